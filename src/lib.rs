//! Yardbird classifies Frigate bird events, keeps the best-scoring
//! species per event in SQLite and fans finalized detections out to live
//! viewers.

pub mod broadcaster;
pub mod classifier;
pub mod config;
pub mod error;
pub mod frigate;
pub mod logging;
pub mod pipeline;
pub mod reconciler;
pub mod store;
pub mod subscriber;

pub use error::{Error, Result};
