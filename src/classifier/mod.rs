//! Species classification seam.
//!
//! The pipeline treats the model as a black box: image bytes in, ranked
//! `(label, confidence)` candidates out. Labels follow the usual bird model
//! convention `"Scientific name (Common Name)"`; plain labels work too.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::Result;

#[cfg(feature = "onnx")]
pub mod onnx;
pub mod remote;

/// One scored label from a classification call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationCandidate {
    pub label: String,
    pub confidence: f32,
    #[serde(default)]
    pub class_index: i32,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    /// Score an encoded image. Candidates are expected best-first but callers
    /// must not rely on it; see [`top_candidate`].
    async fn classify(&self, image: &[u8]) -> Result<Vec<ClassificationCandidate>>;
}

impl ClassificationCandidate {
    /// Confidence is a probability in [0, 1]. NaN is not.
    pub fn is_valid(&self) -> bool {
        (0.0..=1.0).contains(&self.confidence)
    }
}

/// Highest-confidence valid candidate.
pub fn top_candidate(candidates: &[ClassificationCandidate]) -> Option<&ClassificationCandidate> {
    candidates
        .iter()
        .filter(|c| c.is_valid())
        .max_by(|a, b| a.confidence.total_cmp(&b.confidence))
}

/// Common name from a `"Scientific name (Common Name)"` label.
pub fn common_name(label: &str) -> Option<&str> {
    let open = label.rfind('(')?;
    let close = label[open..].find(')')? + open;
    let name = label[open + 1..close].trim();
    (!name.is_empty()).then_some(name)
}

/// Name shown to people and reported back to Frigate.
pub fn display_name(label: &str) -> String {
    common_name(label).unwrap_or(label.trim()).to_string()
}

/// Keep the `k` best candidates, best first.
pub(crate) fn rank(mut candidates: Vec<ClassificationCandidate>, k: usize) -> Vec<ClassificationCandidate> {
    let before = candidates.len();
    candidates.retain(ClassificationCandidate::is_valid);
    if candidates.len() < before {
        warn!(dropped = before - candidates.len(), "Dropped candidates with confidence outside [0, 1]");
    }
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    candidates.truncate(k.max(1));
    candidates
}
