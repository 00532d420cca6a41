//! Frigate HTTP client — snapshot fetch and sub-label reporting.
//!
//! One owned `reqwest::Client` with a bounded timeout, built at startup and
//! shared by the reconciler. Neither call retries; the next event update is
//! the retry.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::FrigateConfig;

/// Failure classes of a Frigate API call.
#[derive(Error, Debug)]
pub enum FrigateError {
    #[error("not found")]
    NotFound,

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
}

impl From<reqwest::Error> for FrigateError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            FrigateError::Timeout
        } else {
            FrigateError::Transport(err)
        }
    }
}

/// Still image source for an event.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_snapshot(&self, event_id: &str) -> Result<Vec<u8>, FrigateError>;
}

/// Reports the winning label back to the NVR.
#[async_trait]
pub trait LabelReporter: Send + Sync {
    async fn report_label(&self, event_id: &str, label: &str, score: f32) -> Result<(), FrigateError>;
}

pub struct FrigateClient {
    http: Client,
    base_url: String,
    token: Option<String>,
}

impl FrigateClient {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> crate::error::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
        })
    }

    pub fn from_config(cfg: &FrigateConfig) -> crate::error::Result<Self> {
        Self::new(
            &cfg.frigate_url,
            cfg.token.clone(),
            Duration::from_secs(cfg.timeout_secs),
        )
    }

    fn event_url(&self, event_id: &str, tail: &str) -> String {
        format!("{}/api/events/{}/{}", self.base_url, event_id, tail)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, FrigateError> {
        let resp = self.authorize(req).send().await?;
        match resp.status() {
            s if s.is_success() => Ok(resp),
            StatusCode::NOT_FOUND => Err(FrigateError::NotFound),
            s => Err(FrigateError::Status(s.as_u16())),
        }
    }
}

#[async_trait]
impl SnapshotSource for FrigateClient {
    async fn fetch_snapshot(&self, event_id: &str) -> Result<Vec<u8>, FrigateError> {
        let url = self.event_url(event_id, "snapshot.jpg");
        let resp = self.send(self.http.get(&url)).await?;
        let bytes = resp.bytes().await?;
        debug!(event_id, bytes = bytes.len(), "Snapshot fetched");
        Ok(bytes.to_vec())
    }
}

#[async_trait]
impl LabelReporter for FrigateClient {
    async fn report_label(&self, event_id: &str, label: &str, score: f32) -> Result<(), FrigateError> {
        let url = self.event_url(event_id, "sub_label");
        let body = json!({ "subLabel": label, "subLabelScore": score });
        self.send(self.http.post(&url).json(&body)).await?;
        debug!(event_id, label, "Sub label set");
        Ok(())
    }
}
