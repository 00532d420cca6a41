//! HTTP inference backend.
//!
//! POSTs the snapshot JPEG to an inference server and reads back
//! `{"candidates": [{"label", "confidence", "class_index"}]}`.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

use super::{rank, ClassificationCandidate, Classifier};
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct InferenceResponse {
    candidates: Vec<ClassificationCandidate>,
}

pub struct RemoteClassifier {
    http: Client,
    endpoint: String,
    top_k: usize,
}

impl RemoteClassifier {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, top_k: usize) -> Result<Self> {
        Ok(Self {
            http: Client::builder().timeout(timeout).build()?,
            endpoint: endpoint.into(),
            top_k,
        })
    }
}

#[async_trait]
impl Classifier for RemoteClassifier {
    async fn classify(&self, image: &[u8]) -> Result<Vec<ClassificationCandidate>> {
        let resp = self
            .http
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "image/jpeg")
            .body(image.to_vec())
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            let truncated: String = body.chars().take(300).collect();
            return Err(Error::Classifier(format!("HTTP {status}: {truncated}")));
        }

        let parsed: InferenceResponse = resp.json().await?;
        debug!(candidates = parsed.candidates.len(), "Inference response received");
        Ok(rank(parsed.candidates, self.top_k))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_classify_ranks_response() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/classify"))
            .and(header("content-type", "image/jpeg"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [
                    {"label": "Turdus migratorius (American Robin)", "confidence": 0.31, "class_index": 7},
                    {"label": "Cardinalis cardinalis (Northern Cardinal)", "confidence": 0.88, "class_index": 3},
                    {"label": "background", "confidence": 0.01}
                ]
            })))
            .mount(&server)
            .await;

        let classifier =
            RemoteClassifier::new(format!("{}/classify", server.uri()), Duration::from_secs(2), 2)
                .unwrap();
        let out = classifier.classify(b"jpeg").await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].class_index, 3);
        assert_eq!(out[1].label, "Turdus migratorius (American Robin)");
    }

    #[tokio::test]
    async fn test_classify_drops_scores_outside_unit_range() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "candidates": [
                    {"label": "logit", "confidence": 1.7},
                    {"label": "negative", "confidence": -0.2},
                    {"label": "Sitta carolinensis (White-breasted Nuthatch)", "confidence": 0.64}
                ]
            })))
            .mount(&server)
            .await;

        let classifier = RemoteClassifier::new(server.uri(), Duration::from_secs(2), 5).unwrap();
        let out = classifier.classify(b"jpeg").await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].label, "Sitta carolinensis (White-breasted Nuthatch)");
    }

    #[tokio::test]
    async fn test_classify_surfaces_server_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("model loading"))
            .mount(&server)
            .await;

        let classifier = RemoteClassifier::new(server.uri(), Duration::from_secs(2), 5).unwrap();
        let err = classifier.classify(b"jpeg").await.unwrap_err();
        assert!(matches!(err, Error::Classifier(msg) if msg.contains("503")));
    }
}
