//! Species classifier — ONNX Runtime
//!
//! Runs an image-classification model locally (e.g. a bird species model
//! exported to ONNX). Input is NCHW f32 in [0, 1] at `input_size`², output a
//! single `[1, num_classes]` score row. Logits are softmaxed.

use async_trait::async_trait;
use image::imageops::FilterType;
use ndarray::Array4;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::sync::Arc;
use tracing::{debug, info};

use super::{rank, ClassificationCandidate, Classifier};
use crate::config::ClassificationConfig;
use crate::error::{Error, Result};

pub struct OnnxClassifier {
    session: Arc<Session>,
    labels: Arc<Vec<String>>,
    input_size: u32,
    top_k: usize,
}

impl OnnxClassifier {
    pub fn from_config(cfg: &ClassificationConfig) -> Result<Self> {
        let session = Session::builder()
            .and_then(|b| b.with_optimization_level(GraphOptimizationLevel::Level3))
            .and_then(|b| b.with_intra_threads(2))
            .and_then(|b| b.commit_from_file(&cfg.model))
            .map_err(ort_err)?;

        let labels: Vec<String> = std::fs::read_to_string(&cfg.labels)?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(String::from)
            .collect();

        info!(model = %cfg.model, labels = labels.len(), "ONNX classifier loaded");

        Ok(Self {
            session: Arc::new(session),
            labels: Arc::new(labels),
            input_size: cfg.input_size,
            top_k: cfg.top_k,
        })
    }
}

#[async_trait]
impl Classifier for OnnxClassifier {
    async fn classify(&self, image: &[u8]) -> Result<Vec<ClassificationCandidate>> {
        let session = Arc::clone(&self.session);
        let labels = Arc::clone(&self.labels);
        let bytes = image.to_vec();
        let size = self.input_size;
        let top_k = self.top_k;

        tokio::task::spawn_blocking(move || {
            let scores = infer(&session, &bytes, size)?;
            let candidates = scores
                .into_iter()
                .enumerate()
                .map(|(idx, confidence)| ClassificationCandidate {
                    label: labels
                        .get(idx)
                        .cloned()
                        .unwrap_or_else(|| format!("class_{idx}")),
                    confidence,
                    class_index: idx as i32,
                })
                .collect();
            Ok(rank(candidates, top_k))
        })
        .await
        .map_err(|e| Error::Classifier(format!("inference task failed: {e}")))?
    }
}

fn infer(session: &Session, jpeg: &[u8], size: u32) -> Result<Vec<f32>> {
    let img = image::load_from_memory(jpeg)
        .map_err(|e| Error::Classifier(format!("image decode failed: {e}")))?;
    let rgb = img.resize_exact(size, size, FilterType::Triangle).to_rgb8();

    let side = size as usize;
    let mut input = Array4::<f32>::zeros((1, 3, side, side));
    for (x, y, pixel) in rgb.enumerate_pixels() {
        for c in 0..3 {
            input[[0, c, y as usize, x as usize]] = pixel[c] as f32 / 255.0;
        }
    }

    let input_name = session.inputs[0].name.clone();
    let outputs = session
        .run(ort::inputs![input_name => input.view()].map_err(ort_err)?)
        .map_err(ort_err)?;
    let tensor = outputs[0].try_extract_tensor::<f32>().map_err(ort_err)?;
    let raw: Vec<f32> = tensor.iter().copied().collect();
    debug!(classes = raw.len(), "ONNX inference done");

    Ok(normalise(raw))
}

/// Scores already in [0, 1] summing to ~1 pass through; anything else is
/// treated as logits.
fn normalise(raw: Vec<f32>) -> Vec<f32> {
    let sum: f32 = raw.iter().sum();
    let probabilities = raw.iter().all(|v| (0.0..=1.0).contains(v)) && (sum - 1.0).abs() < 1e-3;
    if probabilities {
        return raw;
    }
    let max = raw.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exp: Vec<f32> = raw.iter().map(|v| (v - max).exp()).collect();
    let total: f32 = exp.iter().sum();
    exp.into_iter().map(|v| v / total).collect()
}

fn ort_err(e: ort::Error) -> Error {
    Error::Classifier(e.to_string())
}
