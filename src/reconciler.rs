//! Event reconciler — per-event classify / compare / write.
//!
//! Frigate publishes many updates for one event. Each subject-of-interest
//! update is snapshot, classified, and written only when it beats the stored
//! score for that event. `handle` must be driven by a single consumer: the
//! lookup-compare-write below is not atomic against a concurrent `handle`.

use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::broadcaster::{Broadcaster, DetectionEvent};
use crate::classifier::{display_name, top_candidate, ClassificationCandidate, Classifier};
use crate::error::{Error, Result};
use crate::frigate::{FrigateError, LabelReporter, SnapshotSource};
use crate::store::{Detection, DetectionStore};

// ─── Inbound envelope ───────────────────────────────────────────────────────

/// Frigate `frigate/events` message; only the `after` state matters.
#[derive(Debug, Deserialize)]
struct EventEnvelope {
    after: RawEventMessage,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawEventMessage {
    #[serde(rename = "id")]
    pub event_id: String,
    pub label: String,
    pub camera: String,
    #[serde(default)]
    pub start_time: Option<f64>,
}

/// Parse the `after` object out of an event envelope.
pub fn parse_event(payload: &[u8]) -> serde_json::Result<RawEventMessage> {
    serde_json::from_slice::<EventEnvelope>(payload).map(|env| env.after)
}

// ─── Outcome ────────────────────────────────────────────────────────────────

/// What `handle` did with one message.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Malformed,
    IgnoredLabel,
    IgnoredCamera,
    SnapshotUnavailable,
    ClassificationFailed,
    NoCandidates,
    BelowThreshold { confidence: f32 },
    NotImproved { stored: f32, candidate: f32 },
    Created(Detection),
    Updated(Detection),
}

impl Outcome {
    pub fn accepted(&self) -> Option<&Detection> {
        match self {
            Outcome::Created(d) | Outcome::Updated(d) => Some(d),
            _ => None,
        }
    }
}

// ─── Reconciler ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub subject_label: String,
    pub threshold: f32,
    /// Empty means every camera.
    pub cameras: Vec<String>,
}

pub struct Reconciler {
    settings: ReconcilerSettings,
    snapshots: Arc<dyn SnapshotSource>,
    classifier: Arc<dyn Classifier>,
    store: Arc<dyn DetectionStore>,
    reporter: Arc<dyn LabelReporter>,
    broadcaster: Broadcaster,
}

impl Reconciler {
    pub fn new(
        settings: ReconcilerSettings,
        snapshots: Arc<dyn SnapshotSource>,
        classifier: Arc<dyn Classifier>,
        store: Arc<dyn DetectionStore>,
        reporter: Arc<dyn LabelReporter>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            settings,
            snapshots,
            classifier,
            store,
            reporter,
            broadcaster,
        }
    }

    /// Process one raw stream message.
    ///
    /// Only store failures are returned as errors; every other rejection is
    /// an [`Outcome`].
    pub async fn handle(&self, payload: &[u8]) -> Result<Outcome> {
        let event = match parse_event(payload) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, bytes = payload.len(), "Dropping malformed event message");
                return Ok(Outcome::Malformed);
            }
        };

        if event.label != self.settings.subject_label {
            debug!(event_id = %event.event_id, label = %event.label, "Ignoring label");
            return Ok(Outcome::IgnoredLabel);
        }

        if !self.settings.cameras.is_empty() && !self.settings.cameras.contains(&event.camera) {
            debug!(event_id = %event.event_id, camera = %event.camera, "Ignoring camera");
            return Ok(Outcome::IgnoredCamera);
        }

        let image = match self.snapshots.fetch_snapshot(&event.event_id).await {
            Ok(image) => image,
            Err(err) => {
                log_snapshot_failure(&event.event_id, &err);
                return Ok(Outcome::SnapshotUnavailable);
            }
        };

        let candidates = match self.classifier.classify(&image).await {
            Ok(candidates) => candidates,
            Err(err) => {
                warn!(event_id = %event.event_id, error = %err, "Classification failed");
                return Ok(Outcome::ClassificationFailed);
            }
        };

        let Some(best) = top_candidate(&candidates) else {
            debug!(event_id = %event.event_id, "Classifier returned no candidates");
            return Ok(Outcome::NoCandidates);
        };

        if best.confidence < self.settings.threshold {
            debug!(
                event_id = %event.event_id,
                label = %best.label,
                confidence = best.confidence,
                threshold = self.settings.threshold,
                "Below threshold"
            );
            return Ok(Outcome::BelowThreshold {
                confidence: best.confidence,
            });
        }

        // rusqlite blocks; keep it off the async workers.
        let store = Arc::clone(&self.store);
        let (pending, top) = (event.clone(), best.clone());
        let outcome = tokio::task::spawn_blocking(move || reconcile(&*store, &pending, &top))
            .await
            .map_err(|e| Error::StoreUnavailable(format!("store task failed: {e}")))
            .and_then(|res| res)
            .map_err(|err| {
                error!(
                    event_id = %event.event_id,
                    error = %err,
                    "Detection write failed, update lost until next improvement"
                );
                err
            })?;

        if let Some(detection) = outcome.accepted() {
            self.spawn_label_report(detection);
            let receivers = self.broadcaster.publish(DetectionEvent::from(detection.clone()));
            debug!(event_id = %detection.event_id, receivers, "Detection broadcast");
        }

        Ok(outcome)
    }

    fn spawn_label_report(&self, detection: &Detection) {
        let reporter = Arc::clone(&self.reporter);
        let event_id = detection.event_id.clone();
        let label = detection.display_name.clone();
        let score = detection.score;
        tokio::spawn(async move {
            if let Err(err) = reporter.report_label(&event_id, &label, score).await {
                warn!(event_id = %event_id, label = %label, error = %err, "Failed to set sub label");
            }
        });
    }
}

/// Compare-and-write against the stored record for this event.
fn reconcile(
    store: &dyn DetectionStore,
    event: &RawEventMessage,
    best: &ClassificationCandidate,
) -> Result<Outcome> {
    let now = Utc::now();
    let name = display_name(&best.label);

    match store.find_by_event_id(&event.event_id)? {
        None => {
            let created = store.create(&Detection {
                id: None,
                detection_time: now,
                detection_index: 0,
                score: best.confidence,
                display_name: name,
                category_name: best.label.clone(),
                event_id: event.event_id.clone(),
                camera_name: event.camera.clone(),
            })?;
            info!(
                event_id = %created.event_id,
                camera = %created.camera_name,
                species = %created.display_name,
                score = created.score,
                "New detection"
            );
            Ok(Outcome::Created(created))
        }
        Some(stored) if best.confidence > stored.score => {
            let updated = Detection {
                detection_time: now,
                detection_index: stored.detection_index + 1,
                score: best.confidence,
                display_name: name,
                category_name: best.label.clone(),
                ..stored
            };
            store.update(&updated)?;
            info!(
                event_id = %updated.event_id,
                species = %updated.display_name,
                score = updated.score,
                index = updated.detection_index,
                "Detection improved"
            );
            Ok(Outcome::Updated(updated))
        }
        Some(stored) => {
            debug!(
                event_id = %event.event_id,
                stored = stored.score,
                candidate = best.confidence,
                "Not an improvement"
            );
            Ok(Outcome::NotImproved {
                stored: stored.score,
                candidate: best.confidence,
            })
        }
    }
}

fn log_snapshot_failure(event_id: &str, err: &FrigateError) {
    match err {
        FrigateError::NotFound => {
            debug!(event_id, "Snapshot not available yet")
        }
        FrigateError::Status(status) => {
            warn!(event_id, status, "Snapshot request rejected")
        }
        FrigateError::Timeout => warn!(event_id, "Snapshot request timed out"),
        FrigateError::Transport(e) => {
            warn!(event_id, error = %e, "Snapshot request failed")
        }
    }
}
