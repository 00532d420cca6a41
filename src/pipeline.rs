//! Pipeline — wiring and lifecycle
//!
//! Architecture:
//!   MQTT subscriber (one task, sequential)
//!     → reconciler.handle(payload)
//!       → Frigate snapshot → classifier → SQLite compare-and-write
//!       → sub label report (spawned, best-effort)
//!       → broadcaster → live subscribers
//!
//! Stopping lets the in-flight message finish, then detaches every
//! broadcaster subscriber.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broadcaster::Broadcaster;
use crate::classifier::remote::RemoteClassifier;
use crate::classifier::Classifier;
use crate::config::{AppConfig, ClassifierBackend};
use crate::error::{Error, Result};
use crate::frigate::FrigateClient;
use crate::reconciler::{Reconciler, ReconcilerSettings};
use crate::store::DetectionRepository;
use crate::subscriber::mqtt::MqttConnector;
use crate::subscriber::{BrokerConnector, StopHandle, StreamSubscriber};

// ─── Counters ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct Counters {
    messages: AtomicU64,
    accepted: AtomicU64,
    store_failures: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    pub messages: u64,
    pub accepted: u64,
    /// Writes lost to store errors.
    pub store_failures: u64,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            messages: self.messages.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            store_failures: self.store_failures.load(Ordering::Relaxed),
        }
    }
}

// ─── Handle ─────────────────────────────────────────────────────────────────

/// A running pipeline that can be stopped.
pub struct PipelineHandle {
    pub started_at: DateTime<Utc>,
    stop: StopHandle,
    join: JoinHandle<()>,
    broadcaster: Broadcaster,
    counters: Arc<Counters>,
}

impl PipelineHandle {
    /// Signal the subscriber to exit after the current message.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    /// Wait for the subscriber loop to end, then detach live subscribers.
    pub async fn join(self) -> PipelineStats {
        if let Err(err) = self.join.await {
            warn!(error = %err, "Subscriber task ended abnormally");
        }
        self.broadcaster.shutdown();
        let stats = self.counters.snapshot();
        info!(
            messages = stats.messages,
            accepted = stats.accepted,
            store_failures = stats.store_failures,
            "Pipeline stopped"
        );
        stats
    }
}

// ─── Pipeline ───────────────────────────────────────────────────────────────

pub struct Pipeline {
    cfg: AppConfig,
}

impl Pipeline {
    pub fn new(cfg: AppConfig) -> Self {
        Self { cfg }
    }

    /// Build every collaborator from config and start consuming.
    pub fn start(self, broadcaster: Broadcaster) -> Result<PipelineHandle> {
        let cfg = self.cfg;

        let frigate = Arc::new(FrigateClient::from_config(&cfg.frigate)?);
        let store = Arc::new(DetectionRepository::open(&cfg.database.path)?);
        let classifier = build_classifier(&cfg)?;

        let reconciler = Reconciler::new(
            ReconcilerSettings {
                subject_label: cfg.classification.subject_label.clone(),
                threshold: cfg.classification.threshold,
                cameras: cfg.frigate.cameras.clone(),
            },
            frigate.clone(),
            classifier,
            store,
            frigate,
            broadcaster.clone(),
        );

        let connector = MqttConnector::from_config(&cfg.frigate);
        info!(
            topic = connector.topic(),
            subject = %cfg.classification.subject_label,
            threshold = cfg.classification.threshold,
            "Pipeline starting"
        );

        Ok(spawn(
            connector,
            Duration::from_secs(cfg.frigate.mqtt_reconnect_secs),
            reconciler,
            broadcaster,
        ))
    }
}

/// Run `reconciler` over messages from `connector` on one background task.
pub fn spawn<C>(
    connector: C,
    reconnect_delay: Duration,
    reconciler: Reconciler,
    broadcaster: Broadcaster,
) -> PipelineHandle
where
    C: BrokerConnector + 'static,
{
    let (mut subscriber, stop) = StreamSubscriber::new(connector, reconnect_delay);
    let reconciler = Arc::new(reconciler);
    let counters = Arc::new(Counters::default());

    let task_counters = Arc::clone(&counters);
    let join = tokio::spawn(async move {
        subscriber
            .run(move |payload| {
                let reconciler = Arc::clone(&reconciler);
                let counters = Arc::clone(&task_counters);
                async move {
                    counters.messages.fetch_add(1, Ordering::Relaxed);
                    match reconciler.handle(&payload).await {
                        Ok(outcome) if outcome.accepted().is_some() => {
                            counters.accepted.fetch_add(1, Ordering::Relaxed);
                        }
                        Ok(_) => {}
                        Err(_) => {
                            counters.store_failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
            .await;
    });

    PipelineHandle {
        started_at: Utc::now(),
        stop,
        join,
        broadcaster,
        counters,
    }
}

fn build_classifier(cfg: &AppConfig) -> Result<Arc<dyn Classifier>> {
    let cls = &cfg.classification;
    match cls.backend {
        ClassifierBackend::Remote => {
            let endpoint = cls.endpoint.clone().filter(|e| !e.is_empty()).ok_or_else(|| {
                Error::InvalidConfig("classification.endpoint is required for the remote backend".into())
            })?;
            Ok(Arc::new(RemoteClassifier::new(
                endpoint,
                Duration::from_secs(cfg.frigate.timeout_secs),
                cls.top_k,
            )?))
        }
        #[cfg(feature = "onnx")]
        ClassifierBackend::Onnx => Ok(Arc::new(
            crate::classifier::onnx::OnnxClassifier::from_config(cls)?,
        )),
        #[cfg(not(feature = "onnx"))]
        ClassifierBackend::Onnx => Err(Error::InvalidConfig(
            "classification.backend = \"onnx\" requires building with --features onnx".into(),
        )),
    }
}
