mod common;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use common::{bird_event, settings, FakeSnapshots, ScriptedClassifier};
use yardbird::broadcaster::Broadcaster;
use yardbird::frigate::{FrigateError, LabelReporter};
use yardbird::pipeline;
use yardbird::reconciler::Reconciler;
use yardbird::store::{DetectionRepository, DetectionStore};
use yardbird::subscriber::{BrokerConnector, BrokerError, BrokerSession};

/// Hands out a single session fed by a channel; later connects fail.
struct ChannelConnector {
    rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

struct ChannelSession {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl BrokerConnector for ChannelConnector {
    async fn connect(&mut self) -> Result<Box<dyn BrokerSession>, BrokerError> {
        match self.rx.take() {
            Some(rx) => Ok(Box::new(ChannelSession { rx })),
            None => Err(BrokerError::Disconnected),
        }
    }
}

#[async_trait]
impl BrokerSession for ChannelSession {
    async fn next_payload(&mut self) -> Result<Vec<u8>, BrokerError> {
        self.rx.recv().await.ok_or(BrokerError::Disconnected)
    }
}

struct NullReporter;

#[async_trait]
impl LabelReporter for NullReporter {
    async fn report_label(&self, _: &str, _: &str, _: f32) -> Result<(), FrigateError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_messages_flow_from_broker_to_store_and_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("birds.db");
    let repo = Arc::new(DetectionRepository::open(db_path.to_str().unwrap()).unwrap());

    let classifier = Arc::new(ScriptedClassifier::default());
    classifier.push_top("Turdus migratorius (American Robin)", 0.8);
    classifier.push_top("Turdus migratorius (American Robin)", 0.9);

    let broadcaster = Broadcaster::new();
    let mut viewer = broadcaster.subscribe();

    let reconciler = Reconciler::new(
        settings(&[]),
        Arc::new(FakeSnapshots::default()),
        classifier.clone(),
        repo.clone(),
        Arc::new(NullReporter),
        broadcaster.clone(),
    );

    let (tx, rx) = mpsc::unbounded_channel();
    let handle = pipeline::spawn(
        ChannelConnector { rx: Some(rx) },
        Duration::from_millis(20),
        reconciler,
        broadcaster.clone(),
    );

    tx.send(br#"{"after":{"id":"p-1","label":"person","camera":"yard"}}"#.to_vec())
        .unwrap();
    tx.send(bird_event("b-1", "yard")).unwrap();
    tx.send(bird_event("b-1", "yard")).unwrap();

    let first = tokio::time::timeout(Duration::from_secs(5), viewer.recv())
        .await
        .unwrap()
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(5), viewer.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(first.detection.detection_index, 0);
    assert_eq!(second.detection.detection_index, 1);
    assert_eq!(second.common_name.as_deref(), Some("American Robin"));
    assert_eq!(first.detection.id, second.detection.id);

    handle.stop();
    let stats = handle.join().await;
    assert_eq!(stats.messages, 3);
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.store_failures, 0);

    // shutdown detaches every subscriber
    assert!(viewer.recv().await.is_none());
    assert_eq!(broadcaster.subscriber_count(), 0);

    let stored = repo.find_by_event_id("b-1").unwrap().unwrap();
    assert!((stored.score - 0.9).abs() < 1e-6);
    assert_eq!(stored.display_name, "American Robin");
    assert!(repo.find_by_event_id("p-1").unwrap().is_none());
    assert_eq!(classifier.calls(), 2);

    let counts = repo.species_counts().unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!(counts[0].count, 1);
}

#[tokio::test]
async fn test_stop_before_any_message() {
    let repo = Arc::new(DetectionRepository::open_in_memory().unwrap());
    let broadcaster = Broadcaster::new();
    let reconciler = Reconciler::new(
        settings(&[]),
        Arc::new(FakeSnapshots::default()),
        Arc::new(ScriptedClassifier::default()),
        repo,
        Arc::new(NullReporter),
        broadcaster.clone(),
    );

    let (_tx, rx) = mpsc::unbounded_channel();
    let handle = pipeline::spawn(
        ChannelConnector { rx: Some(rx) },
        Duration::from_millis(20),
        reconciler,
        broadcaster,
    );

    handle.stop();
    let stats = tokio::time::timeout(Duration::from_secs(5), handle.join())
        .await
        .unwrap();
    assert_eq!(stats.messages, 0);
}
