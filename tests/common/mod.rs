#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use yardbird::broadcaster::{Broadcaster, Subscription};
use yardbird::classifier::{ClassificationCandidate, Classifier};
use yardbird::frigate::{FrigateError, LabelReporter, SnapshotSource};
use yardbird::reconciler::{Reconciler, ReconcilerSettings};
use yardbird::store::{Detection, DetectionRepository, DetectionStore};
use yardbird::{Error, Result};

pub fn bird_event(id: &str, camera: &str) -> Vec<u8> {
    format!(
        r#"{{"type":"update","after":{{"id":"{id}","label":"bird","camera":"{camera}","start_time":1700000000.0}}}}"#
    )
    .into_bytes()
}

pub fn candidate(label: &str, confidence: f32) -> ClassificationCandidate {
    ClassificationCandidate {
        label: label.to_string(),
        confidence,
        class_index: 1,
    }
}

// ─── Snapshot source ────────────────────────────────────────────────────────

#[derive(Clone, Copy)]
pub enum SnapshotFailure {
    NotFound,
    Status(u16),
    Timeout,
}

#[derive(Default)]
pub struct FakeSnapshots {
    pub calls: AtomicUsize,
    pub failure: Mutex<Option<SnapshotFailure>>,
}

impl FakeSnapshots {
    pub fn fail_with(&self, failure: SnapshotFailure) {
        *self.failure.lock().unwrap() = Some(failure);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotSource for FakeSnapshots {
    async fn fetch_snapshot(&self, _event_id: &str) -> std::result::Result<Vec<u8>, FrigateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match *self.failure.lock().unwrap() {
            None => Ok(b"\xff\xd8fake-jpeg".to_vec()),
            Some(SnapshotFailure::NotFound) => Err(FrigateError::NotFound),
            Some(SnapshotFailure::Status(code)) => Err(FrigateError::Status(code)),
            Some(SnapshotFailure::Timeout) => Err(FrigateError::Timeout),
        }
    }
}

// ─── Classifier ─────────────────────────────────────────────────────────────

/// Returns queued results in order; errors once the queue is empty.
#[derive(Default)]
pub struct ScriptedClassifier {
    pub calls: AtomicUsize,
    queue: Mutex<VecDeque<Vec<ClassificationCandidate>>>,
}

impl ScriptedClassifier {
    pub fn push(&self, candidates: Vec<ClassificationCandidate>) {
        self.queue.lock().unwrap().push_back(candidates);
    }

    pub fn push_top(&self, label: &str, confidence: f32) {
        self.push(vec![candidate(label, confidence), candidate("background", 0.01)]);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Classifier for ScriptedClassifier {
    async fn classify(&self, _image: &[u8]) -> Result<Vec<ClassificationCandidate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Classifier("no scripted result".into()))
    }
}

// ─── Label reporter ─────────────────────────────────────────────────────────

pub struct RecordingReporter {
    tx: mpsc::UnboundedSender<(String, String)>,
    fail: bool,
}

#[async_trait]
impl LabelReporter for RecordingReporter {
    async fn report_label(
        &self,
        event_id: &str,
        label: &str,
        _score: f32,
    ) -> std::result::Result<(), FrigateError> {
        let _ = self.tx.send((event_id.to_string(), label.to_string()));
        if self.fail {
            Err(FrigateError::Status(500))
        } else {
            Ok(())
        }
    }
}

// ─── Store that always fails ────────────────────────────────────────────────

pub struct BrokenStore;

impl DetectionStore for BrokenStore {
    fn find_by_event_id(&self, _event_id: &str) -> Result<Option<Detection>> {
        Ok(None)
    }

    fn create(&self, _detection: &Detection) -> Result<Detection> {
        Err(Error::StoreUnavailable("disk full".into()))
    }

    fn update(&self, _detection: &Detection) -> Result<()> {
        Err(Error::StoreUnavailable("disk full".into()))
    }
}

/// Reads and inserts work; every update fails.
pub struct UpdateFailsStore {
    pub inner: DetectionRepository,
}

impl UpdateFailsStore {
    pub fn new() -> Self {
        Self {
            inner: DetectionRepository::open_in_memory().unwrap(),
        }
    }
}

impl DetectionStore for UpdateFailsStore {
    fn find_by_event_id(&self, event_id: &str) -> Result<Option<Detection>> {
        self.inner.find_by_event_id(event_id)
    }

    fn create(&self, detection: &Detection) -> Result<Detection> {
        self.inner.create(detection)
    }

    fn update(&self, detection: &Detection) -> Result<()> {
        Err(Error::DetectionMissing(detection.event_id.clone()))
    }
}

// ─── Harness ────────────────────────────────────────────────────────────────

pub struct Harness {
    pub reconciler: Reconciler,
    pub store: Arc<DetectionRepository>,
    pub snapshots: Arc<FakeSnapshots>,
    pub classifier: Arc<ScriptedClassifier>,
    pub reports: mpsc::UnboundedReceiver<(String, String)>,
    pub broadcaster: Broadcaster,
    pub feed: Subscription,
}

pub fn settings(cameras: &[&str]) -> ReconcilerSettings {
    ReconcilerSettings {
        subject_label: "bird".into(),
        threshold: 0.7,
        cameras: cameras.iter().map(|c| c.to_string()).collect(),
    }
}

pub struct HarnessBuilder {
    settings: ReconcilerSettings,
    failing_reporter: bool,
    store: Option<Arc<dyn DetectionStore>>,
}

impl HarnessBuilder {
    pub fn new() -> Self {
        Self {
            settings: settings(&[]),
            failing_reporter: false,
            store: None,
        }
    }

    pub fn cameras(mut self, cameras: &[&str]) -> Self {
        self.settings = settings(cameras);
        self
    }

    pub fn failing_reporter(mut self) -> Self {
        self.failing_reporter = true;
        self
    }

    pub fn store(mut self, store: Arc<dyn DetectionStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn build(self) -> Harness {
        let repo = Arc::new(DetectionRepository::open_in_memory().unwrap());
        let store: Arc<dyn DetectionStore> = match self.store {
            Some(store) => store,
            None => repo.clone(),
        };
        let snapshots = Arc::new(FakeSnapshots::default());
        let classifier = Arc::new(ScriptedClassifier::default());
        let (tx, reports) = mpsc::unbounded_channel();
        let reporter = Arc::new(RecordingReporter {
            tx,
            fail: self.failing_reporter,
        });
        let broadcaster = Broadcaster::new();
        let feed = broadcaster.subscribe();

        let reconciler = Reconciler::new(
            self.settings,
            snapshots.clone(),
            classifier.clone(),
            store,
            reporter,
            broadcaster.clone(),
        );

        Harness {
            reconciler,
            store: repo,
            snapshots,
            classifier,
            reports,
            broadcaster,
            feed,
        }
    }
}

impl Harness {
    /// Wait for the spawned label report, if any.
    pub async fn next_report(&mut self) -> Option<(String, String)> {
        tokio::time::timeout(std::time::Duration::from_secs(1), self.reports.recv())
            .await
            .ok()
            .flatten()
    }

    /// Assert nothing was reported after letting spawned tasks run.
    pub async fn assert_no_report(&mut self) {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(self.reports.try_recv().is_err(), "unexpected label report");
    }
}
