use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use timelens::config::PipelineConfig;
use timelens::db::models::{
    ActivityCard, BatchStatus, NewCard, NewSegment, Observation, Segment, SegmentStatus,
};
use timelens::db::Store;
use timelens::error::BackendError;
use timelens::scheduler::ScanWorker;
use timelens::InferenceBackend;

/// Scripted backend: one observation per transcribed segment, one card
/// per synthesis call, with an optional failure on the nth synthesis
/// and an optional shutdown request fired from inside a synthesis.
struct FakeBackend {
    synth_calls: AtomicUsize,
    fail_on_synth_call: Option<usize>,
    cancel_during_synth: Option<CancellationToken>,
}

impl FakeBackend {
    fn new() -> Self {
        Self {
            synth_calls: AtomicUsize::new(0),
            fail_on_synth_call: None,
            cancel_during_synth: None,
        }
    }

    fn failing_on_call(n: usize) -> Self {
        Self {
            fail_on_synth_call: Some(n),
            ..Self::new()
        }
    }

    fn cancelling_during_synth(cancel: CancellationToken) -> Self {
        Self {
            cancel_during_synth: Some(cancel),
            ..Self::new()
        }
    }
}

#[async_trait]
impl InferenceBackend for FakeBackend {
    async fn transcribe(&self, segment: &Segment) -> Result<Vec<Observation>, BackendError> {
        Ok(vec![Observation {
            start_ts: 0.0,
            end_ts: segment.duration_secs,
            text: format!("activity in segment {}", segment.id),
            app_name: None,
            window_title: None,
        }])
    }

    async fn synthesize(
        &self,
        observations: &[Observation],
        _context_cards: &[ActivityCard],
        batch_start: DateTime<Utc>,
    ) -> Result<Vec<NewCard>, BackendError> {
        let call = self.synth_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on_synth_call == Some(call) {
            return Err(BackendError::Api {
                status: 500,
                body: "scripted failure".into(),
            });
        }
        if let Some(cancel) = &self.cancel_during_synth {
            cancel.cancel();
        }

        let span = observations
            .last()
            .map(|o| o.end_ts)
            .unwrap_or_default();
        Ok(vec![NewCard {
            category: "work".into(),
            title: format!("card for {} observation(s)", observations.len()),
            summary: String::new(),
            start_time: batch_start,
            end_time: batch_start + chrono::Duration::milliseconds((span * 1000.0) as i64),
            app_usage: vec![],
            distractions: vec![],
            productivity_score: 75.0,
        }])
    }
}

fn test_config(dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::new(
        dir.to_path_buf(),
        "http://localhost".into(),
        "key".into(),
        "model".into(),
    );
    config.batch_duration_cap = Duration::from_secs(100);
    config
}

fn insert_segment(
    store: &Store,
    dir: &Path,
    name: &str,
    start: DateTime<Utc>,
    duration_secs: f64,
) -> i64 {
    let path = dir.join(name);
    std::fs::write(&path, b"frames").unwrap();

    store
        .save_segment(&NewSegment {
            file_path: path.to_string_lossy().into_owned(),
            start_time: start,
            end_time: start + chrono::Duration::milliseconds((duration_secs * 1000.0) as i64),
            duration_secs,
        })
        .unwrap()
}

#[tokio::test]
async fn full_cycle_completes_batch_and_persists_cards() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Store::open(config.database_path.clone(), config.pool_config()).unwrap();

    let start = Utc::now();
    let id_a = insert_segment(&store, dir.path(), "a.tlseg", start, 50.0);
    let id_b = insert_segment(
        &store,
        dir.path(),
        "b.tlseg",
        start + chrono::Duration::seconds(50),
        50.0,
    );

    let worker = ScanWorker::new(
        store.clone(),
        FakeBackend::new(),
        &config,
        CancellationToken::new(),
    );
    worker.scan_and_process().await.unwrap();

    // Both 50s segments fit one 100s batch and end up completed.
    let seg_a = store.get_segment(id_a).unwrap().unwrap();
    let seg_b = store.get_segment(id_b).unwrap().unwrap();
    assert_eq!(seg_a.status, SegmentStatus::Completed);
    assert_eq!(seg_b.status, SegmentStatus::Completed);
    assert_eq!(seg_a.batch_id, seg_b.batch_id);

    let batch = store.get_batch(seg_a.batch_id.unwrap()).unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    let observations: Vec<Observation> =
        serde_json::from_str(&batch.observations_json).unwrap();
    assert_eq!(observations.len(), 2);
    // The second segment's observation is rebased onto the batch clock.
    assert_eq!(observations[1].start_ts, 50.0);
    assert_eq!(observations[1].end_ts, 100.0);

    let cards = store.get_recent_cards(10).unwrap();
    assert_eq!(cards.len(), 1);
    assert_eq!(cards[0].category, "work");

    // Committed batches release their segment files.
    assert!(!Path::new(&seg_a.file_path).exists());
    assert!(!Path::new(&seg_b.file_path).exists());

    assert!(store.get_pending_segments(10).unwrap().is_empty());
    store.close();
}

#[tokio::test]
async fn failed_batch_does_not_disturb_completed_neighbors() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Store::open(config.database_path.clone(), config.pool_config()).unwrap();

    let start = Utc::now();
    // Two full batches under the 100s cap: [a, b] then [c].
    let id_a = insert_segment(&store, dir.path(), "a.tlseg", start, 50.0);
    let id_b = insert_segment(
        &store,
        dir.path(),
        "b.tlseg",
        start + chrono::Duration::seconds(50),
        50.0,
    );
    let id_c = insert_segment(
        &store,
        dir.path(),
        "c.tlseg",
        start + chrono::Duration::seconds(100),
        50.0,
    );

    // Second synthesis call fails.
    let worker = ScanWorker::new(
        store.clone(),
        FakeBackend::failing_on_call(1),
        &config,
        CancellationToken::new(),
    );
    worker.scan_and_process().await.unwrap();

    let seg_a = store.get_segment(id_a).unwrap().unwrap();
    let seg_b = store.get_segment(id_b).unwrap().unwrap();
    let seg_c = store.get_segment(id_c).unwrap().unwrap();

    assert_eq!(seg_a.status, SegmentStatus::Completed);
    assert_eq!(seg_b.status, SegmentStatus::Completed);
    assert_eq!(seg_c.status, SegmentStatus::Failed);

    let good = store.get_batch(seg_a.batch_id.unwrap()).unwrap().unwrap();
    assert_eq!(good.status, BatchStatus::Completed);

    let bad = store.get_batch(seg_c.batch_id.unwrap()).unwrap().unwrap();
    assert_eq!(bad.status, BatchStatus::Failed);
    assert!(bad.error_message.unwrap().contains("500"));

    // The first batch's card survives and stays queryable.
    let cards = store.get_recent_cards(10).unwrap();
    assert_eq!(cards.len(), 1);

    // Failed batches keep their files for a later retry or inspection.
    assert!(Path::new(&seg_c.file_path).exists());
    store.close();
}

#[tokio::test]
async fn cancellation_mid_cycle_stops_at_the_batch_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Store::open(config.database_path.clone(), config.pool_config()).unwrap();

    let start = Utc::now();
    // Two batches under the 100s cap: [a, b] then [c].
    let id_a = insert_segment(&store, dir.path(), "a.tlseg", start, 50.0);
    let id_b = insert_segment(
        &store,
        dir.path(),
        "b.tlseg",
        start + chrono::Duration::seconds(50),
        50.0,
    );
    let id_c = insert_segment(
        &store,
        dir.path(),
        "c.tlseg",
        start + chrono::Duration::seconds(100),
        50.0,
    );

    // Shutdown arrives while the first batch is being synthesized.
    let cancel = CancellationToken::new();
    let backend = FakeBackend::cancelling_during_synth(cancel.clone());
    let worker = ScanWorker::new(store.clone(), backend, &config, cancel);
    worker.scan_and_process().await.unwrap();

    // The in-flight batch runs to completion.
    let seg_a = store.get_segment(id_a).unwrap().unwrap();
    let seg_b = store.get_segment(id_b).unwrap().unwrap();
    assert_eq!(seg_a.status, SegmentStatus::Completed);
    assert_eq!(seg_b.status, SegmentStatus::Completed);

    // The second batch is never started: its segment stays Pending with
    // no batch row, ready for the next run.
    let seg_c = store.get_segment(id_c).unwrap().unwrap();
    assert_eq!(seg_c.status, SegmentStatus::Pending);
    assert!(seg_c.batch_id.is_none());
    assert!(Path::new(&seg_c.file_path).exists());

    let pending = store.get_pending_segments(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id_c);
    store.close();
}

#[tokio::test]
async fn missing_segment_files_complete_empty_without_backend_calls() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let store = Store::open(config.database_path.clone(), config.pool_config()).unwrap();

    let start = Utc::now();
    let id = insert_segment(&store, dir.path(), "gone.tlseg", start, 50.0);
    std::fs::remove_file(dir.path().join("gone.tlseg")).unwrap();

    let worker = ScanWorker::new(
        store.clone(),
        FakeBackend::new(),
        &config,
        CancellationToken::new(),
    );
    worker.scan_and_process().await.unwrap();

    let segment = store.get_segment(id).unwrap().unwrap();
    assert_eq!(segment.status, SegmentStatus::Completed);

    let batch = store.get_batch(segment.batch_id.unwrap()).unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Completed);
    assert_eq!(batch.observations_json, "[]");
    assert!(store.get_recent_cards(10).unwrap().is_empty());
    store.close();
}
