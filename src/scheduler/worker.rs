use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::backend::InferenceBackend;
use crate::config::PipelineConfig;
use crate::db::models::{BatchStatus, Segment, SegmentStatus};
use crate::db::Store;

/// Most pending segments considered per cycle.
const SCAN_LIMIT: usize = 100;

/// Recent cards fetched as synthesis context.
const CONTEXT_CARD_FETCH: usize = 5;

/// One scheduler cycle's worth of work: bin pending segments into
/// duration-capped batches, drive the backend, write results back.
///
/// Failures are isolated per batch: a failing batch is marked Failed
/// together with its segments and the cycle moves on.
///
/// Cancellation is checked between batches, so shutdown waits for at
/// most the in-flight batch; untouched batches stay Pending for the
/// next start.
pub struct ScanWorker<B> {
    store: Store,
    backend: B,
    batch_cap_secs: f64,
    auto_delete: bool,
    cancel: CancellationToken,
}

impl<B: InferenceBackend> ScanWorker<B> {
    pub fn new(
        store: Store,
        backend: B,
        config: &PipelineConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            backend,
            batch_cap_secs: config.batch_duration_cap.as_secs_f64(),
            auto_delete: config.auto_delete_segments,
            cancel,
        }
    }

    pub async fn scan_and_process(&self) -> Result<()> {
        let pending = self
            .store
            .get_pending_segments(SCAN_LIMIT)
            .context("failed to fetch pending segments")?;

        if pending.is_empty() {
            debug!("no pending segments");
            return Ok(());
        }

        info!("found {} pending segment(s)", pending.len());
        let batches = pack_batches(pending, self.batch_cap_secs);

        for segments in batches {
            if self.cancel.is_cancelled() {
                info!("shutdown requested, leaving remaining segments pending");
                break;
            }
            if let Err(err) = self.process_batch(&segments).await {
                error!("batch processing failed: {err:#}");
            }
        }
        Ok(())
    }

    async fn process_batch(&self, segments: &[Segment]) -> Result<()> {
        let Some(first) = segments.first() else {
            return Ok(());
        };
        let batch_start = first.start_time;
        let batch_end = segments
            .last()
            .map(|s| s.end_time)
            .unwrap_or(batch_start);
        let segment_ids: Vec<i64> = segments.iter().map(|s| s.id).collect();

        let batch_id = self
            .store
            .create_batch(&segment_ids, batch_start, batch_end)?;
        for segment in segments {
            self.store
                .update_segment_status(segment.id, SegmentStatus::Processing, Some(batch_id))?;
        }

        match self.analyze_batch(batch_id, segments, batch_start).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.store.update_batch(
                    batch_id,
                    BatchStatus::Failed,
                    None,
                    Some(&format!("{err:#}")),
                )?;
                for segment in segments {
                    self.store
                        .update_segment_status(segment.id, SegmentStatus::Failed, None)?;
                }
                Err(err).with_context(|| format!("batch {batch_id}"))
            }
        }
    }

    async fn analyze_batch(
        &self,
        batch_id: i64,
        segments: &[Segment],
        batch_start: DateTime<Utc>,
    ) -> Result<()> {
        let mut all_observations = Vec::new();

        for segment in segments {
            if !Path::new(&segment.file_path).exists() {
                warn!(
                    "segment file missing, skipping: {} (segment {})",
                    segment.file_path, segment.id
                );
                continue;
            }

            let mut observations = self.backend.transcribe(segment).await?;

            // Re-base from segment-relative to batch-relative time so
            // the whole batch shares one monotonic clock.
            let offset =
                (segment.start_time - batch_start).num_milliseconds() as f64 / 1000.0;
            for obs in &mut observations {
                obs.shift(offset);
            }
            all_observations.extend(observations);
        }

        if all_observations.is_empty() {
            warn!("batch {batch_id} produced no observations");
            self.store
                .update_batch(batch_id, BatchStatus::Completed, Some("[]"), None)?;
            for segment in segments {
                self.store
                    .update_segment_status(segment.id, SegmentStatus::Completed, None)?;
            }
            return Ok(());
        }

        let context_cards = self.store.get_recent_cards(CONTEXT_CARD_FETCH)?;
        let cards = self
            .backend
            .synthesize(&all_observations, &context_cards, batch_start)
            .await?;

        for card in &cards {
            self.store.save_card(card, Some(batch_id))?;
        }

        let observations_json = serde_json::to_string(&all_observations)
            .context("failed to serialize observations")?;
        self.store.update_batch(
            batch_id,
            BatchStatus::Completed,
            Some(&observations_json),
            None,
        )?;
        for segment in segments {
            self.store
                .update_segment_status(segment.id, SegmentStatus::Completed, None)?;
        }

        info!("batch {batch_id} completed with {} card(s)", cards.len());

        // Files go only after the completion commit above; analysis
        // results are durable before any deletion.
        if self.auto_delete {
            delete_segment_files(segments);
        }
        Ok(())
    }
}

/// Greedy duration-capped bin-packing over start-time-ordered segments.
/// A batch closes when the next segment would push it past the cap; a
/// lone segment longer than the cap still forms its own batch.
pub(crate) fn pack_batches(segments: Vec<Segment>, cap_secs: f64) -> Vec<Vec<Segment>> {
    let mut batches = Vec::new();
    let mut current: Vec<Segment> = Vec::new();
    let mut current_secs = 0.0;

    for segment in segments {
        if !current.is_empty() && current_secs + segment.duration_secs > cap_secs {
            batches.push(std::mem::take(&mut current));
            current_secs = 0.0;
        }
        current_secs += segment.duration_secs;
        current.push(segment);
    }

    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

/// Best-effort cleanup of analyzed segment files. A file already gone
/// is not an error; the analysis record is the source of truth.
fn delete_segment_files(segments: &[Segment]) {
    let mut deleted = 0usize;
    for segment in segments {
        match std::fs::remove_file(&segment.file_path) {
            Ok(()) => deleted += 1,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => warn!("failed to delete {}: {err}", segment.file_path),
        }
    }
    if deleted > 0 {
        info!("cleaned up {deleted} analyzed segment file(s)");
    }
}
