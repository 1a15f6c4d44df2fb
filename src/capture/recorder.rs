use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use uuid::Uuid;

use crate::db::models::NewSegment;

use super::source::FrameSource;
use super::writer::SegmentWriter;

/// Sink for completed-segment events. The single registered subscriber
/// (normally the store) persists the metadata as a Segment row.
pub type SegmentSink = Box<dyn FnMut(NewSegment) -> Result<()> + Send>;

/// Cooperative flags shared between the facade and the worker thread.
pub(super) struct CaptureFlags {
    pub stop: AtomicBool,
    pub paused: AtomicBool,
}

impl CaptureFlags {
    pub fn new() -> Self {
        Self {
            stop: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }
}

pub(super) struct RecorderParams {
    pub fps: u32,
    pub segment_duration: Duration,
    pub output_dir: PathBuf,
}

/// Capture worker: grabs frames on a fixed cadence, rotates segment
/// files, and emits a completed-segment event per rotation.
///
/// Grab failures are logged and retried; writer failures terminate the
/// loop with an error that surfaces when the facade joins the thread,
/// since they indicate potential data loss.
pub(super) fn capture_loop(
    mut source: Box<dyn FrameSource>,
    mut sink: SegmentSink,
    params: RecorderParams,
    flags: Arc<CaptureFlags>,
) -> Result<()> {
    std::fs::create_dir_all(&params.output_dir).with_context(|| {
        format!(
            "failed to create segments directory {}",
            params.output_dir.display()
        )
    })?;

    let frame_interval = Duration::from_secs_f64(1.0 / params.fps.max(1) as f64);
    let segment_secs = params.segment_duration.as_secs_f64();
    let mut writer: Option<SegmentWriter> = None;
    let mut last_frame_at: Option<Instant> = None;

    info!(
        "capture loop started: {} fps, {:.0}s segments",
        params.fps, segment_secs
    );

    while !flags.stop.load(Ordering::Acquire) {
        if flags.paused.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(200));
            continue;
        }

        if let Some(at) = last_frame_at {
            let since = at.elapsed();
            if since < frame_interval {
                thread::sleep((frame_interval - since).min(Duration::from_millis(100)));
                continue;
            }
        }

        let frame = match source.grab() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                // No frame ready this tick; retry shortly.
                thread::sleep(Duration::from_millis(100));
                continue;
            }
            Err(err) => {
                warn!("frame grab failed, retrying next tick: {err}");
                thread::sleep(Duration::from_secs(1));
                continue;
            }
        };

        let needs_rotation = writer
            .as_ref()
            .map(|w| w.elapsed_secs() >= segment_secs)
            .unwrap_or(true);
        if needs_rotation {
            if let Some(full) = writer.take() {
                finalize_segment(full, &mut sink)?;
            }
            writer = Some(open_writer(&params.output_dir)?);
        }

        if let Some(w) = writer.as_mut() {
            w.write_frame(&frame)?;
        }
        last_frame_at = Some(Instant::now());
    }

    // Stop requested: finalize the in-flight segment so no captured
    // data is silently dropped.
    if let Some(partial) = writer.take() {
        finalize_segment(partial, &mut sink)?;
    }

    info!("capture loop stopped");
    Ok(())
}

fn open_writer(output_dir: &PathBuf) -> Result<SegmentWriter> {
    let started_at = Utc::now();
    let name = format!(
        "segment_{}_{}.tlseg",
        started_at.format("%Y%m%d_%H%M%S"),
        &Uuid::new_v4().simple().to_string()[..8],
    );
    SegmentWriter::create(output_dir.join(name), started_at)
}

/// Flushes the writer, then hands the metadata to the subscriber. The
/// file is durable on disk before the event fires.
fn finalize_segment(writer: SegmentWriter, sink: &mut SegmentSink) -> Result<()> {
    let started_at = writer.started_at();
    let path = writer.path().to_path_buf();
    let frames = writer.finalize()?;

    let end_time = Utc::now();
    let duration_secs = (end_time - started_at).num_milliseconds() as f64 / 1000.0;

    info!(
        "segment finalized: {} ({duration_secs:.1}s, {frames} frames)",
        path.display()
    );

    let meta = NewSegment {
        file_path: path.to_string_lossy().into_owned(),
        start_time: started_at,
        end_time,
        duration_secs,
    };

    // Subscriber failures (e.g. a full pool) must not kill the capture
    // loop; the file stays on disk either way.
    if let Err(err) = sink(meta) {
        error!("completed-segment subscriber failed: {err:#}");
    }
    Ok(())
}
