use std::{
    sync::{
        atomic::Ordering,
        Arc, Mutex,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use anyhow::{anyhow, bail, Context, Result};
use log::info;
use serde::Serialize;

use crate::config::PipelineConfig;

use super::recorder::{capture_loop, CaptureFlags, RecorderParams, SegmentSink};
use super::source::FrameSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureState {
    Idle,
    Recording,
    Paused,
    Stopping,
}

/// Facade over the capture worker thread.
///
/// `start` spawns the dedicated thread that owns all blocking
/// grab/write I/O; `stop` signals the cooperative flag and joins,
/// surfacing any writer error the loop ended with.
pub struct CaptureController {
    fps: u32,
    segment_duration: Duration,
    output_dir: std::path::PathBuf,
    flags: Arc<CaptureFlags>,
    handle: Option<JoinHandle<Result<()>>>,
    state: Arc<Mutex<CaptureState>>,
}

impl CaptureController {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            fps: config.capture_fps,
            segment_duration: config.segment_duration,
            output_dir: config.segments_dir.clone(),
            flags: Arc::new(CaptureFlags::new()),
            handle: None,
            state: Arc::new(Mutex::new(CaptureState::Idle)),
        }
    }

    pub fn state(&self) -> CaptureState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_recording(&self) -> bool {
        matches!(self.state(), CaptureState::Recording | CaptureState::Paused)
    }

    /// Starts recording. `source` is the injected screen grabber and
    /// `sink` the single completed-segment subscriber.
    pub fn start(&mut self, source: Box<dyn FrameSource>, sink: SegmentSink) -> Result<()> {
        if self.handle.is_some() {
            bail!("capture already active");
        }

        self.flags.stop.store(false, Ordering::Release);
        self.flags.paused.store(false, Ordering::Release);

        let params = RecorderParams {
            fps: self.fps,
            segment_duration: self.segment_duration,
            output_dir: self.output_dir.clone(),
        };
        let flags = Arc::clone(&self.flags);
        let state = Arc::clone(&self.state);

        let handle = thread::Builder::new()
            .name("timelens-capture".into())
            .spawn(move || {
                let result = capture_loop(source, sink, params, flags);
                *state.lock().unwrap_or_else(|e| e.into_inner()) = CaptureState::Idle;
                result
            })
            .context("failed to spawn capture thread")?;

        self.handle = Some(handle);
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = CaptureState::Recording;
        info!("capture started");
        Ok(())
    }

    pub fn pause(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == CaptureState::Recording {
            self.flags.paused.store(true, Ordering::Release);
            *state = CaptureState::Paused;
            info!("capture paused");
        }
    }

    pub fn resume(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == CaptureState::Paused {
            self.flags.paused.store(false, Ordering::Release);
            *state = CaptureState::Recording;
            info!("capture resumed");
        }
    }

    /// Signals the loop to stop and joins the worker. The in-flight
    /// segment is finalized before the thread exits (bounded by one
    /// capture tick); finalize failures propagate here.
    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = CaptureState::Stopping;
        self.flags.stop.store(true, Ordering::Release);

        let result = handle
            .join()
            .map_err(|_| anyhow!("capture thread panicked"))?;
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = CaptureState::Idle;
        info!("capture stopped");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::source::Frame;
    use crate::db::models::NewSegment;
    use std::sync::mpsc;

    fn test_config(dir: &std::path::Path) -> PipelineConfig {
        let mut config = PipelineConfig::new(
            dir.to_path_buf(),
            "http://localhost".into(),
            "key".into(),
            "model".into(),
        );
        config.capture_fps = 50;
        config.segment_duration = Duration::from_millis(100);
        config
    }

    #[test]
    fn rotation_emits_segments_with_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut controller = CaptureController::new(&test_config(dir.path()));

        let (tx, rx) = mpsc::channel::<(NewSegment, bool)>();
        let sink: SegmentSink = Box::new(move |meta: NewSegment| {
            let exists = std::path::Path::new(&meta.file_path).exists();
            tx.send((meta, exists)).ok();
            Ok(())
        });

        let source = Box::new(|| Ok(Some(Frame::from_pixel(8, 8, image::Rgb([1, 2, 3])))));
        controller.start(source, sink).unwrap();
        assert_eq!(controller.state(), CaptureState::Recording);

        // Long enough for at least one rotation at 100ms segments.
        let (first, existed) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(existed, "file must exist when the event fires");
        assert!(first.duration_secs > 0.0);
        assert!(first.end_time >= first.start_time);

        controller.stop().unwrap();
        assert_eq!(controller.state(), CaptureState::Idle);
    }

    #[test]
    fn stop_finalizes_in_flight_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.segment_duration = Duration::from_secs(3600); // never rotates on its own
        let mut controller = CaptureController::new(&config);

        let (tx, rx) = mpsc::channel::<NewSegment>();
        let sink: SegmentSink = Box::new(move |meta| {
            tx.send(meta).ok();
            Ok(())
        });
        let source = Box::new(|| Ok(Some(Frame::from_pixel(4, 4, image::Rgb([9, 9, 9])))));

        controller.start(source, sink).unwrap();
        std::thread::sleep(Duration::from_millis(120));
        controller.stop().unwrap();

        let meta = rx.try_recv().expect("stop must finalize the open segment");
        assert!(std::path::Path::new(&meta.file_path).exists());
    }

    #[test]
    fn pause_suspends_frame_intake() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.segment_duration = Duration::from_secs(3600);
        let mut controller = CaptureController::new(&config);

        let grabs = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let grabs_in_source = Arc::clone(&grabs);
        let source = Box::new(move || {
            grabs_in_source.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Frame::from_pixel(4, 4, image::Rgb([0, 0, 0]))))
        });
        let sink: SegmentSink = Box::new(|_| Ok(()));

        controller.start(source, sink).unwrap();
        std::thread::sleep(Duration::from_millis(80));
        controller.pause();
        assert_eq!(controller.state(), CaptureState::Paused);
        std::thread::sleep(Duration::from_millis(50));
        let frozen = grabs.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(grabs.load(Ordering::SeqCst), frozen);

        controller.resume();
        assert_eq!(controller.state(), CaptureState::Recording);
        std::thread::sleep(Duration::from_millis(100));
        assert!(grabs.load(Ordering::SeqCst) > frozen);

        controller.stop().unwrap();
    }
}
