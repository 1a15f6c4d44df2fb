use anyhow::{Context, Result};
use log::{debug, info};

use crate::backend::BackendClient;
use crate::capture::{CaptureController, CaptureState, FrameSource, SegmentSink};
use crate::config::PipelineConfig;
use crate::db::Store;
use crate::scheduler::SchedulerController;

/// Wires the three halves together: the capture thread writing segment
/// files, the scheduler thread analyzing them, and the store both sides
/// meet in. Neither worker ever calls into the other.
pub struct Pipeline {
    config: PipelineConfig,
    store: Store,
    capture: CaptureController,
    scheduler: SchedulerController,
}

impl Pipeline {
    /// Opens the store (running migrations) and prepares both workers.
    /// Nothing records until `start`.
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let store = Store::open(config.database_path.clone(), config.pool_config())?;
        let capture = CaptureController::new(&config);
        let scheduler = SchedulerController::new(&config);
        Ok(Self {
            config,
            store,
            capture,
            scheduler,
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn capture_state(&self) -> CaptureState {
        self.capture.state()
    }

    pub fn start(&mut self, source: Box<dyn FrameSource>) -> Result<()> {
        let backend =
            BackendClient::new(&self.config).context("failed to build backend client")?;
        self.scheduler
            .start(self.store.clone(), backend, &self.config)?;

        let store = self.store.clone();
        let sink: SegmentSink = Box::new(move |segment| {
            let id = store
                .save_segment(&segment)
                .context("failed to persist completed segment")?;
            debug!("segment {id} queued for analysis");
            Ok(())
        });
        self.capture.start(source, sink)?;

        info!("pipeline running");
        Ok(())
    }

    pub fn pause(&self) {
        self.capture.pause();
    }

    pub fn resume(&self) {
        self.capture.resume();
    }

    /// Queues an immediate analysis scan.
    pub fn trigger_scan(&self) {
        self.scheduler.trigger_now();
    }

    /// Stops capture first so the final segment lands in the database,
    /// then the scheduler, then the pool. Segments still pending at
    /// shutdown stay queued and are picked up on the next start.
    pub fn stop(&mut self) -> Result<()> {
        let capture_result = self.capture.stop();
        let scheduler_result = self.scheduler.stop();
        self.store.close();

        capture_result?;
        scheduler_result?;
        info!("pipeline stopped");
        Ok(())
    }
}
