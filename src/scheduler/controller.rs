use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use log::{error, info};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::InferenceBackend;
use crate::config::PipelineConfig;
use crate::db::Store;
use crate::scheduler::worker::ScanWorker;

/// Owns the analysis loop: a dedicated thread hosting a single-threaded
/// runtime that alternates between interval scans and manual triggers.
/// The capture side never blocks on analysis; they meet only in the
/// database.
pub struct SchedulerController {
    scan_interval: Duration,
    cancel: Option<CancellationToken>,
    trigger_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SchedulerController {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            scan_interval: config.scan_interval,
            cancel: None,
            trigger_tx: None,
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    pub fn start<B>(&mut self, store: Store, backend: B, config: &PipelineConfig) -> Result<()>
    where
        B: InferenceBackend + 'static,
    {
        if self.handle.is_some() {
            bail!("scheduler is already running");
        }

        let cancel = CancellationToken::new();
        let (trigger_tx, trigger_rx) = mpsc::channel::<()>(1);
        // The worker shares the token so a mid-cycle stop ends the scan
        // at the next batch boundary instead of draining the whole queue.
        let worker = ScanWorker::new(store, backend, config, cancel.clone());
        let scan_interval = self.scan_interval;
        let loop_cancel = cancel.clone();

        let handle = thread::Builder::new()
            .name("timelens-scheduler".to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        error!("failed to build scheduler runtime: {err}");
                        return;
                    }
                };
                runtime.block_on(run_loop(worker, trigger_rx, loop_cancel, scan_interval));
            })
            .context("failed to spawn scheduler thread")?;

        self.cancel = Some(cancel);
        self.trigger_tx = Some(trigger_tx);
        self.handle = Some(handle);
        info!("scheduler started, scanning every {scan_interval:?}");
        Ok(())
    }

    /// Queues an out-of-band scan. A scan already queued or in flight
    /// absorbs the request.
    pub fn trigger_now(&self) {
        if let Some(tx) = &self.trigger_tx {
            let _ = tx.try_send(());
        }
    }

    pub fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        self.trigger_tx = None;

        if handle.join().is_err() {
            bail!("scheduler thread panicked");
        }
        info!("scheduler stopped");
        Ok(())
    }
}

impl Drop for SchedulerController {
    fn drop(&mut self) {
        if self.handle.is_some() {
            if let Err(err) = self.stop() {
                error!("scheduler shutdown error: {err:#}");
            }
        }
    }
}

async fn run_loop<B: InferenceBackend>(
    worker: ScanWorker<B>,
    mut trigger_rx: mpsc::Receiver<()>,
    cancel: CancellationToken,
    scan_interval: Duration,
) {
    let mut ticker = tokio::time::interval(scan_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(err) = worker.scan_and_process().await {
                    error!("scheduled scan failed: {err:#}");
                }
            }
            Some(()) = trigger_rx.recv() => {
                info!("manual scan triggered");
                if let Err(err) = worker.scan_and_process().await {
                    error!("triggered scan failed: {err:#}");
                }
            }
        }
    }
}
