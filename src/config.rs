use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration for the whole pipeline. Built from a data
/// directory plus backend credentials; every knob has a default tuned
/// for continuous background recording.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// OpenAI-compatible endpoint base, e.g. `https://api.openai.com/v1`.
    pub api_base_url: String,
    pub api_key: String,
    pub model: String,
    /// Per-request HTTP timeout. Vision requests with several inline
    /// frames are slow; the default is generous.
    pub request_timeout: Duration,

    pub capture_fps: u32,
    pub segment_duration: Duration,
    /// Directory segment files are written to.
    pub segments_dir: PathBuf,

    /// Upper bound on total recorded duration per analysis batch.
    pub batch_duration_cap: Duration,
    /// How often the scheduler scans for pending segments.
    pub scan_interval: Duration,
    /// Delete segment files once their batch is committed as completed.
    pub auto_delete_segments: bool,

    pub database_path: PathBuf,
    pub pool_max_size: usize,
    pub pool_acquire_timeout: Duration,
    pub pool_idle_timeout: Duration,
    pub pool_reap_interval: Duration,
}

impl PipelineConfig {
    pub fn new(data_dir: PathBuf, api_base_url: String, api_key: String, model: String) -> Self {
        Self {
            api_base_url,
            api_key,
            model,
            request_timeout: Duration::from_secs(120),

            capture_fps: 1,
            segment_duration: Duration::from_secs(60),
            segments_dir: data_dir.join("segments"),

            batch_duration_cap: Duration::from_secs(15 * 60),
            scan_interval: Duration::from_secs(60),
            auto_delete_segments: true,

            database_path: data_dir.join("timelens.db"),
            pool_max_size: 5,
            pool_acquire_timeout: Duration::from_secs(30),
            pool_idle_timeout: Duration::from_secs(300),
            pool_reap_interval: Duration::from_secs(60),
        }
    }

    pub fn pool_config(&self) -> crate::db::pool::PoolConfig {
        crate::db::pool::PoolConfig {
            max_size: self.pool_max_size,
            acquire_timeout: self.pool_acquire_timeout,
            idle_timeout: self.pool_idle_timeout,
            reap_interval: self.pool_reap_interval,
        }
    }
}
