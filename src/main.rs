use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use log::info;

use timelens::capture::PrimaryMonitorSource;
use timelens::{Pipeline, PipelineConfig};

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_secs(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn config_from_env() -> Result<PipelineConfig> {
    let api_key =
        std::env::var("TIMELENS_API_KEY").context("TIMELENS_API_KEY must be set")?;
    let data_dir = PathBuf::from(env_or("TIMELENS_DATA_DIR", "timelens-data"));

    let mut config = PipelineConfig::new(
        data_dir,
        env_or("TIMELENS_API_BASE_URL", "https://api.openai.com/v1"),
        api_key,
        env_or("TIMELENS_MODEL", "gpt-4o-mini"),
    );

    if let Ok(fps) = std::env::var("TIMELENS_FPS") {
        config.capture_fps = fps.parse().context("TIMELENS_FPS must be an integer")?;
    }
    if let Some(secs) = env_secs("TIMELENS_SEGMENT_SECS") {
        config.segment_duration = secs;
    }
    if let Some(secs) = env_secs("TIMELENS_SCAN_INTERVAL_SECS") {
        config.scan_interval = secs;
    }
    if let Some(secs) = env_secs("TIMELENS_BATCH_CAP_SECS") {
        config.batch_duration_cap = secs;
    }
    if std::env::var("TIMELENS_KEEP_SEGMENTS").is_ok() {
        config.auto_delete_segments = false;
    }

    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = config_from_env()?;
    let mut pipeline = Pipeline::new(config)?;

    let source = PrimaryMonitorSource::new().context("failed to open screen capture")?;
    pipeline.start(Box::new(source))?;
    info!("recording, press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutting down");

    pipeline.stop()?;
    Ok(())
}
