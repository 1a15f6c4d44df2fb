use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of a captured segment. Transitions only advance:
/// Pending -> Processing -> {Completed, Failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl SegmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentStatus::Pending => "pending",
            SegmentStatus::Processing => "processing",
            SegmentStatus::Completed => "completed",
            SegmentStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(SegmentStatus::Pending),
            "processing" => Ok(SegmentStatus::Processing),
            "completed" => Ok(SegmentStatus::Completed),
            "failed" => Ok(SegmentStatus::Failed),
            other => Err(anyhow!("unknown segment status '{other}'")),
        }
    }
}

/// A fixed-duration slice of captured screen video, backed by a file on
/// disk. Created by the capture loop on rotation; mutated only by the
/// scheduler afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub id: i64,
    pub file_path: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: f64,
    pub status: SegmentStatus,
    pub batch_id: Option<i64>,
}

/// Metadata emitted by the capture loop when a segment file is
/// finalized, before the row exists.
#[derive(Debug, Clone)]
pub struct NewSegment {
    pub file_path: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_secs: f64,
}
