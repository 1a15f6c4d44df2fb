use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Processing => "processing",
            BatchStatus::Completed => "completed",
            BatchStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        match value {
            "pending" => Ok(BatchStatus::Pending),
            "processing" => Ok(BatchStatus::Processing),
            "completed" => Ok(BatchStatus::Completed),
            "failed" => Ok(BatchStatus::Failed),
            other => Err(anyhow!("unknown batch status '{other}'")),
        }
    }
}

/// A time-bounded group of consecutive segments submitted together for
/// analysis. Terminal state is Completed or Failed; never re-opened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    pub id: i64,
    pub segment_ids: Vec<i64>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub status: BatchStatus,
    /// Serialized `Vec<Observation>` captured at completion.
    pub observations_json: String,
    pub error_message: Option<String>,
}

/// A time-stamped textual description of activity derived from one
/// segment. Offsets are seconds relative to the owning batch start and
/// stay relative until a card is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub start_ts: f64,
    pub end_ts: f64,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_title: Option<String>,
}

impl Observation {
    /// Shift both offsets by `seconds`, moving this observation from
    /// segment-relative to batch-relative time.
    pub fn shift(&mut self, seconds: f64) {
        self.start_ts += seconds;
        self.end_ts += seconds;
    }
}
