use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time spent in one application or site within a card's range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppUsage {
    pub name: String,
    #[serde(default)]
    pub duration_seconds: f64,
}

/// A moment the user drifted away from the card's main activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Distraction {
    pub description: String,
    #[serde(default)]
    pub timestamp: f64,
    #[serde(default)]
    pub duration_seconds: f64,
}

/// A synthesized, human-readable summary of activity over a time range.
/// Immutable once written except for user edits from the UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityCard {
    pub id: i64,
    pub category: String,
    pub title: String,
    pub summary: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub app_usage: Vec<AppUsage>,
    pub distractions: Vec<Distraction>,
    /// 0..=100, clamped on parse.
    pub productivity_score: f64,
}

/// Card contents before insertion assigns an id.
#[derive(Debug, Clone)]
pub struct NewCard {
    pub category: String,
    pub title: String,
    pub summary: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub app_usage: Vec<AppUsage>,
    pub distractions: Vec<Distraction>,
    pub productivity_score: f64,
}
