use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use log::{debug, warn};
use serde_json::Value;

use crate::db::models::{AppUsage, Distraction, NewCard, Observation};

/// Longest raw reply excerpt kept when transcription output cannot be
/// parsed as JSON.
pub const FALLBACK_TEXT_MAX_CHARS: usize = 500;

/// Outcome of parsing a transcription reply. Callers must handle both
/// arms explicitly; there is no silent default.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscribeOutcome {
    /// The reply carried a well-formed observation list.
    Parsed(Vec<Observation>),
    /// The reply was not parseable JSON; the raw text is preserved as a
    /// single observation spanning the whole segment.
    RawFallback(Observation),
}

/// Extracts the first plausible JSON object embedded in model output.
/// Models occasionally wrap the object in prose or code fences, so this
/// takes the outermost brace span and validates it.
fn extract_json_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(&text[start..=end]).ok()
}

/// Parses a transcription reply. Never discards data: a malformed
/// reply degrades to one raw-text observation covering
/// `[0, duration_secs]`.
pub fn parse_observations(reply: &str, duration_secs: f64) -> TranscribeOutcome {
    let Some(root) = extract_json_object(reply) else {
        warn!(
            "transcription reply was not valid JSON, keeping raw text ({} chars)",
            reply.len()
        );
        return TranscribeOutcome::RawFallback(Observation {
            start_ts: 0.0,
            end_ts: duration_secs,
            text: truncate_chars(reply, FALLBACK_TEXT_MAX_CHARS),
            app_name: None,
            window_title: None,
        });
    };

    let items = root
        .get("observations")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let observations = items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            Some(Observation {
                start_ts: obj.get("start_ts").and_then(Value::as_f64).unwrap_or(0.0),
                end_ts: obj
                    .get("end_ts")
                    .and_then(Value::as_f64)
                    .unwrap_or(duration_secs),
                text: obj
                    .get("text")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                app_name: string_field(obj, "app_name"),
                window_title: string_field(obj, "window_title"),
            })
        })
        .collect();

    TranscribeOutcome::Parsed(observations)
}

/// Parses a synthesis reply into cards. Individual malformed entries
/// are skipped; a missing or unreadable timestamp falls back to an
/// offset from the batch start.
pub fn parse_cards(reply: &str, batch_start: DateTime<Utc>) -> Vec<NewCard> {
    let Some(root) = extract_json_object(reply) else {
        warn!("synthesis reply was not valid JSON, no cards produced");
        return Vec::new();
    };

    let items = root
        .get("cards")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    items
        .iter()
        .filter_map(|item| parse_card_entry(item, batch_start))
        .collect()
}

fn parse_card_entry(item: &Value, batch_start: DateTime<Utc>) -> Option<NewCard> {
    let Some(obj) = item.as_object() else {
        debug!("skipping non-object card entry");
        return None;
    };

    let start_time = obj
        .get("start_time")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .unwrap_or_else(|| offset_from(batch_start, obj, "start_offset"));
    let end_time = obj
        .get("end_time")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .unwrap_or_else(|| {
            let fallback = offset_from(batch_start, obj, "end_offset");
            fallback.max(start_time)
        });

    let app_usage = obj
        .get("app_sites")
        .and_then(Value::as_array)
        .map(|apps| {
            apps.iter()
                .filter_map(|app| {
                    let app = app.as_object()?;
                    Some(AppUsage {
                        name: app.get("name")?.as_str()?.to_string(),
                        duration_seconds: app
                            .get("duration_seconds")
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let distractions = obj
        .get("distractions")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let entry = entry.as_object()?;
                    Some(Distraction {
                        description: entry.get("description")?.as_str()?.to_string(),
                        timestamp: entry
                            .get("timestamp")
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0),
                        duration_seconds: entry
                            .get("duration_seconds")
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Some(NewCard {
        category: obj
            .get("category")
            .and_then(Value::as_str)
            .unwrap_or("other")
            .to_string(),
        title: obj
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or("Untitled activity")
            .to_string(),
        summary: obj
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        start_time,
        end_time,
        app_usage,
        distractions,
        productivity_score: obj
            .get("productivity_score")
            .and_then(Value::as_f64)
            .unwrap_or(0.0)
            .clamp(0.0, 100.0),
    })
}

fn string_field(obj: &serde_json::Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Accepts RFC3339 (with offset or Z) and, defensively, naive ISO
/// timestamps which some models emit; naive values are taken as UTC.
fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn offset_from(
    batch_start: DateTime<Utc>,
    obj: &serde_json::Map<String, Value>,
    key: &str,
) -> DateTime<Utc> {
    let seconds = obj.get(key).and_then(Value::as_f64).unwrap_or(0.0);
    batch_start + chrono::Duration::milliseconds((seconds * 1000.0) as i64)
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_observation_list() {
        let reply = r#"Here you go:
{"observations": [
  {"start_ts": 0, "end_ts": 30, "text": "Reading docs", "app_name": "Firefox"},
  {"start_ts": 30, "end_ts": 60, "text": "Writing code", "window_title": "main.rs"}
]}"#;
        match parse_observations(reply, 60.0) {
            TranscribeOutcome::Parsed(obs) => {
                assert_eq!(obs.len(), 2);
                assert_eq!(obs[0].app_name.as_deref(), Some("Firefox"));
                assert_eq!(obs[1].window_title.as_deref(), Some("main.rs"));
                assert!(obs[0].start_ts < obs[0].end_ts);
            }
            other => panic!("expected Parsed, got {other:?}"),
        }
    }

    #[test]
    fn malformed_reply_falls_back_to_single_raw_observation() {
        let reply = "x".repeat(FALLBACK_TEXT_MAX_CHARS + 100);
        match parse_observations(&reply, 42.5) {
            TranscribeOutcome::RawFallback(obs) => {
                assert_eq!(obs.start_ts, 0.0);
                assert_eq!(obs.end_ts, 42.5);
                assert_eq!(obs.text.chars().count(), FALLBACK_TEXT_MAX_CHARS);
                assert!(obs.app_name.is_none());
            }
            other => panic!("expected RawFallback, got {other:?}"),
        }
    }

    #[test]
    fn missing_end_ts_defaults_to_segment_duration() {
        let reply = r#"{"observations": [{"start_ts": 5, "text": "idle"}]}"#;
        match parse_observations(reply, 60.0) {
            TranscribeOutcome::Parsed(obs) => {
                assert_eq!(obs.len(), 1);
                assert_eq!(obs[0].end_ts, 60.0);
            }
            other => panic!("expected Parsed, got {other:?}"),
        }
    }

    #[test]
    fn card_with_timestamps_parses_fully() {
        let batch_start = Utc::now();
        let reply = r#"{"cards": [{
            "category": "coding",
            "title": "Pipeline work",
            "summary": "Implemented batching",
            "start_time": "2024-03-01T09:00:00Z",
            "end_time": "2024-03-01T09:45:00Z",
            "app_sites": [{"name": "VS Code", "duration_seconds": 2700}],
            "distractions": [{"description": "checked chat", "timestamp": 600, "duration_seconds": 120}],
            "productivity_score": 88
        }]}"#;
        let cards = parse_cards(reply, batch_start);
        assert_eq!(cards.len(), 1);
        let card = &cards[0];
        assert_eq!(card.category, "coding");
        assert_eq!(card.app_usage[0].name, "VS Code");
        assert_eq!(card.distractions[0].duration_seconds, 120.0);
        assert_eq!(card.productivity_score, 88.0);
        assert_eq!(card.start_time.to_rfc3339(), "2024-03-01T09:00:00+00:00");
    }

    #[test]
    fn missing_card_timestamps_fall_back_to_batch_offsets() {
        let batch_start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let reply = r#"{"cards": [{
            "category": "work",
            "title": "No clocks",
            "start_offset": 60,
            "end_offset": 180,
            "productivity_score": 150
        }]}"#;
        let cards = parse_cards(reply, batch_start);
        assert_eq!(cards.len(), 1);
        assert_eq!(
            cards[0].start_time,
            batch_start + chrono::Duration::seconds(60)
        );
        assert_eq!(
            cards[0].end_time,
            batch_start + chrono::Duration::seconds(180)
        );
        // Clamped into range.
        assert_eq!(cards[0].productivity_score, 100.0);
    }

    #[test]
    fn malformed_card_entries_are_skipped_not_fatal() {
        let batch_start = Utc::now();
        let reply = r#"{"cards": [
            "not an object",
            {"category": "work", "title": "Valid", "start_time": "2024-03-01T10:00:00Z", "end_time": "2024-03-01T10:30:00Z"}
        ]}"#;
        let cards = parse_cards(reply, batch_start);
        assert_eq!(cards.len(), 1);
        assert_eq!(cards[0].title, "Valid");
    }

    #[test]
    fn naive_timestamps_are_taken_as_utc() {
        assert_eq!(
            parse_timestamp("2024-03-01T09:00:00").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap()
        );
    }
}
