use std::fmt::Write as _;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::config::PipelineConfig;
use crate::db::models::{ActivityCard, NewCard, Observation, Segment};
use crate::error::BackendError;

pub mod frames;
pub mod parse;
mod prompts;

pub use frames::MAX_FRAMES_PER_SEGMENT;
pub use parse::TranscribeOutcome;

/// Context cards included in a synthesis prompt.
const CONTEXT_CARDS_IN_PROMPT: usize = 3;

/// Remote multimodal inference operations the scheduler depends on.
/// The scheduler is generic over this trait so cycles can be exercised
/// without a network.
#[async_trait]
pub trait InferenceBackend: Send + Sync {
    /// Turns one segment into timestamped observations. Offsets in the
    /// result are relative to the segment start.
    async fn transcribe(&self, segment: &Segment) -> Result<Vec<Observation>, BackendError>;

    /// Synthesizes activity cards from batch-relative observations.
    async fn synthesize(
        &self,
        observations: &[Observation],
        context_cards: &[ActivityCard],
        batch_start: DateTime<Utc>,
    ) -> Result<Vec<NewCard>, BackendError>;
}

/// Client for an OpenAI-compatible chat-completions endpoint with
/// vision input. One shared HTTP client, bearer auth, bounded timeout.
pub struct BackendClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl BackendClient {
    pub fn new(config: &PipelineConfig) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
        })
    }

    async fn chat_completion(&self, messages: Value) -> Result<String, BackendError> {
        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": 0.3,
            "max_tokens": 4096,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Api {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let reply: Value = response.json().await?;
        reply["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or(BackendError::EmptyReply)
    }

    /// Probe used by settings surfaces to validate endpoint and key.
    pub async fn check_connection(&self) -> (bool, String) {
        let messages = json!([{"role": "user", "content": "hi"}]);
        match self.chat_completion(messages).await {
            Ok(_) => (true, format!("connected, model {}", self.model)),
            Err(err) => (false, err.to_string()),
        }
    }
}

#[async_trait]
impl InferenceBackend for BackendClient {
    async fn transcribe(&self, segment: &Segment) -> Result<Vec<Observation>, BackendError> {
        let path = PathBuf::from(&segment.file_path);
        let display_path = segment.file_path.clone();

        // Decode/re-encode is CPU work; keep it off the scheduler's
        // runtime thread.
        let sampled = tokio::task::spawn_blocking(move || {
            frames::sample_frames_base64(&path, MAX_FRAMES_PER_SEGMENT)
        })
        .await
        .map_err(|err| BackendError::FrameSampling {
            path: display_path.clone(),
            cause: anyhow::Error::new(err),
        })?
        .map_err(|err| BackendError::FrameSampling {
            path: display_path.clone(),
            cause: err,
        })?;

        if sampled.is_empty() {
            warn!("segment {} produced no frames to sample", segment.id);
            return Ok(Vec::new());
        }

        let mut content = vec![json!({
            "type": "text",
            "text": format!(
                "These are {} key frames from a {:.0} second screen recording. \
                 Analyze the user's activity.",
                sampled.len(),
                segment.duration_secs,
            ),
        })];
        for frame in &sampled {
            content.push(json!({
                "type": "image_url",
                "image_url": {
                    "url": format!("data:image/jpeg;base64,{frame}"),
                    "detail": "low",
                },
            }));
        }

        let messages = json!([
            {"role": "system", "content": prompts::TRANSCRIBE_SYSTEM_PROMPT},
            {"role": "user", "content": content},
        ]);

        let reply = self.chat_completion(messages).await?;
        match parse::parse_observations(&reply, segment.duration_secs) {
            TranscribeOutcome::Parsed(observations) => {
                debug!(
                    "segment {} transcribed into {} observation(s)",
                    segment.id,
                    observations.len()
                );
                Ok(observations)
            }
            TranscribeOutcome::RawFallback(observation) => {
                warn!(
                    "segment {} reply kept as raw fallback observation",
                    segment.id
                );
                Ok(vec![observation])
            }
        }
    }

    async fn synthesize(
        &self,
        observations: &[Observation],
        context_cards: &[ActivityCard],
        batch_start: DateTime<Utc>,
    ) -> Result<Vec<NewCard>, BackendError> {
        if observations.is_empty() {
            return Ok(Vec::new());
        }

        let digest = build_digest(observations, context_cards, batch_start);
        let messages = json!([
            {"role": "system", "content": prompts::SYNTHESIZE_SYSTEM_PROMPT},
            {"role": "user", "content": digest},
        ]);

        let reply = self.chat_completion(messages).await?;
        let cards = parse::parse_cards(&reply, batch_start);
        info!("synthesis produced {} card(s)", cards.len());
        Ok(cards)
    }
}

/// Textual digest of a batch: per-observation time ranges, the batch
/// start for absolute anchoring, and a short recap of recent cards.
fn build_digest(
    observations: &[Observation],
    context_cards: &[ActivityCard],
    batch_start: DateTime<Utc>,
) -> String {
    let mut digest = String::from("Observations:\n");
    for obs in observations {
        let _ = write!(
            digest,
            "- [{:.0}s - {:.0}s] {}",
            obs.start_ts, obs.end_ts, obs.text
        );
        if let Some(app) = &obs.app_name {
            let _ = write!(digest, " (app: {app})");
        }
        digest.push('\n');
    }

    let _ = write!(
        digest,
        "\nRecording started at: {}\n",
        batch_start.to_rfc3339()
    );

    if !context_cards.is_empty() {
        digest.push_str("\nPreceding activity cards:\n");
        for card in context_cards.iter().take(CONTEXT_CARDS_IN_PROMPT) {
            let _ = writeln!(digest, "- {}: {}", card.category, card.title);
        }
    }

    digest
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_lists_observations_and_recent_cards() {
        let observations = vec![
            Observation {
                start_ts: 0.0,
                end_ts: 60.0,
                text: "Editing code".into(),
                app_name: Some("VS Code".into()),
                window_title: None,
            },
            Observation {
                start_ts: 60.0,
                end_ts: 90.0,
                text: "Reading docs".into(),
                app_name: None,
                window_title: None,
            },
        ];
        let cards = vec![
            ActivityCard {
                id: 1,
                category: "work".into(),
                title: "Morning review".into(),
                summary: String::new(),
                start_time: Utc::now(),
                end_time: Utc::now(),
                app_usage: vec![],
                distractions: vec![],
                productivity_score: 70.0,
            };
            5
        ];

        let digest = build_digest(&observations, &cards, Utc::now());
        assert!(digest.contains("[0s - 60s] Editing code (app: VS Code)"));
        assert!(digest.contains("[60s - 90s] Reading docs\n"));
        // Only the three most recent context cards make it in.
        assert_eq!(digest.matches("Morning review").count(), 3);
    }

    #[tokio::test]
    async fn check_connection_reports_unreachable_endpoints() {
        let mut config = PipelineConfig::new(
            std::path::PathBuf::from("unused"),
            // Nothing listens here; the probe must fail fast and carry
            // a human-readable reason, not panic or hang.
            "http://127.0.0.1:1".into(),
            "key".into(),
            "test-model".into(),
        );
        config.request_timeout = std::time::Duration::from_secs(2);

        let client = BackendClient::new(&config).unwrap();
        let (connected, message) = client.check_connection().await;
        assert!(!connected);
        assert!(!message.is_empty());
    }
}
