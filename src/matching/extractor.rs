//! LLM-backed title extraction for listings the cheap heuristics cannot clean.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::AiConfig;
use crate::error::{MatchError, StoreError};
use crate::model::EventType;
use crate::store::write_atomically;

const SYSTEM_PROMPT: &str = "You extract film titles from cinema listing strings. \
Listings may carry event-series prefixes, presenter names, format notes or \
suffixes such as Q&A or intro. Reply with one JSON object only: \
{\"title\": <the film's own title>, \"event\": <event type such as premiere, \
preview, q&a, kids, sing-along, or null>, \"confidence\": <0.0-1.0>}.";

/// Structured reply of the extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedTitle {
    pub title: String,
    pub event: Option<EventType>,
    pub confidence: f64,
}

#[async_trait]
pub trait TitleExtractor: Send + Sync {
    async fn extract(&self, raw_title: &str) -> Result<ExtractedTitle, MatchError>;
}

/// Extraction results keyed by raw title. Shared across a process and,
/// when it has a path, persisted between runs.
#[derive(Debug, Default)]
pub struct TitleCache {
    entries: Mutex<HashMap<String, ExtractedTitle>>,
    path: Option<PathBuf>,
}

impl TitleCache {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Loads `path` if it exists; a missing file is an empty cache.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let entries = if path.exists() {
            let content = fs::read_to_string(path)?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };
        debug!(path = %path.display(), entries = entries.len(), "title cache loaded");
        Ok(Self {
            entries: Mutex::new(entries),
            path: Some(path.to_path_buf()),
        })
    }

    pub fn get(&self, raw_title: &str) -> Option<ExtractedTitle> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(raw_title)
            .cloned()
    }

    pub fn insert(&self, raw_title: &str, extracted: ExtractedTitle) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(raw_title.to_string(), extracted);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the cache back to its file. No-op for in-memory caches.
    /// Concurrent saves are serialized; each one replaces the file whole.
    pub fn save(&self) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let json = serde_json::to_string_pretty(&*entries)?;
        write_atomically(path, &json)
    }
}

/// Pulls a JSON object out of a model reply, tolerating markdown fences and
/// prose around it.
pub fn extract_json_from_response(response: &str) -> String {
    let trimmed = response.trim();

    if let Some(start) = trimmed.find("```json")
        && let Some(end) = trimmed[start + 7..].find("```")
    {
        return trimmed[start + 7..start + 7 + end].trim().to_string();
    }
    if let Some(start) = trimmed.find("```") {
        let after_start = start + 3;
        let content_start = trimmed[after_start..]
            .find('\n')
            .map(|i| after_start + i + 1)
            .unwrap_or(after_start);
        if let Some(end) = trimmed[content_start..].find("```") {
            return trimmed[content_start..content_start + end].trim().to_string();
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}'))
        && end > start
    {
        return trimmed[start..=end].to_string();
    }
    trimmed.to_string()
}

#[derive(Debug, Deserialize)]
struct Reply {
    title: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    confidence: Option<serde_json::Value>,
}

/// Parses a model reply into an [`ExtractedTitle`]. Confidence may come
/// back as a number or as "high"/"medium"/"low".
pub fn parse_reply(content: &str) -> Result<ExtractedTitle, MatchError> {
    let json = extract_json_from_response(content);
    let reply: Reply = serde_json::from_str(&json).map_err(|e| MatchError::Parse(e.to_string()))?;
    let title = reply
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| MatchError::Parse("reply has no title".to_string()))?;
    let confidence = match reply.confidence {
        Some(serde_json::Value::Number(n)) => n.as_f64().unwrap_or(0.5),
        Some(serde_json::Value::String(s)) => match s.to_lowercase().as_str() {
            "high" => 0.9,
            "medium" => 0.6,
            "low" => 0.3,
            other => other.parse().unwrap_or(0.5),
        },
        _ => 0.5,
    };
    Ok(ExtractedTitle {
        title,
        event: reply.event.as_deref().and_then(EventType::from_hint),
        confidence: confidence.clamp(0.0, 1.0),
    })
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: String,
}

/// OpenAI-compatible chat-completions extractor. Calls are serialized and
/// spaced at least `min_interval` apart.
pub struct LlmExtractor {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
    min_interval: Duration,
    last_call: tokio::sync::Mutex<Option<Instant>>,
}

impl LlmExtractor {
    pub fn from_config(config: &AiConfig) -> Result<Self, MatchError> {
        if !config.enabled {
            return Err(MatchError::NotConfigured("title extractor"));
        }
        let api_key = std::env::var(&config.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or(MatchError::NotConfigured("LLM API key"))?;
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key,
            min_interval: Duration::from_millis(config.min_interval_ms),
            last_call: tokio::sync::Mutex::new(None),
        })
    }
}

#[async_trait]
impl TitleExtractor for LlmExtractor {
    async fn extract(&self, raw_title: &str) -> Result<ExtractedTitle, MatchError> {
        // Held for the whole call so requests never overlap.
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            tokio::time::sleep_until(prev + self.min_interval).await;
        }
        *last = Some(Instant::now());

        let body = ChatRequest {
            model: &self.model,
            temperature: 0.0,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: raw_title,
                },
            ],
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(MatchError::ProviderStatus {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        let reply: ChatResponse = resp.json().await?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| MatchError::Parse("empty choices".to_string()))?;
        let extracted = parse_reply(&content)?;
        info!(raw = raw_title, title = %extracted.title, confidence = extracted.confidence, "title extracted");
        Ok(extracted)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replies from a fixed table; unknown titles fail like a broken reply.
    #[derive(Default)]
    pub struct FakeExtractor {
        pub replies: HashMap<String, ExtractedTitle>,
        pub calls: AtomicUsize,
    }

    impl FakeExtractor {
        pub fn reply(mut self, raw: &str, title: &str, event: Option<EventType>, confidence: f64) -> Self {
            self.replies.insert(
                raw.to_string(),
                ExtractedTitle {
                    title: title.to_string(),
                    event,
                    confidence,
                },
            );
            self
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TitleExtractor for FakeExtractor {
        async fn extract(&self, raw_title: &str) -> Result<ExtractedTitle, MatchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .get(raw_title)
                .cloned()
                .ok_or_else(|| MatchError::Parse("no reply".to_string()))
        }
    }
}
