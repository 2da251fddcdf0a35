//! **Language model** — assemble the turn prompt, get a reply and intent tags.
//!
//! The request carries the caller's utterance, a bounded window of prior
//! turns, and the campaign script context. The response is plain text plus
//! optional structured intent tags the trigger matcher inspects.

use async_trait::async_trait;
use ringline_core::{ConversationTurn, RinglineError, RinglineResult, Speaker};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_MODEL: &str = "meta-llama/llama-3.3-70b-instruct";

/// One turn request to the language model.
#[derive(Debug, Clone)]
pub struct LmRequest {
    /// What the caller just said.
    pub utterance: String,
    /// Bounded recent-turns window, oldest first.
    pub history: Vec<ConversationTurn>,
    /// Campaign script context (persona, goal, constraints).
    pub script_context: String,
}

/// Language-model reply for one turn.
#[derive(Debug, Clone, Default)]
pub struct LmResponse {
    pub text: String,
    /// Structured intent tags (e.g. "transfer"), if the model emits them.
    pub intents: Vec<String>,
}

#[async_trait]
pub trait LanguageBackend: Send + Sync {
    async fn complete(&self, req: &LmRequest) -> RinglineResult<LmResponse>;
}

// OpenAI-compatible request/response shapes.
#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageResponse,
}

#[derive(Deserialize)]
struct ChatMessageResponse {
    content: String,
}

/// Production backend: OpenAI-compatible chat completion API.
/// Env: `RINGLINE_LLM_URL` (default OpenRouter), `RINGLINE_LLM_KEY`,
/// `RINGLINE_LLM_MODEL`.
pub struct HttpLanguage {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    client: reqwest::Client,
}

impl HttpLanguage {
    pub fn from_env() -> RinglineResult<Self> {
        let base_url = std::env::var("RINGLINE_LLM_URL")
            .unwrap_or_else(|_| "https://openrouter.ai/api/v1".to_string());
        let api_key = std::env::var("RINGLINE_LLM_KEY")
            .map_err(|_| RinglineError::Config("RINGLINE_LLM_KEY not set".to_string()))?;
        let model = std::env::var("RINGLINE_LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| RinglineError::Language(e.to_string()))?;
        Ok(Self {
            base_url,
            api_key,
            model,
            client,
        })
    }

    fn build_messages(req: &LmRequest) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage {
            role: "system".to_string(),
            content: format!(
                "{}\n\nIf the caller should be handed to a human agent, end your reply with the tag [intent:transfer].",
                req.script_context
            ),
        }];
        for turn in &req.history {
            messages.push(ChatMessage {
                role: match turn.speaker {
                    Speaker::Caller => "user".to_string(),
                    Speaker::Assistant => "assistant".to_string(),
                },
                content: turn.text.clone(),
            });
        }
        messages.push(ChatMessage {
            role: "user".to_string(),
            content: req.utterance.clone(),
        });
        messages
    }
}

/// Pulls `[intent:...]` tags out of model text; returns (clean_text, tags).
pub fn extract_intents(text: &str) -> (String, Vec<String>) {
    let mut intents = Vec::new();
    let mut clean = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("[intent:") {
        clean.push_str(&rest[..start]);
        let after = &rest[start + 8..];
        match after.find(']') {
            Some(end) => {
                intents.push(after[..end].trim().to_string());
                rest = &after[end + 1..];
            }
            None => {
                clean.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    clean.push_str(rest);
    (clean.trim().to_string(), intents)
}

#[async_trait]
impl LanguageBackend for HttpLanguage {
    async fn complete(&self, req: &LmRequest) -> RinglineResult<LmResponse> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: self.model.clone(),
            messages: Self::build_messages(req),
            temperature: Some(0.6),
            max_tokens: Some(200),
        };
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| RinglineError::Language(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let text = res.text().await.unwrap_or_default();
            return Err(RinglineError::Language(format!(
                "LLM API error {status}: {text}"
            )));
        }
        let parsed: ChatResponse = res
            .json()
            .await
            .map_err(|e| RinglineError::Language(e.to_string()))?;
        let raw = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        let (text, intents) = extract_intents(&raw);
        Ok(LmResponse { text, intents })
    }
}

/// Placeholder backend: fixed reply with optional intents and an optional
/// artificial delay (latency-budget tests).
#[derive(Debug, Clone, Default)]
pub struct PlaceholderLanguage {
    pub reply: String,
    pub intents: Vec<String>,
    pub delay: Option<Duration>,
}

impl PlaceholderLanguage {
    pub fn with_reply(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl LanguageBackend for PlaceholderLanguage {
    async fn complete(&self, _req: &LmRequest) -> RinglineResult<LmResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        Ok(LmResponse {
            text: self.reply.clone(),
            intents: self.intents.clone(),
        })
    }
}
