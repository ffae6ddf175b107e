//! LLM chat-completion client.
//!
//! The pipeline only needs one operation from the model provider:
//! `complete(prompt) -> text`. [`Complete`] captures that, and
//! [`OpenAiClient`] implements it against any OpenAI-compatible
//! `/chat/completions` endpoint.
//!
//! Quota rejections (HTTP 429, or a body that reads like one) surface as
//! [`LlmError::RateLimited`] so the retry wrapper can tell them apart from
//! permanent failures.

use crate::config::LlmConfig;
use crate::error::LlmError;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// Async text completion.
pub trait Complete {
    /// Send `prompt` to the model and return its reply.
    async fn complete(&self, prompt: &str) -> Result<String, LlmError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    content: Option<String>,
}

/// Client for an OpenAI-compatible chat completion API.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    http: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig, api_key: Option<String>) -> Result<Self, LlmError> {
        let http = Client::builder().build()?;
        Ok(Self {
            http,
            endpoint: format!("{}/chat/completions", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: api_key.or_else(|| config.api_key.clone()),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Complete for OpenAiClient {
    #[instrument(level = "info", skip_all, fields(model = %self.model))]
    async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
        let t0 = Instant::now();
        let body = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut request = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await?;
        let dt = t0.elapsed();

        if !(200..300).contains(&status) {
            warn!(status, elapsed_ms = dt.as_millis() as u64, "API call failed");
            return Err(LlmError::from_status(status, text));
        }

        let parsed: ChatResponse = serde_json::from_str(&text)?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("response had no content".to_string()))?;

        debug!(elapsed_ms = dt.as_millis() as u64, bytes = content.len(), "API call succeeded");
        Ok(content)
    }
}

/// Race a completion against a deadline.
pub async fn with_deadline<F>(deadline: Duration, call: F) -> Result<String, LlmError>
where
    F: Future<Output = Result<String, LlmError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(LlmError::Timeout(deadline)),
    }
}

#[cfg(test)]
pub mod mock {
    //! Scripted completion client for unit tests.

    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// What the mock does when it sees a prompt containing a given key.
    #[derive(Debug, Clone)]
    pub enum Script {
        Reply(String),
        /// Fail with a rate limit `n` times, then reply.
        RateLimitedThen(usize, String),
        Fail(u16, String),
        /// Never answer within any reasonable deadline.
        Hang,
    }

    #[derive(Debug, Default)]
    pub struct MockClient {
        scripts: Vec<(String, Script)>,
        seen: Mutex<HashMap<String, usize>>,
        calls: AtomicUsize,
    }

    impl MockClient {
        pub fn new() -> Self {
            Self::default()
        }

        /// Answer prompts containing `key` with `script`.
        pub fn on(mut self, key: &str, script: Script) -> Self {
            self.scripts.push((key.to_string(), script));
            self
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// How many times a prompt containing `key` was sent.
        pub fn calls_for(&self, key: &str) -> usize {
            self.seen.lock().unwrap().get(key).copied().unwrap_or(0)
        }
    }

    impl Complete for MockClient {
        async fn complete(&self, prompt: &str) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let Some((key, script)) = self.scripts.iter().find(|(k, _)| prompt.contains(k.as_str())) else {
                return Err(LlmError::InvalidResponse(format!("no script for prompt: {prompt}")));
            };
            let seen = {
                let mut seen = self.seen.lock().unwrap();
                let count = seen.entry(key.clone()).or_insert(0);
                *count += 1;
                *count
            };
            match script {
                Script::Reply(text) => Ok(text.clone()),
                Script::RateLimitedThen(n, text) => {
                    if seen <= *n {
                        Err(LlmError::from_status(429, "Rate limit reached".to_string()))
                    } else {
                        Ok(text.clone())
                    }
                }
                Script::Fail(status, message) => Err(LlmError::from_status(*status, message.clone())),
                Script::Hang => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Err(LlmError::InvalidResponse("hung".to_string()))
                }
            }
        }
    }
}
