//! Upstream model adapter.
//!
//! Advisors reply through a [`CompletionSource`], which turns a prompt into a
//! stream of text chunks. The HTTP implementation speaks the streaming
//! (server-sent events) flavour of the OpenAI and Anthropic chat APIs; the
//! echo implementation needs no network and is used for offline runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use council_core::{LlmProviderKind, LlmSettings};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ChatError, ChatResult};

/// Stream of reply chunks. Concatenating the `Ok` items yields the reply.
pub type ChunkStream = BoxStream<'static, ChatResult<String>>;

/// Role of a prompt message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptMessage {
    pub role: PromptRole,
    pub content: String,
}

impl PromptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: PromptRole::Assistant,
            content: content.into(),
        }
    }
}

/// Everything the model needs to produce one advisor reply
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub advisor_id: String,
    pub system: String,
    pub messages: Vec<PromptMessage>,
}

/// Produces a streamed reply for a prompt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CompletionSource: Send + Sync {
    /// Start the completion. Errors returned here happen before the first chunk.
    async fn stream(&self, request: CompletionRequest) -> ChatResult<ChunkStream>;
}

/// Build the completion source named by the settings.
pub fn completion_source_from_settings(
    settings: &LlmSettings,
) -> ChatResult<Arc<dyn CompletionSource>> {
    match settings.provider {
        LlmProviderKind::Echo => Ok(Arc::new(EchoCompletionSource)),
        _ => Ok(Arc::new(HttpCompletionSource::from_settings(settings)?)),
    }
}

// ============================================================================
// HTTP streaming source
// ============================================================================

const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;
const MAX_RETRIES: u32 = 3;

/// Wire format of the upstream event stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SseFormat {
    OpenAI,
    Anthropic,
}

/// Streams completions from the OpenAI or Anthropic HTTP API.
pub struct HttpCompletionSource {
    format: SseFormat,
    api_key: String,
    model: String,
    base_url: String,
    max_tokens: u32,
    client: reqwest::Client,
}

impl HttpCompletionSource {
    pub fn new(format: SseFormat, api_key: String, model: Option<String>) -> Self {
        let (default_model, base_url) = match format {
            SseFormat::OpenAI => ("gpt-5-mini", OPENAI_BASE_URL),
            SseFormat::Anthropic => ("claude-sonnet-4.5", ANTHROPIC_BASE_URL),
        };
        Self {
            format,
            api_key,
            model: model.unwrap_or_else(|| default_model.to_string()),
            base_url: base_url.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            client: reqwest::Client::new(),
        }
    }

    /// Create a source from settings, reading the API key from the environment.
    ///
    /// OpenAI uses `OPENAI_API_KEY`, Anthropic uses `ANTHROPIC_API_KEY`.
    pub fn from_settings(settings: &LlmSettings) -> ChatResult<Self> {
        let (format, key_var) = match settings.provider {
            LlmProviderKind::OpenAI => (SseFormat::OpenAI, "OPENAI_API_KEY"),
            LlmProviderKind::Anthropic => (SseFormat::Anthropic, "ANTHROPIC_API_KEY"),
            LlmProviderKind::Echo => {
                return Err(ChatError::LlmError(
                    "echo provider has no HTTP endpoint".to_string(),
                ))
            }
        };
        let api_key = std::env::var(key_var)
            .ok()
            .filter(|k| !k.is_empty())
            .ok_or(ChatError::LlmNotConfigured)?;

        let mut source = Self::new(format, api_key, settings.model.clone());
        if let Some(base_url) = &settings.base_url {
            source.base_url = base_url.trim_end_matches('/').to_string();
        }
        if let Some(max_tokens) = settings.max_tokens {
            source.max_tokens = max_tokens;
        }
        Ok(source)
    }

    pub fn format(&self) -> SseFormat {
        self.format
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        match self.format {
            SseFormat::OpenAI => format!("{}/chat/completions", self.base_url),
            SseFormat::Anthropic => format!("{}/messages", self.base_url),
        }
    }

    fn request_body(&self, request: &CompletionRequest) -> ChatResult<Value> {
        let body = match self.format {
            SseFormat::OpenAI => {
                let mut messages = vec![WireMessage {
                    role: "system",
                    content: &request.system,
                }];
                messages.extend(request.messages.iter().map(WireMessage::from));
                serde_json::to_value(OpenAIRequest {
                    model: &self.model,
                    messages,
                    max_completion_tokens: self.max_tokens,
                    stream: true,
                })?
            }
            SseFormat::Anthropic => serde_json::to_value(AnthropicRequest {
                model: &self.model,
                max_tokens: self.max_tokens,
                system: &request.system,
                messages: request.messages.iter().map(WireMessage::from).collect(),
                stream: true,
            })?,
        };
        Ok(body)
    }

    async fn send(&self, body: &Value) -> ChatResult<reqwest::Response> {
        let url = self.endpoint();
        let mut last_error = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 2s, 4s
                tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
            }

            let builder = self.client.post(&url).json(body);
            let builder = match self.format {
                SseFormat::OpenAI => {
                    builder.header("Authorization", format!("Bearer {}", self.api_key))
                }
                SseFormat::Anthropic => builder
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", ANTHROPIC_VERSION),
            };

            let response = match builder.send().await {
                Ok(resp) => resp,
                Err(e) => {
                    warn!("Model request failed (attempt {}): {}", attempt + 1, e);
                    last_error = Some(ChatError::LlmError(format!("Network error: {}", e)));
                    continue;
                }
            };

            let status = response.status();
            if status.is_server_error() || status.as_u16() == 429 {
                let body = response.text().await.unwrap_or_default();
                last_error = Some(ChatError::LlmError(format!(
                    "API error {} (attempt {}/{}): {}",
                    status,
                    attempt + 1,
                    MAX_RETRIES,
                    body
                )));
                continue;
            }
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(ChatError::LlmError(format!("API error {}: {}", status, body)));
            }
            return Ok(response);
        }

        Err(last_error.unwrap_or_else(|| ChatError::LlmError("Max retries exceeded".to_string())))
    }
}

#[async_trait]
impl CompletionSource for HttpCompletionSource {
    async fn stream(&self, request: CompletionRequest) -> ChatResult<ChunkStream> {
        let body = self.request_body(&request)?;
        debug!(
            "Streaming completion for advisor {} from {}",
            request.advisor_id,
            self.endpoint()
        );
        let response = self.send(&body).await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| e.to_string()))
            .boxed();
        Ok(decode_sse(bytes, self.format))
    }
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

impl<'a> From<&'a PromptMessage> for WireMessage<'a> {
    fn from(message: &'a PromptMessage) -> Self {
        let role = match message.role {
            PromptRole::User => "user",
            PromptRole::Assistant => "assistant",
        };
        Self {
            role,
            content: &message.content,
        }
    }
}

#[derive(Debug, Serialize)]
struct OpenAIRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    max_completion_tokens: u32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: Vec<WireMessage<'a>>,
    stream: bool,
}

// ============================================================================
// Server-sent events
// ============================================================================

/// Splits a byte stream into SSE `data:` payloads.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed bytes and return the data payloads of every complete line.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(bytes);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum SseEvent {
    Text(String),
    Done,
    Error(String),
}

fn parse_event(format: SseFormat, data: &str) -> Option<SseEvent> {
    if format == SseFormat::OpenAI && data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    let value: Value = match serde_json::from_str(data) {
        Ok(v) => v,
        Err(e) => {
            debug!("Skipping undecodable event: {}", e);
            return None;
        }
    };
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown upstream error");
        return Some(SseEvent::Error(message.to_string()));
    }

    match format {
        SseFormat::OpenAI => value
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
            .filter(|t| !t.is_empty())
            .map(|t| SseEvent::Text(t.to_string())),
        SseFormat::Anthropic => match value.get("type").and_then(Value::as_str) {
            Some("content_block_delta") => value
                .pointer("/delta/text")
                .and_then(Value::as_str)
                .map(|t| SseEvent::Text(t.to_string())),
            Some("message_stop") => Some(SseEvent::Done),
            _ => None,
        },
    }
}

struct SseState {
    body: BoxStream<'static, Result<Vec<u8>, String>>,
    decoder: SseDecoder,
    format: SseFormat,
    pending: VecDeque<ChatResult<String>>,
    finished: bool,
}

/// Turn a raw SSE byte stream into a stream of reply chunks.
pub fn decode_sse(
    body: BoxStream<'static, Result<Vec<u8>, String>>,
    format: SseFormat,
) -> ChunkStream {
    let state = SseState {
        body,
        decoder: SseDecoder::new(),
        format,
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.finished {
                return None;
            }
            match st.body.next().await {
                Some(Ok(bytes)) => {
                    for data in st.decoder.push(&bytes) {
                        match parse_event(st.format, &data) {
                            Some(SseEvent::Text(text)) => st.pending.push_back(Ok(text)),
                            Some(SseEvent::Done) => {
                                st.finished = true;
                                break;
                            }
                            Some(SseEvent::Error(message)) => {
                                st.pending
                                    .push_back(Err(ChatError::UpstreamStreamFailure(message)));
                                st.finished = true;
                                break;
                            }
                            None => {}
                        }
                    }
                }
                Some(Err(e)) => {
                    st.pending.push_back(Err(ChatError::UpstreamStreamFailure(format!(
                        "stream read failed: {}",
                        e
                    ))));
                    st.finished = true;
                }
                None => st.finished = true,
            }
        }
    })
    .boxed()
}

// ============================================================================
// Offline source
// ============================================================================

/// Replies with the last user message, one word per chunk.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoCompletionSource;

#[async_trait]
impl CompletionSource for EchoCompletionSource {
    async fn stream(&self, request: CompletionRequest) -> ChatResult<ChunkStream> {
        let text = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == PromptRole::User)
            .map(|m| m.content.clone())
            .unwrap_or_default();
        let chunks: Vec<ChatResult<String>> = text
            .split_inclusive(' ')
            .map(|word| Ok(word.to_string()))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}
