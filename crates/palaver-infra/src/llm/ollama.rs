//! Ollama backend implementation.
//!
//! Streams chat completions from a local Ollama server through
//! `POST /api/chat`. The response body is newline-delimited JSON: one
//! object per token batch, the last one carrying `"done": true`.

use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use palaver_core::llm::provider::{LlmProvider, LlmStream};
use palaver_types::backend::BackendConfig;
use palaver_types::error::GatewayError;
use palaver_types::llm::{CompletionRequest, LlmError, StreamEvent, Usage};

pub const DEFAULT_BASE_URL: &str = "http://localhost:11434";

#[derive(Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatBodyMessage<'a>>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<ChatOptions>,
}

#[derive(Serialize)]
struct ChatBodyMessage<'a> {
    role: String,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

/// One line of the NDJSON response.
#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

/// Ollama backend client.
#[derive(Clone)]
pub struct OllamaProvider {
    base_url: String,
    model: String,
    http_client: reqwest::Client,
}

impl OllamaProvider {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self, GatewayError> {
        let http_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| GatewayError::BackendConfig {
                tag: "ollama".to_string(),
                message: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            model: model.into(),
            http_client,
        })
    }

    /// Build from the `[backends.ollama]` map. `model` is required.
    pub fn from_backend_config(tag: &str, config: &BackendConfig) -> Result<Self, GatewayError> {
        let model = config.require(tag, "model")?;
        Self::new(config.get_or("base_url", DEFAULT_BASE_URL), model)
    }

    fn chat_url(&self) -> String {
        format!("{}/api/chat", self.base_url)
    }

    fn build_body<'a>(&'a self, request: &'a CompletionRequest) -> ChatBody<'a> {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = request.system.as_deref() {
            messages.push(ChatBodyMessage {
                role: "system".to_string(),
                content: system,
            });
        }
        messages.extend(request.messages.iter().map(|m| ChatBodyMessage {
            role: m.role.to_string(),
            content: &m.content,
        }));

        let options = (request.temperature.is_some() || request.max_tokens.is_some()).then(|| {
            ChatOptions {
                temperature: request.temperature,
                num_predict: request.max_tokens,
            }
        });

        ChatBody {
            model: if request.model.is_empty() {
                &self.model
            } else {
                &request.model
            },
            messages,
            stream: true,
            options,
        }
    }
}

/// Accumulates raw body bytes and hands out complete lines.
///
/// Lines are split on `\n` before UTF-8 decoding, so a character split
/// across network reads is decoded whole.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, LlmError> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            push_line(&raw[..pos], &mut lines)?;
        }
        Ok(lines)
    }

    /// The unterminated tail, if any, once the body has ended.
    fn finish(&mut self) -> Result<Vec<String>, LlmError> {
        let raw = std::mem::take(&mut self.pending);
        let mut lines = Vec::new();
        push_line(&raw, &mut lines)?;
        Ok(lines)
    }
}

fn push_line(raw: &[u8], lines: &mut Vec<String>) -> Result<(), LlmError> {
    let line = std::str::from_utf8(raw)
        .map_err(|e| LlmError::Deserialization(format!("ollama chunk is not UTF-8: {e}")))?
        .trim();
    if !line.is_empty() {
        lines.push(line.to_string());
    }
    Ok(())
}

/// Translate one NDJSON line into stream events. Returns `true` once the
/// final line has been seen.
fn parse_line(line: &str, out: &mut Vec<StreamEvent>) -> Result<bool, LlmError> {
    let chunk: ChatChunk = serde_json::from_str(line)
        .map_err(|e| LlmError::Deserialization(format!("ollama chunk: {e}")))?;

    if let Some(error) = chunk.error {
        return Err(LlmError::Provider { message: error });
    }
    if let Some(text) = chunk.message.map(|m| m.content).filter(|t| !t.is_empty()) {
        out.push(StreamEvent::TextDelta { text });
    }
    if chunk.done {
        if chunk.prompt_eval_count.is_some() || chunk.eval_count.is_some() {
            out.push(StreamEvent::Usage(Usage {
                input_tokens: chunk.prompt_eval_count.unwrap_or(0),
                output_tokens: chunk.eval_count.unwrap_or(0),
            }));
        }
        out.push(StreamEvent::Done);
    }
    Ok(chunk.done)
}

/// Map a non-success status to an error, consuming the body for context.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    Err(match status.as_u16() {
        401 | 403 => LlmError::AuthenticationFailed,
        429 => LlmError::RateLimited { retry_after_ms: None },
        _ => LlmError::Provider {
            message: format!("ollama returned {status}: {text}"),
        },
    })
}

/// Turn an NDJSON body into stream events.
///
/// The body must end with a `"done": true` line; ending without one is a
/// truncated reply and surfaces as [`LlmError::Stream`].
fn decode_body<S, B, E>(
    mut bytes: S,
    cancel: CancellationToken,
) -> impl futures_util::Stream<Item = Result<StreamEvent, LlmError>> + Send
where
    S: futures_util::Stream<Item = Result<B, E>> + Send + Unpin,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    async_stream::try_stream! {
        let mut buffer = LineBuffer::default();
        let mut events = Vec::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                next = bytes.next() => Some(next),
            };
            let (lines, eof) = match next {
                None => Err(LlmError::Cancelled)?,
                Some(None) => (buffer.finish()?, true),
                Some(Some(chunk)) => {
                    let chunk = chunk.map_err(|e| LlmError::Stream(e.to_string()))?;
                    (buffer.push(chunk.as_ref())?, false)
                }
            };

            for line in lines {
                let done = parse_line(&line, &mut events)?;
                for event in events.drain(..) {
                    yield event;
                }
                if done {
                    return;
                }
            }
            if eof {
                Err::<(), _>(LlmError::Stream(
                    "ollama stream ended before the final chunk".to_string(),
                ))?;
            }
        }
    }
}

impl LlmProvider for OllamaProvider {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    fn stream(&self, request: CompletionRequest, cancel: CancellationToken) -> LlmStream {
        let body = match serde_json::to_vec(&self.build_body(&request)) {
            Ok(body) => body,
            Err(e) => {
                let err = LlmError::InvalidRequest(e.to_string());
                return Box::pin(futures_util::stream::once(async move { Err(err) }));
            }
        };
        let http = self.http_client.clone();
        let url = self.chat_url();

        Box::pin(async_stream::try_stream! {
            let send = http
                .post(&url)
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body)
                .send();
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                r = send => Some(r),
            };
            let response = match response {
                Some(r) => r.map_err(|e| LlmError::Provider { message: e.to_string() })?,
                None => Err(LlmError::Cancelled)?,
            };
            let response = check_status(response).await?;

            yield StreamEvent::Connected;

            let events = decode_body(response.bytes_stream(), cancel);
            futures_util::pin_mut!(events);
            while let Some(event) = events.next().await {
                yield event?;
            }
        })
    }
}
