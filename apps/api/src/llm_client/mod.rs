/// LLM Client — the single point of entry for all Claude API calls in Calibra.
///
/// ARCHITECTURAL RULE: No other module may call the Anthropic API directly.
/// All LLM interactions MUST go through this module.
///
/// The model id is chosen per call by the pipeline (main vs backup escalation),
/// and retries are owned by the job queue — this client performs exactly one
/// request per call so that attempt counting stays in one place.
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub mod prompts;

const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("LLM returned empty content")]
    EmptyContent,

    #[error("call aborted by cancellation signal")]
    Aborted,
}

/// One completion request. The caller picks the model; sampling temperature
/// varies per pipeline step (low for judgment, higher for narrative prose).
#[derive(Debug, Clone)]
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub system: &'a str,
    pub prompt: &'a str,
    pub temperature: f32,
}

/// Abstraction over the completion provider so orchestrators can be driven by
/// a stub in tests. `complete_streaming` forwards each text fragment to
/// `on_chunk` as it arrives and returns the full accumulated text.
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        req: &CompletionRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError>;

    async fn complete_streaming(
        &self,
        req: &CompletionRequest<'_>,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, ProviderError>;
}

#[derive(Debug, Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    temperature: f32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
    messages: Vec<AnthropicMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct LlmResponse {
    content: Vec<ContentBlock>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: u32,
    output_tokens: u32,
}

impl LlmResponse {
    fn text(&self) -> Option<&str> {
        self.content
            .iter()
            .find(|b| b.block_type == "text")
            .and_then(|b| b.text.as_deref())
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicError {
    error: AnthropicErrorBody,
}

#[derive(Debug, Deserialize)]
struct AnthropicErrorBody {
    message: String,
}

/// One server-sent event frame from the streaming Messages API.
/// Only the fields the pipeline cares about are modeled.
#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    event_type: String,
    delta: Option<StreamDelta>,
    error: Option<AnthropicErrorBody>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(rename = "type")]
    delta_type: Option<String>,
    text: Option<String>,
}

/// The concrete Anthropic client shared by both worker queues.
#[derive(Clone)]
pub struct AnthropicClient {
    client: Client,
    api_key: String,
}

impl AnthropicClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(300))
                .build()
                .expect("Failed to build HTTP client"),
            api_key,
        }
    }

    fn request(&self, body: &AnthropicRequest<'_>) -> reqwest::RequestBuilder {
        self.client
            .post(ANTHROPIC_API_URL)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(body)
    }

    async fn call_once(&self, req: &CompletionRequest<'_>) -> Result<String, ProviderError> {
        let body = AnthropicRequest {
            model: req.model,
            max_tokens: MAX_TOKENS,
            system: req.system,
            temperature: req.temperature,
            stream: false,
            messages: vec![AnthropicMessage {
                role: "user",
                content: req.prompt,
            }],
        };

        let response = self.request(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AnthropicError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let llm_response: LlmResponse = response.json().await?;
        debug!(
            "LLM call succeeded: input_tokens={}, output_tokens={}",
            llm_response.usage.input_tokens, llm_response.usage.output_tokens
        );

        llm_response
            .text()
            .map(str::to_owned)
            .ok_or(ProviderError::EmptyContent)
    }
}

#[async_trait]
impl CompletionBackend for AnthropicClient {
    async fn complete(
        &self,
        req: &CompletionRequest<'_>,
        cancel: &CancellationToken,
    ) -> Result<String, ProviderError> {
        tokio::select! {
            result = self.call_once(req) => result,
            _ = cancel.cancelled() => Err(ProviderError::Aborted),
        }
    }

    async fn complete_streaming(
        &self,
        req: &CompletionRequest<'_>,
        cancel: &CancellationToken,
        on_chunk: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<String, ProviderError> {
        let body = AnthropicRequest {
            model: req.model,
            max_tokens: MAX_TOKENS,
            system: req.system,
            temperature: req.temperature,
            stream: true,
            messages: vec![AnthropicMessage {
                role: "user",
                content: req.prompt,
            }],
        };

        let response = tokio::select! {
            result = self.request(&body).send() => result?,
            _ = cancel.cancelled() => return Err(ProviderError::Aborted),
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<AnthropicError>(&body)
                .map(|e| e.error.message)
                .unwrap_or(body);
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        // Dropping the byte stream on cancellation aborts the underlying
        // HTTP connection, so a stop request never waits for generation to
        // finish naturally.
        let mut stream = response.bytes_stream();
        let mut buffer = String::new();
        let mut text = String::new();

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = cancel.cancelled() => return Err(ProviderError::Aborted),
            };

            let chunk = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(e)) => return Err(ProviderError::Http(e)),
                None => break,
            };

            buffer.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim_end_matches('\r').to_string();
                buffer.drain(..=pos);

                let Some(event) = parse_sse_line(&line)? else {
                    continue;
                };

                match event.event_type.as_str() {
                    "content_block_delta" => {
                        if let Some(fragment) = delta_text(&event) {
                            text.push_str(fragment);
                            on_chunk(fragment);
                        }
                    }
                    "error" => {
                        let message = event
                            .error
                            .map(|e| e.message)
                            .unwrap_or_else(|| "unknown stream error".to_string());
                        return Err(ProviderError::Stream(message));
                    }
                    "message_stop" => return finish_stream(text),
                    _ => {}
                }
            }
        }

        finish_stream(text)
    }
}

fn finish_stream(text: String) -> Result<String, ProviderError> {
    if text.is_empty() {
        Err(ProviderError::EmptyContent)
    } else {
        Ok(text)
    }
}

/// Parses one SSE line. Returns Ok(None) for non-data lines (event names,
/// comments, blank keep-alives).
fn parse_sse_line(line: &str) -> Result<Option<StreamEvent>, ProviderError> {
    let Some(data) = line.strip_prefix("data: ") else {
        return Ok(None);
    };
    let event: StreamEvent = serde_json::from_str(data)?;
    Ok(Some(event))
}

fn delta_text(event: &StreamEvent) -> Option<&str> {
    let delta = event.delta.as_ref()?;
    if delta.delta_type.as_deref() == Some("text_delta") {
        delta.text.as_deref()
    } else {
        None
    }
}

/// Strips ```json ... ``` or ``` ... ``` code fences from LLM output.
pub fn strip_json_fences(text: &str) -> &str {
    let text = text.trim();
    if let Some(stripped) = text.strip_prefix("```json") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else if let Some(stripped) = text.strip_prefix("```") {
        stripped
            .trim_start()
            .strip_suffix("```")
            .map(|s| s.trim())
            .unwrap_or(stripped.trim_start())
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_json_fences_with_json_tag() {
        let input = "```json\n{\"key\": \"value\"}\n```";
        assert_eq!(strip_json_fences(input), "{\"key\": \"value\"}");
    }

    #[test]
    fn test_strip_json_fences_without_tag() {
        let input = "```\n{\"key\": \"value\"}\n```";
        assert_eq!(strip_json_fences(input), "{\"key\": \"value\"}");
    }

    #[test]
    fn test_strip_json_fences_no_fences() {
        let input = "{\"key\": \"value\"}";
        assert_eq!(strip_json_fences(input), "{\"key\": \"value\"}");
    }

    #[test]
    fn test_parse_sse_line_extracts_text_delta() {
        let line = r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hello"}}"#;
        let event = parse_sse_line(line).unwrap().unwrap();
        assert_eq!(event.event_type, "content_block_delta");
        assert_eq!(delta_text(&event), Some("Hello"));
    }

    #[test]
    fn test_parse_sse_line_ignores_event_name_lines() {
        assert!(parse_sse_line("event: content_block_delta")
            .unwrap()
            .is_none());
        assert!(parse_sse_line("").unwrap().is_none());
    }

    #[test]
    fn test_parse_sse_line_non_text_delta_yields_no_fragment() {
        let line = r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{"}}"#;
        let event = parse_sse_line(line).unwrap().unwrap();
        assert_eq!(delta_text(&event), None);
    }

    #[test]
    fn test_stream_error_event_carries_message() {
        let line = r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#;
        let event = parse_sse_line(line).unwrap().unwrap();
        assert_eq!(event.error.unwrap().message, "Overloaded");
    }
}
