// LLM streaming adapter - one stream shape over two provider wire formats
//
// The runtime consumes a single tagged stream regardless of provider:
// text deltas as they arrive, complete tool calls once their argument JSON
// has been coalesced, and a terminal `done` carrying the full text. The
// provider is inferred from the model id: `claude*` goes to the Anthropic
// Messages API, everything else to an OpenAI-compatible chat completions
// endpoint.
//
// Both adapters decode SSE byte streams line by line with a carry buffer,
// ignore event framing they don't recognize, and treat malformed tool
// argument JSON as a logged drop rather than an error.

pub mod anthropic;
pub mod openai;

use anyhow::Result;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::store::AgentConfig;

/// One element of the unified provider stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Incremental assistant text.
    TextDelta { text: String },
    /// A complete tool invocation with parsed arguments.
    ToolCall { name: String, args: Value },
    /// End of stream; carries the accumulated assistant text.
    Done { full_text: String },
}

/// Chat history role as replayed to providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One prior message handed to the provider.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// Provider-agnostic tool description; adapters map this onto each wire
/// format (`input_schema` vs nested `function`).
#[derive(Debug, Clone, Serialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Anything that can produce the unified stream. The production
/// implementation is `LlmClient`; tests substitute scripted streams.
pub trait LanguageModel: Send + Sync {
    fn stream(
        &self,
        agent: &AgentConfig,
        tools: &[ToolSchema],
        history: Vec<ChatTurn>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<StreamEvent>>;
}

/// Provider credentials and endpoints.
#[derive(Debug, Clone)]
pub struct ProviderSettings {
    pub anthropic_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_base_url: String,
    pub openai_base_url: String,
}

/// HTTP-backed implementation over both providers.
pub struct LlmClient {
    http: reqwest::Client,
    settings: ProviderSettings,
}

impl LlmClient {
    pub fn new(settings: ProviderSettings) -> Result<Self> {
        // Generous timeout: a single agent turn can stream for a while, and
        // the agent runner enforces its own wall-clock bound.
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()?;
        Ok(Self { http, settings })
    }
}

impl LanguageModel for LlmClient {
    fn stream(
        &self,
        agent: &AgentConfig,
        tools: &[ToolSchema],
        history: Vec<ChatTurn>,
        cancel: CancellationToken,
    ) -> BoxStream<'static, Result<StreamEvent>> {
        if agent.model.starts_with("claude") {
            anthropic::stream(
                self.http.clone(),
                self.settings.clone(),
                agent.clone(),
                tools.to_vec(),
                history,
                cancel,
            )
        } else {
            openai::stream(
                self.http.clone(),
                self.settings.clone(),
                agent.clone(),
                tools.to_vec(),
                history,
                cancel,
            )
        }
    }
}

/// Splits an SSE byte stream into complete lines, carrying partial lines
/// (and partially received UTF-8) across chunk boundaries.
pub(crate) struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(newline) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=newline).collect();
            let text = String::from_utf8_lossy(&line);
            lines.push(text.trim_end_matches(['\n', '\r']).to_string());
        }
        lines
    }
}

/// Extract the JSON payload of an SSE `data:` line. Empty payloads and the
/// OpenAI `[DONE]` sentinel yield None.
pub(crate) fn parse_sse_data_line(line: &str) -> Option<Value> {
    let json_str = line.strip_prefix("data:")?.trim();
    if json_str.is_empty() || json_str == "[DONE]" {
        return None;
    }
    serde_json::from_str(json_str).ok()
}

/// True when this line is the OpenAI end-of-stream sentinel.
pub(crate) fn is_done_sentinel(line: &str) -> bool {
    line.strip_prefix("data:")
        .map(str::trim)
        .is_some_and(|payload| payload == "[DONE]")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_reassembles_split_chunks() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"data: {\"a\":").is_empty());
        let lines = buffer.push(b" 1}\r\ndata: done\n");
        assert_eq!(lines, vec!["data: {\"a\": 1}", "data: done"]);
    }

    #[test]
    fn line_buffer_survives_utf8_split_across_chunks() {
        let mut buffer = LineBuffer::new();
        let text = "data: héllo\n".as_bytes();
        assert!(buffer.push(&text[..8]).is_empty()); // cuts é in half
        let lines = buffer.push(&text[8..]);
        assert_eq!(lines, vec!["data: héllo"]);
    }

    #[test]
    fn data_line_parsing_skips_sentinels_and_noise() {
        assert!(parse_sse_data_line("event: message_start").is_none());
        assert!(parse_sse_data_line("data: [DONE]").is_none());
        assert!(parse_sse_data_line("data:").is_none());
        assert_eq!(
            parse_sse_data_line("data: {\"type\":\"ping\"}"),
            Some(serde_json::json!({ "type": "ping" }))
        );
        assert!(is_done_sentinel("data: [DONE]"));
        assert!(!is_done_sentinel("data: {}"));
    }
}
