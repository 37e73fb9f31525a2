// OpenAI-compatible chat completions streaming
//
// Any model id that isn't Anthropic's routes here, so this adapter also
// covers OpenAI-compatible gateways pointed at by OPENAI_BASE_URL. Tool call
// arguments arrive as string fragments spread over delta chunks, keyed by
// tool-call index; they are buffered until the `[DONE]` sentinel and parsed
// in index order.

use anyhow::{anyhow, Result};
use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

use crate::store::AgentConfig;

use super::{
    is_done_sentinel, parse_sse_data_line, ChatTurn, LineBuffer, ProviderSettings, StreamEvent,
    ToolSchema,
};

/// Open a streaming chat completions request and yield unified events until
/// `[DONE]`, stream end, error, or cancellation.
pub fn stream(
    http: reqwest::Client,
    settings: ProviderSettings,
    agent: AgentConfig,
    tools: Vec<ToolSchema>,
    history: Vec<ChatTurn>,
    cancel: CancellationToken,
) -> BoxStream<'static, Result<StreamEvent>> {
    Box::pin(try_stream! {
        let response = open_stream(&http, &settings, &agent, &tools, &history).await?;
        let mut bytes = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut assembler = Assembler::default();

        'read: loop {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!(model = %agent.model, "OpenAI stream cancelled");
                    break 'read;
                }
                chunk = bytes.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            for line in lines.push(&chunk) {
                if is_done_sentinel(&line) {
                    for event in assembler.finish() {
                        yield event;
                    }
                    break 'read;
                }
                for event in assembler.feed(&line) {
                    yield event;
                }
            }
        }
    })
}

/// Build and send the streaming request, failing on a non-success status.
async fn open_stream(
    http: &reqwest::Client,
    settings: &ProviderSettings,
    agent: &AgentConfig,
    tools: &[ToolSchema],
    history: &[ChatTurn],
) -> Result<reqwest::Response> {
    let api_key = settings
        .openai_api_key
        .clone()
        .ok_or_else(|| anyhow!("OPENAI_API_KEY is not configured"))?;

    let mut messages: Vec<Value> = Vec::new();
    if !agent.system.is_empty() {
        messages.push(json!({ "role": "system", "content": agent.system }));
    }
    for turn in history {
        messages.push(json!({ "role": turn.role.as_str(), "content": turn.content }));
    }

    let mut body = json!({
        "model": agent.model,
        "messages": messages,
        "stream": true,
    });
    if !tools.is_empty() {
        let schemas: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    },
                })
            })
            .collect();
        body["tools"] = json!(schemas);
    }
    if let Some(effort) = &agent.reasoning_effort {
        body["reasoning_effort"] = json!(effort);
    }

    let response = http
        .post(format!("{}/v1/chat/completions", settings.openai_base_url))
        .bearer_auth(api_key)
        .json(&body)
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        return Err(anyhow!("OpenAI API error {status}: {detail}"));
    }
    Ok(response)
}

#[derive(Default)]
struct ToolBuilder {
    name: String,
    arguments: String,
}

/// Per-stream state machine over decoded SSE lines.
#[derive(Default)]
struct Assembler {
    full_text: String,
    /// tool-call index -> builder; BTreeMap keeps dispatch in call order.
    tool_builders: BTreeMap<u64, ToolBuilder>,
}

impl Assembler {
    fn feed(&mut self, line: &str) -> Vec<StreamEvent> {
        let Some(data) = parse_sse_data_line(line) else {
            return Vec::new();
        };
        let Some(delta) = data
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|choice| choice.get("delta"))
        else {
            return Vec::new();
        };

        let mut events = Vec::new();
        if let Some(text) = delta.get("content").and_then(Value::as_str) {
            if !text.is_empty() {
                self.full_text.push_str(text);
                events.push(StreamEvent::TextDelta {
                    text: text.to_string(),
                });
            }
        }

        if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
            for call in calls {
                let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
                let builder = self.tool_builders.entry(index).or_default();
                if let Some(name) = call
                    .get("function")
                    .and_then(|f| f.get("name"))
                    .and_then(Value::as_str)
                {
                    builder.name.push_str(name);
                }
                if let Some(fragment) = call
                    .get("function")
                    .and_then(|f| f.get("arguments"))
                    .and_then(Value::as_str)
                {
                    builder.arguments.push_str(fragment);
                }
            }
        }
        events
    }

    /// Flush buffered tool calls and the terminal done event.
    fn finish(&mut self) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        for (_, builder) in std::mem::take(&mut self.tool_builders) {
            let raw = if builder.arguments.trim().is_empty() {
                "{}".to_string()
            } else {
                builder.arguments
            };
            match serde_json::from_str(&raw) {
                Ok(args) => events.push(StreamEvent::ToolCall {
                    name: builder.name,
                    args,
                }),
                Err(e) => {
                    tracing::warn!(
                        tool = %builder.name,
                        "Dropping tool call with malformed JSON: {e}"
                    );
                }
            }
        }
        events.push(StreamEvent::Done {
            full_text: self.full_text.clone(),
        });
        events
    }
}
