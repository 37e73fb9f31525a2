// Anthropic Messages API streaming
//
// Wire format: SSE events named message_start, content_block_start,
// content_block_delta (text_delta / input_json_delta), content_block_stop,
// message_delta, message_stop. Tool arguments arrive as partial JSON strings
// spread over input_json_delta events; they are buffered per block index and
// parsed only at content_block_stop.

use anyhow::{anyhow, Result};
use async_stream::try_stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::store::AgentConfig;

use super::{parse_sse_data_line, ChatTurn, LineBuffer, ProviderSettings, Role, StreamEvent, ToolSchema};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

/// Open a streaming Messages request and yield unified events until
/// message_stop, stream end, error, or cancellation.
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
                    tracing::debug!(model = %agent.model, "Anthropic stream cancelled");
                    break 'read;
                }
                chunk = bytes.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            for line in lines.push(&chunk) {
                for event in assembler.feed(&line)? {
                    let finished = matches!(event, StreamEvent::Done { .. });
                    yield event;
                    if finished {
                        break 'read;
                    }
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
        .anthropic_api_key
        .clone()
        .ok_or_else(|| anyhow!("ANTHROPIC_API_KEY is not configured"))?;

    let mut body = json!({
        "model": agent.model,
        "max_tokens": MAX_TOKENS,
        "messages": messages_payload(history),
        "stream": true,
    });
    if !agent.system.is_empty() {
        body["system"] = json!(agent.system);
    }
    if !tools.is_empty() {
        let schemas: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body["tools"] = json!(schemas);
    }

    let response = http
        .post(format!("{}/v1/messages", settings.anthropic_base_url))
        .header("x-api-key", api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(&body)
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let detail = response.text().await.unwrap_or_default();
        return Err(anyhow!("Anthropic API error {status}: {detail}"));
    }
    Ok(response)
}

/// Anthropic requires the conversation to open with a user turn, and group
/// chat produces runs of same-role messages; adjacent turns are merged.
fn messages_payload(history: &[ChatTurn]) -> Vec<Value> {
    let mut merged: Vec<(Role, String)> = Vec::new();
    for turn in history {
        match merged.last_mut() {
            Some((role, content)) if *role == turn.role => {
                content.push('\n');
                content.push_str(&turn.content);
            }
            _ => merged.push((turn.role, turn.content.clone())),
        }
    }
    if merged.first().map(|(role, _)| *role) != Some(Role::User) {
        merged.insert(
            0,
            (
                Role::User,
                "The participants have joined the chat.".to_string(),
            ),
        );
    }
    merged
        .into_iter()
        .map(|(role, content)| json!({ "role": role.as_str(), "content": content }))
        .collect()
}

/// Per-stream state machine over decoded SSE lines.
#[derive(Default)]
struct Assembler {
    full_text: String,
    /// block index -> (tool name, accumulated argument JSON)
    tool_builders: HashMap<u64, (String, String)>,
}

impl Assembler {
    fn feed(&mut self, line: &str) -> Result<Vec<StreamEvent>> {
        let Some(data) = parse_sse_data_line(line) else {
            return Ok(Vec::new());
        };
        let event_type = data.get("type").and_then(Value::as_str).unwrap_or("");

        match event_type {
            "content_block_start" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0);
                if let Some(block) = data.get("content_block") {
                    if block.get("type").and_then(Value::as_str) == Some("tool_use") {
                        let name = block
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        self.tool_builders.insert(index, (name, String::new()));
                    }
                }
                Ok(Vec::new())
            }
            "content_block_delta" => {
                let Some(delta) = data.get("delta") else {
                    return Ok(Vec::new());
                };
                match delta.get("type").and_then(Value::as_str) {
                    Some("text_delta") => {
                        let Some(text) = delta.get("text").and_then(Value::as_str) else {
                            return Ok(Vec::new());
                        };
                        self.full_text.push_str(text);
                        Ok(vec![StreamEvent::TextDelta {
                            text: text.to_string(),
                        }])
                    }
                    Some("input_json_delta") => {
                        let index = data.get("index").and_then(Value::as_u64).unwrap_or(0);
                        if let Some((_, args)) = self.tool_builders.get_mut(&index) {
                            if let Some(partial) =
                                delta.get("partial_json").and_then(Value::as_str)
                            {
                                args.push_str(partial);
                            }
                        }
                        Ok(Vec::new())
                    }
                    _ => Ok(Vec::new()),
                }
            }
            "content_block_stop" => {
                let index = data.get("index").and_then(Value::as_u64).unwrap_or(0);
                let Some((name, args_json)) = self.tool_builders.remove(&index) else {
                    return Ok(Vec::new());
                };
                Ok(finish_tool_call(name, args_json).into_iter().collect())
            }
            "message_stop" => Ok(vec![StreamEvent::Done {
                full_text: self.full_text.clone(),
            }]),
            "error" => {
                let message = data
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown stream error");
                Err(anyhow!("Anthropic stream error: {message}"))
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// Parse coalesced tool arguments; malformed JSON drops the call.
fn finish_tool_call(name: String, args_json: String) -> Option<StreamEvent> {
    let raw = if args_json.trim().is_empty() {
        "{}".to_string()
    } else {
        args_json
    };
    match serde_json::from_str(&raw) {
        Ok(args) => Some(StreamEvent::ToolCall { name, args }),
        Err(e) => {
            tracing::warn!(tool = %name, "Dropping tool call with malformed JSON: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(assembler: &mut Assembler, lines: &[&str]) -> Vec<StreamEvent> {
        lines
            .iter()
            .flat_map(|line| assembler.feed(line).unwrap())
            .collect()
    }

    #[test]
    fn text_deltas_accumulate_into_done() {
        let mut assembler = Assembler::default();
        let events = feed_all(
            &mut assembler,
            &[
                r#"data: {"type":"message_start","message":{"model":"claude-sonnet-4-5"}}"#,
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text"}}"#,
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"lo"}}"#,
                r#"data: {"type":"content_block_stop","index":0}"#,
                r#"data: {"type":"message_stop"}"#,
            ],
        );

        assert_eq!(
            events,
            vec![
                StreamEvent::TextDelta { text: "Hel".into() },
                StreamEvent::TextDelta { text: "lo".into() },
                StreamEvent::Done {
                    full_text: "Hello".into()
                },
            ]
        );
    }

    #[test]
    fn tool_arguments_coalesce_across_deltas() {
        let mut assembler = Assembler::default();
        let events = feed_all(
            &mut assembler,
            &[
                r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"tu_1","name":"end_chat"}}"#,
                r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"deal_re"}}"#,
                r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"ached\": true}"}}"#,
                r#"data: {"type":"content_block_stop","index":1}"#,
            ],
        );

        assert_eq!(
            events,
            vec![StreamEvent::ToolCall {
                name: "end_chat".into(),
                args: serde_json::json!({ "deal_reached": true }),
            }]
        );
    }

    #[test]
    fn malformed_tool_json_is_dropped() {
        let mut assembler = Assembler::default();
        let events = feed_all(
            &mut assembler,
            &[
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"tool_use","name":"end_chat"}}"#,
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{not json"}}"#,
                r#"data: {"type":"content_block_stop","index":0}"#,
            ],
        );
        assert!(events.is_empty());
    }

    #[test]
    fn empty_tool_arguments_parse_as_empty_object() {
        let mut assembler = Assembler::default();
        let events = feed_all(
            &mut assembler,
            &[
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"tool_use","name":"end_chat"}}"#,
                r#"data: {"type":"content_block_stop","index":0}"#,
            ],
        );
        assert_eq!(
            events,
            vec![StreamEvent::ToolCall {
                name: "end_chat".into(),
                args: serde_json::json!({}),
            }]
        );
    }

    #[test]
    fn stream_errors_surface() {
        let mut assembler = Assembler::default();
        let result =
            assembler.feed(r#"data: {"type":"error","error":{"message":"overloaded"}}"#);
        assert!(result.is_err());
    }

    #[test]
    fn history_merges_runs_and_opens_with_user() {
        let history = vec![
            ChatTurn {
                role: Role::Assistant,
                content: "Welcome!".into(),
            },
            ChatTurn {
                role: Role::User,
                content: "hi from A".into(),
            },
            ChatTurn {
                role: Role::User,
                content: "hi from B".into(),
            },
        ];
        let payload = messages_payload(&history);
        assert_eq!(payload.len(), 3);
        assert_eq!(payload[0]["role"], "user");
        assert_eq!(payload[1]["role"], "assistant");
        assert_eq!(payload[2]["role"], "user");
        assert_eq!(payload[2]["content"], "hi from A\nhi from B");
    }
}
