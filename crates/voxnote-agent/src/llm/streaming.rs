//! SSE stream parser for the Anthropic Messages API.
//!
//! The Anthropic streaming format sends `event:` and `data:` lines in
//! standard SSE format.  [`SseParser`] turns those lines into typed
//! [`StreamEvent`]s and [`AnthropicStreamState`] folds them into
//! [`GenerationEvent`]s.

use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::types::{GenerationEvent, GenerationInfo, StreamDelta, StreamEvent};

/// Name of the forced tool used to obtain structured output.
pub const STRUCTURED_OUTPUT_TOOL: &str = "structured_output";

/// Parses raw SSE lines from the Anthropic Messages API stream.
///
/// Accumulates partial state across calls because SSE events span multiple
/// lines (`event:` followed by `data:`).
#[derive(Debug, Default)]
pub struct SseParser {
    /// The most recently seen `event:` type.
    current_event_type: Option<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a single line from the SSE stream.
    ///
    /// Returns `Some(event)` when a complete event has been parsed, `None` for
    /// comment lines, blank lines, or the `event:` prefix line (which just
    /// sets internal state for the next `data:` line).
    pub fn parse_line(&mut self, line: &str) -> Result<Option<StreamEvent>> {
        let line = line.trim_end();

        if line.starts_with(':') || line.is_empty() {
            return Ok(None);
        }

        if let Some(event_type) = line.strip_prefix("event:") {
            self.current_event_type = Some(event_type.trim().to_owned());
            return Ok(None);
        }

        if let Some(data) = line.strip_prefix("data:") {
            let event_type = self
                .current_event_type
                .take()
                .unwrap_or_else(|| "unknown".into());

            return self.parse_event(&event_type, data.trim_start());
        }

        tracing::trace!(line, "ignoring unrecognised SSE line");
        Ok(None)
    }

    fn parse_event(&self, event_type: &str, data: &str) -> Result<Option<StreamEvent>> {
        match event_type {
            "message_start" => {
                let v = parse_json(data)?;
                let message = &v["message"];
                Ok(Some(StreamEvent::MessageStart {
                    message_id: json_string(message, "id"),
                    model: json_string(message, "model"),
                    input_tokens: json_u32(&message["usage"], "input_tokens"),
                }))
            }

            "content_block_start" => {
                let v = parse_json(data)?;
                let block = &v["content_block"];
                Ok(Some(StreamEvent::ContentBlockStart {
                    index: json_u32(&v, "index"),
                    content_type: json_string(block, "type"),
                    id: block["id"].as_str().map(String::from),
                    name: block["name"].as_str().map(String::from),
                }))
            }

            "content_block_delta" => {
                let v = parse_json(data)?;
                let delta_obj = &v["delta"];

                let delta = match delta_obj["type"].as_str().unwrap_or_default() {
                    "text_delta" => StreamDelta::TextDelta(json_string(delta_obj, "text")),
                    "input_json_delta" => {
                        StreamDelta::InputJsonDelta(json_string(delta_obj, "partial_json"))
                    }
                    other => {
                        tracing::trace!(delta_type = other, "ignoring unknown delta type");
                        return Ok(None);
                    }
                };

                Ok(Some(StreamEvent::ContentBlockDelta {
                    index: json_u32(&v, "index"),
                    delta,
                }))
            }

            "content_block_stop" => {
                let v = parse_json(data)?;
                Ok(Some(StreamEvent::ContentBlockStop {
                    index: json_u32(&v, "index"),
                }))
            }

            "message_delta" => {
                let v = parse_json(data)?;
                Ok(Some(StreamEvent::MessageDelta {
                    stop_reason: v["delta"]["stop_reason"].as_str().map(String::from),
                    output_tokens: json_u32(&v["usage"], "output_tokens"),
                }))
            }

            "message_stop" => Ok(Some(StreamEvent::MessageStop)),

            "ping" => Ok(Some(StreamEvent::Ping)),

            "error" => {
                let v = parse_json(data)?;
                Err(AgentError::Backend {
                    adapter: "anthropic".into(),
                    reason: format!(
                        "{}: {}",
                        json_string(&v["error"], "type"),
                        json_string(&v["error"], "message")
                    ),
                })
            }

            _ => {
                if data.trim() == "[DONE]" {
                    Ok(Some(StreamEvent::MessageStop))
                } else {
                    tracing::trace!(event_type, "ignoring unknown SSE event type");
                    Ok(None)
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Event folding
// ---------------------------------------------------------------------------

/// Turns Anthropic stream events into generation events.
///
/// Text deltas are forwarded immediately.  Tool-use input arrives as JSON
/// fragments and is emitted as one [`GenerationEvent::ToolCallRequested`]
/// when its block closes.  When `structured` is set, the input of the forced
/// [`STRUCTURED_OUTPUT_TOOL`] is forwarded as text instead.
#[derive(Debug, Default)]
pub struct AnthropicStreamState {
    structured: bool,
    open_call: Option<ToolUseBuilder>,
    info: GenerationInfo,
    done: bool,
}

#[derive(Debug)]
struct ToolUseBuilder {
    id: Option<String>,
    name: String,
    input_json: String,
    as_text: bool,
}

impl AnthropicStreamState {
    pub fn new(structured: bool) -> Self {
        Self {
            structured,
            ..Self::default()
        }
    }

    /// Returns `true` once `message_stop` has been seen.
    pub fn is_done(&self) -> bool {
        self.done
    }

    pub fn apply(&mut self, event: StreamEvent) -> Vec<GenerationEvent> {
        match event {
            StreamEvent::MessageStart {
                model,
                input_tokens,
                ..
            } => {
                self.info.model = Some(model);
                self.info.input_tokens = Some(input_tokens);
                Vec::new()
            }

            StreamEvent::ContentBlockStart {
                content_type, id, name, ..
            } if content_type == "tool_use" => {
                let name = name.unwrap_or_default();
                let as_text = self.structured && name == STRUCTURED_OUTPUT_TOOL;
                self.open_call = Some(ToolUseBuilder {
                    id,
                    name,
                    input_json: String::new(),
                    as_text,
                });
                Vec::new()
            }

            StreamEvent::ContentBlockDelta { delta, .. } => match delta {
                StreamDelta::TextDelta(text) => vec![GenerationEvent::TextChunk(text)],
                StreamDelta::InputJsonDelta(json) => match self.open_call.as_mut() {
                    Some(call) if call.as_text => vec![GenerationEvent::TextChunk(json)],
                    Some(call) => {
                        call.input_json.push_str(&json);
                        Vec::new()
                    }
                    None => Vec::new(),
                },
            },

            StreamEvent::ContentBlockStop { .. } => match self.open_call.take() {
                Some(call) if !call.as_text => vec![GenerationEvent::ToolCallRequested {
                    id: call.id,
                    name: call.name,
                    arguments: call.input_json,
                }],
                _ => Vec::new(),
            },

            StreamEvent::MessageDelta {
                stop_reason,
                output_tokens,
            } => {
                self.info.stop_reason = stop_reason;
                self.info.output_tokens = Some(output_tokens);
                Vec::new()
            }

            StreamEvent::MessageStop => self.finish(),

            StreamEvent::ContentBlockStart { .. } | StreamEvent::Ping => Vec::new(),
        }
    }

    /// Emit the trailing [`GenerationEvent::Info`].  Idempotent.
    pub fn finish(&mut self) -> Vec<GenerationEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;
        vec![GenerationEvent::Info(std::mem::take(&mut self.info))]
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_json(data: &str) -> Result<Value> {
    serde_json::from_str(data).map_err(|e| AgentError::Backend {
        adapter: "anthropic".into(),
        reason: format!("invalid JSON in SSE data: {e}"),
    })
}

/// Extract a string field, returning an empty string if missing.
fn json_string(v: &Value, field: &str) -> String {
    v[field].as_str().unwrap_or_default().to_owned()
}

fn json_u32(v: &Value, field: &str) -> u32 {
    v[field]
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut SseParser, state: &mut AnthropicStreamState, lines: &[&str]) -> Vec<GenerationEvent> {
        let mut out = Vec::new();
        for line in lines {
            if let Some(event) = parser.parse_line(line).unwrap() {
                out.extend(state.apply(event));
            }
        }
        out
    }

    #[test]
    fn parse_message_start() {
        let mut parser = SseParser::new();
        assert!(parser.parse_line("event: message_start").unwrap().is_none());
        let event = parser
            .parse_line(r#"data: {"type":"message_start","message":{"id":"msg_01","model":"claude-sonnet-4-20250514","role":"assistant","content":[],"stop_reason":null,"usage":{"input_tokens":10,"output_tokens":0}}}"#)
            .unwrap()
            .unwrap();

        match event {
            StreamEvent::MessageStart {
                message_id,
                model,
                input_tokens,
            } => {
                assert_eq!(message_id, "msg_01");
                assert_eq!(model, "claude-sonnet-4-20250514");
                assert_eq!(input_tokens, 10);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn blank_and_comment_lines_ignored() {
        let mut parser = SseParser::new();
        assert!(parser.parse_line("").unwrap().is_none());
        assert!(parser.parse_line(": keepalive").unwrap().is_none());
    }

    #[test]
    fn error_event_is_backend_failure() {
        let mut parser = SseParser::new();
        parser.parse_line("event: error").unwrap();
        let err = parser
            .parse_line(r#"data: {"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#)
            .unwrap_err();
        assert!(matches!(err, AgentError::Backend { ref reason, .. } if reason.contains("Overloaded")));
    }

    #[test]
    fn text_and_tool_use_fold_into_events() {
        let mut parser = SseParser::new();
        let mut state = AnthropicStreamState::new(false);
        let events = feed(
            &mut parser,
            &mut state,
            &[
                "event: message_start",
                r#"data: {"type":"message_start","message":{"id":"m","model":"claude","usage":{"input_tokens":5}}}"#,
                "event: content_block_start",
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Checking"}}"#,
                "event: content_block_stop",
                r#"data: {"type":"content_block_stop","index":0}"#,
                "event: content_block_start",
                r#"data: {"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"current_time","input":{}}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"zone\":"}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"UTC\"}"}}"#,
                "event: content_block_stop",
                r#"data: {"type":"content_block_stop","index":1}"#,
                "event: message_delta",
                r#"data: {"type":"message_delta","delta":{"stop_reason":"tool_use"},"usage":{"output_tokens":12}}"#,
                "event: message_stop",
                r#"data: {"type":"message_stop"}"#,
            ],
        );

        assert_eq!(events.len(), 3);
        assert_eq!(events[0], GenerationEvent::TextChunk("Checking".into()));
        assert_eq!(
            events[1],
            GenerationEvent::ToolCallRequested {
                id: Some("toolu_1".into()),
                name: "current_time".into(),
                arguments: r#"{"zone":"UTC"}"#.into(),
            }
        );
        match &events[2] {
            GenerationEvent::Info(info) => {
                assert_eq!(info.stop_reason.as_deref(), Some("tool_use"));
                assert_eq!(info.input_tokens, Some(5));
                assert_eq!(info.output_tokens, Some(12));
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(state.is_done());
    }

    #[test]
    fn structured_output_tool_input_becomes_text() {
        let mut parser = SseParser::new();
        let mut state = AnthropicStreamState::new(true);
        let events = feed(
            &mut parser,
            &mut state,
            &[
                "event: content_block_start",
                r#"data: {"type":"content_block_start","index":0,"content_block":{"type":"tool_use","id":"toolu_s","name":"structured_output","input":{}}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"title\":"}}"#,
                "event: content_block_delta",
                r#"data: {"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"\"x\"}"}}"#,
                "event: content_block_stop",
                r#"data: {"type":"content_block_stop","index":0}"#,
            ],
        );

        let text: String = events
            .iter()
            .filter_map(|e| match e {
                GenerationEvent::TextChunk(t) => Some(t.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, r#"{"title":"x"}"#);
        assert!(
            !events
                .iter()
                .any(|e| matches!(e, GenerationEvent::ToolCallRequested { .. }))
        );
    }
}
