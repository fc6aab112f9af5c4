//! SSE stream parser for the OpenAI Chat Completions API.
//!
//! The OpenAI streaming format sends `data:` lines in standard SSE format
//! with JSON payloads containing `choices[].delta` objects.  The stream
//! terminates with a `data: [DONE]` sentinel.

use serde_json::Value;

use crate::error::{AgentError, Result};
use crate::llm::types::{GenerationEvent, GenerationInfo};

// ---------------------------------------------------------------------------
// Stream state
// ---------------------------------------------------------------------------

/// Folds an OpenAI SSE stream into generation events.
///
/// Text deltas are forwarded as soon as they arrive.  Tool call deltas are
/// accumulated per `index` (the name typically arrives in the first chunk,
/// argument fragments follow) and emitted in index order once the stream
/// ends.
#[derive(Debug, Default)]
pub struct OpenAiStreamState {
    /// In-progress tool calls indexed by their position in the tool_calls
    /// array.
    tool_call_builders: Vec<OpenAiToolCallBuilder>,

    /// Whether the `[DONE]` sentinel has been received.
    done: bool,

    info: GenerationInfo,
}

/// In-progress tool call being assembled from streaming deltas.
#[derive(Debug, Default)]
struct OpenAiToolCallBuilder {
    id: Option<String>,
    name: String,
    arguments: String,
}

impl OpenAiStreamState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if the `[DONE]` sentinel has been received.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Feed a single SSE line from the stream.
    pub fn feed_line(&mut self, line: &str) -> Result<Vec<GenerationEvent>> {
        let line = line.trim_end();

        if line.is_empty() || line.starts_with(':') {
            return Ok(Vec::new());
        }

        let Some(data) = line.strip_prefix("data:") else {
            // `event:` / `id:` / `retry:` fields carry nothing we use.
            tracing::trace!(line, "ignoring non-data SSE line");
            return Ok(Vec::new());
        };
        let data = data.trim();

        if data == "[DONE]" {
            return Ok(self.finish());
        }

        let v: Value = serde_json::from_str(data).map_err(|e| AgentError::Backend {
            adapter: "openai".into(),
            reason: format!("invalid JSON in OpenAI SSE data: {e}"),
        })?;

        if let Some(error) = v.get("error").filter(|e| !e.is_null()) {
            return Err(AgentError::Backend {
                adapter: "openai".into(),
                reason: error["message"]
                    .as_str()
                    .map(String::from)
                    .unwrap_or_else(|| error.to_string()),
            });
        }

        if let Some(model) = v["model"].as_str() {
            self.info.model = Some(model.to_owned());
        }

        // Some OpenAI-compatible providers include usage in stream chunks.
        if let Some(usage) = v.get("usage").filter(|u| !u.is_null()) {
            self.info.input_tokens = usage["prompt_tokens"].as_u64().map(|n| n as u32);
            self.info.output_tokens = usage["completion_tokens"].as_u64().map(|n| n as u32);
        }

        let choice = &v["choices"][0];
        if let Some(reason) = choice["finish_reason"].as_str() {
            self.info.stop_reason = Some(reason.to_owned());
        }

        let delta = &choice["delta"];
        if delta.is_null() {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();
        if let Some(content) = delta["content"].as_str().filter(|c| !c.is_empty()) {
            events.push(GenerationEvent::TextChunk(content.to_owned()));
        }

        if let Some(tool_calls) = delta["tool_calls"].as_array() {
            for tc in tool_calls {
                let index = tc["index"].as_u64().unwrap_or(0) as usize;

                while self.tool_call_builders.len() <= index {
                    self.tool_call_builders
                        .push(OpenAiToolCallBuilder::default());
                }

                let builder = &mut self.tool_call_builders[index];

                if let Some(id) = tc["id"].as_str() {
                    builder.id = Some(id.to_owned());
                }

                let func = &tc["function"];
                if let Some(name) = func["name"].as_str() {
                    builder.name.push_str(name);
                }
                if let Some(args) = func["arguments"].as_str() {
                    builder.arguments.push_str(args);
                }
            }
        }

        Ok(events)
    }

    /// Flush accumulated tool calls and the trailing
    /// [`GenerationEvent::Info`].  Called on `[DONE]` or when the body ends
    /// without one.  Idempotent.
    pub fn finish(&mut self) -> Vec<GenerationEvent> {
        if self.done {
            return Vec::new();
        }
        self.done = true;

        let mut events: Vec<GenerationEvent> = self
            .tool_call_builders
            .drain(..)
            .filter(|b| !b.name.is_empty())
            .map(|b| GenerationEvent::ToolCallRequested {
                id: b.id,
                name: b.name,
                arguments: b.arguments,
            })
            .collect();
        events.push(GenerationEvent::Info(std::mem::take(&mut self.info)));
        events
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
