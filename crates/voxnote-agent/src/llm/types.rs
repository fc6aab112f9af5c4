//! Core types for backend interaction.
//!
//! These types model the data flowing between the session and an adapter.
//! They are backend-agnostic; each adapter translates them into its own
//! native request format.

use std::fmt;

use serde::{Deserialize, Serialize};
use voxnote_schema::Schema;

use crate::tool::ToolSpec;
use crate::transcript::{Segment, ToolCall, join_text};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// The role of a participant in the running chat context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// System-level instructions that shape model behavior.
    System,
    /// The user turn.
    User,
    /// Output from the model.
    Assistant,
    /// Result of a tool invocation, fed back to the model.
    Tool,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }
}

/// A single message in the running chat context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who produced this message.
    pub role: Role,

    /// Message content.
    #[serde(default)]
    pub segments: Vec<Segment>,

    /// Tool calls requested by the assistant (only present when
    /// `role == Role::Assistant`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,

    /// Identifies which tool call this message answers (only present when
    /// `role == Role::Tool`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn new(role: Role, segments: Vec<Segment>) -> Self {
        Self {
            role,
            segments,
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// A message holding one text segment.
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self::new(role, vec![Segment::text(text)])
    }

    /// An assistant message carrying tool calls and any text produced in the
    /// same round.
    pub fn assistant_tool_calls(text: Option<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::new(Role::Assistant, text.map(Segment::text).into_iter().collect())
        }
    }

    /// A tool-role message answering `tool_call_id`.
    pub fn tool_output(tool_call_id: impl Into<String>, segments: Vec<Segment>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::new(Role::Tool, segments)
        }
    }

    /// Concatenated textual content.
    pub fn content_text(&self) -> String {
        join_text(&self.segments)
    }
}

// ---------------------------------------------------------------------------
// Generation options
// ---------------------------------------------------------------------------

/// Sampling controls passed unchanged to the adapter.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationOptions {
    /// Maximum tokens the model may generate in one round.
    pub max_tokens: Option<u32>,
    /// Sampling temperature; the adapter's default when `None`.
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub repetition_penalty: Option<f32>,
}

impl GenerationOptions {
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// The final output shape requested from the backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum OutputFormat {
    /// Free-form text.
    #[default]
    Text,
    /// JSON matching a schema.
    Structured(Schema),
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Structured(Schema::Object(object)) => {
                write!(f, "structured `{}`", object.name())
            }
            Self::Structured(schema) => write!(f, "structured {}", schema.kind()),
        }
    }
}

/// Everything an adapter needs for one round of generation.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// The running chat context: at most one system message, then the
    /// conversation in order.
    pub messages: Vec<ChatMessage>,
    /// Tools the model may call.
    pub tools: Vec<ToolSpec>,
    pub options: GenerationOptions,
    pub output: OutputFormat,
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One item of an adapter's event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum GenerationEvent {
    /// A piece of assistant text.
    TextChunk(String),
    /// The model wants to call a tool.  `arguments` is the raw JSON text as
    /// the backend produced it.
    ToolCallRequested {
        id: Option<String>,
        name: String,
        arguments: String,
    },
    /// Diagnostics; ignored by the session.
    Info(GenerationInfo),
}

/// Diagnostic metadata reported at the end of a round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationInfo {
    pub model: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub stop_reason: Option<String>,
}

// ---------------------------------------------------------------------------
// Anthropic streaming events
// ---------------------------------------------------------------------------

/// Events emitted during SSE streaming from the Anthropic Messages API.
///
/// These map to the `event:` field in the SSE stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// The stream has started.
    MessageStart {
        message_id: String,
        model: String,
        input_tokens: u32,
    },

    /// A new content block has started (`"text"` or `"tool_use"`).
    ContentBlockStart {
        index: u32,
        content_type: String,
        /// For tool_use blocks: the tool call id.
        id: Option<String>,
        /// For tool_use blocks: the tool name.
        name: Option<String>,
    },

    /// An incremental delta within a content block.
    ContentBlockDelta { index: u32, delta: StreamDelta },

    /// A content block has finished streaming.
    ContentBlockStop { index: u32 },

    /// Top-level message changes reported near the end of the stream.
    MessageDelta {
        /// `"end_turn"`, `"tool_use"`, `"max_tokens"`, ...
        stop_reason: Option<String>,
        output_tokens: u32,
    },

    /// The stream has fully terminated.
    MessageStop,

    /// Keepalive.
    Ping,
}

/// Incremental delta within a streaming content block.
#[derive(Debug, Clone)]
pub enum StreamDelta {
    /// A chunk of text.
    TextDelta(String),

    /// A chunk of JSON for a tool-use input.
    InputJsonDelta(String),
}
