//! Language-model session core for voxnote.
//!
//! This crate lets an application converse with interchangeable model
//! backends through one protocol: it keeps the conversation transcript,
//! exposes tools to the model, and runs the generate / call-tools /
//! re-generate loop until the model stops asking for tools.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐  respond   ┌───────────┐  generate  ┌──────────────────┐
//! │   Caller   │──────────> │  Session  │──────────> │ Adapter          │
//! │ (CLI, app) │ <──────────│  (loop)   │ <──────────│ local │ http     │
//! └────────────┘  text +    └─────┬─────┘  events    └──────────────────┘
//!                 entries         │
//!                           ┌─────┴─────┐
//!                           │   Tools   │
//!                           └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`transcript`] -- Entries, segments and tool calls of a conversation.
//! - [`tool`] -- The [`Tool`] trait and the per-session registry.
//! - [`llm`] -- The [`Adapter`] capability, the local and HTTP adapters, and
//!   their wire types.
//! - [`session`] -- The tool-calling loop.
//! - [`config`] -- TOML and environment configuration.
//! - [`error`] -- Agent error types.

pub mod config;
pub mod error;
pub mod llm;
pub mod session;
pub mod tool;
pub mod transcript;

// Re-export the most commonly used types at the crate root.
pub use config::{AgentConfig, BackendConfig};
pub use error::{AgentError, EngineError, Result, ToolError, TranscriptError};
pub use llm::{
    Adapter, ChatMessage, EventStream, GenerationEvent, GenerationInfo, GenerationOptions,
    GenerationRequest, HttpAdapter, HttpAdapterConfig, LocalAdapter, LocalEngine, OutputFormat,
    Provider, Role,
};
pub use session::{
    HistoryMode, ResponseSnapshot, Session, SessionConfig, SessionResponse, StructuredResponse,
};
pub use tool::{Tool, ToolRegistry, ToolSpec};
pub use transcript::{Entry, ImageSegment, ImageSource, Segment, SegmentKind, ToolCall, Transcript};
