//! Agent error types.
//!
//! All session and adapter failures surface through [`AgentError`].  The
//! variants keep the originating error's identity so callers can tell a
//! backend problem from a tool bug from malformed model output.

use voxnote_schema::{SchemaError, ValueError};

/// Unified error type for the session core.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    // -- Structured data errors ----------------------------------------------
    /// Model output (a structured response or tool-call arguments) could not
    /// be parsed or did not match its schema.
    #[error("value error: {0}")]
    Value(#[from] ValueError),

    /// A schema could not be built or resolved.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// A loaded transcript violates the tool-output pairing rules.
    #[error("transcript error: {0}")]
    Transcript(#[from] TranscriptError),

    // -- Tool errors ---------------------------------------------------------
    /// A registered tool failed.  The whole turn is aborted.
    #[error("tool `{tool_name}` failed (call {call_id}): {source}")]
    ToolExecution {
        tool_name: String,
        call_id: String,
        #[source]
        source: ToolError,
    },

    // -- Adapter errors ------------------------------------------------------
    /// The backend could not be brought up (e.g. the model failed to load).
    #[error("adapter `{adapter}` unavailable: {reason}")]
    AdapterUnavailable { adapter: String, reason: String },

    /// The backend failed while serving a request.
    #[error("adapter `{adapter}` backend failure: {reason}")]
    Backend { adapter: String, reason: String },

    /// The caller asked for an output format the adapter cannot produce.
    #[error("adapter `{adapter}` does not support {output} output")]
    UnsupportedOutputType { adapter: String, output: String },

    /// The API key is missing for a provider that requires one.
    #[error("missing api key for provider: {provider}")]
    MissingApiKey { provider: String },

    // -- Session errors ------------------------------------------------------
    /// The model kept requesting tools past the configured round limit.
    #[error("tool-calling loop exceeded {rounds} rounds")]
    RoundLimitExceeded { rounds: u32 },

    // -- Configuration errors ------------------------------------------------
    /// Configuration loading or validation failed.
    #[error("config error: {reason}")]
    Config { reason: String },

    // -- Serialization -------------------------------------------------------
    /// JSON serialization or deserialization failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience alias used throughout the agent crate.
pub type Result<T> = std::result::Result<T, AgentError>;

impl From<reqwest::Error> for AgentError {
    fn from(err: reqwest::Error) -> Self {
        Self::Backend {
            adapter: "http".into(),
            reason: err.to_string(),
        }
    }
}

/// Errors a [`crate::Tool`] implementation reports.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    /// The arguments did not have the shape the tool expects.
    #[error("invalid arguments: {reason}")]
    InvalidArguments { reason: String },

    /// The tool ran and failed.
    #[error("{reason}")]
    Failed { reason: String },

    /// Decoding the arguments into a typed value failed.
    #[error(transparent)]
    Value(#[from] ValueError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ToolError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

/// Violations of the transcript's tool-output pairing rules.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranscriptError {
    /// A tool output has no matching tool call earlier in the same turn.
    #[error("tool output `{id}` at entry {index} has no matching tool call")]
    OrphanToolOutput { id: String, index: usize },

    /// Two tool calls in one turn share an id.
    #[error("duplicate tool call id `{id}` at entry {index}")]
    DuplicateToolCallId { id: String, index: usize },
}

/// Failure reported by a [`crate::llm::local::LocalEngine`].
#[derive(Debug, Clone, thiserror::Error)]
#[error("{reason}")]
pub struct EngineError {
    pub reason: String,
}

impl EngineError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
