//! The backend adapter capability.
//!
//! The session depends only on [`Adapter`]; every backend (on-device engine,
//! cloud API) supplies one implementation.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::Result;
use crate::llm::types::{GenerationEvent, GenerationRequest, OutputFormat};

/// Lazy, single-pass, finite sequence of generation events for one round.
///
/// Dropping the stream abandons the in-flight backend work at its next
/// suspension point.
pub type EventStream = BoxStream<'static, Result<GenerationEvent>>;

/// Translates uniform generation requests to and from one backend.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Short identifier used in errors and logs.
    fn name(&self) -> &str;

    /// Whether the backend can produce the requested final output.  The
    /// session checks this before any backend work starts.
    fn supports_output(&self, output: &OutputFormat) -> bool;

    /// Start one round of generation.
    ///
    /// # Errors
    ///
    /// [`crate::AgentError::AdapterUnavailable`] when the backend cannot be
    /// brought up, [`crate::AgentError::Backend`] when the request fails,
    /// [`crate::AgentError::UnsupportedOutputType`] for an output format
    /// [`Adapter::supports_output`] rejects.
    async fn generate(&self, request: GenerationRequest) -> Result<EventStream>;
}
