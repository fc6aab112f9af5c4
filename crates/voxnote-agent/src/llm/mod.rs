//! Backend integration layer.
//!
//! This module provides the interface between the session and the model
//! backends.  It is organized into:
//!
//! - [`types`] -- Core data types (chat messages, requests, generation events).
//! - [`adapter`] -- The [`Adapter`] capability every backend implements.
//! - [`local`] -- On-device adapter over a pluggable [`LocalEngine`].
//! - [`client`] -- HTTP adapter for Anthropic and OpenAI-style APIs.
//! - [`streaming`] -- SSE stream parser for Anthropic incremental responses.
//! - [`streaming_openai`] -- SSE stream parser for OpenAI incremental responses.

pub mod adapter;
pub mod client;
pub mod local;
pub mod streaming;
pub mod streaming_openai;
pub mod types;

// Re-export the most commonly used types for convenience.
pub use adapter::{Adapter, EventStream};
pub use client::{HttpAdapter, HttpAdapterConfig, Provider};
pub use local::{EngineInput, LocalAdapter, LocalEngine, NativeMessage, PieceStream, SamplingParams};
pub use types::{
    ChatMessage, GenerationEvent, GenerationInfo, GenerationOptions, GenerationRequest,
    OutputFormat, Role,
};
