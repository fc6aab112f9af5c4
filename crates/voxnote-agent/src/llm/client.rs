//! Cloud backend adapter.
//!
//! Supports the **Anthropic Messages API** and the **OpenAI Chat Completions
//! API** (including OpenAI-compatible endpoints such as Ollama, Together, and
//! vLLM).  Responses are always streamed over SSE and surfaced as a lazy
//! [`EventStream`].

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use voxnote_schema::Schema;

use crate::error::{AgentError, Result};
use crate::llm::adapter::{Adapter, EventStream};
use crate::llm::streaming::{AnthropicStreamState, STRUCTURED_OUTPUT_TOOL, SseParser};
use crate::llm::streaming_openai::OpenAiStreamState;
use crate::llm::types::{ChatMessage, GenerationEvent, GenerationRequest, OutputFormat, Role};
use crate::tool::ToolSpec;
use crate::transcript::{ImageSource, Segment, join_text};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Default Anthropic API base URL.
pub const ANTHROPIC_BASE_URL: &str = "https://api.anthropic.com";

/// Default OpenAI API base URL.
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Default maximum tokens per response.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

// ---------------------------------------------------------------------------
// Provider enum
// ---------------------------------------------------------------------------

/// Identifies which wire protocol the adapter speaks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    /// Anthropic Messages API.
    #[default]
    Anthropic,
    /// OpenAI Chat Completions API.
    #[serde(rename = "openai")]
    OpenAi,
    /// Any endpoint speaking the OpenAI protocol.  An API key is optional.
    #[serde(rename = "openai_compatible")]
    OpenAiCompatible,
}

impl Provider {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::OpenAiCompatible => "openai_compatible",
        }
    }

    /// Default base URL for the provider.  OpenAI-compatible endpoints
    /// default to a local Ollama server.
    pub fn default_base_url(self) -> &'static str {
        match self {
            Self::Anthropic => ANTHROPIC_BASE_URL,
            Self::OpenAi => OPENAI_BASE_URL,
            Self::OpenAiCompatible => "http://localhost:11434/v1",
        }
    }

    fn speaks_openai(self) -> bool {
        matches!(self, Self::OpenAi | Self::OpenAiCompatible)
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "openai_compatible" | "openai-compatible" => Ok(Self::OpenAiCompatible),
            other => Err(AgentError::Config {
                reason: format!("unknown provider `{other}`"),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter configuration
// ---------------------------------------------------------------------------

/// Configuration for connecting to a single cloud endpoint.
#[derive(Debug, Clone)]
pub struct HttpAdapterConfig {
    pub provider: Provider,
    pub api_key: String,
    /// Base URL for the API (e.g. `https://api.anthropic.com`).
    pub base_url: String,
    pub model: String,
    /// Used when the request's options leave `max_tokens` unset.
    pub max_tokens: u32,
}

impl HttpAdapterConfig {
    /// Create a configuration for the Anthropic API.
    pub fn anthropic(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: Provider::Anthropic,
            api_key: api_key.into(),
            base_url: ANTHROPIC_BASE_URL.to_owned(),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Create a configuration for the OpenAI API.
    pub fn openai(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: Provider::OpenAi,
            api_key: api_key.into(),
            base_url: OPENAI_BASE_URL.to_owned(),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }

    /// Create a configuration for any OpenAI-compatible API (e.g. Ollama,
    /// Together, vLLM).
    pub fn openai_compatible(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            provider: Provider::OpenAiCompatible,
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Streams generations from a cloud API.
#[derive(Debug, Clone)]
pub struct HttpAdapter {
    config: Arc<HttpAdapterConfig>,
    http: reqwest::Client,
}

impl HttpAdapter {
    /// Create a new adapter.
    ///
    /// # Errors
    ///
    /// [`AgentError::MissingApiKey`] when the provider requires a key and none
    /// is configured.
    pub fn new(config: HttpAdapterConfig) -> Result<Self> {
        if config.api_key.is_empty() && config.provider != Provider::OpenAiCompatible {
            return Err(AgentError::MissingApiKey {
                provider: config.provider.to_string(),
            });
        }

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| AgentError::Backend {
                adapter: config.provider.to_string(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            config: Arc::new(config),
            http,
        })
    }

    pub fn config(&self) -> &HttpAdapterConfig {
        &self.config
    }

    fn backend_error(&self, reason: impl Into<String>) -> AgentError {
        AgentError::Backend {
            adapter: self.config.provider.to_string(),
            reason: reason.into(),
        }
    }

    /// Build the JSON request body for the configured provider.
    pub fn request_body(&self, request: &GenerationRequest) -> Value {
        if self.config.provider.speaks_openai() {
            self.build_openai_request_body(request)
        } else {
            self.build_anthropic_request_body(request)
        }
    }

    // -- Anthropic request building ------------------------------------------

    fn build_anthropic_request_body(&self, request: &GenerationRequest) -> Value {
        let (system_text, messages) = messages_to_anthropic(&request.messages);
        let options = &request.options;

        let mut body = json!({
            "model": self.config.model,
            "max_tokens": options.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": messages,
            "stream": true,
        });

        if let Some(system) = system_text {
            body["system"] = json!(system);
        }
        if let Some(temp) = options.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }

        let mut tools = tools_to_anthropic(&request.tools);
        if let OutputFormat::Structured(schema) = &request.output {
            tools.push(json!({
                "name": STRUCTURED_OUTPUT_TOOL,
                "description": "Respond with data matching this schema.",
                "input_schema": schema.to_json_schema(),
            }));
            // With caller tools registered the model may still call them; the
            // turn ends once it picks the output tool.
            body["tool_choice"] = if request.tools.is_empty() {
                json!({"type": "tool", "name": STRUCTURED_OUTPUT_TOOL})
            } else {
                json!({"type": "any"})
            };
        }
        if !tools.is_empty() {
            body["tools"] = json!(tools);
        }

        body
    }

    async fn send_anthropic_request(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!("{}/v1/messages", self.config.base_url.trim_end_matches('/'));

        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.config.api_key)
                .map_err(|e| self.backend_error(format!("invalid API key header: {e}")))?,
        );
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        tracing::debug!(url = %url, model = %body["model"], provider = "anthropic", "sending generation request");
        self.send(&url, headers, body).await
    }

    // -- OpenAI request building ---------------------------------------------

    fn build_openai_request_body(&self, request: &GenerationRequest) -> Value {
        let options = &request.options;

        let mut body = json!({
            "model": self.config.model,
            "max_tokens": options.max_tokens.unwrap_or(self.config.max_tokens),
            "messages": messages_to_openai(&request.messages),
            "stream": true,
        });

        if let Some(temp) = options.temperature {
            body["temperature"] = json!(temp);
        }
        if let Some(top_p) = options.top_p {
            body["top_p"] = json!(top_p);
        }
        if let Some(penalty) = options.repetition_penalty {
            // Closest OpenAI control; compatible servers often accept the
            // native name too.
            body["frequency_penalty"] = json!(penalty - 1.0);
        }
        if !request.tools.is_empty() {
            body["tools"] = tools_to_openai(&request.tools);
        }
        if let OutputFormat::Structured(schema) = &request.output {
            body["response_format"] = response_format(schema);
        }

        body
    }

    async fn send_openai_request(&self, body: &Value) -> Result<reqwest::Response> {
        let url = format!(
            "{}/chat/completions",
            self.config.base_url.trim_end_matches('/')
        );

        let mut headers = HeaderMap::new();
        if !self.config.api_key.is_empty() {
            let auth_value = format!("Bearer {}", self.config.api_key);
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&auth_value).map_err(|e| {
                    self.backend_error(format!("invalid authorization header: {e}"))
                })?,
            );
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        tracing::debug!(url = %url, model = %body["model"], provider = %self.config.provider, "sending generation request");
        self.send(&url, headers, body).await
    }

    async fn send(&self, url: &str, headers: HeaderMap, body: &Value) -> Result<reqwest::Response> {
        let resp = self
            .http
            .post(url)
            .headers(headers)
            .json(body)
            .send()
            .await
            .map_err(|e| self.backend_error(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(self.backend_error(format!("API returned {status}: {text}")));
        }
        Ok(resp)
    }
}

#[async_trait]
impl Adapter for HttpAdapter {
    fn name(&self) -> &str {
        self.config.provider.as_str()
    }

    fn supports_output(&self, _output: &OutputFormat) -> bool {
        true
    }

    async fn generate(&self, request: GenerationRequest) -> Result<EventStream> {
        let body = self.request_body(&request);
        let provider = self.config.provider;

        let (resp, wire) = if provider.speaks_openai() {
            let resp = self.send_openai_request(&body).await?;
            (resp, WireState::OpenAi(OpenAiStreamState::new()))
        } else {
            let structured = matches!(request.output, OutputFormat::Structured(_));
            let resp = self.send_anthropic_request(&body).await?;
            (
                resp,
                WireState::Anthropic(SseParser::new(), AnthropicStreamState::new(structured)),
            )
        };

        let body_stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
            .boxed();
        Ok(sse_event_stream(provider.as_str(), body_stream, wire))
    }
}

// ===========================================================================
// SSE body decoding
// ===========================================================================

/// Per-protocol line handling.
enum WireState {
    Anthropic(SseParser, AnthropicStreamState),
    OpenAi(OpenAiStreamState),
}

impl WireState {
    fn feed_line(&mut self, line: &str) -> Result<Vec<GenerationEvent>> {
        match self {
            Self::Anthropic(parser, state) => Ok(parser
                .parse_line(line)?
                .map(|event| state.apply(event))
                .unwrap_or_default()),
            Self::OpenAi(state) => state.feed_line(line),
        }
    }

    fn is_done(&self) -> bool {
        match self {
            Self::Anthropic(_, state) => state.is_done(),
            Self::OpenAi(state) => state.is_done(),
        }
    }

    fn finish(&mut self) -> Vec<GenerationEvent> {
        match self {
            Self::Anthropic(_, state) => state.finish(),
            Self::OpenAi(state) => state.finish(),
        }
    }
}

struct SseDecoder {
    adapter: &'static str,
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    buffer: Vec<u8>,
    pending: VecDeque<GenerationEvent>,
    wire: WireState,
    finished: bool,
}

impl SseDecoder {
    fn error(&self, reason: String) -> AgentError {
        AgentError::Backend {
            adapter: self.adapter.to_owned(),
            reason,
        }
    }

    /// Process every complete line in the buffer.
    fn drain_lines(&mut self) -> Result<()> {
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.feed(&raw)?;
            if self.wire.is_done() {
                self.finished = true;
                break;
            }
        }
        Ok(())
    }

    fn feed(&mut self, raw: &[u8]) -> Result<()> {
        let line = std::str::from_utf8(raw)
            .map_err(|e| self.error(format!("invalid UTF-8 in stream: {e}")))?;
        let events = self.wire.feed_line(line)?;
        self.pending.extend(events);
        Ok(())
    }

    /// Handle the end of the body: a trailing unterminated line, then the
    /// protocol's closing events.
    fn flush(&mut self) -> Result<()> {
        self.finished = true;
        if !self.buffer.is_empty() {
            let raw = std::mem::take(&mut self.buffer);
            self.feed(&raw)?;
        }
        let closing = self.wire.finish();
        self.pending.extend(closing);
        Ok(())
    }
}

/// Decode an SSE response body into a lazy event stream.
fn sse_event_stream(
    adapter: &'static str,
    body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
    wire: WireState,
) -> EventStream {
    let decoder = SseDecoder {
        adapter,
        body,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        wire,
        finished: false,
    };

    stream::unfold(decoder, |mut decoder| async move {
        loop {
            if let Some(event) = decoder.pending.pop_front() {
                return Some((Ok(event), decoder));
            }
            if decoder.finished {
                return None;
            }

            let step = match decoder.body.next().await {
                Some(Ok(chunk)) => {
                    decoder.buffer.extend_from_slice(&chunk);
                    decoder.drain_lines()
                }
                Some(Err(e)) => Err(decoder.error(format!("stream read error: {e}"))),
                None => decoder.flush(),
            };

            if let Err(e) = step {
                decoder.finished = true;
                decoder.pending.clear();
                return Some((Err(e), decoder));
            }
        }
    })
    .boxed()
}

// ===========================================================================
// Anthropic format conversion (free functions)
// ===========================================================================

/// Convert segments into Anthropic content blocks.
fn segments_to_anthropic(segments: &[Segment]) -> Vec<Value> {
    segments
        .iter()
        .map(|segment| match segment {
            Segment::Text(text) => json!({"type": "text", "text": text}),
            Segment::Structured { value, .. } => json!({"type": "text", "text": value.to_json()}),
            Segment::Image(image) => match &image.source {
                ImageSource::Url { url } => json!({
                    "type": "image",
                    "source": {"type": "url", "url": url},
                }),
                ImageSource::Bytes { data, mime_type } => json!({
                    "type": "image",
                    "source": {
                        "type": "base64",
                        "media_type": mime_type,
                        "data": STANDARD.encode(data),
                    },
                }),
            },
        })
        .collect()
}

/// Split the system message out (Anthropic expects it as a top-level field,
/// not in the `messages` array) and convert the remaining messages to the
/// Anthropic wire format.  Consecutive tool results are merged into one user
/// message.
pub fn messages_to_anthropic(messages: &[ChatMessage]) -> (Option<String>, Vec<Value>) {
    let mut system: Option<String> = None;
    let mut wire_messages: Vec<Value> = Vec::with_capacity(messages.len());
    let mut pending_results: Vec<Value> = Vec::new();

    for msg in messages {
        if msg.role != Role::Tool && !pending_results.is_empty() {
            wire_messages.push(json!({
                "role": "user",
                "content": std::mem::take(&mut pending_results),
            }));
        }

        match msg.role {
            Role::System => {
                let text = msg.content_text();
                match &mut system {
                    Some(existing) => {
                        existing.push('\n');
                        existing.push_str(&text);
                    }
                    None => system = Some(text),
                }
            }
            Role::User => {
                wire_messages.push(json!({
                    "role": "user",
                    "content": segments_to_anthropic(&msg.segments),
                }));
            }
            Role::Assistant => {
                let mut content = segments_to_anthropic(&msg.segments);
                for tc in &msg.tool_calls {
                    content.push(json!({
                        "type": "tool_use",
                        "id": tc.id,
                        "name": tc.tool_name,
                        "input": Value::from(&tc.arguments),
                    }));
                }
                wire_messages.push(json!({
                    "role": "assistant",
                    "content": content,
                }));
            }
            Role::Tool => {
                pending_results.push(json!({
                    "type": "tool_result",
                    "tool_use_id": msg.tool_call_id,
                    "content": segments_to_anthropic(&msg.segments),
                }));
            }
        }
    }

    if !pending_results.is_empty() {
        wire_messages.push(json!({
            "role": "user",
            "content": pending_results,
        }));
    }

    (system, wire_messages)
}

/// Convert tool specs into the Anthropic API format.
pub fn tools_to_anthropic(tools: &[ToolSpec]) -> Vec<Value> {
    tools
        .iter()
        .map(|t| {
            json!({
                "name": t.name,
                "description": t.description,
                "input_schema": t.parameters,
            })
        })
        .collect()
}

// ===========================================================================
// OpenAI format conversion (free functions)
// ===========================================================================

/// Convert segments into OpenAI message content: a plain string when the
/// segments are all textual, a content-part array otherwise.
fn segments_to_openai(segments: &[Segment]) -> Value {
    if !segments.iter().any(|s| matches!(s, Segment::Image(_))) {
        return json!(join_text(segments));
    }

    let parts: Vec<Value> = segments
        .iter()
        .map(|segment| match segment {
            Segment::Image(image) => {
                let url = match &image.source {
                    ImageSource::Url { url } => url.clone(),
                    ImageSource::Bytes { data, mime_type } => {
                        format!("data:{mime_type};base64,{}", STANDARD.encode(data))
                    }
                };
                json!({"type": "image_url", "image_url": {"url": url}})
            }
            other => json!({"type": "text", "text": other.render_text().unwrap_or_default()}),
        })
        .collect();
    json!(parts)
}

/// Convert chat messages to the OpenAI Chat Completions wire format.
///
/// In the OpenAI format, system messages are part of the `messages` array,
/// tool calls are in `assistant.tool_calls`, and tool results use
/// `role: "tool"` with a `tool_call_id`.
pub fn messages_to_openai(messages: &[ChatMessage]) -> Vec<Value> {
    messages
        .iter()
        .map(|msg| match msg.role {
            Role::System | Role::User => json!({
                "role": msg.role.as_str(),
                "content": segments_to_openai(&msg.segments),
            }),
            Role::Assistant if msg.tool_calls.is_empty() => json!({
                "role": "assistant",
                "content": msg.content_text(),
            }),
            Role::Assistant => {
                let tool_calls: Vec<Value> = msg
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.tool_name,
                                "arguments": tc.arguments.to_json(),
                            }
                        })
                    })
                    .collect();

                let mut m = json!({
                    "role": "assistant",
                    "tool_calls": tool_calls,
                });
                let text = msg.content_text();
                if !text.is_empty() {
                    m["content"] = json!(text);
                }
                m
            }
            Role::Tool => json!({
                "role": "tool",
                "tool_call_id": msg.tool_call_id,
                "content": msg.content_text(),
            }),
        })
        .collect()
}

/// Convert tool specs into the OpenAI Chat Completions API format.
///
/// OpenAI wraps each tool in `{"type": "function", "function": {...}}`.
pub fn tools_to_openai(tools: &[ToolSpec]) -> Value {
    let tool_values: Vec<Value> = tools
        .iter()
        .map(|t| {
            json!({
                "type": "function",
                "function": {
                    "name": t.name,
                    "description": t.description,
                    "parameters": t.parameters,
                }
            })
        })
        .collect();
    json!(tool_values)
}

/// `response_format` for schema-guided output.
fn response_format(schema: &Schema) -> Value {
    let name = match schema {
        Schema::Object(object) => object.name().to_owned(),
        _ => "response".to_owned(),
    };
    json!({
        "type": "json_schema",
        "json_schema": {
            "name": name,
            "schema": schema.to_json_schema(),
        },
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
