//! On-device inference adapter.
//!
//! [`LocalAdapter`] drives any [`LocalEngine`]: it renders the chat context
//! into the engine's native history, loads the model on first use, and
//! scans the engine's text pieces for `<tool_call>...</tool_call>` tags.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::OnceCell;
use voxnote_schema::Value;

use crate::error::{AgentError, EngineError, Result};
use crate::llm::adapter::{Adapter, EventStream};
use crate::llm::types::{
    ChatMessage, GenerationEvent, GenerationInfo, GenerationOptions, GenerationRequest,
    OutputFormat,
};
use crate::tool::ToolSpec;
use crate::transcript::{ImageSource, Segment};

/// Default sampling temperature for on-device models.
pub const DEFAULT_TEMPERATURE: f32 = 0.6;

const TOOL_CALL_OPEN: &str = "<tool_call>";
const TOOL_CALL_CLOSE: &str = "</tool_call>";

// ---------------------------------------------------------------------------
// Engine interface
// ---------------------------------------------------------------------------

/// Stream of decoded text pieces produced by an engine.
pub type PieceStream = BoxStream<'static, std::result::Result<String, EngineError>>;

/// A local inference runtime.
#[async_trait]
pub trait LocalEngine: Send + Sync + 'static {
    /// Loaded weights and tokenizer.
    type Model: Send + Sync + 'static;

    /// Identifier used in errors and logs.
    fn name(&self) -> &str;

    /// Whether [`NativeMessage::images`] are understood.
    fn supports_images(&self) -> bool {
        false
    }

    /// Load the model.  Called at most once per adapter.
    async fn load(&self) -> std::result::Result<Self::Model, EngineError>;

    /// Generate a reply to `input`, one decoded piece per token.
    async fn generate(
        &self,
        model: Arc<Self::Model>,
        input: EngineInput,
    ) -> std::result::Result<PieceStream, EngineError>;
}

/// Everything the engine needs for one generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineInput {
    pub messages: Vec<NativeMessage>,
    /// Function-calling specs: `{"type": "function", "function": {...}}`.
    pub tools: Vec<serde_json::Value>,
    pub sampling: SamplingParams,
}

/// One message of the engine's chat template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NativeMessage {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageSource>,
}

/// Native sampling parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: Option<f32>,
    pub max_tokens: Option<u32>,
    pub repetition_penalty: Option<f32>,
}

impl From<&GenerationOptions> for SamplingParams {
    fn from(options: &GenerationOptions) -> Self {
        Self {
            temperature: options.temperature.unwrap_or(DEFAULT_TEMPERATURE),
            top_p: options.top_p,
            max_tokens: options.max_tokens,
            repetition_penalty: options.repetition_penalty,
        }
    }
}

// ---------------------------------------------------------------------------
// Context conversion
// ---------------------------------------------------------------------------

/// Render one chat message into the engine's native form.  The same rules
/// apply to every role; only the role tag differs.
fn to_native(message: &ChatMessage, supports_images: bool) -> NativeMessage {
    let mut content = String::new();
    let mut images = Vec::new();

    for segment in &message.segments {
        match segment {
            Segment::Image(image) if supports_images => images.push(image.source.clone()),
            Segment::Image(_) => {
                tracing::debug!(role = message.role.as_str(), "engine has no image support, dropping image segment");
            }
            other => {
                if let Some(text) = other.render_text() {
                    content.push_str(&text);
                }
            }
        }
    }

    for call in &message.tool_calls {
        let tag = json!({"name": call.tool_name, "arguments": serde_json::Value::from(&call.arguments)});
        content.push_str(&format!("{TOOL_CALL_OPEN}{tag}{TOOL_CALL_CLOSE}"));
    }

    NativeMessage {
        role: message.role.as_str().to_owned(),
        content,
        images,
    }
}

/// Convert tool specs into the function-calling schema chat templates
/// expect.
pub fn tools_to_native(tools: &[ToolSpec]) -> Vec<serde_json::Value> {
    tools
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
        .collect()
}

/// Build the engine input for a request.
pub fn engine_input(request: &GenerationRequest, supports_images: bool) -> EngineInput {
    EngineInput {
        messages: request
            .messages
            .iter()
            .map(|m| to_native(m, supports_images))
            .collect(),
        tools: tools_to_native(&request.tools),
        sampling: SamplingParams::from(&request.options),
    }
}

// ---------------------------------------------------------------------------
// Tool-call tag detection
// ---------------------------------------------------------------------------

/// Splits streamed text into plain text and `<tool_call>` payloads, even
/// when a tag is split across pieces.
#[derive(Debug, Default)]
pub struct ToolCallScanner {
    buffer: String,
    in_tag: bool,
}

impl ToolCallScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one piece.  Text that might be the start of an opening tag is
    /// held back until the next piece decides it.
    pub fn push(&mut self, piece: &str) -> Vec<Result<GenerationEvent>> {
        self.buffer.push_str(piece);
        let mut events = Vec::new();

        loop {
            if self.in_tag {
                let Some(end) = self.buffer.find(TOOL_CALL_CLOSE) else {
                    break;
                };
                let body: String = self.buffer[..end].to_owned();
                self.buffer.drain(..end + TOOL_CALL_CLOSE.len());
                self.in_tag = false;
                events.push(parse_tool_call(&body));
            } else if let Some(start) = self.buffer.find(TOOL_CALL_OPEN) {
                if start > 0 {
                    events.push(Ok(GenerationEvent::TextChunk(self.buffer[..start].to_owned())));
                }
                self.buffer.drain(..start + TOOL_CALL_OPEN.len());
                self.in_tag = true;
            } else {
                let keep = partial_open_len(&self.buffer);
                let emit = self.buffer.len() - keep;
                if emit > 0 {
                    let text: String = self.buffer.drain(..emit).collect();
                    events.push(Ok(GenerationEvent::TextChunk(text)));
                }
                break;
            }
        }

        events
    }

    /// Flush whatever is left at the end of generation.  An unterminated
    /// tag is returned as plain text.
    pub fn finish(&mut self) -> Option<GenerationEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let text = if std::mem::take(&mut self.in_tag) {
            tracing::warn!("generation ended inside an unterminated tool call tag");
            format!("{TOOL_CALL_OPEN}{rest}")
        } else {
            rest
        };
        (!text.is_empty()).then_some(GenerationEvent::TextChunk(text))
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of the
/// opening tag.
fn partial_open_len(text: &str) -> usize {
    (1..TOOL_CALL_OPEN.len())
        .rev()
        .find(|&n| {
            n <= text.len()
                && text.is_char_boundary(text.len() - n)
                && TOOL_CALL_OPEN.starts_with(&text[text.len() - n..])
        })
        .unwrap_or(0)
}

/// Parse a tag body: `{"name": ..., "arguments": ...}`.  Arguments may be an
/// object or a JSON-encoded string.
fn parse_tool_call(body: &str) -> Result<GenerationEvent> {
    let value = Value::parse(body.trim())?;
    let name = value
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let arguments = match value.get("arguments") {
        Some(Value::String(raw)) => raw.clone(),
        Some(other) => other.to_json(),
        None => "{}".to_owned(),
    };
    Ok(GenerationEvent::ToolCallRequested {
        id: None,
        name,
        arguments,
    })
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Adapter for an on-device [`LocalEngine`].
pub struct LocalAdapter<E: LocalEngine> {
    engine: Arc<E>,
    model: OnceCell<Arc<E::Model>>,
}

impl<E: LocalEngine> LocalAdapter<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine: Arc::new(engine),
            model: OnceCell::new(),
        }
    }

    /// Whether the model has been loaded.
    pub fn is_loaded(&self) -> bool {
        self.model.initialized()
    }

    async fn model(&self) -> Result<Arc<E::Model>> {
        self.model
            .get_or_try_init(|| async {
                tracing::info!(engine = self.engine.name(), "loading local model");
                self.engine
                    .load()
                    .await
                    .map(Arc::new)
                    .map_err(|e| AgentError::AdapterUnavailable {
                        adapter: self.engine.name().to_owned(),
                        reason: e.reason,
                    })
            })
            .await
            .map(Arc::clone)
    }
}

#[async_trait]
impl<E: LocalEngine> Adapter for LocalAdapter<E> {
    fn name(&self) -> &str {
        self.engine.name()
    }

    fn supports_output(&self, output: &OutputFormat) -> bool {
        matches!(output, OutputFormat::Text)
    }

    async fn generate(&self, request: GenerationRequest) -> Result<EventStream> {
        if !self.supports_output(&request.output) {
            return Err(AgentError::UnsupportedOutputType {
                adapter: self.name().to_owned(),
                output: request.output.to_string(),
            });
        }

        let input = engine_input(&request, self.engine.supports_images());
        let max_tokens = input.sampling.max_tokens;
        let model = self.model().await?;

        tracing::debug!(
            engine = self.engine.name(),
            messages = input.messages.len(),
            tools = input.tools.len(),
            "starting local generation"
        );

        let adapter = self.engine.name().to_owned();
        let pieces = self
            .engine
            .generate(model, input)
            .await
            .map_err(|e| AgentError::Backend {
                adapter: adapter.clone(),
                reason: e.reason,
            })?;

        Ok(local_event_stream(adapter, pieces, max_tokens))
    }
}

struct LocalStreamState {
    adapter: String,
    pieces: PieceStream,
    scanner: ToolCallScanner,
    pending: VecDeque<Result<GenerationEvent>>,
    tokens: u32,
    max_tokens: Option<u32>,
    finished: bool,
}

fn local_event_stream(adapter: String, pieces: PieceStream, max_tokens: Option<u32>) -> EventStream {
    let state = LocalStreamState {
        adapter,
        pieces,
        scanner: ToolCallScanner::new(),
        pending: VecDeque::new(),
        tokens: 0,
        max_tokens,
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((event, state));
            }
            if state.finished {
                return None;
            }

            match state.pieces.next().await {
                Some(Ok(piece)) => {
                    state.tokens += 1;
                    let events = state.scanner.push(&piece);
                    state.pending.extend(events);
                }
                Some(Err(e)) => {
                    state.finished = true;
                    return Some((
                        Err(AgentError::Backend {
                            adapter: state.adapter.clone(),
                            reason: e.reason,
                        }),
                        state,
                    ));
                }
                None => {
                    state.finished = true;
                    if let Some(event) = state.scanner.finish() {
                        state.pending.push_back(Ok(event));
                    }
                    let hit_limit = state.max_tokens.is_some_and(|max| state.tokens >= max);
                    state.pending.push_back(Ok(GenerationEvent::Info(GenerationInfo {
                        model: Some(state.adapter.clone()),
                        input_tokens: None,
                        output_tokens: Some(state.tokens),
                        stop_reason: Some(if hit_limit { "max_tokens" } else { "end_turn" }.into()),
                    })));
                }
            }
        }
    })
    .boxed()
}

impl<E: LocalEngine> std::fmt::Debug for LocalAdapter<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalAdapter")
            .field("engine", &self.engine.name())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
