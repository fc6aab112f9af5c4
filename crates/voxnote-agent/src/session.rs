//! Session orchestrator: the tool-calling loop.
//!
//! A [`Session`] drives one adapter through repeated rounds.  Each round
//! sends the running chat context to the adapter, drains its event stream,
//! and, when the model asked for tools, runs them in emission order and
//! feeds their output back.  The turn ends on the first round that requests
//! no tools.
//!
//! ```text
//!   seed context (instructions + prompt)
//!            │
//!            ▼
//!   ┌──> Generating ──> CollectingChunks ──┬── no calls ──> Done
//!   │                                      │
//!   └──────── ResolvingToolCalls <─────────┘
//! ```

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use futures::StreamExt;
use futures::stream::{self, BoxStream};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use voxnote_schema::{Schema, SchemaError, Value};

use crate::error::{AgentError, Result};
use crate::llm::adapter::Adapter;
use crate::llm::types::{
    ChatMessage, GenerationEvent, GenerationOptions, GenerationRequest, OutputFormat, Role,
};
use crate::tool::{Tool, ToolRegistry};
use crate::transcript::{Entry, Segment, ToolCall, Transcript};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// How much of the incoming transcript is replayed to the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    /// Instructions plus the most recent prompt only.  Suits backends that
    /// keep their own chat history.
    #[default]
    LatestPrompt,
    /// Every prompt, response and tool exchange in transcript order.
    Full,
}

/// Per-session settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// System instructions used when the transcript has no
    /// [`Entry::Instructions`].
    pub instructions: Option<String>,

    /// Maximum generation rounds per turn.  `None` means unbounded: a
    /// backend that keeps requesting tools keeps the turn alive.
    pub max_rounds: Option<u32>,

    pub history: HistoryMode,
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// The outcome of a completed turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionResponse {
    /// Assistant text across all rounds, concatenated.
    pub text: String,

    /// Entries to append to the caller's transcript: every `ToolCalls` and
    /// `ToolOutput` entry in round order, then one `Response`.
    pub entries: Vec<Entry>,

    /// Generation rounds performed.
    pub rounds: u32,
}

/// A completed structured turn.
#[derive(Debug, Clone)]
pub struct StructuredResponse<T> {
    /// The decoded application value.
    pub value: T,
    /// The validated dynamic value it was decoded from.
    pub raw: Value,
    pub response: SessionResponse,
}

/// One item of [`Session::stream_response`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseSnapshot {
    /// Text produced so far.
    pub text: String,
    /// Entries produced so far.
    pub entries: Vec<Entry>,
    pub is_final: bool,
}

/// What one round produced.
#[derive(Debug, Default)]
struct RoundOutput {
    text: String,
    calls: Vec<ToolCall>,
}

/// Everything a turn produced before its final `Response` entry.
struct TurnOutput {
    text: String,
    entries: Vec<Entry>,
    rounds: u32,
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// Drives conversations with one backend and a fixed tool set.
///
/// A session holds no per-turn state, so one instance can serve many turns,
/// including concurrently.
pub struct Session {
    adapter: Arc<dyn Adapter>,
    tools: ToolRegistry,
    config: SessionConfig,
}

impl Session {
    /// Create a session.  Duplicate tool names keep the first registration.
    pub fn new(adapter: Arc<dyn Adapter>, tools: impl IntoIterator<Item = Arc<dyn Tool>>) -> Self {
        Self {
            adapter,
            tools: tools.into_iter().collect(),
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn adapter_name(&self) -> &str {
        self.adapter.name()
    }

    /// Run one turn and return the assistant's text.
    ///
    /// A non-empty `prompt` is treated as a new [`Entry::Prompt`] following
    /// `transcript`.  When it is empty, the transcript's latest prompt is
    /// used.  The returned entries never include the prompt; the caller
    /// appends it alongside them.
    ///
    /// # Errors
    ///
    /// Any adapter, tool or parse failure aborts the turn; no partial text
    /// is returned.
    pub async fn respond(
        &self,
        transcript: &Transcript,
        prompt: &str,
        options: &GenerationOptions,
    ) -> Result<SessionResponse> {
        let turn = self.run(transcript, prompt, options, OutputFormat::Text).await?;
        let mut entries = turn.entries;
        entries.push(Entry::response(turn.text.as_str()));

        Ok(SessionResponse {
            text: turn.text,
            entries,
            rounds: turn.rounds,
        })
    }

    /// Run one turn whose final output must match `schema`, and decode it
    /// into `T`.
    ///
    /// # Errors
    ///
    /// [`AgentError::UnsupportedOutputType`] before any backend work when the
    /// adapter cannot produce structured output, [`AgentError::Schema`] when
    /// `schema` still contains references, [`AgentError::Value`] when the
    /// model's output does not parse or does not match.
    pub async fn respond_structured<T: DeserializeOwned>(
        &self,
        transcript: &Transcript,
        prompt: &str,
        schema: &Schema,
        options: &GenerationOptions,
    ) -> Result<StructuredResponse<T>> {
        if let Some(name) = schema.first_reference() {
            return Err(SchemaError::UnknownReference {
                name: name.to_owned(),
                path: "$".into(),
            }
            .into());
        }

        let turn = self
            .run(transcript, prompt, options, OutputFormat::Structured(schema.clone()))
            .await?;

        let raw = Value::parse_lenient(&turn.text)?;
        let value: T = raw.decode(schema)?;

        let mut entries = turn.entries;
        entries.push(Entry::Response {
            segments: vec![Segment::structured(raw.clone(), schema.clone())],
        });

        Ok(StructuredResponse {
            value,
            raw,
            response: SessionResponse {
                text: turn.text,
                entries,
                rounds: turn.rounds,
            },
        })
    }

    /// Streaming form of [`Session::respond`].
    ///
    /// Currently yields exactly one snapshot, the final one, once the turn
    /// completes.
    pub fn stream_response<'a>(
        &'a self,
        transcript: &'a Transcript,
        prompt: &'a str,
        options: &'a GenerationOptions,
    ) -> BoxStream<'a, Result<ResponseSnapshot>> {
        stream::once(async move {
            let response = self.respond(transcript, prompt, options).await?;
            Ok(ResponseSnapshot {
                text: response.text,
                entries: response.entries,
                is_final: true,
            })
        })
        .boxed()
    }

    // -- Loop ------------------------------------------------------------------

    async fn run(
        &self,
        transcript: &Transcript,
        prompt: &str,
        options: &GenerationOptions,
        output: OutputFormat,
    ) -> Result<TurnOutput> {
        if !self.adapter.supports_output(&output) {
            return Err(AgentError::UnsupportedOutputType {
                adapter: self.adapter.name().to_owned(),
                output: output.to_string(),
            });
        }
        transcript.validate()?;

        let tools = self.tools.specs();
        let mut messages = self.seed_context(transcript, prompt);
        let mut issued = HashSet::new();
        let mut text = String::new();
        let mut entries = Vec::new();
        let mut rounds = 0u32;

        tracing::info!(
            adapter = self.adapter.name(),
            tool_count = tools.len(),
            context = messages.len(),
            output = %output,
            "starting turn"
        );

        loop {
            if let Some(max) = self.config.max_rounds {
                if rounds >= max {
                    tracing::warn!(rounds, "round limit reached with tool calls pending");
                    return Err(AgentError::RoundLimitExceeded { rounds });
                }
            }
            rounds += 1;
            tracing::debug!(round = rounds, messages = messages.len(), "generation round start");

            let request = GenerationRequest {
                messages: messages.clone(),
                tools: tools.clone(),
                options: options.clone(),
                output: output.clone(),
            };
            let round = self.generate_round(request, &mut issued).await?;
            text.push_str(&round.text);

            if round.calls.is_empty() {
                break;
            }

            tracing::info!(
                round = rounds,
                tool_count = round.calls.len(),
                tools = ?round.calls.iter().map(|c| &c.tool_name).collect::<Vec<_>>(),
                "model requested tool calls"
            );

            let round_text = (!round.text.is_empty()).then_some(round.text);
            messages.push(ChatMessage::assistant_tool_calls(round_text, round.calls.clone()));
            entries.push(Entry::ToolCalls {
                calls: round.calls.clone(),
            });

            for call in round.calls {
                let segments = self.execute(&call).await?;
                messages.push(ChatMessage::tool_output(call.id.as_str(), segments.clone()));
                entries.push(Entry::ToolOutput {
                    id: call.id,
                    tool_name: call.tool_name,
                    segments,
                });
            }
        }

        tracing::info!(
            adapter = self.adapter.name(),
            rounds,
            tool_entries = entries.len(),
            chars = text.len(),
            "turn completed"
        );

        Ok(TurnOutput {
            text,
            entries,
            rounds,
        })
    }

    /// Build the initial chat context from the incoming transcript followed
    /// by the new prompt, if any.
    fn seed_context(&self, transcript: &Transcript, prompt: &str) -> Vec<ChatMessage> {
        let mut view = Cow::Borrowed(transcript);
        if !prompt.is_empty() {
            view.to_mut().append(Entry::prompt(prompt));
        }

        let mut messages = Vec::new();
        if let Some(segments) = view.instruction_segments(self.config.instructions.as_deref()) {
            messages.push(ChatMessage::new(Role::System, segments));
        }

        match self.config.history {
            HistoryMode::LatestPrompt => {
                messages.push(ChatMessage::new(Role::User, view.prompt_segments(prompt)));
            }
            HistoryMode::Full => {
                let mut saw_prompt = false;
                for entry in view.iter() {
                    match entry {
                        Entry::Instructions { .. } => {}
                        Entry::Prompt { segments } => {
                            saw_prompt = true;
                            messages.push(ChatMessage::new(Role::User, segments.clone()));
                        }
                        Entry::Response { segments } => {
                            messages.push(ChatMessage::new(Role::Assistant, segments.clone()));
                        }
                        Entry::ToolCalls { calls } => {
                            messages.push(ChatMessage::assistant_tool_calls(None, calls.clone()));
                        }
                        Entry::ToolOutput { id, segments, .. } => {
                            messages.push(ChatMessage::tool_output(id.as_str(), segments.clone()));
                        }
                    }
                }
                if !saw_prompt {
                    messages.push(ChatMessage::text(Role::User, prompt));
                }
            }
        }
        messages
    }

    /// Drain one adapter call, splitting text from tool calls.
    async fn generate_round(
        &self,
        request: GenerationRequest,
        issued: &mut HashSet<String>,
    ) -> Result<RoundOutput> {
        let mut events = self.adapter.generate(request).await?;
        let mut round = RoundOutput::default();

        while let Some(event) = events.next().await {
            match event? {
                GenerationEvent::TextChunk(chunk) => round.text.push_str(&chunk),
                GenerationEvent::ToolCallRequested {
                    id,
                    name,
                    arguments,
                } => round.calls.push(tool_call(id, name, &arguments, issued)?),
                GenerationEvent::Info(info) => {
                    tracing::debug!(
                        model = info.model.as_deref().unwrap_or("-"),
                        input_tokens = info.input_tokens,
                        output_tokens = info.output_tokens,
                        stop_reason = info.stop_reason.as_deref().unwrap_or("-"),
                        "generation info"
                    );
                }
            }
        }
        Ok(round)
    }

    /// Run one tool call.  Unknown tools and arguments that do not match the
    /// tool's input schema answer with a text segment so the model can see
    /// the failure and retry.
    async fn execute(&self, call: &ToolCall) -> Result<Vec<Segment>> {
        let Some(tool) = self.tools.get(&call.tool_name) else {
            tracing::warn!(tool = %call.tool_name, id = %call.id, "model requested an unknown tool");
            return Ok(vec![Segment::text(format!("Tool not found: {}", call.tool_name))]);
        };

        if let Err(err) = tool.input_schema().validate(&call.arguments) {
            tracing::warn!(tool = %call.tool_name, id = %call.id, error = %err, "tool arguments rejected");
            return Ok(vec![Segment::text(format!(
                "Invalid arguments for {}: {err}",
                call.tool_name
            ))]);
        }

        tracing::debug!(tool = %call.tool_name, id = %call.id, "executing tool");
        tool.call(call.arguments.clone())
            .await
            .map_err(|source| {
                tracing::warn!(tool = %call.tool_name, id = %call.id, error = %source, "tool execution failed");
                AgentError::ToolExecution {
                    tool_name: call.tool_name.clone(),
                    call_id: call.id.clone(),
                    source,
                }
            })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("adapter", &self.adapter.name())
            .field("tools", &self.tools)
            .field("config", &self.config)
            .finish()
    }
}

/// Turn a raw tool-call event into a [`ToolCall`] with a turn-unique id.
fn tool_call(
    id: Option<String>,
    name: String,
    arguments: &str,
    issued: &mut HashSet<String>,
) -> Result<ToolCall> {
    let arguments = if arguments.trim().is_empty() {
        Value::object()
    } else {
        Value::parse(arguments)?
    };

    let id = match id {
        Some(id) if !issued.contains(&id) => id,
        Some(id) => {
            let fresh = fresh_call_id();
            tracing::warn!(%id, %fresh, "backend reused a tool call id, assigning a new one");
            fresh
        }
        None => fresh_call_id(),
    };
    issued.insert(id.clone());

    Ok(ToolCall {
        id,
        tool_name: name,
        arguments,
    })
}

fn fresh_call_id() -> String {
    format!("call_{}", Uuid::now_v7().simple())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
