//! Integration tests for the session loop.
//!
//! A scripted adapter replays a fixed list of rounds and records every
//! request it receives, so each test can check both what the session
//! returned and what it sent.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde::Deserialize;
use voxnote_agent::{
    Adapter, AgentError, ChatMessage, Entry, EventStream, GenerationEvent, GenerationInfo,
    GenerationOptions, GenerationRequest, HistoryMode, OutputFormat, Role, Segment, Session,
    SessionConfig, Tool, ToolError, Transcript,
};
use voxnote_schema::{Field, ObjectSchema, Schema, Value};

// ═══════════════════════════════════════════════════════════════════════
//  Fixtures
// ═══════════════════════════════════════════════════════════════════════

struct ScriptedAdapter {
    rounds: Mutex<VecDeque<Vec<GenerationEvent>>>,
    requests: Mutex<Vec<GenerationRequest>>,
    structured: bool,
    repeat_last: bool,
}

impl ScriptedAdapter {
    fn new(rounds: Vec<Vec<GenerationEvent>>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
            requests: Mutex::new(Vec::new()),
            structured: true,
            repeat_last: false,
        })
    }

    fn text_only(rounds: Vec<Vec<GenerationEvent>>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(rounds.into()),
            requests: Mutex::new(Vec::new()),
            structured: false,
            repeat_last: false,
        })
    }

    /// Replays the same round forever.
    fn looping(round: Vec<GenerationEvent>) -> Arc<Self> {
        Arc::new(Self {
            rounds: Mutex::new(vec![round].into()),
            requests: Mutex::new(Vec::new()),
            structured: false,
            repeat_last: true,
        })
    }

    fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Adapter for ScriptedAdapter {
    fn name(&self) -> &str {
        "scripted"
    }

    fn supports_output(&self, output: &OutputFormat) -> bool {
        self.structured || matches!(output, OutputFormat::Text)
    }

    async fn generate(&self, request: GenerationRequest) -> voxnote_agent::Result<EventStream> {
        self.requests.lock().unwrap().push(request);
        let mut rounds = self.rounds.lock().unwrap();
        let events = if self.repeat_last {
            rounds.front().cloned().unwrap_or_default()
        } else {
            rounds.pop_front().unwrap_or_default()
        };
        Ok(stream::iter(events.into_iter().map(Ok)).boxed())
    }
}

fn text(chunk: &str) -> GenerationEvent {
    GenerationEvent::TextChunk(chunk.into())
}

fn call(id: &str, name: &str, arguments: &str) -> GenerationEvent {
    GenerationEvent::ToolCallRequested {
        id: Some(id.into()),
        name: name.into(),
        arguments: arguments.into(),
    }
}

fn info() -> GenerationEvent {
    GenerationEvent::Info(GenerationInfo {
        model: Some("stub".into()),
        stop_reason: Some("end_turn".into()),
        ..Default::default()
    })
}

/// Echoes its `zone` argument back.
struct ClockTool;

#[async_trait]
impl Tool for ClockTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Current time in a zone"
    }

    fn input_schema(&self) -> Schema {
        ObjectSchema::from_fields("ClockArgs", [Field::optional("zone", Schema::String)])
            .unwrap()
            .into()
    }

    async fn call(&self, arguments: Value) -> Result<Vec<Segment>, ToolError> {
        let zone = arguments.get("zone").and_then(Value::as_str).unwrap_or("UTC");
        Ok(vec![Segment::text(format!("12:00 {zone}"))])
    }
}

/// Appends every call to a shared log, to observe execution order.
struct LogTool {
    name: &'static str,
    log: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tool for LogTool {
    fn name(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        "Records that it ran"
    }

    fn input_schema(&self) -> Schema {
        ObjectSchema::new("Empty").into()
    }

    async fn call(&self, _arguments: Value) -> Result<Vec<Segment>, ToolError> {
        self.log.lock().unwrap().push(self.name.to_owned());
        Ok(vec![Segment::text("ok")])
    }
}

struct BrokenTool;

#[async_trait]
impl Tool for BrokenTool {
    fn name(&self) -> &str {
        "vault_write"
    }

    fn description(&self) -> &str {
        "Always fails"
    }

    fn input_schema(&self) -> Schema {
        ObjectSchema::new("Empty").into()
    }

    async fn call(&self, _arguments: Value) -> Result<Vec<Segment>, ToolError> {
        Err(ToolError::failed("disk full"))
    }
}

fn session(adapter: Arc<ScriptedAdapter>, tools: Vec<Arc<dyn Tool>>) -> Session {
    Session::new(adapter, tools)
}

// ═══════════════════════════════════════════════════════════════════════
//  Single-round turns
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn terse_arithmetic_scenario() {
    let adapter = ScriptedAdapter::new(vec![vec![text("4"), info()]]);
    let session = session(adapter.clone(), Vec::new());
    let transcript =
        Transcript::from_entries([Entry::instructions("You are terse."), Entry::prompt("2+2?")]);

    let response = session
        .respond(&transcript, "", &GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(response.text, "4");
    assert_eq!(response.entries, vec![Entry::response("4")]);
    assert_eq!(response.rounds, 1);

    let requests = adapter.requests();
    let messages = &requests[0].messages;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0], ChatMessage::text(Role::System, "You are terse."));
    assert_eq!(messages[1], ChatMessage::text(Role::User, "2+2?"));
}

#[tokio::test]
async fn no_tool_turn_is_one_round() {
    let adapter = ScriptedAdapter::new(vec![vec![text("Hello"), text(", "), text("world")]]);
    let session = session(adapter.clone(), Vec::new());

    let response = session
        .respond(&Transcript::new(), "hi", &GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(response.text, "Hello, world");
    assert_eq!(response.rounds, 1);
    assert_eq!(response.entries.len(), 1);
    assert!(matches!(response.entries[0], Entry::Response { .. }));
    assert_eq!(adapter.requests().len(), 1);
}

#[tokio::test]
async fn fallback_prompt_and_session_instructions() {
    let adapter = ScriptedAdapter::new(vec![vec![text("done")]]);
    let session = session(adapter.clone(), Vec::new()).with_config(SessionConfig {
        instructions: Some("Clean up the transcript.".into()),
        ..Default::default()
    });

    session
        .respond(&Transcript::new(), "um so the meeting is uh tuesday", &GenerationOptions::default())
        .await
        .unwrap();

    let messages = adapter.requests()[0].messages.clone();
    assert_eq!(messages[0].role, Role::System);
    assert_eq!(messages[0].content_text(), "Clean up the transcript.");
    assert_eq!(messages[1].content_text(), "um so the meeting is uh tuesday");
}

#[tokio::test]
async fn latest_prompt_wins() {
    let adapter = ScriptedAdapter::new(vec![vec![text("ok")]]);
    let session = session(adapter.clone(), Vec::new());
    let transcript = Transcript::from_entries([
        Entry::prompt("first"),
        Entry::response("earlier answer"),
        Entry::prompt("second"),
    ]);

    session
        .respond(&transcript, "", &GenerationOptions::default())
        .await
        .unwrap();

    let messages = adapter.requests()[0].messages.clone();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content_text(), "second");
}

#[tokio::test]
async fn second_turn_sends_the_new_prompt() {
    let adapter = ScriptedAdapter::new(vec![vec![text("one")], vec![text("two")]]);
    let session = session(adapter.clone(), Vec::new());
    let options = GenerationOptions::default();

    let mut transcript = Transcript::new();
    let first = session.respond(&transcript, "first question", &options).await.unwrap();
    transcript.append(Entry::prompt("first question"));
    transcript.extend(first.entries);

    let second = session.respond(&transcript, "second question", &options).await.unwrap();
    assert_eq!(second.text, "two");
    assert_eq!(second.entries, vec![Entry::response("two")]);

    let requests = adapter.requests();
    assert_eq!(requests[0].messages[0].content_text(), "first question");
    assert_eq!(requests[1].messages.len(), 1);
    assert_eq!(requests[1].messages[0].content_text(), "second question");
}

#[tokio::test]
async fn full_history_appends_the_new_prompt() {
    let adapter = ScriptedAdapter::new(vec![vec![text("ok")]]);
    let session = session(adapter.clone(), Vec::new()).with_config(SessionConfig {
        history: HistoryMode::Full,
        ..Default::default()
    });
    let transcript =
        Transcript::from_entries([Entry::prompt("first question"), Entry::response("one")]);

    session
        .respond(&transcript, "second question", &GenerationOptions::default())
        .await
        .unwrap();

    let messages = adapter.requests()[0].messages.clone();
    let texts: Vec<String> = messages.iter().map(ChatMessage::content_text).collect();
    assert_eq!(texts, ["first question", "one", "second question"]);
    assert_eq!(messages[2].role, Role::User);
}

#[tokio::test]
async fn full_history_replays_transcript() {
    let adapter = ScriptedAdapter::new(vec![vec![text("ok")]]);
    let session = session(adapter.clone(), Vec::new()).with_config(SessionConfig {
        history: HistoryMode::Full,
        ..Default::default()
    });
    let transcript = Transcript::from_entries([
        Entry::instructions("Be brief."),
        Entry::prompt("first"),
        Entry::response("earlier answer"),
        Entry::prompt("second"),
    ]);

    session
        .respond(&transcript, "", &GenerationOptions::default())
        .await
        .unwrap();

    let roles: Vec<Role> = adapter.requests()[0].messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, [Role::System, Role::User, Role::Assistant, Role::User]);
}

#[tokio::test]
async fn options_pass_through_unchanged() {
    let adapter = ScriptedAdapter::new(vec![vec![text("ok")]]);
    let session = session(adapter.clone(), vec![Arc::new(ClockTool) as Arc<dyn Tool>]);
    let options = GenerationOptions::default()
        .with_max_tokens(128)
        .with_temperature(0.6);

    session.respond(&Transcript::new(), "hi", &options).await.unwrap();

    let request = &adapter.requests()[0];
    assert_eq!(request.options, options);
    assert_eq!(request.tools.len(), 1);
    assert_eq!(request.tools[0].name, "current_time");
    assert_eq!(request.tools[0].parameters["type"], "object");
}

// ═══════════════════════════════════════════════════════════════════════
//  Tool rounds
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn tool_round_composition() {
    let adapter = ScriptedAdapter::new(vec![
        vec![call("call_a", "current_time", r#"{"zone":"CET"}"#), info()],
        vec![text("It is noon."), info()],
    ]);
    let session = session(adapter.clone(), vec![Arc::new(ClockTool) as Arc<dyn Tool>]);

    let response = session
        .respond(&Transcript::new(), "What time is it?", &GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(response.rounds, 2);
    assert_eq!(response.text, "It is noon.");
    assert_eq!(response.entries.len(), 3);

    match &response.entries[0] {
        Entry::ToolCalls { calls } => {
            assert_eq!(calls.len(), 1);
            assert_eq!(calls[0].id, "call_a");
            assert_eq!(calls[0].arguments, Value::object().with("zone", "CET"));
        }
        other => panic!("expected tool calls, got {other:?}"),
    }
    assert_eq!(
        response.entries[1],
        Entry::ToolOutput {
            id: "call_a".into(),
            tool_name: "current_time".into(),
            segments: vec![Segment::text("12:00 CET")],
        }
    );
    assert_eq!(response.entries[2], Entry::response("It is noon."));

    // The second round sees the call and its output.
    let second = &adapter.requests()[1].messages;
    assert_eq!(second.len(), 3);
    assert_eq!(second[1].role, Role::Assistant);
    assert_eq!(second[1].tool_calls.len(), 1);
    assert_eq!(second[2].role, Role::Tool);
    assert_eq!(second[2].tool_call_id.as_deref(), Some("call_a"));
    assert_eq!(second[2].content_text(), "12:00 CET");

    // The returned entries form a valid transcript continuation.
    let mut transcript = Transcript::from_entries([Entry::prompt("What time is it?")]);
    transcript.extend(response.entries);
    assert!(transcript.validate().is_ok());
}

#[tokio::test]
async fn unknown_tool_is_reported_to_the_model() {
    let adapter = ScriptedAdapter::new(vec![
        vec![call("call_x", "teleport", "{}")],
        vec![text("I cannot do that.")],
    ]);
    let session = session(adapter.clone(), Vec::new());

    let response = session
        .respond(&Transcript::new(), "go", &GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(response.entries[1].text(), "Tool not found: teleport");
    assert_eq!(response.text, "I cannot do that.");
    assert_eq!(
        adapter.requests()[1].messages[2].content_text(),
        "Tool not found: teleport"
    );
}

#[tokio::test]
async fn mismatched_arguments_are_reported_to_the_model() {
    let adapter = ScriptedAdapter::new(vec![
        vec![call("call_z", "current_time", r#"{"zone": 5}"#)],
        vec![call("call_y", "current_time", r#"{"zone": "CET"}"#)],
        vec![text("It is noon.")],
    ]);
    let session = session(adapter.clone(), vec![Arc::new(ClockTool) as Arc<dyn Tool>]);

    let response = session
        .respond(&Transcript::new(), "time?", &GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(response.rounds, 3);
    assert_eq!(
        response.entries[1].text(),
        "Invalid arguments for current_time: schema mismatch at `$.zone`: expected string, found number"
    );
    assert_eq!(response.entries[3].text(), "12:00 CET");
    assert_eq!(
        adapter.requests()[1].messages[2].content_text(),
        response.entries[1].text()
    );
}

#[tokio::test]
async fn tools_run_in_emission_order() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let tools: Vec<Arc<dyn Tool>> = vec![
        Arc::new(LogTool { name: "first", log: log.clone() }),
        Arc::new(LogTool { name: "second", log: log.clone() }),
    ];
    let adapter = ScriptedAdapter::new(vec![
        vec![call("1", "second", "{}"), call("2", "first", "{}"), call("3", "second", "")],
        vec![text("done")],
    ]);

    let response = session(adapter, tools)
        .respond(&Transcript::new(), "go", &GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(*log.lock().unwrap(), ["second", "first", "second"]);
    // One ToolCalls entry, three outputs, one response.
    assert_eq!(response.entries.len(), 5);
}

#[tokio::test]
async fn text_across_rounds_is_concatenated() {
    let adapter = ScriptedAdapter::new(vec![
        vec![text("Checking the clock. "), call("c1", "current_time", "")],
        vec![text("It is noon.")],
    ]);
    let session = session(adapter.clone(), vec![Arc::new(ClockTool) as Arc<dyn Tool>]);

    let response = session
        .respond(&Transcript::new(), "time?", &GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(response.text, "Checking the clock. It is noon.");
    let assistant = &adapter.requests()[1].messages[1];
    assert_eq!(assistant.content_text(), "Checking the clock. ");
}

#[tokio::test]
async fn missing_call_ids_are_filled_in() {
    let adapter = ScriptedAdapter::new(vec![
        vec![GenerationEvent::ToolCallRequested {
            id: None,
            name: "current_time".into(),
            arguments: String::new(),
        }],
        vec![text("noon")],
    ]);
    let session = session(adapter, vec![Arc::new(ClockTool) as Arc<dyn Tool>]);

    let response = session
        .respond(&Transcript::new(), "time?", &GenerationOptions::default())
        .await
        .unwrap();

    let Entry::ToolCalls { calls } = &response.entries[0] else {
        panic!("expected tool calls");
    };
    let Entry::ToolOutput { id, .. } = &response.entries[1] else {
        panic!("expected tool output");
    };
    assert!(calls[0].id.starts_with("call_"));
    assert_eq!(&calls[0].id, id);
}

// ═══════════════════════════════════════════════════════════════════════
//  Failures
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn tool_failure_aborts_the_turn() {
    let adapter = ScriptedAdapter::new(vec![
        vec![call("call_w", "vault_write", "{}")],
        vec![text("never reached")],
    ]);
    let session = session(adapter.clone(), vec![Arc::new(BrokenTool) as Arc<dyn Tool>]);

    let err = session
        .respond(&Transcript::new(), "save", &GenerationOptions::default())
        .await
        .unwrap_err();

    match err {
        AgentError::ToolExecution {
            tool_name,
            call_id,
            source,
        } => {
            assert_eq!(tool_name, "vault_write");
            assert_eq!(call_id, "call_w");
            assert_eq!(source.to_string(), "disk full");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(adapter.requests().len(), 1);
}

#[tokio::test]
async fn malformed_tool_arguments_are_value_errors() {
    let adapter = ScriptedAdapter::new(vec![vec![call("c", "current_time", "{\"zone\": ")]]);
    let session = session(adapter, vec![Arc::new(ClockTool) as Arc<dyn Tool>]);

    let err = session
        .respond(&Transcript::new(), "time?", &GenerationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Value(_)));
}

#[tokio::test]
async fn round_limit_stops_a_looping_backend() {
    let adapter = ScriptedAdapter::looping(vec![call("again", "current_time", "{}")]);
    let session = session(adapter.clone(), vec![Arc::new(ClockTool) as Arc<dyn Tool>])
        .with_config(SessionConfig {
            max_rounds: Some(3),
            ..Default::default()
        });

    let err = session
        .respond(&Transcript::new(), "loop", &GenerationOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::RoundLimitExceeded { rounds: 3 }));
    assert_eq!(adapter.requests().len(), 3);
}

#[tokio::test]
async fn backend_errors_propagate() {
    struct FailingAdapter;

    #[async_trait]
    impl Adapter for FailingAdapter {
        fn name(&self) -> &str {
            "failing"
        }

        fn supports_output(&self, _output: &OutputFormat) -> bool {
            true
        }

        async fn generate(&self, _request: GenerationRequest) -> voxnote_agent::Result<EventStream> {
            let events = vec![
                Ok(GenerationEvent::TextChunk("partial".into())),
                Err(AgentError::Backend {
                    adapter: "failing".into(),
                    reason: "connection reset".into(),
                }),
            ];
            Ok(stream::iter(events).boxed())
        }
    }

    let session = Session::new(Arc::new(FailingAdapter), Vec::new());
    let err = session
        .respond(&Transcript::new(), "hi", &GenerationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Backend { ref reason, .. } if reason == "connection reset"));
}

#[tokio::test]
async fn invalid_transcript_is_rejected() {
    let adapter = ScriptedAdapter::new(vec![vec![text("unused")]]);
    let session = session(adapter.clone(), Vec::new());
    let transcript = Transcript::from_entries([
        Entry::prompt("hi"),
        Entry::ToolOutput {
            id: "ghost".into(),
            tool_name: "current_time".into(),
            segments: vec![Segment::text("12:00")],
        },
    ]);

    let err = session
        .respond(&transcript, "", &GenerationOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::Transcript(_)));
    assert!(adapter.requests().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
//  Structured output
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize, PartialEq)]
struct Note {
    title: String,
    body: String,
}

fn note_schema() -> Schema {
    ObjectSchema::from_fields(
        "Note",
        [
            Field::required("title", Schema::String),
            Field::required("body", Schema::String),
        ],
    )
    .unwrap()
    .into()
}

#[tokio::test]
async fn structured_turn_decodes_value() {
    let adapter = ScriptedAdapter::new(vec![vec![
        text(r#"{"title": "Standup", "#),
        text(r#""body": "Ship on Tuesday."}"#),
    ]]);
    let session = session(adapter.clone(), Vec::new());
    let schema = note_schema();

    let response = session
        .respond_structured::<Note>(&Transcript::new(), "notes", &schema, &GenerationOptions::default())
        .await
        .unwrap();

    assert_eq!(
        response.value,
        Note {
            title: "Standup".into(),
            body: "Ship on Tuesday.".into(),
        }
    );
    assert_eq!(
        response.response.entries,
        vec![Entry::Response {
            segments: vec![Segment::structured(response.raw.clone(), schema.clone())],
        }]
    );
    assert_eq!(adapter.requests()[0].output, OutputFormat::Structured(schema));
}

#[tokio::test]
async fn structured_mismatch_names_the_field() {
    let adapter = ScriptedAdapter::new(vec![vec![text(r#"{"title": "Standup", "body": 7}"#)]]);
    let session = session(adapter, Vec::new());

    let err = session
        .respond_structured::<Note>(&Transcript::new(), "notes", &note_schema(), &GenerationOptions::default())
        .await
        .unwrap_err();

    match err {
        AgentError::Value(voxnote_schema::ValueError::SchemaMismatch { path, .. }) => {
            assert_eq!(path, "$.body");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn unsupported_output_rejected_before_generation() {
    let adapter = ScriptedAdapter::text_only(vec![vec![text("{}")]]);
    let session = session(adapter.clone(), Vec::new());

    let err = session
        .respond_structured::<Note>(&Transcript::new(), "notes", &note_schema(), &GenerationOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::UnsupportedOutputType { .. }));
    assert!(adapter.requests().is_empty());
}

#[tokio::test]
async fn unresolved_schema_reference_is_rejected() {
    let adapter = ScriptedAdapter::new(vec![vec![text("{}")]]);
    let session = session(adapter.clone(), Vec::new());
    let schema: Schema = ObjectSchema::from_fields(
        "Outline",
        [Field::optional("child", Schema::reference("Outline"))],
    )
    .unwrap()
    .into();

    let err = session
        .respond_structured::<serde_json::Value>(&Transcript::new(), "x", &schema, &GenerationOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::Schema(_)));
    assert!(adapter.requests().is_empty());
}

// ═══════════════════════════════════════════════════════════════════════
//  Streaming
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn stream_yields_one_final_snapshot() {
    let adapter = ScriptedAdapter::new(vec![vec![text("4")]]);
    let session = session(adapter, Vec::new());
    let transcript = Transcript::new();
    let options = GenerationOptions::default();

    let snapshots: Vec<_> = session
        .stream_response(&transcript, "2+2?", &options)
        .collect()
        .await;

    assert_eq!(snapshots.len(), 1);
    let snapshot = snapshots.into_iter().next().unwrap().unwrap();
    assert!(snapshot.is_final);
    assert_eq!(snapshot.text, "4");
    assert_eq!(snapshot.entries, vec![Entry::response("4")]);
}
