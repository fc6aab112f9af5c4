//! Shared helper functions used across CLI subcommands.
//!
//! Includes tracing initialization, configuration resolution, input
//! reading, and the built-in tools offered to the model.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::info;
use tracing_subscriber::EnvFilter;
use voxnote_agent::{AgentConfig, Segment, Tool, ToolError};
use voxnote_schema::{Field, ObjectSchema, Schema, Value};

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber with the given default log level.
/// Logs go to stderr so stdout carries only the cleaned text.
pub fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .compact()
        .init();
}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Cleanup instructions used when neither the config file nor the command
/// line provides any.
pub const DEFAULT_INSTRUCTIONS: &str = "You clean up raw speech-to-text transcripts. \
Fix punctuation, capitalization and obvious transcription errors, remove filler words \
and false starts, and split the text into paragraphs. Keep the speaker's wording and \
meaning; do not summarize or add content. Reply with the cleaned text only. \
Use the current_time tool if the transcript refers to relative dates such as \
\"tomorrow\" or \"next week\" and you need today's date to resolve them.";

/// Load the configuration file (if any), then overlay the environment.
pub fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    let mut config = match path {
        Some(path) => AgentConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            info!("no config file given, using defaults");
            AgentConfig::default()
        }
    };
    config
        .apply_env()
        .context("invalid configuration in environment")?;

    if config.session.instructions.is_none() {
        config.session.instructions = Some(DEFAULT_INSTRUCTIONS.to_owned());
    }
    Ok(config)
}

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

/// Read the transcript from a file, or from stdin when `input` is `-`.
pub fn read_input(input: &str) -> Result<String> {
    let text = if input == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read transcript from stdin")?;
        buf
    } else {
        std::fs::read_to_string(input).with_context(|| format!("failed to read {input}"))?
    };

    let text = text.trim().to_owned();
    anyhow::ensure!(!text.is_empty(), "transcript is empty");
    Ok(text)
}

// ---------------------------------------------------------------------------
// Built-in tools
// ---------------------------------------------------------------------------

/// Reports the current date and time.
pub struct CurrentTimeTool;

#[async_trait]
impl Tool for CurrentTimeTool {
    fn name(&self) -> &str {
        "current_time"
    }

    fn description(&self) -> &str {
        "Returns the current date, time and weekday."
    }

    fn input_schema(&self) -> Schema {
        ObjectSchema::new("CurrentTimeArgs")
            .with_field(
                Field::optional("utc", Schema::Boolean)
                    .with_guidance("Report UTC instead of the local time zone."),
            )
            .map(Schema::from)
            .unwrap_or_else(|_| ObjectSchema::new("CurrentTimeArgs").into())
    }

    async fn call(&self, arguments: Value) -> Result<Vec<Segment>, ToolError> {
        let utc = match arguments.get("utc") {
            None | Some(Value::Null) => false,
            Some(value) => value.as_bool().ok_or_else(|| ToolError::InvalidArguments {
                reason: format!("`utc` must be a boolean, got {}", value.kind()),
            })?,
        };

        const FORMAT: &str = "%Y-%m-%d %H:%M:%S %Z (%A)";
        let now = if utc {
            chrono::Utc::now().format(FORMAT).to_string()
        } else {
            chrono::Local::now().format(FORMAT).to_string()
        };
        Ok(vec![Segment::text(now)])
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
