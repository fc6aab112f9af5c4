//! CLI entry point for voxnote.
//!
//! This binary provides the `voxnote` command: `clean` runs a transcript
//! through a cleanup session, `config` shows the resolved configuration.

mod cli;
mod helpers;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use voxnote_agent::{Session, Tool, Transcript};

use crate::cli::{Cli, Commands};
use crate::helpers::{CurrentTimeTool, init_tracing, load_config, read_input};

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Pick up API keys from a local .env if present.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    match cli.command {
        Commands::Clean {
            input,
            provider,
            model,
            instructions,
            max_rounds,
            json,
        } => {
            let overrides = CleanOverrides {
                provider,
                model,
                instructions,
                max_rounds,
            };
            cmd_clean(cli.config.as_deref(), &input, overrides, json).await
        }
        Commands::Config => cmd_config(cli.config.as_deref()),
    }
}

// ---------------------------------------------------------------------------
// Subcommand: clean
// ---------------------------------------------------------------------------

struct CleanOverrides {
    provider: Option<String>,
    model: Option<String>,
    instructions: Option<String>,
    max_rounds: Option<u32>,
}

async fn cmd_clean(
    config_path: Option<&std::path::Path>,
    input: &str,
    overrides: CleanOverrides,
    json: bool,
) -> Result<()> {
    let mut config = load_config(config_path)?;
    if let Some(provider) = overrides.provider {
        config.backend.provider = provider.parse().context("invalid --provider")?;
    }
    if let Some(model) = overrides.model {
        config.backend.model = model;
    }
    if let Some(instructions) = overrides.instructions {
        config.session.instructions = Some(instructions);
    }
    if overrides.max_rounds.is_some() {
        config.session.max_rounds = overrides.max_rounds;
    }

    let transcript_text = read_input(input)?;
    let adapter = config
        .build_adapter()
        .context("failed to set up the model backend")?;

    info!(
        provider = %config.backend.provider,
        model = config.backend.model_or_default(),
        chars = transcript_text.len(),
        "cleaning transcript"
    );

    let tools: Vec<Arc<dyn Tool>> = vec![Arc::new(CurrentTimeTool)];
    let session = Session::new(Arc::new(adapter), tools).with_config(config.session.clone());

    let response = session
        .respond(&Transcript::new(), &transcript_text, &config.generation)
        .await
        .context("cleanup session failed")?;

    if json {
        let rendered =
            serde_json::to_string_pretty(&response).context("failed to render response")?;
        println!("{rendered}");
    } else {
        println!("{}", response.text.trim());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Subcommand: config
// ---------------------------------------------------------------------------

fn cmd_config(config_path: Option<&std::path::Path>) -> Result<()> {
    let config = load_config(config_path)?;
    print!("{}", config.to_redacted_toml()?);
    Ok(())
}
