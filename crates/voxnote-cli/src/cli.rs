//! CLI argument definitions for voxnote.
//!
//! All `clap` structures live here so that `main.rs` stays focused on
//! dispatching subcommands.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// voxnote -- clean up voice transcripts with a language model.
#[derive(Parser)]
#[command(
    name = "voxnote",
    version,
    about = "voxnote -- clean up voice transcripts with a language model",
    long_about = "Sends a raw speech-to-text transcript to a configured model backend, \
                  lets the model call the built-in tools, and prints the cleaned text."
)]
pub struct Cli {
    /// Path to a TOML configuration file.
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    /// Default log level when RUST_LOG is unset.
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Clean up a transcript and print the result.
    Clean {
        /// Transcript file to read, or `-` for stdin.
        #[arg(default_value = "-")]
        input: String,

        /// Override the configured provider (anthropic, openai, openai_compatible).
        #[arg(long)]
        provider: Option<String>,

        /// Override the configured model.
        #[arg(long, short)]
        model: Option<String>,

        /// Replace the cleanup instructions.
        #[arg(long)]
        instructions: Option<String>,

        /// Stop after this many generation rounds.
        #[arg(long)]
        max_rounds: Option<u32>,

        /// Print the full response, including tool entries, as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the resolved configuration with secrets redacted.
    Config,
}
