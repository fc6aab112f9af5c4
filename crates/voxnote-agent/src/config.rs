//! File and environment configuration.
//!
//! An [`AgentConfig`] is read from a TOML file with three sections:
//!
//! ```toml
//! [backend]
//! provider = "anthropic"          # anthropic | openai | openai_compatible
//! model = "claude-sonnet-4-20250514"
//! # base_url = "http://localhost:11434/v1"
//! # api_key = "..."               # prefer ANTHROPIC_API_KEY / OPENAI_API_KEY
//! max_tokens = 4096
//!
//! [session]
//! instructions = "Clean up this voice transcript."
//! max_rounds = 8
//! history = "latest_prompt"       # latest_prompt | full
//!
//! [generation]
//! temperature = 0.3
//! ```
//!
//! Environment variables overlay the file; see [`AgentConfig::apply_env`].

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{AgentError, Result};
use crate::llm::client::{DEFAULT_MAX_TOKENS, HttpAdapter, HttpAdapterConfig, Provider};
use crate::llm::types::GenerationOptions;
use crate::session::SessionConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub backend: BackendConfig,
    pub session: SessionConfig,
    pub generation: GenerationOptions,
}

/// Which backend to talk to and how.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub provider: Provider,
    /// Model identifier.  Empty selects the provider's default.
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub max_tokens: u32,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: String::new(),
            base_url: None,
            api_key: None,
            max_tokens: DEFAULT_MAX_TOKENS,
        }
    }
}

impl BackendConfig {
    /// The configured model, or the provider's default.
    pub fn model_or_default(&self) -> &str {
        if !self.model.is_empty() {
            return &self.model;
        }
        match self.provider {
            Provider::Anthropic => "claude-sonnet-4-20250514",
            Provider::OpenAi => "gpt-4o",
            Provider::OpenAiCompatible => "llama3.1",
        }
    }

    pub fn base_url_or_default(&self) -> &str {
        self.base_url
            .as_deref()
            .unwrap_or_else(|| self.provider.default_base_url())
    }
}

// Keys never reach logs.
impl fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendConfig")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("max_tokens", &self.max_tokens)
            .finish()
    }
}

impl AgentConfig {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// [`AgentError::Config`] when the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| AgentError::Config {
            reason: format!("failed to read config file {}: {e}", path.display()),
        })?;
        let config = Self::from_toml_str(&content)?;
        tracing::info!(path = %path.display(), provider = %config.backend.provider, "configuration loaded");
        Ok(config)
    }

    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| AgentError::Config {
            reason: format!("failed to parse TOML config: {e}"),
        })
    }

    /// Overlay settings from the process environment.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_with(|name| std::env::var(name).ok())
    }

    /// Overlay settings read through `lookup`.  Empty values are ignored.
    ///
    /// | Variable | Setting |
    /// |---|---|
    /// | `VOXNOTE_PROVIDER` | `backend.provider` |
    /// | `VOXNOTE_MODEL` | `backend.model` |
    /// | `VOXNOTE_BASE_URL` | `backend.base_url` |
    /// | `VOXNOTE_MAX_ROUNDS` | `session.max_rounds` |
    /// | `ANTHROPIC_API_KEY` / `OPENAI_API_KEY` | `backend.api_key`, per provider, when the file sets none |
    pub fn apply_env_with(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(provider) = var("VOXNOTE_PROVIDER") {
            self.backend.provider = provider.parse()?;
        }
        if let Some(model) = var("VOXNOTE_MODEL") {
            self.backend.model = model;
        }
        if let Some(base_url) = var("VOXNOTE_BASE_URL") {
            self.backend.base_url = Some(base_url);
        }
        if let Some(rounds) = var("VOXNOTE_MAX_ROUNDS") {
            let rounds = rounds.trim().parse::<u32>().map_err(|e| AgentError::Config {
                reason: format!("VOXNOTE_MAX_ROUNDS must be a non-negative integer: {e}"),
            })?;
            self.session.max_rounds = Some(rounds);
        }

        if self.backend.api_key.is_none() {
            let key_var = match self.backend.provider {
                Provider::Anthropic => "ANTHROPIC_API_KEY",
                Provider::OpenAi | Provider::OpenAiCompatible => "OPENAI_API_KEY",
            };
            self.backend.api_key = var(key_var);
        }
        Ok(())
    }

    /// Build the cloud adapter this configuration describes.
    ///
    /// # Errors
    ///
    /// [`AgentError::MissingApiKey`] when the provider needs a key and none
    /// was configured.
    pub fn build_adapter(&self) -> Result<HttpAdapter> {
        let backend = &self.backend;
        HttpAdapter::new(HttpAdapterConfig {
            provider: backend.provider,
            api_key: backend.api_key.clone().unwrap_or_default(),
            base_url: backend.base_url_or_default().to_owned(),
            model: backend.model_or_default().to_owned(),
            max_tokens: backend.max_tokens,
        })
    }

    /// TOML rendering with the API key masked, for display.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.backend.api_key.is_some() {
            shown.backend.api_key = Some("<redacted>".into());
        }
        toml::to_string_pretty(&shown).map_err(|e| AgentError::Config {
            reason: format!("failed to render config: {e}"),
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
