//! Tool abstraction and per-session registry.
//!
//! A [`Tool`] is a named capability with a declared input [`Schema`].  The
//! session exposes every registered tool to the model as a [`ToolSpec`] and
//! runs the ones the model asks for.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use voxnote_schema::{Schema, Value};

use crate::error::ToolError;
use crate::transcript::Segment;

// ---------------------------------------------------------------------------
// Tool trait
// ---------------------------------------------------------------------------

/// A capability the model may invoke.
///
/// Tools are shared across rounds behind an `Arc` and must not rely on being
/// called from a particular task.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique name the model uses to call the tool.
    fn name(&self) -> &str;

    /// Human-readable description shown to the model.
    fn description(&self) -> &str;

    /// Shape of the arguments the tool accepts.  Must be free of unresolved
    /// references.
    fn input_schema(&self) -> Schema;

    /// Run the tool.
    async fn call(&self, arguments: Value) -> Result<Vec<Segment>, ToolError>;

    /// The definition sent to backends.
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.name().to_owned(),
            description: self.description().to_owned(),
            parameters: self.input_schema().to_json_schema(),
        }
    }
}

/// A tool definition in the JSON Schema interchange form every adapter
/// derives its native function-calling format from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON Schema of the input object.
    pub parameters: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Name-keyed tool set, fixed once the session is built.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool.  The first registration of a name wins; later ones
    /// are ignored and `false` is returned.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> bool {
        let name = tool.name().to_owned();
        if self.by_name.contains_key(&name) {
            tracing::warn!(tool = %name, "duplicate tool registration ignored");
            return false;
        }
        self.by_name.insert(name, self.tools.len());
        self.tools.push(tool);
        true
    }

    pub fn get(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.by_name.get(name).map(|&index| &self.tools[index])
    }

    /// Specs for every registered tool, in registration order.
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| t.spec()).collect()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|t| t.name())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl FromIterator<Arc<dyn Tool>> for ToolRegistry {
    fn from_iter<I: IntoIterator<Item = Arc<dyn Tool>>>(iter: I) -> Self {
        let mut registry = Self::new();
        for tool in iter {
            registry.register(tool);
        }
        registry
    }
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
