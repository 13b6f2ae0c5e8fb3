//! Host-side tools callable from guest code.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use thiserror::Error;

use crate::error::Result;
use crate::sandbox::state::validate_identifier;
use crate::sandbox::value::Value;

/// Error returned by a tool. It is raised in the guest as `ToolError`.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct ToolError {
    message: String,
}

impl ToolError {
    /// Create a tool error with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The error message shown to guest code.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<anyhow::Error> for ToolError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(format!("{err:#}"))
    }
}

/// Arguments of one guest-side tool invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolCall {
    /// Positional arguments.
    pub args: Vec<Value>,
    /// Keyword arguments.
    pub kwargs: BTreeMap<String, Value>,
}

impl ToolCall {
    /// Get a positional argument.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// Get a keyword argument.
    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Get an argument by keyword, falling back to its position.
    pub fn param(&self, name: &str, index: usize) -> Option<&Value> {
        self.kwarg(name).or_else(|| self.arg(index))
    }
}

/// A host callable exposed to the guest under a name.
pub trait Tool: Send + Sync {
    /// Invoke the tool.
    fn call(&self, call: &ToolCall) -> std::result::Result<Value, ToolError>;
}

impl<F> Tool for F
where
    F: Fn(&ToolCall) -> std::result::Result<Value, ToolError> + Send + Sync,
{
    fn call(&self, call: &ToolCall) -> std::result::Result<Value, ToolError> {
        self(call)
    }
}

/// Named tools registered with an executor.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name.
    pub fn insert(&mut self, name: impl Into<String>, tool: impl Tool + 'static) -> Result<()> {
        self.insert_arc(name.into(), Arc::new(tool))
    }

    /// Register a closure as a tool.
    pub fn insert_fn<F>(&mut self, name: impl Into<String>, f: F) -> Result<()>
    where
        F: Fn(&ToolCall) -> std::result::Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.insert_arc(name.into(), Arc::new(f))
    }

    pub(crate) fn insert_arc(&mut self, name: String, tool: Arc<dyn Tool>) -> Result<()> {
        validate_identifier(&name)?;
        self.insert_unchecked(name, tool);
        Ok(())
    }

    pub(crate) fn insert_unchecked(&mut self, name: String, tool: Arc<dyn Tool>) {
        self.tools.insert(name, tool);
    }

    /// Look up a tool.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Check if a tool is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Check if no tools are registered.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Merge another registry into this one; its tools win on conflicts.
    pub fn extend(&mut self, other: ToolRegistry) {
        self.tools.extend(other.tools);
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (&String, &Arc<dyn Tool>)> {
        self.tools.iter()
    }
}

/// Invoke a tool, turning a panic into a [`ToolError`].
pub(crate) fn invoke_contained(
    name: &str,
    tool: &dyn Tool,
    call: &ToolCall,
) -> std::result::Result<Value, ToolError> {
    match catch_unwind(AssertUnwindSafe(|| tool.call(call))) {
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(ToolError::new(format!("tool '{name}' panicked: {reason}")))
        }
    }
}
