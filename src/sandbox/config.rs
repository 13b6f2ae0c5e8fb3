//! Executor configuration with builder pattern.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{ExecutorError, Result};
use crate::sandbox::state::validate_identifier;
use crate::sandbox::tools::{Tool, ToolCall, ToolError, ToolRegistry};
use crate::sandbox::value::Value;

/// Default character budget for captured logs.
pub const DEFAULT_MAX_PRINT_OUTPUTS_LENGTH: usize = 50_000;

/// Default name of the completion sentinel.
pub const DEFAULT_FINAL_ANSWER_TOOL: &str = "final_answer";

/// Modules guest code may always import.
pub const BASE_AUTHORIZED_IMPORTS: [&str; 11] = [
    "collections",
    "datetime",
    "itertools",
    "math",
    "queue",
    "random",
    "re",
    "stat",
    "statistics",
    "time",
    "unicodedata",
];

/// Configuration for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Modules the guest may import on top of [`BASE_AUTHORIZED_IMPORTS`].
    /// `"*"` authorizes every module.
    pub additional_authorized_imports: Vec<String>,
    /// Maximum number of characters kept in the logs of one execution.
    pub max_print_outputs_length: usize,
    /// Tools registered at construction.
    pub additional_functions: ToolRegistry,
    /// Path to the RustPython wasm file.
    pub interpreter_path: PathBuf,
    /// Maximum guest linear memory in bytes.
    pub max_memory: u64,
    /// Fuel (instruction budget) for one execution; `None` for unlimited.
    pub max_fuel: Option<u64>,
    /// Wall-clock limit for one execution.
    pub timeout: Option<Duration>,
    /// Name under which the completion sentinel is exposed.
    pub final_answer_tool: String,
    /// Reuse precompiled runtime artifacts across executors.
    pub cache_compiled_runtime: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            additional_authorized_imports: Vec::new(),
            max_print_outputs_length: DEFAULT_MAX_PRINT_OUTPUTS_LENGTH,
            additional_functions: ToolRegistry::new(),
            interpreter_path: PathBuf::from("assets/rustpython.wasm"),
            max_memory: 256 * 1024 * 1024, // 256MB
            max_fuel: Some(20_000_000_000),
            timeout: None,
            final_answer_tool: DEFAULT_FINAL_ANSWER_TOOL.to_string(),
            cache_compiled_runtime: true,
        }
    }
}

impl ExecutorConfig {
    /// Create a new builder for ExecutorConfig.
    pub fn builder() -> ExecutorConfigBuilder {
        ExecutorConfigBuilder::default()
    }

    /// Check the configuration for values the executor cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_print_outputs_length == 0 {
            return Err(ExecutorError::Config(
                "max_print_outputs_length must be greater than zero".to_string(),
            ));
        }
        if self.max_memory == 0 {
            return Err(ExecutorError::Config(
                "max_memory must be greater than zero".to_string(),
            ));
        }
        if self.max_fuel == Some(0) {
            return Err(ExecutorError::Config("max_fuel must be greater than zero".to_string()));
        }
        if self.timeout == Some(Duration::ZERO) {
            return Err(ExecutorError::Config("timeout must be greater than zero".to_string()));
        }
        validate_identifier(&self.final_answer_tool).map_err(|_| {
            ExecutorError::Config(format!(
                "final_answer_tool {:?} is not a valid identifier",
                self.final_answer_tool
            ))
        })?;

        for name in self.additional_functions.names() {
            validate_identifier(&name).map_err(|_| {
                ExecutorError::Config(format!("tool name {name:?} is not a valid identifier"))
            })?;
        }

        let mut seen = HashSet::new();
        for import in &self.additional_authorized_imports {
            if !is_module_pattern(import) {
                return Err(ExecutorError::Config(format!(
                    "invalid authorized import {import:?}"
                )));
            }
            if !seen.insert(import.as_str()) {
                return Err(ExecutorError::Config(format!(
                    "duplicate authorized import {import:?}"
                )));
            }
        }
        Ok(())
    }

    /// The full set of importable modules, sorted.
    pub fn authorized_imports(&self) -> Vec<String> {
        let mut imports: Vec<String> = BASE_AUTHORIZED_IMPORTS
            .iter()
            .map(|s| s.to_string())
            .chain(self.additional_authorized_imports.iter().cloned())
            .collect();
        imports.sort();
        imports.dedup();
        imports
    }
}

fn is_module_pattern(name: &str) -> bool {
    name == "*"
        || name.split('.').all(|part| {
            let mut chars = part.chars();
            chars
                .next()
                .map(|c| c == '_' || c.is_ascii_alphabetic())
                .unwrap_or(false)
                && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
        })
}

/// Builder for creating ExecutorConfig instances.
#[derive(Debug, Clone, Default)]
pub struct ExecutorConfigBuilder {
    config: ExecutorConfig,
}

impl ExecutorConfigBuilder {
    /// Set the modules authorized on top of the base set.
    pub fn additional_authorized_imports<I, S>(mut self, imports: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.additional_authorized_imports = imports.into_iter().map(Into::into).collect();
        self
    }

    /// Set the character budget for captured logs.
    pub fn max_print_outputs_length(mut self, chars: usize) -> Self {
        self.config.max_print_outputs_length = chars;
        self
    }

    /// Register a tool available from the first execution on.
    ///
    /// Invalid names are reported by [`ExecutorConfig::validate`] when the
    /// executor is constructed.
    pub fn additional_function(mut self, name: impl Into<String>, tool: impl Tool + 'static) -> Self {
        self.config
            .additional_functions
            .insert_unchecked(name.into(), Arc::new(tool));
        self
    }

    /// Register a closure as a tool available from the first execution on.
    pub fn additional_fn<F>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&ToolCall) -> std::result::Result<Value, ToolError> + Send + Sync + 'static,
    {
        self.additional_function(name, f)
    }

    /// Register several tools at once.
    pub fn additional_functions(mut self, tools: ToolRegistry) -> Self {
        self.config.additional_functions.extend(tools);
        self
    }

    /// Set the path to the RustPython wasm interpreter.
    pub fn interpreter_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.interpreter_path = path.into();
        self
    }

    /// Set the maximum memory limit in bytes.
    pub fn max_memory(mut self, bytes: u64) -> Self {
        self.config.max_memory = bytes;
        self
    }

    /// Set the fuel (instruction budget) of one execution.
    pub fn max_fuel(mut self, fuel: u64) -> Self {
        self.config.max_fuel = Some(fuel);
        self
    }

    /// Remove the fuel budget.
    pub fn unlimited_fuel(mut self) -> Self {
        self.config.max_fuel = None;
        self
    }

    /// Set the wall-clock limit of one execution.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Rename the completion sentinel.
    pub fn final_answer_tool(mut self, name: impl Into<String>) -> Self {
        self.config.final_answer_tool = name.into();
        self
    }

    /// Enable or disable the shared compilation cache.
    pub fn cache_compiled_runtime(mut self, enabled: bool) -> Self {
        self.config.cache_compiled_runtime = enabled;
        self
    }

    /// Build the ExecutorConfig.
    pub fn build(self) -> ExecutorConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ExecutorConfig::default();
        assert_eq!(config.max_print_outputs_length, 50_000);
        assert!(config.additional_authorized_imports.is_empty());
        assert!(config.additional_functions.is_empty());
        assert_eq!(config.final_answer_tool, "final_answer");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = ExecutorConfig::builder()
            .additional_authorized_imports(["numpy", "pandas"])
            .max_print_outputs_length(2000)
            .additional_fn("test_func", |call| {
                let x = call.arg(0).and_then(Value::as_i64).unwrap_or(0);
                Ok(Value::Int(x * 2))
            })
            .max_fuel(1_000_000)
            .timeout(Duration::from_secs(5))
            .build();

        assert_eq!(config.additional_authorized_imports, vec!["numpy", "pandas"]);
        assert_eq!(config.max_print_outputs_length, 2000);
        assert!(config.additional_functions.contains("test_func"));
        assert_eq!(config.max_fuel, Some(1_000_000));
        assert_eq!(config.timeout, Some(Duration::from_secs(5)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let zero = ExecutorConfig::builder().max_print_outputs_length(0).build();
        assert!(matches!(zero.validate(), Err(ExecutorError::Config(_))));

        let dup = ExecutorConfig::builder()
            .additional_authorized_imports(["json", "json"])
            .build();
        assert!(dup.validate().unwrap_err().to_string().contains("duplicate"));

        let bad_import = ExecutorConfig::builder()
            .additional_authorized_imports(["os; rm"])
            .build();
        assert!(bad_import.validate().is_err());

        let bad_tool = ExecutorConfig::builder()
            .additional_fn("not valid", |_| Ok(Value::None))
            .build();
        assert!(bad_tool.validate().is_err());
    }

    #[test]
    fn test_authorized_imports_merge() {
        let config = ExecutorConfig::builder()
            .additional_authorized_imports(["json", "math"])
            .build();
        let imports = config.authorized_imports();
        assert!(imports.contains(&"json".to_string()));
        assert_eq!(imports.iter().filter(|m| *m == "math").count(), 1);
    }
}
