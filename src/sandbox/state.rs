//! The persistent namespace of a sandbox instance.

use std::collections::BTreeMap;
use std::ops::Index;

use serde::{Deserialize, Serialize};

use crate::error::{ExecutorError, Result};
use crate::sandbox::value::Value;

/// Reserved binding marking the namespace as a top-level module scope.
pub const MODULE_NAME_KEY: &str = "__name__";

const PYTHON_KEYWORDS: [&str; 35] = [
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Source of a top-level `def`, `class` or `import` made by guest code.
///
/// Functions, classes and modules have no [`Value`] form, so they are carried
/// across executions by replaying their source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Definition {
    /// Names the statement binds.
    pub names: Vec<String>,
    /// The statement source, decorators included.
    pub source: String,
}

/// Host-visible mapping from identifier to value, merged across executions.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionState {
    bindings: BTreeMap<String, Value>,
    definitions: Vec<Definition>,
}

impl Default for ExecutionState {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionState {
    /// Create a state holding only the reserved module binding.
    pub fn new() -> Self {
        let mut bindings = BTreeMap::new();
        bindings.insert(MODULE_NAME_KEY.to_string(), Value::from("__main__"));
        Self {
            bindings,
            definitions: Vec::new(),
        }
    }

    /// Get a binding by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.bindings.get(name)
    }

    /// Check if a name is bound, either to a value or by a definition.
    pub fn contains(&self, name: &str) -> bool {
        self.bindings.contains_key(name)
            || self
                .definitions
                .iter()
                .any(|def| def.names.iter().any(|n| n == name))
    }

    /// Number of value bindings, the reserved one included.
    pub fn len(&self) -> usize {
        self.bindings.len()
    }

    /// Always false: the reserved binding is never removed.
    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }

    /// Iterate over value bindings in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.bindings.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Top-level definitions in the order they were made.
    pub fn definitions(&self) -> &[Definition] {
        &self.definitions
    }

    /// Validate and merge host variables. Nothing is merged if any entry fails.
    pub fn merge_variables<K: Into<String>>(
        &mut self,
        vars: impl IntoIterator<Item = (K, Value)>,
    ) -> Result<()> {
        let vars: Vec<(String, Value)> = vars.into_iter().map(|(k, v)| (k.into(), v)).collect();
        for (name, value) in &vars {
            validate_identifier(name)?;
            value
                .validate()
                .map_err(|e| ExecutorError::UnsupportedVariableType {
                    key: name.clone(),
                    reason: e.to_string(),
                })?;
        }
        for (name, value) in vars {
            self.bind(name, value);
        }
        Ok(())
    }

    /// Apply the namespace reported by the guest after an execution.
    ///
    /// New definitions shadow earlier value bindings of the same name; reported
    /// bindings then overwrite. Nothing is ever removed.
    pub(crate) fn apply_guest_snapshot(
        &mut self,
        bindings: Vec<(String, Value)>,
        definitions: Vec<Definition>,
    ) {
        for def in definitions {
            for name in &def.names {
                if name != MODULE_NAME_KEY {
                    self.bindings.remove(name);
                }
            }
            self.definitions.retain(|old| {
                !old.names.iter().all(|n| def.names.contains(n))
            });
            self.definitions.push(def);
        }
        for (name, value) in bindings {
            if name != MODULE_NAME_KEY {
                self.bind(name, value);
            }
        }
    }

    /// Drop value bindings and definitions that a newly registered tool shadows.
    pub(crate) fn shadow(&mut self, name: &str) {
        if name == MODULE_NAME_KEY {
            return;
        }
        self.bindings.remove(name);
        for def in &mut self.definitions {
            def.names.retain(|n| n != name);
        }
        self.definitions.retain(|def| !def.names.is_empty());
    }

    fn bind(&mut self, name: String, value: Value) {
        self.bindings.insert(name, value);
    }
}

impl Index<&str> for ExecutionState {
    type Output = Value;

    fn index(&self, name: &str) -> &Value {
        match self.bindings.get(name) {
            Some(value) => value,
            None => panic!("no binding named {name:?} in execution state"),
        }
    }
}

/// Check that `name` can be bound as a plain Python identifier.
pub fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid_start = chars
        .next()
        .map(|c| c == '_' || c.is_alphabetic())
        .unwrap_or(false);
    let valid_rest = chars.all(|c| c == '_' || c.is_alphanumeric());
    let dunder = name.len() > 4 && name.starts_with("__") && name.ends_with("__");

    if !valid_start || !valid_rest || dunder || PYTHON_KEYWORDS.contains(&name) {
        return Err(ExecutorError::InvalidIdentifier(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_state_has_module_name() {
        let state = ExecutionState::new();
        assert_eq!(state[MODULE_NAME_KEY], Value::from("__main__"));
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn test_merge_overwrites_and_keeps() {
        let mut state = ExecutionState::new();
        state
            .merge_variables([("x", Value::Int(10)), ("y", Value::Int(20))])
            .unwrap();
        state.merge_variables([("x", Value::Int(5))]).unwrap();
        assert_eq!(state["x"], Value::Int(5));
        assert_eq!(state["y"], Value::Int(20));
    }

    #[test]
    fn test_merge_is_all_or_nothing() {
        let mut state = ExecutionState::new();
        let err = state
            .merge_variables([("ok", Value::Int(1)), ("bad", Value::Float(f64::INFINITY))])
            .unwrap_err();
        match err {
            ExecutorError::UnsupportedVariableType { key, .. } => assert_eq!(key, "bad"),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(state.get("ok").is_none());
    }

    #[test]
    fn test_identifier_rules() {
        assert!(validate_identifier("test_var").is_ok());
        assert!(validate_identifier("_private").is_ok());
        assert!(validate_identifier("données").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("a-b").is_err());
        assert!(validate_identifier("class").is_err());
        assert!(validate_identifier("__name__").is_err());
        assert!(validate_identifier("").is_err());
    }

    #[test]
    fn test_definitions_shadow_bindings() {
        let mut state = ExecutionState::new();
        state.merge_variables([("f", Value::Int(1))]).unwrap();
        state.apply_guest_snapshot(
            vec![("n".to_string(), Value::Int(3))],
            vec![Definition {
                names: vec!["f".to_string()],
                source: "def f():\n    return n".to_string(),
            }],
        );
        assert!(state.get("f").is_none());
        assert!(state.contains("f"));
        assert_eq!(state["n"], Value::Int(3));

        // Redefining replaces the earlier source.
        state.apply_guest_snapshot(
            vec![],
            vec![Definition {
                names: vec!["f".to_string()],
                source: "def f():\n    return 0".to_string(),
            }],
        );
        assert_eq!(state.definitions().len(), 1);
        assert!(state.definitions()[0].source.ends_with("return 0"));
    }

    #[test]
    fn test_guest_cannot_replace_module_name() {
        let mut state = ExecutionState::new();
        state.apply_guest_snapshot(vec![(MODULE_NAME_KEY.to_string(), Value::Int(0))], vec![]);
        assert_eq!(state[MODULE_NAME_KEY], Value::from("__main__"));
    }

    #[test]
    fn test_shadow_removes_binding_and_definition() {
        let mut state = ExecutionState::new();
        state.apply_guest_snapshot(
            vec![("tool".to_string(), Value::Int(1))],
            vec![Definition {
                names: vec!["helper".to_string()],
                source: "def helper(): pass".to_string(),
            }],
        );
        state.shadow("tool");
        state.shadow("helper");
        assert!(!state.contains("tool"));
        assert!(state.definitions().is_empty());
    }
}
