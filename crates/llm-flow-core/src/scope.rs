// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Per-invocation variable scope.
//!
//! A workflow invocation owns one flat scope: a string entry per completed
//! step or loop plus the reserved built-ins (`input`, `env.*`, `loop.*`,
//! `item`, `index`, `consensus`). Entries are appended by the scheduler
//! only; workers never write to the scope directly.

use serde_json::Value;
use std::collections::BTreeMap;

/// Reserved scope keys that are always legal to reference without a
/// `needs:` entry.
pub const BUILTINS: &[&str] = &[
    "input",
    "loop.iteration",
    "loop.output",
    "loop.last.output",
    "loop.history",
    "item",
    "index",
    "consensus",
];

/// Returns true when `key` is a reserved built-in (including any
/// `env.*` reference).
pub fn is_builtin(key: &str) -> bool {
    BUILTINS.contains(&key) || key.starts_with("env.")
}

/// Flat string scope for one workflow invocation.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    values: BTreeMap<String, String>,
    env: BTreeMap<String, String>,
}

impl Scope {
    /// Creates an empty scope with the workflow's `env:` map attached.
    pub fn new(env: BTreeMap<String, String>) -> Self {
        Self {
            values: BTreeMap::new(),
            env,
        }
    }

    /// Creates a child scope seeded with explicit `with:` entries and a
    /// synthesized `input`: the single value when the map has exactly one
    /// entry, otherwise a JSON encoding of the whole map.
    pub fn for_child(with: &BTreeMap<String, String>, env: BTreeMap<String, String>) -> Self {
        let mut scope = Self::new(env);
        for (key, value) in with {
            scope.set(key, value.clone());
        }
        let input = if with.len() == 1 {
            with.values().next().cloned().unwrap_or_default()
        } else {
            serde_json::to_string(with).unwrap_or_default()
        };
        scope.set("input", input);
        scope
    }

    /// Resolves a key. `env.X` resolves against the workflow `env` map
    /// first, then the process environment; every other key (dotted or
    /// not) is an opaque lookup.
    pub fn get(&self, key: &str) -> Option<String> {
        if let Some(var) = key.strip_prefix("env.") {
            return self
                .env
                .get(var)
                .cloned()
                .or_else(|| std::env::var(var).ok());
        }
        self.values.get(key).cloned()
    }

    /// Whether the key resolves.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Sets an entry.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    /// Sets an entry from a structured value; non-string values are
    /// serialized as JSON text (prompts are strings).
    pub fn set_value(&mut self, key: impl Into<String>, value: &Value) {
        let text = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        self.set(key, text);
    }

    /// Removes an entry (used by the loop controller to retract loop
    /// variables after exit).
    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    /// Non-builtin entries, keyed by step/loop name.
    pub fn entries(&self) -> &BTreeMap<String, String> {
        &self.values
    }

    /// The workflow `env:` map attached to this scope.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_detection() {
        assert!(is_builtin("input"));
        assert!(is_builtin("loop.last.output"));
        assert!(is_builtin("env.HOME"));
        assert!(!is_builtin("summarize"));
        assert!(!is_builtin("loop.unknown"));
    }

    #[test]
    fn test_env_precedence() {
        std::env::set_var("FLOW_SCOPE_TEST", "from-process");
        let mut env = BTreeMap::new();
        env.insert("FLOW_SCOPE_TEST".to_string(), "from-workflow".to_string());

        let scope = Scope::new(env);
        assert_eq!(
            scope.get("env.FLOW_SCOPE_TEST"),
            Some("from-workflow".to_string())
        );

        let scope = Scope::new(BTreeMap::new());
        assert_eq!(
            scope.get("env.FLOW_SCOPE_TEST"),
            Some("from-process".to_string())
        );
    }

    #[test]
    fn test_dotted_keys_are_opaque() {
        let mut scope = Scope::new(BTreeMap::new());
        scope.set("loop.last.output", "draft v2");
        assert_eq!(scope.get("loop.last.output"), Some("draft v2".to_string()));
        assert_eq!(scope.get("loop.last"), None);
    }

    #[test]
    fn test_child_scope_single_input() {
        let mut with = BTreeMap::new();
        with.insert("text".to_string(), "hello".to_string());

        let scope = Scope::for_child(&with, BTreeMap::new());
        assert_eq!(scope.get("input"), Some("hello".to_string()));
        assert_eq!(scope.get("text"), Some("hello".to_string()));
    }

    #[test]
    fn test_child_scope_multi_input_is_json() {
        let mut with = BTreeMap::new();
        with.insert("a".to_string(), "1".to_string());
        with.insert("b".to_string(), "2".to_string());

        let scope = Scope::for_child(&with, BTreeMap::new());
        let input = scope.get("input").unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&input).unwrap();
        assert_eq!(parsed["a"], "1");
        assert_eq!(parsed["b"], "2");
    }

    #[test]
    fn test_set_value_serializes_json() {
        let mut scope = Scope::new(BTreeMap::new());
        scope.set_value("hits", &serde_json::json!(["a", "b"]));
        assert_eq!(scope.get("hits"), Some("[\"a\",\"b\"]".to_string()));

        scope.set_value("plain", &serde_json::json!("text"));
        assert_eq!(scope.get("plain"), Some("text".to_string()));
    }
}
