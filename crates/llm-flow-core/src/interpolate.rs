// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `{{placeholder}}` interpolation.
//!
//! Whitespace inside the braces is trimmed. Strict interpolation (prompts,
//! `with:` maps) fails on the first unresolved key; lenient interpolation
//! (`if:` conditions) substitutes the empty string.

use crate::scope::Scope;
use regex::Regex;
use std::sync::OnceLock;

/// An unresolved placeholder key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingKey(pub String);

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\{\{([^{}]+)\}\}").unwrap())
}

/// Strictly interpolates `template` against `scope`; errors with the
/// first missing key.
pub fn interpolate(template: &str, scope: &Scope) -> Result<String, MissingKey> {
    let mut missing: Option<String> = None;
    let result = placeholder_regex().replace_all(template, |caps: &regex::Captures<'_>| {
        let key = caps[1].trim().to_string();
        match scope.get(&key) {
            Some(value) => value,
            None => {
                if missing.is_none() {
                    missing = Some(key);
                }
                String::new()
            }
        }
    });
    match missing {
        Some(key) => Err(MissingKey(key)),
        None => Ok(result.into_owned()),
    }
}

/// Leniently interpolates `template`; unresolved keys become empty
/// strings. Used for `if:` conditions, where an absent (skipped) step
/// output is an expected state.
pub fn interpolate_lenient(template: &str, scope: &Scope) -> String {
    placeholder_regex()
        .replace_all(template, |caps: &regex::Captures<'_>| {
            scope.get(caps[1].trim()).unwrap_or_default()
        })
        .into_owned()
}

/// The distinct placeholder keys referenced by `template`, in order of
/// first appearance. Used by the validator for `needs:` consistency.
pub fn referenced_keys(template: &str) -> Vec<String> {
    let mut keys = Vec::new();
    for caps in placeholder_regex().captures_iter(template) {
        let key = caps[1].trim().to_string();
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn scope_with(entries: &[(&str, &str)]) -> Scope {
        let mut scope = Scope::new(BTreeMap::new());
        for (key, value) in entries {
            scope.set(*key, *value);
        }
        scope
    }

    #[test]
    fn test_no_placeholders_is_identity() {
        let scope = scope_with(&[]);
        assert_eq!(
            interpolate("plain text, no substitution", &scope).unwrap(),
            "plain text, no substitution"
        );
    }

    #[test]
    fn test_whitespace_trimmed() {
        let scope = scope_with(&[("draft", "v1")]);
        assert_eq!(interpolate("Review {{  draft  }}", &scope).unwrap(), "Review v1");
    }

    #[test]
    fn test_missing_key_errors_strict() {
        let scope = scope_with(&[("a", "1")]);
        let err = interpolate("{{a}} then {{b}}", &scope).unwrap_err();
        assert_eq!(err, MissingKey("b".to_string()));
    }

    #[test]
    fn test_missing_key_empty_lenient() {
        let scope = scope_with(&[("a", "1")]);
        assert_eq!(interpolate_lenient("{{a}}-{{b}}-", &scope), "1--");
    }

    #[test]
    fn test_dotted_key_opaque() {
        let mut scope = scope_with(&[]);
        scope.set("loop.last.output", "FAIL");
        assert_eq!(
            interpolate("Previous: {{loop.last.output}}", &scope).unwrap(),
            "Previous: FAIL"
        );
    }

    #[test]
    fn test_env_resolution() {
        let mut env = BTreeMap::new();
        env.insert("STAGE".to_string(), "prod".to_string());
        let scope = Scope::new(env);
        assert_eq!(interpolate("stage={{env.STAGE}}", &scope).unwrap(), "stage=prod");
    }

    #[test]
    fn test_referenced_keys_dedup_in_order() {
        let keys = referenced_keys("{{b}} {{ a }} {{b}} {{c}}");
        assert_eq!(keys, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_multiple_substitutions() {
        let scope = scope_with(&[("a", "x"), ("b", "y")]);
        assert_eq!(interpolate("{{a}}{{b}}{{a}}", &scope).unwrap(), "xyx");
    }
}
