use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

/// Composed child environment for one step, plus the secrets bookkeeping
/// the masking layer needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretsContext {
    pub declared: Vec<String>,
    /// Sorted names of declared secrets absent from the process env.
    pub missing: Vec<String>,
    pub child_env: BTreeMap<String, String>,
}

/// Resolves declared secret names against the process environment and keeps
/// the registry of values to mask for the rest of the run. The registry only
/// grows; values stay masked even after the step that introduced them.
#[derive(Debug, Default)]
pub struct SecretsManager {
    masked: BTreeSet<String>,
}

impl SecretsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Env composition: inherited process env, overlaid by declared secrets
    /// from the process env, overlaid by step env (step wins; an overriding
    /// value for a declared name is also registered for masking). An empty
    /// env value counts as present.
    pub fn resolve(
        &mut self,
        declared: &[String],
        step_env: &BTreeMap<String, String>,
    ) -> SecretsContext {
        let mut child_env: BTreeMap<String, String> = std::env::vars().collect();
        let mut missing = Vec::new();

        for name in declared {
            match std::env::var(name) {
                Ok(value) => {
                    child_env.insert(name.clone(), value.clone());
                    self.register(value);
                }
                Err(_) => missing.push(name.clone()),
            }
        }

        for (key, value) in step_env {
            child_env.insert(key.clone(), value.clone());
            if declared.iter().any(|name| name == key) {
                self.register(value.clone());
            }
        }

        missing.sort();
        missing.dedup();

        SecretsContext {
            declared: declared.to_vec(),
            missing,
            child_env,
        }
    }

    fn register(&mut self, value: String) {
        if !value.is_empty() {
            self.masked.insert(value);
        }
    }

    /// Replaces every known secret value with `***`, longest value first so
    /// substring secrets cannot leave partial residue.
    pub fn mask_text(&self, text: &str) -> String {
        if text.is_empty() || self.masked.is_empty() {
            return text.to_string();
        }
        let mut values: Vec<&String> = self.masked.iter().collect();
        values.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));

        let mut masked = text.to_string();
        for value in values {
            if masked.contains(value.as_str()) {
                masked = masked.replace(value.as_str(), "***");
            }
        }
        masked
    }

    /// Masks every string leaf of a value, recursively.
    pub fn mask_value(&self, value: &Value) -> Value {
        if self.masked.is_empty() {
            return value.clone();
        }
        match value {
            Value::String(text) => Value::String(self.mask_text(text)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.mask_value(item)).collect())
            }
            Value::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(key, entry)| (key.clone(), self.mask_value(entry)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    pub fn mask_lines(&self, lines: &[String]) -> Vec<String> {
        lines.iter().map(|line| self.mask_text(line)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn longer_values_mask_before_their_substrings() {
        let mut manager = SecretsManager::new();
        manager.register("secret".to_string());
        manager.register("secret-extended".to_string());
        assert_eq!(manager.mask_text("use secret-extended here"), "use *** here");
        assert_eq!(manager.mask_text("plain secret"), "plain ***");
    }

    #[test]
    fn empty_values_are_never_masked() {
        let mut manager = SecretsManager::new();
        manager.register(String::new());
        assert_eq!(manager.mask_text("unchanged"), "unchanged");
    }

    #[test]
    fn masking_recurses_through_nested_values() {
        let mut manager = SecretsManager::new();
        manager.register("hunter2".to_string());
        let masked = manager.mask_value(&json!({
            "output": "token hunter2",
            "nested": {"lines": ["hunter2", 7]},
        }));
        assert_eq!(
            masked,
            json!({"output": "token ***", "nested": {"lines": ["***", 7]}})
        );
    }
}
