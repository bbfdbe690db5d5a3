use crate::provider::{InputMode, ProviderTemplate};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Holds the built-in provider templates plus any the workflow defines.
/// Workflow entries override built-ins by name.
pub struct ProviderRegistry {
    builtin: BTreeMap<String, ProviderTemplate>,
    workflow: BTreeMap<String, ProviderTemplate>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            builtin: builtin_templates(),
            workflow: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, template: ProviderTemplate) {
        self.workflow.insert(template.name.clone(), template);
    }

    pub fn get(&self, name: &str) -> Option<&ProviderTemplate> {
        self.workflow.get(name).or_else(|| self.builtin.get(name))
    }

    /// Deep merge of the template defaults with step parameters; step values
    /// win, recursing into nested maps.
    pub fn merge_params(&self, name: &str, step_params: &Map<String, Value>) -> Map<String, Value> {
        let mut merged = self
            .get(name)
            .map(|template| template.defaults.clone())
            .unwrap_or_default();
        deep_merge(&mut merged, step_params);
        merged
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn deep_merge(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                deep_merge(existing, incoming);
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

fn builtin_templates() -> BTreeMap<String, ProviderTemplate> {
    let mut builtin = BTreeMap::new();
    let mut claude_defaults = Map::new();
    claude_defaults.insert(
        "model".to_string(),
        Value::String("claude-sonnet-4-20250514".to_string()),
    );
    builtin.insert(
        "claude".to_string(),
        ProviderTemplate {
            name: "claude".to_string(),
            command: argv(&["claude", "-p", "${PROMPT}", "--model", "${model}"]),
            defaults: claude_defaults,
            input_mode: InputMode::Argv,
        },
    );
    builtin.insert(
        "gemini".to_string(),
        ProviderTemplate {
            name: "gemini".to_string(),
            command: argv(&["gemini", "-p", "${PROMPT}"]),
            defaults: Map::new(),
            input_mode: InputMode::Argv,
        },
    );
    let mut codex_defaults = Map::new();
    codex_defaults.insert("model".to_string(), Value::String("gpt-5".to_string()));
    builtin.insert(
        "codex".to_string(),
        ProviderTemplate {
            name: "codex".to_string(),
            command: argv(&[
                "codex",
                "exec",
                "--model",
                "${model}",
                "--dangerously-bypass-approvals-and-sandbox",
            ]),
            defaults: codex_defaults,
            input_mode: InputMode::Stdin,
        },
    );
    builtin
}

fn argv(tokens: &[&str]) -> Vec<String> {
    tokens.iter().map(|token| token.to_string()).collect()
}
