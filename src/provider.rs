pub mod invocation;
pub mod registry;

pub use invocation::{compose_command, ComposeError, PreparedInvocation};
pub use registry::ProviderRegistry;

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputMode {
    #[default]
    Argv,
    Stdin,
}

impl InputMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "argv" => Some(Self::Argv),
            "stdin" => Some(Self::Stdin),
            _ => None,
        }
    }
}

pub const PROMPT_PLACEHOLDER: &str = "${PROMPT}";

/// An external AI-agent command-line tool: an argv template with
/// `${placeholder}` slots, parameter defaults, and a prompt delivery mode.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderTemplate {
    pub name: String,
    pub command: Vec<String>,
    pub defaults: Map<String, Value>,
    pub input_mode: InputMode,
}

impl ProviderTemplate {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.command.is_empty() {
            errors.push(format!("provider '{}': command cannot be empty", self.name));
        }
        if self.input_mode == InputMode::Stdin
            && self
                .command
                .iter()
                .any(|token| token.contains(PROMPT_PLACEHOLDER))
        {
            errors.push(format!(
                "provider '{}': ${{PROMPT}} not allowed in stdin mode",
                self.name
            ));
        }
        errors
    }
}
