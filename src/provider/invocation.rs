use crate::provider::{InputMode, ProviderTemplate};
use crate::variables::{self, Scope};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// A composed argv ready for the subprocess runner.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedInvocation {
    pub argv: Vec<String>,
    pub input_mode: InputMode,
    /// The prompt to deliver on stdin (stdin-mode templates only).
    pub stdin_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComposeError {
    #[error("${{PROMPT}} not allowed in stdin mode")]
    InvalidPromptPlaceholder,
    #[error("missing placeholders: {}", .0.join(", "))]
    MissingPlaceholders(Vec<String>),
}

/// Substitutes placeholders into the template's command tokens.
///
/// Every non-PROMPT placeholder resolves from the merged parameter map
/// (nested values addressable by dotted path) or the ambient scope; `$$`
/// and `$${` escape to literal text. `${PROMPT}` is replaced with the
/// prompt verbatim in argv mode, and the replacement is never rescanned,
/// so tokens inside the prompt stay untouched.
pub fn compose_command(
    template: &ProviderTemplate,
    params: &Map<String, Value>,
    scope: &Scope,
    prompt: &str,
) -> Result<PreparedInvocation, ComposeError> {
    let mut argv = Vec::with_capacity(template.command.len());
    let mut missing: BTreeSet<String> = BTreeSet::new();

    for token in &template.command {
        argv.push(substitute_token(
            token,
            template.input_mode,
            params,
            scope,
            prompt,
            &mut missing,
        )?);
    }

    if !missing.is_empty() {
        return Err(ComposeError::MissingPlaceholders(
            missing.into_iter().collect(),
        ));
    }

    Ok(PreparedInvocation {
        argv,
        input_mode: template.input_mode,
        stdin_prompt: match template.input_mode {
            InputMode::Stdin => Some(prompt.to_string()),
            InputMode::Argv => None,
        },
    })
}

fn substitute_token(
    token: &str,
    input_mode: InputMode,
    params: &Map<String, Value>,
    scope: &Scope,
    prompt: &str,
    missing: &mut BTreeSet<String>,
) -> Result<String, ComposeError> {
    let mut out = String::with_capacity(token.len());
    let mut cursor = token;

    loop {
        let Some(pos) = cursor.find('$') else {
            out.push_str(cursor);
            break;
        };
        out.push_str(&cursor[..pos]);
        let after = &cursor[pos + 1..];

        if let Some(rest) = after.strip_prefix('$') {
            // "$$" and "$${" both collapse to a literal dollar; whatever
            // follows is plain text, never a placeholder.
            out.push('$');
            cursor = rest;
        } else if let Some(body) = after.strip_prefix('{') {
            match body.find('}') {
                Some(close) if close > 0 => {
                    let name = &body[..close];
                    if name == "PROMPT" {
                        if input_mode == InputMode::Stdin {
                            return Err(ComposeError::InvalidPromptPlaceholder);
                        }
                        out.push_str(prompt);
                    } else {
                        match lookup_param(params, name).or_else(|| variables::lookup(name, scope))
                        {
                            Some(value) => out.push_str(&variables::render(&value)),
                            None => {
                                missing.insert(name.to_string());
                            }
                        }
                    }
                    cursor = &body[close + 1..];
                }
                Some(close) => {
                    out.push_str("${}");
                    cursor = &body[close + 1..];
                }
                None => {
                    out.push('$');
                    cursor = after;
                }
            }
        } else {
            out.push('$');
            cursor = after;
        }
    }

    Ok(out)
}

fn lookup_param(params: &Map<String, Value>, name: &str) -> Option<Value> {
    if let Some(value) = params.get(name) {
        return Some(value.clone());
    }
    let mut segments = name.split('.');
    let mut current = params.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current.clone())
}
