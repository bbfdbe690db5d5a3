use crate::shared::path_safety::{self, PathSafetyError};
use crate::variables::{self, Scope};
use crate::wait;
use crate::workflow::WhenCondition;
use serde_json::Value;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum ConditionError {
    #[error("unsafe pattern in condition: {0}")]
    PathSafety(#[from] PathSafetyError),
}

/// Evaluates a step's `when` condition. `equals` compares both sides as
/// strings after substitution; an undefined variable makes the condition
/// false rather than an error. `exists`/`not_exists` glob the workspace and
/// ignore symlink-escaping matches; unsafe patterns are a hard error.
pub fn evaluate(
    condition: &WhenCondition,
    scope: &Scope,
    workspace: &Path,
) -> Result<bool, ConditionError> {
    match condition {
        WhenCondition::Equals { left, right } => Ok(evaluate_equals(left, right, scope)),
        WhenCondition::Exists(pattern) => evaluate_exists(pattern, scope, workspace),
        WhenCondition::NotExists(pattern) => {
            evaluate_exists(pattern, scope, workspace).map(|found| !found)
        }
    }
}

fn evaluate_equals(left: &Value, right: &Value, scope: &Scope) -> bool {
    let Some(left) = substituted_comparand(left, scope) else {
        return false;
    };
    let Some(right) = substituted_comparand(right, scope) else {
        return false;
    };
    left == right
}

fn substituted_comparand(value: &Value, scope: &Scope) -> Option<String> {
    match value {
        Value::String(text) => {
            let (rendered, undefined) = variables::substitute_text_lenient(text, scope);
            if undefined.is_empty() {
                Some(rendered)
            } else {
                None
            }
        }
        other => Some(variables::render(other)),
    }
}

fn evaluate_exists(
    pattern: &str,
    scope: &Scope,
    workspace: &Path,
) -> Result<bool, ConditionError> {
    let (expanded, undefined) = variables::substitute_text_lenient(pattern, scope);
    if !undefined.is_empty() {
        return Ok(false);
    }
    path_safety::check_pattern(&expanded)?;

    let workspace = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    Ok(!wait::poll_matches(&workspace, &expanded).is_empty())
}
