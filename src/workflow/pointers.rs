use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PointerError {
    #[error("invalid pointer syntax: {pointer}")]
    InvalidSyntax { pointer: String },
    #[error("loop iteration references not supported in items_from: {pointer}")]
    LoopScoped { pointer: String },
    #[error("step '{step}' not found in state")]
    StepNotFound { step: String },
    #[error("step '{step}' does not have '{field}' output")]
    MissingField { step: String, field: String },
    #[error("'lines' cannot have nested paths: {pointer}")]
    LinesWithPath { pointer: String },
    #[error("cannot navigate '{pointer}': '{key}' is not an object")]
    NotAnObject { pointer: String, key: String },
    #[error("path not found in '{pointer}': missing key '{key}'")]
    MissingKey { pointer: String, key: String },
    #[error("invalid output field '{field}': must be 'lines' or 'json'")]
    InvalidField { field: String },
}

/// Resolves `steps.<Name>.lines` or `steps.<Name>.json(.<key>)*` against a
/// step-result map. Loop-scoped keys like `Parent[i].Child` are rejected;
/// iteration-scoped access is the executor's job.
pub fn resolve_pointer(steps: &Map<String, Value>, pointer: &str) -> Result<Value, PointerError> {
    let rest = pointer
        .strip_prefix("steps.")
        .ok_or_else(|| PointerError::InvalidSyntax {
            pointer: pointer.to_string(),
        })?;
    let (step_name, field_path) =
        rest.split_once('.')
            .ok_or_else(|| PointerError::InvalidSyntax {
                pointer: pointer.to_string(),
            })?;
    if step_name.is_empty() || field_path.is_empty() {
        return Err(PointerError::InvalidSyntax {
            pointer: pointer.to_string(),
        });
    }
    if step_name.contains('[') {
        return Err(PointerError::LoopScoped {
            pointer: pointer.to_string(),
        });
    }

    let record = steps
        .get(step_name)
        .ok_or_else(|| PointerError::StepNotFound {
            step: step_name.to_string(),
        })?;

    let mut segments = field_path.split('.');
    let field = segments.next().unwrap_or_default();
    match field {
        "lines" => {
            if segments.next().is_some() {
                return Err(PointerError::LinesWithPath {
                    pointer: pointer.to_string(),
                });
            }
            lookup_field(record, step_name, "lines")
        }
        "json" => {
            let mut current = lookup_field(record, step_name, "json")?;
            for key in segments {
                let object = current
                    .as_object()
                    .ok_or_else(|| PointerError::NotAnObject {
                        pointer: pointer.to_string(),
                        key: key.to_string(),
                    })?;
                current = object
                    .get(key)
                    .cloned()
                    .ok_or_else(|| PointerError::MissingKey {
                        pointer: pointer.to_string(),
                        key: key.to_string(),
                    })?;
            }
            Ok(current)
        }
        other => Err(PointerError::InvalidField {
            field: other.to_string(),
        }),
    }
}

fn lookup_field(record: &Value, step_name: &str, field: &str) -> Result<Value, PointerError> {
    record
        .as_object()
        .and_then(|object| object.get(field))
        .cloned()
        .ok_or_else(|| PointerError::MissingField {
            step: step_name.to_string(),
            field: field.to_string(),
        })
}
