use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

/// Run-level metadata exposed as `${run.id}` / `${run.root}` /
/// `${run.timestamp_utc}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunScope {
    pub id: String,
    pub root: String,
    pub timestamp_utc: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopScope {
    pub index: usize,
    pub total: usize,
}

/// The variable namespace visible at one point of execution.
///
/// `steps` holds whichever step map the caller wants visible: the run-wide
/// map for top-level steps, or the single iteration's map inside a for-each.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub run: RunScope,
    pub context: BTreeMap<String, String>,
    pub steps: Map<String, Value>,
    pub loop_vars: Option<LoopScope>,
    pub item: Option<Value>,
    pub alias: Option<String>,
}

impl Scope {
    pub fn with_loop(mut self, index: usize, total: usize, item: Value, alias: &str) -> Self {
        self.loop_vars = Some(LoopScope { index, total });
        self.item = Some(item);
        if alias != "item" {
            self.alias = Some(alias.to_string());
        }
        self
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
#[error("undefined variables: {}", names.join(", "))]
pub struct UndefinedVariables {
    /// Sorted, deduplicated token paths that resolved to nothing.
    pub names: Vec<String>,
    /// Best-effort rendering of the input with defined tokens substituted.
    pub rendered: Value,
}

/// Substitutes `${path}` tokens in a string. `$$` escapes a literal `$`.
/// Substitution is textual and non-recursive.
pub fn substitute_text(text: &str, scope: &Scope) -> Result<String, UndefinedVariables> {
    let (rendered, undefined) = substitute_text_lenient(text, scope);
    if undefined.is_empty() {
        Ok(rendered)
    } else {
        Err(UndefinedVariables {
            names: undefined.into_iter().collect(),
            rendered: Value::String(rendered),
        })
    }
}

/// Like [`substitute_text`] but leaves unresolved tokens in place and
/// returns them instead of failing.
pub fn substitute_text_lenient(text: &str, scope: &Scope) -> (String, BTreeSet<String>) {
    let mut undefined = BTreeSet::new();
    let rendered = scan(text, scope, &mut undefined);
    (rendered, undefined)
}

/// Substitutes every string leaf of a value; non-string leaves pass through
/// untouched.
pub fn substitute_value(value: &Value, scope: &Scope) -> Result<Value, UndefinedVariables> {
    let (rendered, undefined) = substitute_value_lenient(value, scope);
    if undefined.is_empty() {
        Ok(rendered)
    } else {
        Err(UndefinedVariables {
            names: undefined.into_iter().collect(),
            rendered,
        })
    }
}

pub fn substitute_value_lenient(value: &Value, scope: &Scope) -> (Value, BTreeSet<String>) {
    let mut undefined = BTreeSet::new();
    let rendered = substitute_inner(value, scope, &mut undefined);
    (rendered, undefined)
}

fn substitute_inner(value: &Value, scope: &Scope, undefined: &mut BTreeSet<String>) -> Value {
    match value {
        Value::String(text) => Value::String(scan(text, scope, undefined)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_inner(item, scope, undefined))
                .collect(),
        ),
        Value::Object(entries) => Value::Object(
            entries
                .iter()
                .map(|(key, entry)| (key.clone(), substitute_inner(entry, scope, undefined)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn scan(text: &str, scope: &Scope, undefined: &mut BTreeSet<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = text;

    loop {
        let Some(pos) = cursor.find('$') else {
            out.push_str(cursor);
            break;
        };
        out.push_str(&cursor[..pos]);
        let after = &cursor[pos + 1..];

        if let Some(rest) = after.strip_prefix('$') {
            out.push('$');
            cursor = rest;
        } else if let Some(body) = after.strip_prefix('{') {
            match body.find('}') {
                Some(close) if close > 0 => {
                    let token = &body[..close];
                    match resolve(token, scope) {
                        Some(value) => out.push_str(&render(&value)),
                        None => {
                            undefined.insert(token.to_string());
                            out.push_str("${");
                            out.push_str(token);
                            out.push('}');
                        }
                    }
                    cursor = &body[close + 1..];
                }
                Some(close) => {
                    // ${} stays literal
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

    out
}

/// Renders a resolved value into replacement text. Booleans become
/// `true`/`false`, numbers use their canonical decimal form, complex values
/// serialize to canonical JSON.
pub fn render(value: &Value) -> String {
    match value {
        Value::Bool(flag) => if *flag { "true" } else { "false" }.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.clone(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Resolves a single token path against the scope without any text
/// scanning. Used by the provider composer for placeholder lookup.
pub fn lookup(token: &str, scope: &Scope) -> Option<Value> {
    resolve(token, scope)
}

fn resolve(token: &str, scope: &Scope) -> Option<Value> {
    let mut parts = token.split('.');
    let namespace = parts.next()?;
    let rest: Vec<&str> = parts.collect();

    if rest.is_empty() {
        if Some(namespace) == scope.alias.as_deref() {
            return scope.item.clone();
        }
        if namespace == "item" {
            return scope.item.clone();
        }
    }

    match namespace {
        "run" => resolve_run(&scope.run, &rest),
        "loop" => resolve_loop(scope.loop_vars.as_ref()?, &rest),
        "context" => resolve_context(&scope.context, &rest),
        "steps" => resolve_steps(&scope.steps, &rest),
        "item" => walk(scope.item.as_ref()?, &rest),
        other if Some(other) == scope.alias.as_deref() => walk(scope.item.as_ref()?, &rest),
        _ => None,
    }
}

fn resolve_run(run: &RunScope, rest: &[&str]) -> Option<Value> {
    match rest {
        ["id"] => Some(Value::String(run.id.clone())),
        ["root"] => Some(Value::String(run.root.clone())),
        ["timestamp_utc"] => Some(Value::String(run.timestamp_utc.clone())),
        _ => None,
    }
}

fn resolve_loop(loop_vars: &LoopScope, rest: &[&str]) -> Option<Value> {
    match rest {
        ["index"] => Some(Value::from(loop_vars.index)),
        ["total"] => Some(Value::from(loop_vars.total)),
        _ => None,
    }
}

fn resolve_context(context: &BTreeMap<String, String>, rest: &[&str]) -> Option<Value> {
    match rest {
        [key] => context.get(*key).map(|v| Value::String(v.clone())),
        _ => None,
    }
}

fn resolve_steps(steps: &Map<String, Value>, rest: &[&str]) -> Option<Value> {
    let (step_name, path) = rest.split_first()?;
    let record = steps.get(*step_name)?;
    if path.is_empty() {
        return Some(record.clone());
    }
    walk(record, path)
}

fn walk(value: &Value, path: &[&str]) -> Option<Value> {
    let mut current = value;
    for segment in path {
        current = current.as_object()?.get(*segment)?;
    }
    Some(current.clone())
}
