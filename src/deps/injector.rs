use serde_json::{json, Value};
use std::fs;
use std::path::Path;

/// Hard cap on injected content, prompt excluded.
pub const MAX_INJECTION_BYTES: usize = 256 * 1024;

/// Below this many remaining bytes a truncated file tail is not worth
/// emitting; the file is omitted instead.
const MIN_USEFUL_TAIL: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectMode {
    List,
    Content,
    None,
}

impl InjectMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "list" => Some(Self::List),
            "content" => Some(Self::Content),
            "none" => Some(Self::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectPosition {
    Prepend,
    Append,
}

impl InjectPosition {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "prepend" => Some(Self::Prepend),
            "append" => Some(Self::Append),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectSpec {
    pub mode: InjectMode,
    pub position: InjectPosition,
    pub instruction: Option<String>,
}

impl InjectSpec {
    /// `inject: true` shorthand.
    pub fn shorthand() -> Self {
        Self {
            mode: InjectMode::List,
            position: InjectPosition::Prepend,
            instruction: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InjectionOutcome {
    pub prompt: String,
    pub truncated: bool,
    /// `debug.injection` payload when any truncation happened.
    pub details: Option<Value>,
}

/// Composes the modified prompt in memory; the source files are never
/// touched.
pub fn inject(
    workspace: &Path,
    prompt: &str,
    files: &[String],
    spec: &InjectSpec,
    is_required: bool,
) -> InjectionOutcome {
    let instruction = spec
        .instruction
        .clone()
        .unwrap_or_else(|| default_instruction(spec.mode, is_required));

    let (block, truncated, details) = match spec.mode {
        InjectMode::List => render_list(files, &instruction),
        InjectMode::Content => render_content(workspace, files, &instruction),
        InjectMode::None => {
            return InjectionOutcome {
                prompt: prompt.to_string(),
                truncated: false,
                details: None,
            }
        }
    };

    let prompt = match spec.position {
        InjectPosition::Prepend if prompt.is_empty() => block,
        InjectPosition::Prepend => format!("{block}\n\n{prompt}"),
        InjectPosition::Append if prompt.is_empty() => block,
        InjectPosition::Append => format!("{prompt}\n\n{block}"),
    };

    InjectionOutcome {
        prompt,
        truncated,
        details,
    }
}

fn default_instruction(mode: InjectMode, is_required: bool) -> String {
    let dep_kind = if is_required { "required" } else { "optional" };
    match mode {
        InjectMode::List => format!("The following {dep_kind} files are available:"),
        InjectMode::Content => format!("Content from {dep_kind} dependencies:"),
        InjectMode::None => format!("Dependencies ({dep_kind}):"),
    }
}

fn render_list(files: &[String], instruction: &str) -> (String, bool, Option<Value>) {
    let full: String = std::iter::once(instruction.to_string())
        .chain(files.iter().map(|file| format!("  - {file}")))
        .collect::<Vec<_>>()
        .join("\n");

    if full.len() <= MAX_INJECTION_BYTES {
        return (full, false, None);
    }

    let mut lines = vec![instruction.to_string()];
    let mut emitted = instruction.len();
    let mut files_shown = 0usize;
    for file in files {
        let line = format!("  - {file}\n");
        if emitted + line.len() > MAX_INJECTION_BYTES {
            break;
        }
        emitted += line.len();
        lines.push(format!("  - {file}"));
        files_shown += 1;
    }
    let files_omitted = files.len() - files_shown;
    lines.push(format!(
        "  ... ({files_omitted} files omitted due to size limit)"
    ));

    let details = json!({
        "total_size": full.len(),
        "shown_size": emitted,
        "files_shown": files_shown,
        "files_truncated": 0,
        "files_omitted": files_omitted,
    });
    (lines.join("\n"), true, Some(details))
}

fn render_content(
    workspace: &Path,
    files: &[String],
    instruction: &str,
) -> (String, bool, Option<Value>) {
    let mut sections = vec![instruction.to_string()];
    let mut emitted = instruction.len();
    let mut total_size = 0usize;
    let mut shown_size = 0usize;
    let mut files_shown = 0usize;
    let mut files_truncated = 0usize;
    let mut files_omitted = 0usize;
    let mut truncated = false;

    let mut pending = files.iter().peekable();
    while let Some(file) = pending.next() {
        let Ok(content) = fs::read_to_string(workspace.join(file)) else {
            continue;
        };
        let file_size = content.len();
        total_size += file_size;

        // Reserve room for the size annotation in the header.
        let header_prefix = format!("\n=== File: {file} ");
        let header_reserve = header_prefix.len() + 20;

        if emitted + header_reserve + file_size > MAX_INJECTION_BYTES {
            truncated = true;
            let remaining = MAX_INJECTION_BYTES.saturating_sub(emitted + header_reserve);
            if remaining < MIN_USEFUL_TAIL {
                files_omitted += 1 + pending.count();
                break;
            }
            let tail = truncate_utf8(&content, remaining);
            sections.push(format!("{header_prefix}({}/{file_size} bytes) ===", tail.len()));
            sections.push(tail.to_string());
            sections.push("... (truncated)".to_string());
            files_shown += 1;
            files_truncated += 1;
            shown_size += tail.len();
            emitted += header_reserve + tail.len();
            files_omitted += pending.count();
            break;
        }

        sections.push(format!("{header_prefix}({file_size}/{file_size} bytes) ==="));
        sections.push(content);
        files_shown += 1;
        shown_size += file_size;
        emitted += header_reserve + file_size;
    }

    if truncated {
        sections.push(format!(
            "\n... Injection truncated at {MAX_INJECTION_BYTES} bytes. \
             Files: {files_shown} shown, {files_truncated} truncated, {files_omitted} omitted."
        ));
    }

    let details = truncated.then(|| {
        json!({
            "total_size": total_size,
            "shown_size": shown_size,
            "files_shown": files_shown,
            "files_truncated": files_truncated,
            "files_omitted": files_omitted,
        })
    });

    (sections.join("\n"), truncated, details)
}

fn truncate_utf8(text: &str, limit: usize) -> &str {
    if text.len() <= limit {
        return text;
    }
    let mut end = limit;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
