use crate::state::StepError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub const TEXT_LIMIT_BYTES: usize = 8 * 1024;
pub const LINES_LIMIT: usize = 10_000;
pub const JSON_BUFFER_LIMIT: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureMode {
    Text,
    Lines,
    Json,
}

impl CaptureMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "lines" => Some(Self::Lines),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Distilled stdout for the state document, plus the capture-level exit
/// code override (JSON failures force exit 2 unless `allow_parse_error`).
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureOutcome {
    pub exit_code: i32,
    pub output: Option<String>,
    pub lines: Option<Vec<String>>,
    pub json: Option<Value>,
    pub truncated: bool,
    pub error: Option<StepError>,
    pub debug: Option<Value>,
}

impl CaptureOutcome {
    fn passthrough(exit_code: i32) -> Self {
        Self {
            exit_code,
            output: None,
            lines: None,
            json: None,
            truncated: false,
            error: None,
            debug: None,
        }
    }
}

pub struct OutputCapture {
    logs_dir: PathBuf,
}

impl OutputCapture {
    pub fn new(logs_dir: &Path) -> Self {
        Self {
            logs_dir: logs_dir.to_path_buf(),
        }
    }

    /// Processes raw stdout into the requested mode with size caps.
    ///
    /// Stderr always spills to `logs/<step>.stderr` when non-empty, and the
    /// full raw stdout is teed to `output_file` when given, regardless of
    /// mode, caps, or parse outcome.
    #[allow(clippy::too_many_arguments)]
    pub fn capture(
        &self,
        stdout: &[u8],
        stderr: &[u8],
        step_name: &str,
        mode: CaptureMode,
        output_file: Option<&Path>,
        allow_parse_error: bool,
        exit_code: i32,
    ) -> Result<CaptureOutcome, CaptureError> {
        if !stderr.is_empty() {
            self.write_log(&format!("{step_name}.stderr"), stderr)?;
        }
        if let Some(target) = output_file {
            write_file(target, stdout)?;
        }

        let text = String::from_utf8_lossy(stdout);

        match mode {
            CaptureMode::Text => self.capture_text(&text, stdout, step_name, exit_code),
            CaptureMode::Lines => self.capture_lines(&text, stdout, step_name, exit_code),
            CaptureMode::Json => {
                self.capture_json(&text, stdout, step_name, allow_parse_error, exit_code)
            }
        }
    }

    fn capture_text(
        &self,
        text: &str,
        raw_stdout: &[u8],
        step_name: &str,
        exit_code: i32,
    ) -> Result<CaptureOutcome, CaptureError> {
        let mut outcome = CaptureOutcome::passthrough(exit_code);
        if text.len() > TEXT_LIMIT_BYTES {
            outcome.truncated = true;
            outcome.output = Some(truncate_utf8(text, TEXT_LIMIT_BYTES).to_string());
            self.write_log(&format!("{step_name}.stdout"), raw_stdout)?;
        } else {
            outcome.output = Some(text.to_string());
        }
        Ok(outcome)
    }

    fn capture_lines(
        &self,
        text: &str,
        raw_stdout: &[u8],
        step_name: &str,
        exit_code: i32,
    ) -> Result<CaptureOutcome, CaptureError> {
        let normalized = text.replace("\r\n", "\n");
        let mut lines: Vec<String> = normalized.split('\n').map(str::to_string).collect();
        if lines.last().is_some_and(|line| line.is_empty()) {
            lines.pop();
        }

        let mut outcome = CaptureOutcome::passthrough(exit_code);
        if lines.len() > LINES_LIMIT {
            outcome.truncated = true;
            lines.truncate(LINES_LIMIT);
            self.write_log(&format!("{step_name}.stdout"), raw_stdout)?;
        }
        outcome.lines = Some(lines);
        Ok(outcome)
    }

    fn capture_json(
        &self,
        text: &str,
        raw_stdout: &[u8],
        step_name: &str,
        allow_parse_error: bool,
        exit_code: i32,
    ) -> Result<CaptureOutcome, CaptureError> {
        if raw_stdout.len() > JSON_BUFFER_LIMIT {
            let message = format!(
                "JSON buffer overflow: {} bytes exceeds 1 MiB limit",
                raw_stdout.len()
            );
            if allow_parse_error {
                self.write_log(&format!("{step_name}.stdout"), raw_stdout)?;
                let mut outcome = CaptureOutcome::passthrough(0);
                outcome.output = Some(truncate_utf8(text, TEXT_LIMIT_BYTES).to_string());
                outcome.truncated = true;
                outcome.debug = Some(json!({"json_parse_error": message}));
                return Ok(outcome);
            }
            let mut outcome = CaptureOutcome::passthrough(2);
            outcome.error = Some(StepError::new(
                "json_overflow",
                message,
                json!({"buffer_size": raw_stdout.len(), "limit": JSON_BUFFER_LIMIT}),
            ));
            return Ok(outcome);
        }

        match serde_json::from_str::<Value>(text) {
            Ok(value) => {
                let mut outcome = CaptureOutcome::passthrough(exit_code);
                outcome.json = Some(value);
                Ok(outcome)
            }
            Err(err) if allow_parse_error => {
                let mut outcome = CaptureOutcome::passthrough(0);
                if text.len() > TEXT_LIMIT_BYTES {
                    outcome.truncated = true;
                    outcome.output = Some(truncate_utf8(text, TEXT_LIMIT_BYTES).to_string());
                    self.write_log(&format!("{step_name}.stdout"), raw_stdout)?;
                } else {
                    outcome.output = Some(text.to_string());
                }
                outcome.debug = Some(json!({"json_parse_error": err.to_string()}));
                Ok(outcome)
            }
            Err(err) => {
                let mut outcome = CaptureOutcome::passthrough(2);
                outcome.error = Some(StepError::new(
                    "json_parse_error",
                    format!("failed to parse JSON: {err}"),
                    json!({}),
                ));
                Ok(outcome)
            }
        }
    }

    fn write_log(&self, file_name: &str, content: &[u8]) -> Result<(), CaptureError> {
        write_file(&self.logs_dir.join(file_name), content)
    }
}

fn write_file(path: &Path, content: &[u8]) -> Result<(), CaptureError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| CaptureError::Write {
            path: parent.display().to_string(),
            source,
        })?;
    }
    fs::write(path, content).map_err(|source| CaptureError::Write {
        path: path.display().to_string(),
        source,
    })
}

/// Longest prefix of `text` that fits `limit` bytes without splitting a
/// multi-byte character.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_truncation_never_splits_characters() {
        let text = "é".repeat(5000); // 2 bytes each
        let cut = truncate_utf8(&text, TEXT_LIMIT_BYTES);
        assert!(cut.len() <= TEXT_LIMIT_BYTES);
        assert!(cut.chars().all(|c| c == 'é'));
    }
}
