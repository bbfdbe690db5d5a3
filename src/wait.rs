use crate::shared::path_safety::{self, PathSafetyError};
use crate::state::StepError;
use serde_json::json;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT_SEC: u64 = 300;
pub const DEFAULT_POLL_MS: u64 = 500;
pub const DEFAULT_MIN_COUNT: usize = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitConfig {
    pub pattern: String,
    pub timeout_sec: u64,
    pub poll_ms: u64,
    pub min_count: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    pub files: Vec<String>,
    pub wait_duration_ms: u64,
    pub poll_count: u64,
    pub timed_out: bool,
    pub exit_code: i32,
    pub error: Option<StepError>,
}

/// Blocks polling the workspace for files matching the glob until at least
/// `min_count` safe matches exist or the deadline passes.
///
/// Path-safety violations return exit 2 immediately, before any I/O.
pub fn wait_for_files(workspace: &Path, config: &WaitConfig) -> WaitOutcome {
    if let Err(violation) = path_safety::check_pattern(&config.pattern) {
        return safety_rejection(&config.pattern, &violation);
    }

    let workspace = match workspace.canonicalize() {
        Ok(root) => root,
        Err(err) => {
            return WaitOutcome {
                files: Vec::new(),
                wait_duration_ms: 0,
                poll_count: 0,
                timed_out: false,
                exit_code: 1,
                error: Some(StepError::new(
                    "execution_error",
                    format!("workspace unavailable: {err}"),
                    json!({}),
                )),
            }
        }
    };

    let start = Instant::now();
    let deadline = Duration::from_secs(config.timeout_sec);
    let interval = Duration::from_millis(config.poll_ms);
    let mut poll_count = 0u64;
    let mut matched: Vec<String> = Vec::new();

    loop {
        poll_count += 1;
        matched = poll_matches(&workspace, &config.pattern);

        if matched.len() >= config.min_count {
            let elapsed = start.elapsed().as_millis() as u64;
            return WaitOutcome {
                files: matched,
                wait_duration_ms: elapsed.max(1),
                poll_count,
                timed_out: false,
                exit_code: 0,
                error: None,
            };
        }

        if start.elapsed() + interval >= deadline {
            break;
        }
        thread::sleep(interval);
    }

    WaitOutcome {
        files: matched,
        wait_duration_ms: start.elapsed().as_millis() as u64,
        poll_count,
        timed_out: true,
        exit_code: 124,
        error: None,
    }
}

/// One directory scan: glob within the workspace, drop matches whose real
/// path escapes it, return sorted workspace-relative paths with their
/// original (symlink) spellings.
pub fn poll_matches(workspace: &Path, pattern: &str) -> Vec<String> {
    let full_pattern = workspace.join(pattern);
    let Some(full_pattern) = full_pattern.to_str() else {
        return Vec::new();
    };
    let Ok(paths) = glob::glob(full_pattern) else {
        return Vec::new();
    };

    let mut matches = Vec::new();
    for entry in paths.flatten() {
        if !path_safety::real_path_within(workspace, &entry) {
            continue;
        }
        if let Some(relative) = path_safety::workspace_relative(workspace, &entry) {
            matches.push(relative.display().to_string());
        }
    }
    matches.sort();
    matches
}

fn safety_rejection(pattern: &str, violation: &PathSafetyError) -> WaitOutcome {
    WaitOutcome {
        files: Vec::new(),
        wait_duration_ms: 0,
        poll_count: 0,
        timed_out: false,
        exit_code: 2,
        error: Some(StepError::new(
            "path_safety_error",
            violation.to_string(),
            json!({"glob_pattern": pattern}),
        )),
    }
}
