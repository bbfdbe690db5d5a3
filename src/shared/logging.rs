use chrono::Utc;
use std::fs;
use std::io::Write;
use std::path::Path;

/// Appends a structured event line to `<logs_dir>/events.jsonl`.
///
/// Best-effort: logging must never fail a run, so errors are swallowed.
pub fn append_run_event(logs_dir: &Path, level: &str, event: &str, message: &str) {
    let _ = fs::create_dir_all(logs_dir);
    let payload = serde_json::json!({
        "timestamp": Utc::now().to_rfc3339(),
        "level": level,
        "event": event,
        "message": message,
    });

    let Ok(line) = serde_json::to_string(&payload) else {
        return;
    };

    let path = logs_dir.join("events.jsonl");
    let _ = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(format!("{line}\n").as_bytes()));
}
