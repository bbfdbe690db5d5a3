use orchestrate::exec::{CaptureMode, OutputCapture};
use std::fs;
use std::path::Path;

fn capture_at(dir: &Path) -> OutputCapture {
    OutputCapture::new(&dir.join("logs"))
}

#[test]
fn text_under_the_cap_passes_through_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let outcome = capture_at(dir.path())
        .capture(b"E2E\n", b"", "Echo", CaptureMode::Text, None, false, 0)
        .expect("capture");
    assert_eq!(outcome.output.as_deref(), Some("E2E\n"));
    assert!(!outcome.truncated);
    assert!(!dir.path().join("logs").join("Echo.stdout").exists());
}

#[test]
fn oversized_text_truncates_and_spills_the_full_bytes() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stdout = vec![b'x'; 20_000];
    let outcome = capture_at(dir.path())
        .capture(&stdout, b"", "Big", CaptureMode::Text, None, false, 0)
        .expect("capture");

    assert!(outcome.truncated);
    let kept = outcome.output.expect("output");
    assert!(kept.len() <= 8 * 1024);
    let spilled = fs::read(dir.path().join("logs").join("Big.stdout")).expect("spill");
    assert_eq!(spilled, stdout);
}

#[test]
fn lines_normalize_crlf_and_drop_the_trailing_empty_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let outcome = capture_at(dir.path())
        .capture(
            b"one\r\ntwo\nthree\n",
            b"",
            "List",
            CaptureMode::Lines,
            None,
            false,
            0,
        )
        .expect("capture");
    assert_eq!(
        outcome.lines.expect("lines"),
        vec!["one".to_string(), "two".to_string(), "three".to_string()]
    );
    assert!(!outcome.truncated);
}

#[test]
fn line_overflow_caps_at_ten_thousand_and_spills() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stdout: Vec<u8> = (0..10_500)
        .flat_map(|i| format!("line{i}\n").into_bytes())
        .collect();
    let outcome = capture_at(dir.path())
        .capture(&stdout, b"", "Flood", CaptureMode::Lines, None, false, 0)
        .expect("capture");
    assert!(outcome.truncated);
    assert_eq!(outcome.lines.expect("lines").len(), 10_000);
    assert!(dir.path().join("logs").join("Flood.stdout").exists());
}

#[test]
fn json_mode_parses_objects() {
    let dir = tempfile::tempdir().expect("tempdir");
    let outcome = capture_at(dir.path())
        .capture(
            br#"{"files": ["a.txt"], "count": 1}"#,
            b"",
            "Parse",
            CaptureMode::Json,
            None,
            false,
            0,
        )
        .expect("capture");
    let parsed = outcome.json.expect("json");
    assert_eq!(parsed["count"], 1);
    assert_eq!(outcome.exit_code, 0);
}

#[test]
fn json_parse_failure_without_allowance_exits_two() {
    let dir = tempfile::tempdir().expect("tempdir");
    let outcome = capture_at(dir.path())
        .capture(b"not json", b"", "Parse", CaptureMode::Json, None, false, 0)
        .expect("capture");
    assert_eq!(outcome.exit_code, 2);
    let error = outcome.error.expect("error");
    assert_eq!(error.kind.as_deref(), Some("json_parse_error"));
}

#[test]
fn json_parse_failure_with_allowance_degrades_to_text() {
    let dir = tempfile::tempdir().expect("tempdir");
    let outcome = capture_at(dir.path())
        .capture(b"not json", b"", "Parse", CaptureMode::Json, None, true, 0)
        .expect("capture");
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.output.as_deref(), Some("not json"));
    let debug = outcome.debug.expect("debug");
    assert!(debug["json_parse_error"].as_str().is_some());
}

#[test]
fn json_overflow_is_exit_two_or_degrades_with_allowance() {
    let dir = tempfile::tempdir().expect("tempdir");
    let oversized = vec![b'z'; 1024 * 1024 + 1];

    let strict = capture_at(dir.path())
        .capture(&oversized, b"", "Huge", CaptureMode::Json, None, false, 0)
        .expect("capture");
    assert_eq!(strict.exit_code, 2);
    assert_eq!(
        strict.error.expect("error").kind.as_deref(),
        Some("json_overflow")
    );

    let tolerant = capture_at(dir.path())
        .capture(&oversized, b"", "Huge2", CaptureMode::Json, None, true, 0)
        .expect("capture");
    assert_eq!(tolerant.exit_code, 0);
    assert!(tolerant.truncated);
    assert!(tolerant.output.expect("output").len() <= 8 * 1024);
    let spilled = fs::read(dir.path().join("logs").join("Huge2.stdout")).expect("spill");
    assert_eq!(spilled.len(), oversized.len());
}

#[test]
fn stderr_always_lands_in_the_logs_when_non_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    capture_at(dir.path())
        .capture(b"ok", b"warning: noise", "Noisy", CaptureMode::Text, None, false, 0)
        .expect("capture");
    let stderr = fs::read_to_string(dir.path().join("logs").join("Noisy.stderr")).expect("read");
    assert_eq!(stderr, "warning: noise");
}

#[test]
fn output_file_receives_full_stdout_regardless_of_mode() {
    let dir = tempfile::tempdir().expect("tempdir");
    let stdout = vec![b'q'; 20_000];
    let target = dir.path().join("out.bin");
    let outcome = capture_at(dir.path())
        .capture(
            &stdout,
            b"",
            "Tee",
            CaptureMode::Json,
            Some(&target),
            true,
            0,
        )
        .expect("capture");
    assert_eq!(fs::read(&target).expect("tee"), stdout);
    assert_eq!(outcome.exit_code, 0);
}
