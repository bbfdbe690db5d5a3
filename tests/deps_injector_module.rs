use orchestrate::deps::{inject, InjectMode, InjectPosition, InjectSpec};
use std::fs;
use std::path::Path;

fn seed(workspace: &Path, file: &str, content: &str) {
    let path = workspace.join(file);
    fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
    fs::write(path, content).expect("write");
}

fn strings(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

#[test]
fn list_mode_prepends_a_header_and_bullet_lines() {
    let dir = tempfile::tempdir().expect("tempdir");
    let outcome = inject(
        dir.path(),
        "Summarize the inputs.",
        &strings(&["data/a.txt", "data/b.txt"]),
        &InjectSpec::shorthand(),
        true,
    );
    assert!(!outcome.truncated);
    assert!(outcome
        .prompt
        .starts_with("The following required files are available:"));
    assert!(outcome.prompt.contains("  - data/a.txt"));
    assert!(outcome.prompt.contains("  - data/b.txt"));
    assert!(outcome.prompt.ends_with("Summarize the inputs."));
}

#[test]
fn append_position_places_the_block_after_the_prompt() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = InjectSpec {
        mode: InjectMode::List,
        position: InjectPosition::Append,
        instruction: Some("Inputs:".to_string()),
    };
    let outcome = inject(dir.path(), "Original prompt.", &strings(&["x.txt"]), &spec, false);
    assert!(outcome.prompt.starts_with("Original prompt.\n\nInputs:"));
}

#[test]
fn content_mode_emits_file_sections_with_size_annotations() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed(dir.path(), "notes/one.md", "alpha");
    seed(dir.path(), "notes/two.md", "beta!");

    let spec = InjectSpec {
        mode: InjectMode::Content,
        position: InjectPosition::Prepend,
        instruction: None,
    };
    let outcome = inject(
        dir.path(),
        "Use the notes.",
        &strings(&["notes/one.md", "notes/two.md"]),
        &spec,
        true,
    );
    assert!(!outcome.truncated);
    assert!(outcome.prompt.contains("=== File: notes/one.md (5/5 bytes) ==="));
    assert!(outcome.prompt.contains("alpha"));
    assert!(outcome.prompt.contains("=== File: notes/two.md (5/5 bytes) ==="));
    assert!(outcome.prompt.ends_with("Use the notes."));
}

#[test]
fn content_mode_truncates_the_last_file_at_the_cap() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed(dir.path(), "big/first.txt", &"a".repeat(200 * 1024));
    seed(dir.path(), "big/second.txt", &"b".repeat(200 * 1024));
    seed(dir.path(), "big/third.txt", "tail");

    let spec = InjectSpec {
        mode: InjectMode::Content,
        position: InjectPosition::Prepend,
        instruction: None,
    };
    let outcome = inject(
        dir.path(),
        "",
        &strings(&["big/first.txt", "big/second.txt", "big/third.txt"]),
        &spec,
        true,
    );

    assert!(outcome.truncated);
    assert!(outcome.prompt.contains("... (truncated)"));
    let details = outcome.details.expect("details");
    assert_eq!(details["files_shown"], 2);
    assert_eq!(details["files_truncated"], 1);
    assert_eq!(details["files_omitted"], 1);
    // Only files actually read count toward total_size; the omitted tail
    // file is never opened.
    assert_eq!(details["total_size"], 200 * 1024 + 200 * 1024);
    assert!(outcome.prompt.len() <= 300 * 1024);
}

#[test]
fn list_mode_overflow_reports_the_omitted_count() {
    let dir = tempfile::tempdir().expect("tempdir");
    let long_name = format!("dir/{}.txt", "n".repeat(200));
    let files: Vec<String> = (0..2000).map(|i| format!("{long_name}{i}")).collect();

    let outcome = inject(dir.path(), "p", &files, &InjectSpec::shorthand(), true);
    assert!(outcome.truncated);
    assert!(outcome.prompt.contains("files omitted due to size limit"));
    let details = outcome.details.expect("details");
    let shown = details["files_shown"].as_u64().expect("shown");
    let omitted = details["files_omitted"].as_u64().expect("omitted");
    assert_eq!(shown + omitted, 2000);
    assert!(omitted > 0);
}

#[test]
fn none_mode_leaves_the_prompt_untouched() {
    let dir = tempfile::tempdir().expect("tempdir");
    let spec = InjectSpec {
        mode: InjectMode::None,
        position: InjectPosition::Prepend,
        instruction: None,
    };
    let outcome = inject(dir.path(), "unchanged", &strings(&["a.txt"]), &spec, true);
    assert_eq!(outcome.prompt, "unchanged");
    assert!(outcome.details.is_none());
}

#[test]
fn source_files_are_never_modified_by_injection() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed(dir.path(), "src/data.txt", "pristine");
    let spec = InjectSpec {
        mode: InjectMode::Content,
        position: InjectPosition::Prepend,
        instruction: None,
    };
    inject(dir.path(), "prompt", &strings(&["src/data.txt"]), &spec, true);
    assert_eq!(
        fs::read_to_string(dir.path().join("src/data.txt")).expect("read"),
        "pristine"
    );
}
