use orchestrate::wait::{wait_for_files, WaitConfig};
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

fn config(pattern: &str, timeout_sec: u64) -> WaitConfig {
    WaitConfig {
        pattern: pattern.to_string(),
        timeout_sec,
        poll_ms: 50,
        min_count: 1,
    }
}

#[test]
fn existing_matches_return_immediately_sorted() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("inbox")).expect("mkdir");
    fs::write(dir.path().join("inbox/b.task"), b"").expect("write");
    fs::write(dir.path().join("inbox/a.task"), b"").expect("write");

    let outcome = wait_for_files(dir.path(), &config("inbox/*.task", 5));
    assert_eq!(outcome.exit_code, 0);
    assert!(!outcome.timed_out);
    assert_eq!(outcome.files, vec!["inbox/a.task", "inbox/b.task"]);
    assert!(outcome.wait_duration_ms >= 1);
    assert!(outcome.poll_count >= 1);
}

#[test]
fn a_file_arriving_mid_poll_satisfies_the_wait() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("drop")).expect("mkdir");

    let workspace = dir.path().to_path_buf();
    let producer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(200));
        fs::write(workspace.join("drop/ready.txt"), b"go").expect("produce");
    });

    let outcome = wait_for_files(dir.path(), &config("drop/*.txt", 5));
    producer.join().expect("producer");
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.files, vec!["drop/ready.txt"]);
    assert!(outcome.poll_count >= 2);
}

#[test]
fn deadline_exceeded_returns_124_with_the_partial_list() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("queue")).expect("mkdir");
    fs::write(dir.path().join("queue/only.task"), b"").expect("write");

    let outcome = wait_for_files(
        dir.path(),
        &WaitConfig {
            pattern: "queue/*.task".to_string(),
            timeout_sec: 1,
            poll_ms: 100,
            min_count: 3,
        },
    );
    assert_eq!(outcome.exit_code, 124);
    assert!(outcome.timed_out);
    assert_eq!(outcome.files, vec!["queue/only.task"]);
}

#[test]
fn unsafe_patterns_are_rejected_before_any_polling() {
    let dir = tempfile::tempdir().expect("tempdir");

    for pattern in ["/etc/*.conf", "../sibling/*.txt"] {
        let outcome = wait_for_files(dir.path(), &config(pattern, 5));
        assert_eq!(outcome.exit_code, 2, "pattern {pattern}");
        assert_eq!(outcome.poll_count, 0);
        assert_eq!(outcome.wait_duration_ms, 0);
        let error = outcome.error.expect("error");
        assert_eq!(error.kind.as_deref(), Some("path_safety_error"));
        assert_eq!(error.context["glob_pattern"], pattern);
    }
}

#[cfg(unix)]
#[test]
fn symlinks_escaping_the_workspace_are_excluded() {
    let outside = tempfile::tempdir().expect("outside");
    fs::write(outside.path().join("secret.txt"), b"x").expect("write");

    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("links")).expect("mkdir");
    std::os::unix::fs::symlink(
        outside.path().join("secret.txt"),
        dir.path().join("links/escape.txt"),
    )
    .expect("symlink");
    fs::write(dir.path().join("links/inside.txt"), b"ok").expect("write");

    let outcome = wait_for_files(dir.path(), &config("links/*.txt", 1));
    assert_eq!(outcome.files, vec!["links/inside.txt"]);
}

#[cfg(unix)]
#[test]
fn internal_symlink_spellings_are_preserved() {
    let dir = tempfile::tempdir().expect("tempdir");
    fs::create_dir_all(dir.path().join("real")).expect("mkdir");
    fs::write(dir.path().join("real/data.txt"), b"x").expect("write");
    std::os::unix::fs::symlink(
        dir.path().join("real/data.txt"),
        dir.path().join("alias.txt"),
    )
    .expect("symlink");

    let outcome = wait_for_files(dir.path(), &config("alias.txt", 1));
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.files, vec!["alias.txt"]);
}
