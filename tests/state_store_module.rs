use orchestrate::shared::ids;
use orchestrate::state::{RunState, RunStatus, StateStore, StepError, StepRecord};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

fn write_workflow(workspace: &Path) -> String {
    let body = "version: \"1.1\"\nsteps:\n  - name: Echo\n    command: echo hi\n";
    fs::write(workspace.join("wf.yaml"), body).expect("write workflow");
    "wf.yaml".to_string()
}

fn init_store(workspace: &Path, backups: bool) -> StateStore {
    let workflow = write_workflow(workspace);
    let mut store = StateStore::new(workspace, None, backups, false);
    store
        .initialize(&workflow, BTreeMap::new())
        .expect("initialize");
    store
}

#[test]
fn initialize_creates_run_layout_and_checksummed_state() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = init_store(dir.path(), false);

    assert!(ids::is_valid_run_id(store.run_id()));
    let run_root = dir
        .path()
        .join(".orchestrate")
        .join("runs")
        .join(store.run_id());
    assert!(run_root.join("state.json").exists());
    assert!(run_root.join("logs").is_dir());

    let raw = fs::read_to_string(run_root.join("state.json")).expect("read state");
    let state: RunState = serde_json::from_str(&raw).expect("parse state");
    assert_eq!(state.run_id, store.run_id());
    assert_eq!(state.workflow_file, "wf.yaml");
    assert!(state.workflow_checksum.starts_with("sha256:"));
    assert_eq!(state.status, RunStatus::Running);
    assert_eq!(state.run_root.as_deref(), Some(run_root.to_str().unwrap()));
}

#[test]
fn step_updates_persist_atomically_and_reload() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = init_store(dir.path(), false);

    let mut record = StepRecord::with_status(orchestrate::state::StepStatus::Completed);
    record.exit_code = Some(0);
    record.output = Some("hello".to_string());
    store.update_step("Echo", &record).expect("update step");

    let mut reloaded = StateStore::new(
        dir.path(),
        Some(store.run_id().to_string()),
        false,
        false,
    );
    reloaded.load().expect("load");
    let fetched = reloaded.step_record("Echo").expect("step record");
    assert_eq!(fetched.output.as_deref(), Some("hello"));
    assert!(fetched.is_terminal());

    // No stray temp files are left behind by the atomic write.
    let leftovers: Vec<_> = fs::read_dir(store.run_root())
        .expect("read run root")
        .flatten()
        .filter(|entry| entry.file_name().to_string_lossy().contains(".tmp-"))
        .collect();
    assert!(leftovers.is_empty());
}

#[test]
fn updated_at_moves_forward_with_every_persist() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = init_store(dir.path(), false);
    let first = store.state().expect("state").updated_at.clone();

    thread::sleep(Duration::from_millis(5));
    store
        .update_step("Echo", &StepRecord::skipped())
        .expect("update");
    let second = store.state().expect("state").updated_at.clone();

    let first = chrono::DateTime::parse_from_rfc3339(&first).expect("parse first");
    let second = chrono::DateTime::parse_from_rfc3339(&second).expect("parse second");
    assert!(second > first);
}

#[test]
fn backup_rotation_keeps_only_the_newest_three() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = init_store(dir.path(), true);

    for name in ["One", "Two", "Three", "Four", "Five"] {
        store.backup_state(name).expect("backup");
        store
            .update_step(name, &StepRecord::skipped())
            .expect("update");
        thread::sleep(Duration::from_millis(5));
    }

    let backups: Vec<String> = fs::read_dir(store.run_root())
        .expect("read run root")
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| name.starts_with("state.json.step_") && name.ends_with(".bak"))
        .collect();
    assert_eq!(backups.len(), 3);
    for survivor in ["Three", "Four", "Five"] {
        assert!(
            backups
                .iter()
                .any(|name| name.contains(&format!("step_{survivor}."))),
            "expected backup for {survivor}, got {backups:?}"
        );
    }
}

#[test]
fn repair_restores_the_newest_parseable_backup() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = init_store(dir.path(), true);

    let mut record = StepRecord::with_status(orchestrate::state::StepStatus::Completed);
    record.exit_code = Some(0);
    store.update_step("First", &record).expect("update");
    store.backup_state("Second").expect("backup");

    let state_path = store.run_root().join("state.json");
    fs::write(&state_path, b"{ not json").expect("corrupt state");

    let mut broken = StateStore::new(
        dir.path(),
        Some(store.run_id().to_string()),
        false,
        false,
    );
    assert!(broken.load().is_err());
    broken.attempt_repair().expect("repair");

    let repaired = broken.step_record("First").expect("restored record");
    assert_eq!(repaired.exit_code, Some(0));
    let reread: RunState =
        serde_json::from_str(&fs::read_to_string(&state_path).expect("read")).expect("parse");
    assert_eq!(reread.run_id, store.run_id());
}

#[test]
fn repair_fails_when_no_backup_parses() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = init_store(dir.path(), true);
    store.backup_state("Only").expect("backup");

    let backup = store.run_root().join("state.json.step_Only.bak");
    fs::write(&backup, b"garbage").expect("corrupt backup");
    fs::write(store.run_root().join("state.json"), b"garbage").expect("corrupt state");

    let mut broken = StateStore::new(
        dir.path(),
        Some(store.run_id().to_string()),
        false,
        false,
    );
    assert!(broken.load().is_err());
    assert!(broken.attempt_repair().is_err());
}

#[test]
fn checksum_validation_detects_workflow_edits() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = init_store(dir.path(), false);
    let workflow_path = dir.path().join("wf.yaml");

    assert!(store.validate_checksum(&workflow_path).expect("validate"));

    fs::write(
        &workflow_path,
        "version: \"1.1\"\nsteps:\n  - name: Changed\n    command: echo other\n",
    )
    .expect("rewrite workflow");
    assert!(!store.validate_checksum(&workflow_path).expect("validate"));
}

#[test]
fn step_error_round_trips_through_the_document() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut store = init_store(dir.path(), false);

    let record = StepRecord::failed(
        2,
        StepError::new(
            "missing_secrets",
            "missing required secrets: API_KEY",
            json!({"missing_secrets": ["API_KEY"]}),
        ),
    );
    store.update_step("Guard", &record).expect("update");

    let fetched = store.step_record("Guard").expect("record");
    let error = fetched.error.expect("error");
    assert_eq!(error.kind.as_deref(), Some("missing_secrets"));
    assert_eq!(error.context["missing_secrets"][0], "API_KEY");
}
