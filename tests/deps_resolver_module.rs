use orchestrate::deps::resolve_dependencies;
use orchestrate::variables::Scope;
use std::fs;
use std::path::Path;

fn seed(workspace: &Path, files: &[&str]) {
    for file in files {
        let path = workspace.join(file);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, b"content").expect("write");
    }
}

fn strings(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

#[test]
fn required_and_optional_patterns_expand_dedupe_and_sort() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed(dir.path(), &["specs/b.md", "specs/a.md", "notes/x.txt"]);

    let resolution = resolve_dependencies(
        dir.path(),
        &strings(&["specs/*.md"]),
        &strings(&["specs/a.md", "notes/*.txt"]),
        &Scope::default(),
    )
    .expect("resolve");

    assert!(resolution.is_valid());
    assert_eq!(
        resolution.files(),
        vec!["notes/x.txt", "specs/a.md", "specs/b.md"]
    );
    assert_eq!(
        resolution.patterns_used.get("specs/*.md").map(Vec::len),
        Some(2)
    );
}

#[test]
fn a_required_pattern_without_matches_invalidates_the_resolution() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed(dir.path(), &["present/a.txt"]);

    let resolution = resolve_dependencies(
        dir.path(),
        &strings(&["present/*.txt", "absent/*.txt"]),
        &[],
        &Scope::default(),
    )
    .expect("resolve");

    assert!(!resolution.is_valid());
    assert_eq!(resolution.missing_required, vec!["absent/*.txt"]);
    assert_eq!(resolution.files(), vec!["present/a.txt"]);
}

#[test]
fn missing_optional_patterns_are_silently_omitted() {
    let dir = tempfile::tempdir().expect("tempdir");
    let resolution = resolve_dependencies(
        dir.path(),
        &[],
        &strings(&["nothing/*.bin"]),
        &Scope::default(),
    )
    .expect("resolve");
    assert!(resolution.is_valid());
    assert!(resolution.files().is_empty());
}

#[test]
fn variables_substitute_into_patterns_before_matching() {
    let dir = tempfile::tempdir().expect("tempdir");
    seed(dir.path(), &["reports/prod/summary.md"]);

    let mut scope = Scope::default();
    scope
        .context
        .insert("env".to_string(), "prod".to_string());

    let resolution = resolve_dependencies(
        dir.path(),
        &strings(&["reports/${context.env}/*.md"]),
        &[],
        &scope,
    )
    .expect("resolve");
    assert_eq!(resolution.files(), vec!["reports/prod/summary.md"]);
}

#[test]
fn absolute_and_traversal_patterns_are_hard_errors() {
    let dir = tempfile::tempdir().expect("tempdir");
    assert!(resolve_dependencies(dir.path(), &strings(&["/etc/*"]), &[], &Scope::default())
        .is_err());
    assert!(resolve_dependencies(
        dir.path(),
        &[],
        &strings(&["../elsewhere/*"]),
        &Scope::default()
    )
    .is_err());
}

#[cfg(unix)]
#[test]
fn symlink_escapes_are_dropped_from_matches() {
    let outside = tempfile::tempdir().expect("outside");
    fs::write(outside.path().join("leak.md"), b"secret").expect("write");

    let dir = tempfile::tempdir().expect("tempdir");
    seed(dir.path(), &["docs/safe.md"]);
    std::os::unix::fs::symlink(
        outside.path().join("leak.md"),
        dir.path().join("docs/leak.md"),
    )
    .expect("symlink");

    let resolution = resolve_dependencies(
        dir.path(),
        &strings(&["docs/*.md"]),
        &[],
        &Scope::default(),
    )
    .expect("resolve");
    assert_eq!(resolution.files(), vec!["docs/safe.md"]);
}
