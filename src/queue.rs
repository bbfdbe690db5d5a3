use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("task file not found: {path}")]
    NotFound { path: String },
    #[error("directory {path} is outside the workspace")]
    OutsideWorkspace { path: String },
}

fn io_err(path: &Path, source: std::io::Error) -> QueueError {
    QueueError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Writes a task file atomically: staged as `<stem>.tmp` in the destination
/// directory, then renamed to the final name so consumers never observe a
/// partial task.
pub fn write_task(workspace: &Path, target: &str, content: &str) -> Result<PathBuf, QueueError> {
    let target_path = workspace.join(target);
    let parent = target_path
        .parent()
        .ok_or_else(|| QueueError::NotFound {
            path: target.to_string(),
        })?;
    fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;

    let stem = target_path
        .file_stem()
        .and_then(|v| v.to_str())
        .unwrap_or("task");
    let staging = parent.join(format!("{stem}.tmp"));

    fs::write(&staging, content).map_err(|e| io_err(&staging, e))?;
    if let Err(source) = fs::rename(&staging, &target_path) {
        let _ = fs::remove_file(&staging);
        return Err(io_err(&target_path, source));
    }
    Ok(target_path)
}

/// Moves a consumed task into `processed/<YYYYMMDDTHHMMSS>/`.
pub fn move_to_processed(workspace: &Path, task_path: &str) -> Result<PathBuf, QueueError> {
    move_task(workspace, task_path, "processed")
}

/// Moves a failed task into `failed/<YYYYMMDDTHHMMSS>/`.
pub fn move_to_failed(workspace: &Path, task_path: &str) -> Result<PathBuf, QueueError> {
    move_task(workspace, task_path, "failed")
}

fn move_task(workspace: &Path, task_path: &str, dest_dir: &str) -> Result<PathBuf, QueueError> {
    let source = workspace.join(task_path);
    if !source.exists() {
        return Err(QueueError::NotFound {
            path: task_path.to_string(),
        });
    }

    let timestamp = Utc::now().format("%Y%m%dT%H%M%S").to_string();
    let dest_parent = workspace.join(dest_dir).join(timestamp);
    fs::create_dir_all(&dest_parent).map_err(|e| io_err(&dest_parent, e))?;

    let file_name = source.file_name().ok_or_else(|| QueueError::NotFound {
        path: task_path.to_string(),
    })?;
    let dest = dest_parent.join(file_name);
    fs::rename(&source, &dest).map_err(|e| io_err(&dest, e))?;
    Ok(dest)
}

/// Lists task files in a directory, sorted for deterministic ordering.
pub fn list_tasks(
    workspace: &Path,
    directory: &str,
    extension: &str,
) -> Result<Vec<String>, QueueError> {
    let target = workspace.join(directory);
    if !target.exists() {
        return Ok(Vec::new());
    }

    let mut tasks = Vec::new();
    let entries = fs::read_dir(&target).map_err(|e| io_err(&target, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(&target, e))?;
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let matches = path
            .file_name()
            .and_then(|v| v.to_str())
            .is_some_and(|name| name.ends_with(extension));
        if matches {
            if let Ok(relative) = path.strip_prefix(workspace) {
                tasks.push(relative.display().to_string());
            }
        }
    }
    tasks.sort();
    Ok(tasks)
}

/// Empties a directory inside the workspace, keeping the directory itself.
pub fn clean_directory(workspace: &Path, directory: &str) -> Result<usize, QueueError> {
    let target = workspace.join(directory);
    ensure_within_workspace(workspace, &target)?;

    if !target.exists() {
        return Ok(0);
    }

    let mut removed = 0usize;
    let entries = fs::read_dir(&target).map_err(|e| io_err(&target, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(&target, e))?;
        let path = entry.path();
        if path.is_dir() {
            fs::remove_dir_all(&path).map_err(|e| io_err(&path, e))?;
        } else {
            fs::remove_file(&path).map_err(|e| io_err(&path, e))?;
        }
        removed += 1;
    }
    Ok(removed)
}

/// Copies a workspace directory tree to an archive destination.
pub fn archive_directory(
    workspace: &Path,
    directory: &str,
    dest: &Path,
) -> Result<PathBuf, QueueError> {
    let source = workspace.join(directory);
    ensure_within_workspace(workspace, &source)?;
    if !source.exists() {
        fs::create_dir_all(&source).map_err(|e| io_err(&source, e))?;
    }

    copy_tree(&source, dest)?;
    Ok(dest.to_path_buf())
}

fn copy_tree(source: &Path, dest: &Path) -> Result<(), QueueError> {
    fs::create_dir_all(dest).map_err(|e| io_err(dest, e))?;
    let entries = fs::read_dir(source).map_err(|e| io_err(source, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(source, e))?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if from.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to).map_err(|e| io_err(&to, e))?;
        }
    }
    Ok(())
}

fn ensure_within_workspace(workspace: &Path, target: &Path) -> Result<(), QueueError> {
    let workspace = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    let resolved = match target.canonicalize() {
        Ok(resolved) => resolved,
        // A not-yet-existing target is judged by its lexical location.
        Err(_) => target.to_path_buf(),
    };
    if resolved.starts_with(&workspace) {
        Ok(())
    } else {
        Err(QueueError::OutsideWorkspace {
            path: target.display().to_string(),
        })
    }
}
