use std::path::{Component, Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PathSafetyError {
    #[error("absolute paths not allowed: {pattern}")]
    Absolute { pattern: String },
    #[error("parent directory traversal ('..') not allowed: {pattern}")]
    ParentTraversal { pattern: String },
}

/// Rejects absolute patterns and any pattern containing a `..` segment.
///
/// Patterns still carrying `${` variable tokens are deferred; they must be
/// re-checked after substitution.
pub fn check_pattern(pattern: &str) -> Result<(), PathSafetyError> {
    if pattern.contains("${") {
        return Ok(());
    }
    let path = Path::new(pattern);
    if path.is_absolute() {
        return Err(PathSafetyError::Absolute {
            pattern: pattern.to_string(),
        });
    }
    if path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(PathSafetyError::ParentTraversal {
            pattern: pattern.to_string(),
        });
    }
    Ok(())
}

/// True when `candidate`'s real (symlink-resolved) path lies inside the
/// already-canonicalized workspace root.
pub fn real_path_within(workspace: &Path, candidate: &Path) -> bool {
    match candidate.canonicalize() {
        Ok(resolved) => resolved.starts_with(workspace),
        Err(_) => false,
    }
}

/// Strips the workspace prefix, returning the match as seen (symlink
/// spellings preserved). Returns None for paths outside the workspace.
pub fn workspace_relative(workspace: &Path, candidate: &Path) -> Option<PathBuf> {
    candidate
        .strip_prefix(workspace)
        .ok()
        .map(|p| p.to_path_buf())
}
