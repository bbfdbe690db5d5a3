use crate::shared::path_safety::{self, PathSafetyError};
use crate::variables::{self, Scope};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Outcome of expanding a step's dependency patterns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DependencyResolution {
    pub required_files: Vec<String>,
    pub optional_files: Vec<String>,
    /// Substituted required patterns that matched nothing.
    pub missing_required: Vec<String>,
    /// Substituted pattern -> matched files, echoed for observability.
    pub patterns_used: BTreeMap<String, Vec<String>>,
}

impl DependencyResolution {
    pub fn is_valid(&self) -> bool {
        self.missing_required.is_empty()
    }

    /// The combined dependency set, deduplicated and sorted.
    pub fn files(&self) -> Vec<String> {
        let mut combined: Vec<String> = self
            .required_files
            .iter()
            .chain(self.optional_files.iter())
            .cloned()
            .collect();
        combined.sort();
        combined.dedup();
        combined
    }
}

/// Expands required and optional glob patterns against the workspace.
///
/// Patterns are substituted first; absolute or `..` patterns are a hard
/// error. Matches whose real path escapes the workspace are silently
/// dropped. A required pattern with no matches lands in `missing_required`.
pub fn resolve_dependencies(
    workspace: &Path,
    required: &[String],
    optional: &[String],
    scope: &Scope,
) -> Result<DependencyResolution, PathSafetyError> {
    let workspace = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());

    let mut resolution = DependencyResolution::default();

    expand_patterns(
        &workspace,
        required,
        scope,
        true,
        &mut resolution.required_files,
        &mut resolution.missing_required,
        &mut resolution.patterns_used,
    )?;
    let mut no_missing = Vec::new();
    expand_patterns(
        &workspace,
        optional,
        scope,
        false,
        &mut resolution.optional_files,
        &mut no_missing,
        &mut resolution.patterns_used,
    )?;

    Ok(resolution)
}

fn expand_patterns(
    workspace: &Path,
    patterns: &[String],
    scope: &Scope,
    required: bool,
    files: &mut Vec<String>,
    missing: &mut Vec<String>,
    patterns_used: &mut BTreeMap<String, Vec<String>>,
) -> Result<(), PathSafetyError> {
    let mut seen: BTreeSet<String> = BTreeSet::new();

    for pattern in patterns {
        let (expanded, _undefined) = variables::substitute_text_lenient(pattern, scope);
        path_safety::check_pattern(&expanded)?;

        let matches = glob_within(workspace, &expanded);
        if matches.is_empty() {
            if required {
                missing.push(expanded);
            }
            continue;
        }
        patterns_used.insert(expanded, matches.clone());
        for matched in matches {
            if seen.insert(matched.clone()) {
                files.push(matched);
            }
        }
    }

    Ok(())
}

fn glob_within(workspace: &Path, pattern: &str) -> Vec<String> {
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
