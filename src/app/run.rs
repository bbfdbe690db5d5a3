use crate::app::cli::RunOptions;
use crate::queue;
use crate::state::StateStore;
use crate::variables;
use crate::workflow::executor::{ExecutorOptions, RunOutcome, WorkflowExecutor};
use crate::workflow::loader::{load_workflow, WorkflowError};
use serde_json::Value;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The `run` command: validate, prepare the processed directory, initialize
/// a fresh run, and drive the executor.
pub fn execute(options: RunOptions) -> i32 {
    let workspace = match env::current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("failed to resolve working directory: {err}");
            return 1;
        }
    };

    let workflow_path = resolve_in(&workspace, &options.workflow);
    if !workflow_path.exists() {
        eprintln!("workflow file not found: {}", options.workflow);
        return 1;
    }

    let workflow = match load_workflow(&workflow_path) {
        Ok(workflow) => workflow,
        Err(WorkflowError::Validation { errors }) => {
            for error in errors {
                eprintln!("validation error: {error}");
            }
            return 2;
        }
        Err(err @ WorkflowError::Parse { .. }) => {
            eprintln!("{err}");
            return 2;
        }
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    };

    let processed_rel = workflow.processed_dir().to_string();
    let processed_dir = workspace.join(&processed_rel);

    if options.clean_processed {
        if let Err(message) = validate_clean_target(&workspace, &processed_dir) {
            eprintln!("{message}");
            return 2;
        }
        if options.dry_run {
            println!(
                "[dry-run] would clean processed directory: {}",
                processed_dir.display()
            );
        } else if let Err(err) = queue::clean_directory(&workspace, &processed_rel) {
            eprintln!("{err}");
            return 1;
        }
    }

    let archive_dest = options
        .archive_processed
        .as_ref()
        .map(|dest| resolve_in(&workspace, dest));
    if let Some(dest) = &archive_dest {
        if dest.starts_with(&processed_dir) {
            eprintln!(
                "safety check failed: archive destination '{}' cannot be inside the processed directory",
                dest.display()
            );
            return 2;
        }
        if options.dry_run {
            println!(
                "[dry-run] would archive processed directory to: {}",
                dest.display()
            );
        }
    }

    if options.dry_run {
        println!("workflow validation successful");
        return 0;
    }

    let mut context = workflow.context.clone();
    if let Some(path) = &options.context_file {
        match load_context_file(&resolve_in(&workspace, path)) {
            Ok(pairs) => context.extend(pairs),
            Err(message) => {
                eprintln!("{message}");
                return 2;
            }
        }
    }
    for (key, value) in &options.context {
        context.insert(key.clone(), value.clone());
    }

    let mut store = StateStore::new(&workspace, None, options.backup_state, options.debug);
    if let Err(err) = store.initialize(&options.workflow, context) {
        eprintln!("{err}");
        return 1;
    }
    if !options.quiet {
        println!("created run {}", store.run_id());
    }

    let interrupt = install_interrupt_flag();
    let executor_options = ExecutorOptions {
        on_error: options.on_error,
        max_retries: options.max_retries,
        retry_delay_ms: options.retry_delay_ms,
        debug: options.debug,
        resume: false,
    };

    let outcome = {
        let mut executor =
            WorkflowExecutor::new(&workflow, &workspace, &mut store, executor_options)
                .with_interrupt(interrupt);
        executor.execute()
    };

    match outcome {
        Ok(RunOutcome::Completed) => {
            if let Some(dest) = &archive_dest {
                if let Err(err) = queue::archive_directory(&workspace, &processed_rel, dest) {
                    eprintln!("{err}");
                    return 1;
                }
            }
            if !options.quiet {
                println!("run {} completed", store.run_id());
            }
            0
        }
        Ok(RunOutcome::Halted { exit_code }) => {
            eprintln!("run {} failed", store.run_id());
            exit_code
        }
        Ok(RunOutcome::Suspended) => {
            eprintln!("run {} suspended", store.run_id());
            130
        }
        Err(err) => {
            eprintln!("{err}");
            1
        }
    }
}

pub(crate) fn install_interrupt_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    let _ = ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst));
    flag
}

pub(crate) fn resolve_in(workspace: &Path, raw: &str) -> PathBuf {
    let path = Path::new(raw);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        workspace.join(path)
    }
}

/// `--clean-processed` refuses anything outside the workspace, the
/// workspace root itself, and any parent of the workspace.
fn validate_clean_target(workspace: &Path, processed_dir: &Path) -> Result<(), String> {
    let workspace = workspace
        .canonicalize()
        .unwrap_or_else(|_| workspace.to_path_buf());
    let processed = processed_dir
        .canonicalize()
        .unwrap_or_else(|_| processed_dir.to_path_buf());

    if !processed.starts_with(&workspace) {
        return Err(format!(
            "safety check failed: processed directory '{}' is outside the workspace '{}'",
            processed.display(),
            workspace.display()
        ));
    }
    if processed == workspace {
        return Err("safety check failed: cannot clean the workspace root directory".to_string());
    }
    if workspace.starts_with(&processed) {
        return Err("safety check failed: cannot clean a parent of the workspace".to_string());
    }
    Ok(())
}

fn load_context_file(path: &Path) -> Result<BTreeMap<String, String>, String> {
    let raw = fs::read_to_string(path)
        .map_err(|err| format!("failed to read context file {}: {err}", path.display()))?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|err| format!("invalid json in context file {}: {err}", path.display()))?;
    let Value::Object(entries) = value else {
        return Err(format!(
            "context file {} must contain a JSON object",
            path.display()
        ));
    };
    Ok(entries
        .into_iter()
        .map(|(key, value)| (key, variables::render(&value)))
        .collect())
}
