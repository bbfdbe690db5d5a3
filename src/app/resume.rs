use crate::app::cli::ResumeOptions;
use crate::app::run::{install_interrupt_flag, resolve_in};
use crate::state::{RunStatus, StateStore};
use crate::workflow::executor::{ExecutorOptions, RunOutcome, WorkflowExecutor};
use crate::workflow::loader::{load_workflow, WorkflowError};
use std::env;

/// The `resume` command: reload a run's state, verify the workflow is
/// unchanged, and continue from the first non-terminal step. With
/// `--force-restart` a fresh run is minted instead; the prior run directory
/// stays on disk for audit.
pub fn execute(options: ResumeOptions) -> i32 {
    let workspace = match env::current_dir() {
        Ok(dir) => dir,
        Err(err) => {
            eprintln!("failed to resolve working directory: {err}");
            return 1;
        }
    };

    let run_dir = workspace
        .join(".orchestrate")
        .join("runs")
        .join(&options.run_id);
    if !run_dir.exists() {
        eprintln!("no run found with id '{}'", options.run_id);
        return 1;
    }

    let mut store = StateStore::new(
        &workspace,
        Some(options.run_id.clone()),
        options.backup_state,
        options.debug,
    );

    if let Err(err) = store.load() {
        eprintln!("failed to load state: {err}");
        if !options.repair {
            eprintln!("use --repair to attempt recovery from backups");
            return 1;
        }
        match store.attempt_repair() {
            Ok(()) => println!("repaired state from backup"),
            Err(err) => {
                eprintln!("{err}");
                return 1;
            }
        }
    }

    let (workflow_file, status, recorded_context) = match store.state() {
        Ok(state) => (
            state.workflow_file.clone(),
            state.status,
            state.context.clone(),
        ),
        Err(err) => {
            eprintln!("{err}");
            return 1;
        }
    };

    let workflow_path = resolve_in(&workspace, &workflow_file);
    if !workflow_path.exists() {
        eprintln!("workflow file not found: {workflow_file}");
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
        Err(err) => {
            eprintln!("{err}");
            return 2;
        }
    };

    if !options.force_restart {
        match store.validate_checksum(&workflow_path) {
            Ok(true) => {}
            Ok(false) => {
                eprintln!("workflow has been modified since the run started");
                eprintln!("the workflow checksum does not match the recorded checksum");
                eprintln!("use --force-restart to mint a new run instead");
                return 1;
            }
            Err(err) => {
                eprintln!("{err}");
                return 1;
            }
        }
        if status == RunStatus::Completed {
            println!("run {} has already completed successfully", options.run_id);
            return 0;
        }
    }

    let (mut store, resume) = if options.force_restart {
        // Mint a fresh run; the old state directory is left untouched.
        let mut fresh = StateStore::new(&workspace, None, options.backup_state, options.debug);
        if let Err(err) = fresh.initialize(&workflow_file, recorded_context) {
            eprintln!("{err}");
            return 1;
        }
        println!(
            "force restarting workflow as new run {} (previous run {} kept)",
            fresh.run_id(),
            options.run_id
        );
        (fresh, false)
    } else {
        println!("resuming run {}", options.run_id);
        (store, true)
    };

    let interrupt = install_interrupt_flag();
    let executor_options = ExecutorOptions {
        debug: options.debug,
        resume,
        ..ExecutorOptions::default()
    };

    let outcome = {
        let mut executor =
            WorkflowExecutor::new(&workflow, &workspace, &mut store, executor_options)
                .with_interrupt(interrupt);
        executor.execute()
    };

    match outcome {
        Ok(RunOutcome::Completed) => {
            println!("run {} completed", store.run_id());
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
