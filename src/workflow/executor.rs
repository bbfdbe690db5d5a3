use crate::deps;
use crate::exec::capture::CaptureError;
use crate::exec::{run_command, CommandRequest, OutputCapture, RetryPolicy};
use crate::provider::{compose_command, ComposeError, ProviderRegistry};
use crate::secrets::SecretsManager;
use crate::shared::logging;
use crate::shared::path_safety;
use crate::state::{
    ForEachProgress, RunStatus, StateError, StateStore, StepError, StepRecord, StepStatus,
};
use crate::variables::{self, RunScope, Scope};
use crate::wait::{self, WaitConfig};
use crate::workflow::{
    conditions, pointers, CommandLine, ForEachSpec, ProviderStep, Step, StepKind, Workflow,
    END_TARGET,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OnErrorMode {
    #[default]
    Stop,
    Continue,
}

impl OnErrorMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "stop" => Some(Self::Stop),
            "continue" => Some(Self::Continue),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub on_error: OnErrorMode,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub debug: bool,
    pub resume: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            on_error: OnErrorMode::Stop,
            max_retries: 0,
            retry_delay_ms: 1000,
            debug: false,
            resume: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error("failed to read input file {path}: {source}")]
    InputFile {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// How a run ended, from the caller's exit-code perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Strict flow halted the run on a failing step.
    Halted { exit_code: i32 },
    /// User interrupt; the state document stays resumable.
    Suspended,
}

enum FlowDecision {
    Next,
    Jump(String),
    End,
    Halt(i32),
}

/// Drives the cursor-based step loop over a validated workflow, persisting
/// every transition through the state store.
pub struct WorkflowExecutor<'a> {
    workflow: &'a Workflow,
    workspace: PathBuf,
    store: &'a mut StateStore,
    registry: ProviderRegistry,
    secrets: SecretsManager,
    options: ExecutorOptions,
    interrupt: Option<Arc<AtomicBool>>,
}

impl<'a> WorkflowExecutor<'a> {
    pub fn new(
        workflow: &'a Workflow,
        workspace: &Path,
        store: &'a mut StateStore,
        options: ExecutorOptions,
    ) -> Self {
        let mut registry = ProviderRegistry::new();
        for template in &workflow.providers {
            registry.register(template.clone());
        }
        Self {
            workflow,
            workspace: workspace.to_path_buf(),
            store,
            registry,
            secrets: SecretsManager::new(),
            options,
            interrupt: None,
        }
    }

    /// Installs the cooperative cancellation flag checked between steps.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn execute(&mut self) -> Result<RunOutcome, ExecutorError> {
        let workflow = self.workflow;
        let steps = &workflow.steps;
        let mut cursor = 0usize;

        self.log("info", "run_started", &format!("run {}", self.store.run_id()));

        while cursor < steps.len() {
            if self.interrupted() {
                self.store.update_status(RunStatus::Suspended)?;
                self.log("warn", "run_suspended", "interrupted by user");
                return Ok(RunOutcome::Suspended);
            }

            let step = &steps[cursor];

            if self.options.resume && self.terminal_on_resume(step) {
                self.log("info", "step_resumed", &format!("skipping '{}'", step.name));
                cursor += 1;
                continue;
            }

            if let Some(condition) = &step.when {
                let scope = self.root_scope()?;
                match conditions::evaluate(condition, &scope, &self.workspace) {
                    Ok(true) => {}
                    Ok(false) => {
                        self.store.update_step(&step.name, &StepRecord::skipped())?;
                        self.log("info", "step_skipped", &step.name);
                        cursor += 1;
                        continue;
                    }
                    Err(err) => {
                        let record = StepRecord::failed(
                            2,
                            StepError {
                                kind: Some("path_safety_error".to_string()),
                                message: format!("condition evaluation failed: {err}"),
                                context: json!({}),
                            },
                        );
                        self.store.update_step(&step.name, &record)?;
                        match self.flow_decision(step, &record) {
                            FlowDecision::Next => cursor += 1,
                            FlowDecision::Jump(target) => {
                                cursor = self.jump_target(&target, cursor)
                            }
                            FlowDecision::End => return self.finish_completed(),
                            FlowDecision::Halt(code) => return self.finish_halted(code),
                        }
                        continue;
                    }
                }
            }

            self.store.backup_state(&step.name)?;
            self.log("info", "step_started", &step.name);

            let record = match &step.kind {
                StepKind::Command(line) => {
                    let scope = self.root_scope()?;
                    Some(self.run_command_step(step, line, &scope)?)
                }
                StepKind::Provider(provider_step) => {
                    let scope = self.root_scope()?;
                    Some(self.run_provider_step(step, provider_step, &scope)?)
                }
                StepKind::WaitFor(config) => {
                    let scope = self.root_scope()?;
                    Some(self.run_wait_step(config, &scope))
                }
                StepKind::ForEach(spec) => self.run_for_each(step, spec)?,
            };

            let decision = match record {
                Some(record) => {
                    self.store.update_step(&step.name, &record)?;
                    self.log_step_result(&step.name, &record);
                    self.flow_decision(step, &record)
                }
                None => FlowDecision::Next,
            };

            // An interrupt that landed while the step ran wins over flow
            // handling; the step's own result is already durable.
            if self.interrupted() {
                self.store.update_status(RunStatus::Suspended)?;
                self.log("warn", "run_suspended", "interrupted by user");
                return Ok(RunOutcome::Suspended);
            }

            match decision {
                FlowDecision::Next => cursor += 1,
                FlowDecision::Jump(target) => cursor = self.jump_target(&target, cursor),
                FlowDecision::End => return self.finish_completed(),
                FlowDecision::Halt(code) => return self.finish_halted(code),
            }
        }

        self.finish_completed()
    }

    fn finish_completed(&mut self) -> Result<RunOutcome, ExecutorError> {
        self.store.update_status(RunStatus::Completed)?;
        self.log("info", "run_completed", self.store.run_id());
        Ok(RunOutcome::Completed)
    }

    fn finish_halted(&mut self, exit_code: i32) -> Result<RunOutcome, ExecutorError> {
        self.store.update_status(RunStatus::Failed)?;
        self.log("error", "run_failed", &format!("halted with exit {exit_code}"));
        Ok(RunOutcome::Halted { exit_code })
    }

    fn interrupted(&self) -> bool {
        self.interrupt
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    /// Resume skip: terminal single-step results, and for-each parents whose
    /// every recorded iteration is fully terminal.
    fn terminal_on_resume(&self, step: &Step) -> bool {
        if let StepKind::ForEach(spec) = &step.kind {
            let Ok(state) = self.store.state() else {
                return false;
            };
            let Some(Value::Array(iterations)) = state.steps.get(&step.name) else {
                return false;
            };
            if iterations.is_empty() {
                return false;
            }
            return (0..iterations.len())
                .all(|index| self.iteration_complete(&step.name, index, &spec.steps));
        }
        self.store
            .step_record(&step.name)
            .is_some_and(|record| record.is_terminal())
    }

    fn iteration_complete(&self, loop_name: &str, index: usize, children: &[Step]) -> bool {
        children.iter().all(|child| {
            self.store
                .step_record(&format!("{loop_name}[{index}].{}", child.name))
                .is_some_and(|record| record.is_terminal())
        })
    }

    fn flow_decision(&self, step: &Step, record: &StepRecord) -> FlowDecision {
        if record.skipped {
            return FlowDecision::Next;
        }
        let exit_code = record.exit_code.unwrap_or(0);

        if let Some(handlers) = &step.on {
            let mut target = if exit_code == 0 {
                handlers.success.as_ref()
            } else {
                handlers.failure.as_ref()
            };
            if handlers.always.is_some() {
                target = handlers.always.as_ref();
            }
            if let Some(target) = target {
                if target == END_TARGET {
                    return FlowDecision::End;
                }
                return FlowDecision::Jump(target.clone());
            }
        }

        if exit_code != 0
            && self.workflow.strict_flow
            && self.options.on_error == OnErrorMode::Stop
        {
            let halt_code = if exit_code == 124 { 124 } else { 1 };
            return FlowDecision::Halt(halt_code);
        }

        FlowDecision::Next
    }

    /// Goto is a cursor reassignment. Targets naming loop children are not
    /// addressable from the top level; the run just advances.
    fn jump_target(&mut self, target: &str, current: usize) -> usize {
        match self
            .workflow
            .steps
            .iter()
            .position(|step| step.name == target)
        {
            Some(index) => {
                self.log("info", "goto", &format!("jump to '{target}'"));
                index
            }
            None => {
                self.log("warn", "goto", &format!("target '{target}' not at top level"));
                current + 1
            }
        }
    }

    fn root_scope(&self) -> Result<Scope, ExecutorError> {
        let state = self.store.state()?;
        Ok(Scope {
            run: RunScope {
                id: state.run_id.clone(),
                root: state.run_root.clone().unwrap_or_default(),
                timestamp_utc: state.started_at.clone(),
            },
            context: state.context.clone(),
            steps: state.steps.clone(),
            loop_vars: None,
            item: None,
            alias: None,
        })
    }

    /// Inside an iteration, `steps.*` sees only what the iteration itself
    /// produced; ancestor-scope results are invisible.
    fn loop_scope(
        &self,
        iteration: &Map<String, Value>,
        index: usize,
        total: usize,
        item: &Value,
        alias: &str,
    ) -> Result<Scope, ExecutorError> {
        let mut scope = self.root_scope()?;
        scope.steps = iteration.clone();
        Ok(scope.with_loop(index, total, item.clone(), alias))
    }

    fn declared_secrets(&self, step: &Step) -> Vec<String> {
        let mut declared = self.workflow.secrets.clone();
        for name in &step.secrets {
            if !declared.contains(name) {
                declared.push(name.clone());
            }
        }
        declared
    }

    fn run_command_step(
        &mut self,
        step: &Step,
        line: &CommandLine,
        scope: &Scope,
    ) -> Result<StepRecord, ExecutorError> {
        let started_at = Utc::now().to_rfc3339();

        let argv = match self.substituted_argv(line, scope) {
            Ok(argv) => argv,
            Err(record) => return Ok(record),
        };
        let output_file = match self.substituted_output_file(step, scope) {
            Ok(path) => path,
            Err(record) => return Ok(record),
        };

        let declared = self.declared_secrets(step);
        let secrets_context = self.secrets.resolve(&declared, &step.env);
        if !secrets_context.missing.is_empty() {
            return Ok(missing_secrets_record(&secrets_context.missing));
        }

        let policy = RetryPolicy::for_command(
            step.retries.map(|retries| (retries.max, retries.delay_ms)),
        );
        let record = self.run_with_retries(
            step,
            &argv,
            None,
            &secrets_context.child_env,
            output_file.as_deref(),
            &policy,
        )?;

        Ok(self.finish_record(record, started_at, None))
    }

    fn run_provider_step(
        &mut self,
        step: &Step,
        provider_step: &ProviderStep,
        scope: &Scope,
    ) -> Result<StepRecord, ExecutorError> {
        let started_at = Utc::now().to_rfc3339();
        let mut injection_debug: Option<Value> = None;

        // Dependencies resolve and validate before anything runs.
        let mut dependency_files = Vec::new();
        if let Some(depends_on) = &provider_step.depends_on {
            let resolution = match deps::resolve_dependencies(
                &self.workspace,
                &depends_on.required,
                &depends_on.optional,
                scope,
            ) {
                Ok(resolution) => resolution,
                Err(violation) => {
                    return Ok(StepRecord::failed(
                        2,
                        StepError::new("path_safety_error", violation.to_string(), json!({})),
                    ))
                }
            };
            if !resolution.is_valid() {
                return Ok(StepRecord::failed(
                    2,
                    StepError::new(
                        "dependency_validation",
                        "missing required dependencies",
                        json!({"missing_dependencies": resolution.missing_required}),
                    ),
                ));
            }
            dependency_files = resolution.files();
        }

        // The prompt is the input file's literal bytes; nothing inside it is
        // ever substituted.
        let mut prompt = String::new();
        if let Some(input_file) = &provider_step.input_file {
            let path = self.workspace.join(input_file);
            if path.exists() {
                prompt = std::fs::read_to_string(&path).map_err(|source| {
                    ExecutorError::InputFile {
                        path: path.display().to_string(),
                        source,
                    }
                })?;
            }
        }

        if let Some(depends_on) = &provider_step.depends_on {
            if let Some(spec) = &depends_on.inject {
                let outcome = deps::inject(
                    &self.workspace,
                    &prompt,
                    &dependency_files,
                    spec,
                    !depends_on.required.is_empty(),
                );
                prompt = outcome.prompt;
                if outcome.truncated {
                    injection_debug = outcome.details;
                }
            }
        }

        let declared = self.declared_secrets(step);
        let secrets_context = self.secrets.resolve(&declared, &step.env);
        if !secrets_context.missing.is_empty() {
            return Ok(missing_secrets_record(&secrets_context.missing));
        }

        if self.options.debug && !prompt.is_empty() {
            self.write_prompt_audit(&step.name, &prompt);
        }

        let output_file = match self.substituted_output_file(step, scope) {
            Ok(path) => path,
            Err(record) => return Ok(record),
        };

        let Some(template) = self.registry.get(&provider_step.provider).cloned() else {
            return Ok(StepRecord::failed(
                2,
                StepError::new(
                    "validation_error",
                    format!("provider '{}' not found", provider_step.provider),
                    json!({"provider": provider_step.provider}),
                ),
            ));
        };

        let merged = self
            .registry
            .merge_params(&provider_step.provider, &provider_step.provider_params);
        let params = match variables::substitute_value(&Value::Object(merged), scope) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(undefined) => {
                return Ok(StepRecord::failed(
                    2,
                    StepError::new(
                        "undefined_variables",
                        format!(
                            "undefined variables in provider_params: {}",
                            undefined.names.join(", ")
                        ),
                        json!({"undefined_vars": undefined.names}),
                    ),
                ))
            }
        };

        let invocation = match compose_command(&template, &params, scope, &prompt) {
            Ok(invocation) => invocation,
            Err(ComposeError::InvalidPromptPlaceholder) => {
                return Ok(StepRecord::failed(
                    2,
                    StepError::new(
                        "validation_error",
                        "invalid ${PROMPT} placeholder in stdin mode",
                        json!({"invalid_prompt_placeholder": true}),
                    ),
                ))
            }
            Err(ComposeError::MissingPlaceholders(names)) => {
                return Ok(StepRecord::failed(
                    2,
                    StepError::new(
                        "validation_error",
                        format!("missing placeholders: {}", names.join(", ")),
                        json!({"missing_placeholders": names}),
                    ),
                ))
            }
        };

        let policy = match step.retries {
            Some(retries) => RetryPolicy::for_command(Some((retries.max, retries.delay_ms))),
            None => RetryPolicy::for_provider(self.options.max_retries, self.options.retry_delay_ms),
        };

        let record = self.run_with_retries(
            step,
            &invocation.argv,
            invocation.stdin_prompt.as_deref(),
            &secrets_context.child_env,
            output_file.as_deref(),
            &policy,
        )?;

        Ok(self.finish_record(record, started_at, injection_debug))
    }

    fn run_with_retries(
        &mut self,
        step: &Step,
        argv: &[String],
        stdin: Option<&str>,
        child_env: &std::collections::BTreeMap<String, String>,
        output_file: Option<&Path>,
        policy: &RetryPolicy,
    ) -> Result<StepRecord, ExecutorError> {
        let capture = OutputCapture::new(self.store.logs_dir());
        let mut attempt = 0u32;

        loop {
            let outcome = run_command(&CommandRequest {
                argv,
                cwd: &self.workspace,
                env: child_env,
                stdin,
                timeout: step.timeout_sec.map(Duration::from_secs),
            });

            let captured = capture.capture(
                &outcome.stdout,
                &outcome.stderr,
                &step.name,
                step.output_capture,
                output_file,
                step.allow_parse_error,
                outcome.exit_code,
            )?;

            // The capture layer overrides the process exit only when it
            // failed itself (JSON overflow or parse error without the
            // allowance); a tolerated parse error keeps the process exit.
            let exit_code = if captured.exit_code != 0 {
                captured.exit_code
            } else {
                outcome.exit_code
            };
            let error = captured.error.clone().or(outcome.error.clone());

            if policy.should_retry(exit_code, attempt) {
                attempt += 1;
                self.log(
                    "warn",
                    "step_retrying",
                    &format!(
                        "'{}' exited {exit_code}, attempt {attempt}/{}",
                        step.name, policy.max_retries
                    ),
                );
                policy.wait();
                continue;
            }

            let mut record = StepRecord::with_status(if exit_code == 0 {
                StepStatus::Completed
            } else {
                StepStatus::Failed
            });
            record.exit_code = Some(exit_code);
            record.duration_ms = Some(outcome.duration_ms);
            record.truncated = captured.truncated;
            record.output = captured
                .output
                .as_deref()
                .map(|text| self.secrets.mask_text(text));
            record.lines = captured.lines.as_deref().map(|lines| self.secrets.mask_lines(lines));
            record.json = captured.json.as_ref().map(|value| self.secrets.mask_value(value));
            record.debug = captured.debug.clone();
            record.error = error.map(|err| StepError {
                kind: err.kind,
                message: self.secrets.mask_text(&err.message),
                context: self.secrets.mask_value(&err.context),
            });
            return Ok(record);
        }
    }

    fn run_wait_step(&mut self, config: &WaitConfig, scope: &Scope) -> StepRecord {
        let (pattern, undefined) = variables::substitute_text_lenient(&config.pattern, scope);
        if !undefined.is_empty() {
            let names: Vec<String> = undefined.into_iter().collect();
            return StepRecord::failed(
                2,
                StepError::new(
                    "undefined_variables",
                    format!("undefined variables in wait_for.glob: {}", names.join(", ")),
                    json!({"undefined_vars": names}),
                ),
            );
        }

        let outcome = wait::wait_for_files(
            &self.workspace,
            &WaitConfig {
                pattern,
                ..config.clone()
            },
        );

        let mut record = StepRecord::with_status(if outcome.exit_code == 0 {
            StepStatus::Completed
        } else {
            StepStatus::Failed
        });
        record.exit_code = Some(outcome.exit_code);
        record.duration_ms = Some(outcome.wait_duration_ms);
        record.files = Some(outcome.files.clone());
        record.wait_duration_ms = Some(outcome.wait_duration_ms);
        record.poll_count = Some(outcome.poll_count);
        record.timed_out = Some(outcome.timed_out);
        record.error = outcome.error.clone();
        if outcome.timed_out && record.error.is_none() {
            record.error = Some(StepError::new(
                "timeout",
                format!("wait timed out after {} seconds", config.timeout_sec),
                json!({
                    "timeout_sec": config.timeout_sec,
                    "files_found": outcome.files.len(),
                    "min_count_required": config.min_count,
                }),
            ));
        }
        record
    }

    fn run_for_each(
        &mut self,
        step: &Step,
        spec: &ForEachSpec,
    ) -> Result<Option<StepRecord>, ExecutorError> {
        let items = match self.resolve_items(spec) {
            Ok(items) => items,
            Err(record) => return Ok(Some(record)),
        };

        // Resume: completed iterations (every child terminal) are skipped
        // wholesale; the first incomplete one re-runs only unfinished
        // children.
        let mut loop_results: Vec<Value> = Vec::new();
        let mut start_index = 0usize;
        if self.options.resume {
            for index in 0..items.len() {
                if self.iteration_complete(&step.name, index, &spec.steps) {
                    loop_results.push(Value::Object(self.recorded_iteration(
                        &step.name,
                        index,
                        &spec.steps,
                    )));
                    start_index = index + 1;
                } else {
                    break;
                }
            }
        }

        let mut progress = ForEachProgress {
            items: items.clone(),
            completed_indices: (0..start_index).collect(),
            current_index: None,
        };

        for (index, item) in items.iter().enumerate().skip(start_index) {
            progress.current_index = Some(index);
            self.store.update_for_each(&step.name, progress.clone())?;

            let mut iteration: Map<String, Value> = if self.options.resume {
                self.recorded_iteration(&step.name, index, &spec.steps)
            } else {
                Map::new()
            };

            for child in &spec.steps {
                let child_key = format!("{}[{index}].{}", step.name, child.name);

                if self.options.resume {
                    if let Some(existing) = self.store.step_record(&child_key) {
                        if existing.is_terminal() {
                            iteration.insert(child.name.clone(), existing.to_value()?);
                            continue;
                        }
                    }
                }

                let scope =
                    self.loop_scope(&iteration, index, items.len(), item, &spec.alias)?;

                if let Some(condition) = &child.when {
                    match conditions::evaluate(condition, &scope, &self.workspace) {
                        Ok(true) => {}
                        Ok(false) => {
                            let record = StepRecord::skipped();
                            self.store.update_step(&child_key, &record)?;
                            iteration.insert(child.name.clone(), record.to_value()?);
                            continue;
                        }
                        Err(err) => {
                            let record = StepRecord::failed(
                                2,
                                StepError {
                                    kind: Some("path_safety_error".to_string()),
                                    message: format!("condition evaluation failed: {err}"),
                                    context: json!({}),
                                },
                            );
                            self.store.update_step(&child_key, &record)?;
                            iteration.insert(child.name.clone(), record.to_value()?);
                            continue;
                        }
                    }
                }

                self.store.backup_state(&child_key)?;

                let record = match &child.kind {
                    StepKind::Command(line) => self.run_command_step(child, line, &scope)?,
                    StepKind::Provider(provider_step) => {
                        self.run_provider_step(child, provider_step, &scope)?
                    }
                    StepKind::WaitFor(config) => self.run_wait_step(config, &scope),
                    // Loops do not nest; the child is recorded as skipped.
                    StepKind::ForEach(_) => StepRecord::skipped(),
                };

                self.store.update_step(&child_key, &record)?;
                self.log_step_result(&child_key, &record);
                iteration.insert(child.name.clone(), record.to_value()?);
            }

            loop_results.push(Value::Object(iteration));
            self.store
                .update_step_value(&step.name, Value::Array(loop_results.clone()))?;

            progress.completed_indices.push(index);
            progress.current_index = None;
            self.store.update_for_each(&step.name, progress.clone())?;
        }

        self.store
            .update_step_value(&step.name, Value::Array(loop_results))?;
        Ok(None)
    }

    fn resolve_items(&self, spec: &ForEachSpec) -> Result<Vec<Value>, StepRecord> {
        if let Some(pointer) = &spec.items_from {
            let steps = match self.store.state() {
                Ok(state) => &state.steps,
                Err(_) => {
                    return Err(StepRecord::failed(
                        2,
                        StepError {
                            kind: None,
                            message: "state not initialized".to_string(),
                            context: json!({}),
                        },
                    ))
                }
            };
            let resolved = pointers::resolve_pointer(steps, pointer).map_err(|err| {
                StepRecord::failed(
                    2,
                    StepError {
                        kind: None,
                        message: format!("failed to resolve items_from pointer: {err}"),
                        context: json!({"pointer": pointer, "error": err.to_string()}),
                    },
                )
            })?;
            match resolved {
                Value::Array(items) => Ok(items),
                other => Err(StepRecord::failed(
                    2,
                    StepError {
                        kind: None,
                        message: format!(
                            "items_from must resolve to an array, got {}",
                            value_kind(&other)
                        ),
                        context: json!({"pointer": pointer, "resolved_type": value_kind(&other)}),
                    },
                )),
            }
        } else {
            Ok(spec.items.clone().unwrap_or_default())
        }
    }

    fn recorded_iteration(
        &self,
        loop_name: &str,
        index: usize,
        children: &[Step],
    ) -> Map<String, Value> {
        let mut iteration = Map::new();
        for child in children {
            let key = format!("{loop_name}[{index}].{}", child.name);
            if let Ok(state) = self.store.state() {
                if let Some(value) = state.steps.get(&key) {
                    iteration.insert(child.name.clone(), value.clone());
                }
            }
        }
        iteration
    }

    fn substituted_argv(
        &self,
        line: &CommandLine,
        scope: &Scope,
    ) -> Result<Vec<String>, StepRecord> {
        match line {
            CommandLine::Shell(text) => {
                let rendered = match variables::substitute_text(text, scope) {
                    Ok(rendered) => rendered,
                    Err(undefined) => {
                        let best_effort = variables::render(&undefined.rendered);
                        return Err(undefined_command_record(
                            undefined.names,
                            vec![best_effort],
                        ));
                    }
                };
                match shlex::split(&rendered) {
                    Some(argv) => Ok(argv),
                    None => Err(StepRecord::failed(
                        1,
                        StepError::new(
                            "execution_error",
                            format!("failed to tokenize command: {rendered}"),
                            json!({}),
                        ),
                    )),
                }
            }
            CommandLine::Argv(tokens) => {
                let mut argv = Vec::with_capacity(tokens.len());
                let mut undefined = std::collections::BTreeSet::new();
                for token in tokens {
                    let (rendered, missing) = variables::substitute_text_lenient(token, scope);
                    undefined.extend(missing);
                    argv.push(rendered);
                }
                if !undefined.is_empty() {
                    return Err(undefined_command_record(
                        undefined.into_iter().collect(),
                        argv,
                    ));
                }
                Ok(argv)
            }
        }
    }

    fn substituted_output_file(
        &self,
        step: &Step,
        scope: &Scope,
    ) -> Result<Option<PathBuf>, StepRecord> {
        let Some(raw) = &step.output_file else {
            return Ok(None);
        };
        let (rendered, undefined) = variables::substitute_text_lenient(raw, scope);
        if !undefined.is_empty() {
            let names: Vec<String> = undefined.into_iter().collect();
            return Err(StepRecord::failed(
                2,
                StepError::new(
                    "undefined_variables",
                    format!("undefined variables in output_file: {}", names.join(", ")),
                    json!({"undefined_vars": names}),
                ),
            ));
        }
        if let Err(violation) = path_safety::check_pattern(&rendered) {
            return Err(StepRecord::failed(
                2,
                StepError::new("path_safety_error", violation.to_string(), json!({})),
            ));
        }
        Ok(Some(self.workspace.join(rendered)))
    }

    fn finish_record(
        &self,
        mut record: StepRecord,
        started_at: String,
        injection_debug: Option<Value>,
    ) -> StepRecord {
        record.started_at = Some(started_at);
        record.completed_at = Some(Utc::now().to_rfc3339());
        if let Some(details) = injection_debug {
            let mut debug = match record.debug.take() {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            debug.insert("injection".to_string(), details);
            record.debug = Some(Value::Object(debug));
        }
        record
    }

    fn write_prompt_audit(&mut self, step_name: &str, prompt: &str) {
        let masked = self.secrets.mask_text(prompt);
        let path = self.store.logs_dir().join(format!("{step_name}.prompt.txt"));
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::write(path, masked);
    }

    fn log_step_result(&self, key: &str, record: &StepRecord) {
        let exit_code = record.exit_code.unwrap_or(0);
        match record.status {
            StepStatus::Completed => {
                self.log("info", "step_completed", &format!("'{key}' exit {exit_code}"))
            }
            StepStatus::Skipped => self.log("info", "step_skipped", key),
            _ => self.log("error", "step_failed", &format!("'{key}' exit {exit_code}")),
        }
    }

    fn log(&self, level: &str, event: &str, message: &str) {
        logging::append_run_event(
            self.store.logs_dir(),
            level,
            event,
            &self.secrets.mask_text(message),
        );
    }
}

fn missing_secrets_record(missing: &[String]) -> StepRecord {
    StepRecord::failed(
        2,
        StepError::new(
            "missing_secrets",
            format!("missing required secrets: {}", missing.join(", ")),
            json!({"missing_secrets": missing}),
        ),
    )
}

fn undefined_command_record(names: Vec<String>, substituted: Vec<String>) -> StepRecord {
    StepRecord::failed(
        2,
        StepError::new(
            "undefined_variables",
            format!("undefined variables in command: {}", names.join(", ")),
            json!({"undefined_vars": names, "substituted_command": substituted}),
        ),
    )
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
