use orchestrate::exec::CaptureMode;
use orchestrate::provider::InputMode;
use orchestrate::workflow::loader::{load_workflow, WorkflowError};
use orchestrate::workflow::{CommandLine, StepKind, Workflow};
use std::fs;
use std::path::{Path, PathBuf};

fn write_workflow(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("wf.yaml");
    fs::write(&path, body).expect("write workflow");
    path
}

fn load(body: &str) -> Result<Workflow, WorkflowError> {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = write_workflow(dir.path(), body);
    load_workflow(&path)
}

fn validation_errors(body: &str) -> Vec<String> {
    match load(body) {
        Err(WorkflowError::Validation { errors }) => errors,
        other => panic!("expected validation failure, got {other:?}"),
    }
}

#[test]
fn full_workflow_parses_into_the_typed_model() {
    let workflow = load(concat!(
        "version: \"1.1.1\"\n",
        "name: pipeline\n",
        "strict_flow: false\n",
        "context:\n",
        "  env: prod\n",
        "secrets: [API_KEY]\n",
        "providers:\n",
        "  reviewer:\n",
        "    command: [review-cli, --prompt, \"${PROMPT}\"]\n",
        "    defaults:\n",
        "      model: base\n",
        "steps:\n",
        "  - name: Fetch\n",
        "    command: [curl-done, \"${context.env}\"]\n",
        "    output_capture: lines\n",
        "  - name: Review\n",
        "    provider: reviewer\n",
        "    input_file: prompt.txt\n",
        "    depends_on:\n",
        "      required: [\"reports/*.md\"]\n",
        "      inject: true\n",
        "    on:\n",
        "      failure:\n",
        "        goto: _end\n",
    ))
    .expect("load");

    assert_eq!(workflow.version, "1.1.1");
    assert!(!workflow.strict_flow);
    assert_eq!(workflow.context.get("env").map(String::as_str), Some("prod"));
    assert_eq!(workflow.secrets, vec!["API_KEY".to_string()]);
    assert_eq!(workflow.providers.len(), 1);
    assert_eq!(workflow.providers[0].input_mode, InputMode::Argv);

    assert_eq!(workflow.steps.len(), 2);
    let fetch = &workflow.steps[0];
    assert_eq!(fetch.output_capture, CaptureMode::Lines);
    assert!(matches!(
        &fetch.kind,
        StepKind::Command(CommandLine::Argv(argv)) if argv.len() == 2
    ));

    let review = &workflow.steps[1];
    let StepKind::Provider(provider) = &review.kind else {
        panic!("expected provider step");
    };
    assert_eq!(provider.provider, "reviewer");
    assert_eq!(provider.input_file.as_deref(), Some("prompt.txt"));
    let depends_on = provider.depends_on.as_ref().expect("depends_on");
    assert!(depends_on.inject.is_some());
    assert_eq!(
        review.on.as_ref().and_then(|on| on.failure.as_deref()),
        Some("_end")
    );
}

#[test]
fn the_on_key_is_never_coerced_into_a_boolean() {
    // YAML 1.1 loaders turn a bare `on` into `true`; the DSL requires the
    // string key to survive.
    let workflow = load(concat!(
        "version: \"1.1\"\n",
        "steps:\n",
        "  - name: Risky\n",
        "    command: do-thing\n",
        "    on:\n",
        "      success:\n",
        "        goto: _end\n",
    ))
    .expect("load");
    assert_eq!(
        workflow.steps[0]
            .on
            .as_ref()
            .and_then(|on| on.success.as_deref()),
        Some("_end")
    );
}

#[test]
fn errors_accumulate_across_the_whole_document() {
    let errors = validation_errors(concat!(
        "version: \"9.9\"\n",
        "mystery: true\n",
        "steps:\n",
        "  - name: A\n",
        "    command: echo hi\n",
        "  - name: A\n",
        "    command: echo again\n",
        "    command_override: nope\n",
    ));
    assert!(errors.iter().any(|e| e.contains("unsupported version")));
    assert!(errors.iter().any(|e| e.contains("unknown field 'mystery'")));
    assert!(errors.iter().any(|e| e.contains("duplicate step name 'A'")));
    assert!(errors.iter().any(|e| e.contains("command_override")));
}

#[test]
fn execution_fields_are_mutually_exclusive_and_required() {
    let errors = validation_errors(concat!(
        "version: \"1.1\"\n",
        "steps:\n",
        "  - name: Both\n",
        "    command: echo hi\n",
        "    wait_for:\n",
        "      glob: \"inbox/*.task\"\n",
        "  - name: Neither\n",
        "    timeout_sec: 5\n",
    ));
    assert!(errors.iter().any(|e| e.contains("mutually exclusive")));
    assert!(errors.iter().any(|e| e.contains("exactly one of")));
}

#[test]
fn env_namespace_tokens_are_rejected_anywhere() {
    let errors = validation_errors(concat!(
        "version: \"1.1\"\n",
        "context:\n",
        "  home: \"${env.HOME}\"\n",
        "steps:\n",
        "  - name: Echo\n",
        "    command: echo hi\n",
    ));
    assert!(errors.iter().any(|e| e.contains("${env.*}")));
}

#[test]
fn goto_targets_must_exist_and_end_is_reserved() {
    let errors = validation_errors(concat!(
        "version: \"1.1\"\n",
        "steps:\n",
        "  - name: Start\n",
        "    command: echo hi\n",
        "    on:\n",
        "      failure:\n",
        "        goto: Nowhere\n",
    ));
    assert!(errors
        .iter()
        .any(|e| e.contains("unknown target 'Nowhere'")));

    assert!(load(concat!(
        "version: \"1.1\"\n",
        "steps:\n",
        "  - name: Start\n",
        "    command: echo hi\n",
        "    on:\n",
        "      always:\n",
        "        goto: _end\n",
    ))
    .is_ok());
}

#[test]
fn inject_is_gated_to_the_exact_version() {
    let errors = validation_errors(concat!(
        "version: \"1.1\"\n",
        "steps:\n",
        "  - name: Review\n",
        "    provider: claude\n",
        "    depends_on:\n",
        "      required: [\"docs/*.md\"]\n",
        "      inject: true\n",
    ));
    assert!(errors.iter().any(|e| e.contains("requires version '1.1.1'")));
}

#[test]
fn stdin_providers_reject_the_prompt_placeholder() {
    let errors = validation_errors(concat!(
        "version: \"1.1\"\n",
        "providers:\n",
        "  piped:\n",
        "    command: [tool, \"${PROMPT}\"]\n",
        "    input_mode: stdin\n",
        "steps:\n",
        "  - name: Go\n",
        "    provider: piped\n",
    ));
    assert!(errors
        .iter()
        .any(|e| e.contains("${PROMPT} not allowed in stdin mode")));
}

#[test]
fn step_paths_must_stay_relative_and_traversal_free() {
    let errors = validation_errors(concat!(
        "version: \"1.1\"\n",
        "steps:\n",
        "  - name: Escape\n",
        "    command: echo hi\n",
        "    output_file: ../outside.txt\n",
        "  - name: Absolute\n",
        "    provider: claude\n",
        "    input_file: /etc/prompt.txt\n",
    ));
    assert!(errors.iter().any(|e| e.contains("parent directory traversal")));
    assert!(errors.iter().any(|e| e.contains("absolute paths not allowed")));
}

#[test]
fn when_requires_exactly_one_condition_key() {
    let errors = validation_errors(concat!(
        "version: \"1.1\"\n",
        "steps:\n",
        "  - name: Guarded\n",
        "    command: echo hi\n",
        "    when:\n",
        "      exists: \"a/*.txt\"\n",
        "      not_exists: \"b/*.txt\"\n",
    ));
    assert!(errors
        .iter()
        .any(|e| e.contains("exactly one of equals/exists/not_exists")));
}

#[test]
fn for_each_requires_one_item_source_and_inner_steps() {
    let errors = validation_errors(concat!(
        "version: \"1.1\"\n",
        "steps:\n",
        "  - name: Loop\n",
        "    for_each:\n",
        "      items: [a]\n",
        "      items_from: steps.A.lines\n",
    ));
    assert!(errors
        .iter()
        .any(|e| e.contains("cannot have both 'items_from' and 'items'")));
    assert!(errors.iter().any(|e| e.contains("missing required 'steps'")));
}

#[test]
fn unknown_step_fields_are_rejected() {
    let errors = validation_errors(concat!(
        "version: \"1.1\"\n",
        "steps:\n",
        "  - name: Odd\n",
        "    command: echo hi\n",
        "    surprise: value\n",
    ));
    assert!(errors.iter().any(|e| e.contains("unknown field 'surprise'")));
}
