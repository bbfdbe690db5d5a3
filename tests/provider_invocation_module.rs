use orchestrate::provider::{
    compose_command, ComposeError, InputMode, ProviderRegistry, ProviderTemplate,
};
use orchestrate::variables::Scope;
use serde_json::{json, Map, Value};

fn template(tokens: &[&str], input_mode: InputMode) -> ProviderTemplate {
    ProviderTemplate {
        name: "tool".to_string(),
        command: tokens.iter().map(|t| t.to_string()).collect(),
        defaults: Map::new(),
        input_mode,
    }
}

fn params(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(key, value)| (key.to_string(), value.clone()))
        .collect()
}

#[test]
fn placeholders_fill_from_params_and_the_prompt_stays_literal() {
    let template = template(
        &["agent", "-p", "${PROMPT}", "--model", "${model}"],
        InputMode::Argv,
    );
    let prompt = "Review this. Keep ${model} and ${run.id} untouched.";
    let invocation = compose_command(
        &template,
        &params(&[("model", json!("opus"))]),
        &Scope::default(),
        prompt,
    )
    .expect("compose");

    assert_eq!(
        invocation.argv,
        vec!["agent", "-p", prompt, "--model", "opus"]
    );
    assert!(invocation.stdin_prompt.is_none());
}

#[test]
fn nested_params_are_addressable_by_dotted_path() {
    let template = template(&["agent", "--fmt", "${output.format}"], InputMode::Argv);
    let invocation = compose_command(
        &template,
        &params(&[("output", json!({"format": "json"}))]),
        &Scope::default(),
        "",
    )
    .expect("compose");
    assert_eq!(invocation.argv, vec!["agent", "--fmt", "json"]);
}

#[test]
fn ambient_scope_backfills_placeholders_params_do_not_cover() {
    let template = template(&["agent", "--run", "${run.id}"], InputMode::Argv);
    let mut scope = Scope::default();
    scope.run.id = "20250101T000000Z-abc123".to_string();
    let invocation =
        compose_command(&template, &Map::new(), &scope, "").expect("compose");
    assert_eq!(invocation.argv[2], "20250101T000000Z-abc123");
}

#[test]
fn dollar_escapes_survive_composition() {
    let template = template(&["agent", "--cost", "$$5", "--raw", "$${model}"], InputMode::Argv);
    let invocation =
        compose_command(&template, &Map::new(), &Scope::default(), "").expect("compose");
    assert_eq!(invocation.argv[2], "$5");
    assert_eq!(invocation.argv[4], "${model}");
}

#[test]
fn missing_placeholders_are_reported_sorted() {
    let template = template(
        &["agent", "${zeta}", "${alpha}", "${alpha}"],
        InputMode::Argv,
    );
    let err = compose_command(&template, &Map::new(), &Scope::default(), "")
        .expect_err("should fail");
    let ComposeError::MissingPlaceholders(names) = err else {
        panic!("expected missing placeholders");
    };
    assert_eq!(names, vec!["alpha", "zeta"]);
}

#[test]
fn stdin_mode_rejects_the_prompt_placeholder_and_delivers_via_stdin() {
    let bad = template(&["agent", "${PROMPT}"], InputMode::Stdin);
    assert!(matches!(
        compose_command(&bad, &Map::new(), &Scope::default(), "p"),
        Err(ComposeError::InvalidPromptPlaceholder)
    ));

    let good = template(&["agent", "exec"], InputMode::Stdin);
    let invocation =
        compose_command(&good, &Map::new(), &Scope::default(), "piped body").expect("compose");
    assert_eq!(invocation.stdin_prompt.as_deref(), Some("piped body"));
}

#[test]
fn builtin_registry_templates_resolve_and_merge_deeply() {
    let registry = ProviderRegistry::new();
    assert!(registry.get("claude").is_some());
    assert!(registry.get("gemini").is_some());
    assert_eq!(
        registry.get("codex").map(|t| t.input_mode),
        Some(InputMode::Stdin)
    );

    let merged = registry.merge_params(
        "claude",
        &params(&[("options", json!({"depth": 2, "keep": true}))]),
    );
    assert_eq!(merged["model"], "claude-sonnet-4-20250514");
    assert_eq!(merged["options"]["depth"], 2);
}

#[test]
fn workflow_templates_override_builtins_by_name() {
    let mut registry = ProviderRegistry::new();
    registry.register(ProviderTemplate {
        name: "claude".to_string(),
        command: vec!["local-claude".to_string(), "${PROMPT}".to_string()],
        defaults: params(&[("model", json!("local"))]),
        input_mode: InputMode::Argv,
    });
    assert_eq!(registry.get("claude").expect("template").command[0], "local-claude");
    assert_eq!(registry.merge_params("claude", &Map::new())["model"], "local");
}

#[test]
fn deep_merge_lets_step_values_win_recursively() {
    let mut registry = ProviderRegistry::new();
    registry.register(ProviderTemplate {
        name: "nested".to_string(),
        command: vec!["tool".to_string()],
        defaults: params(&[(
            "output",
            json!({"format": "text", "limits": {"lines": 10, "bytes": 100}}),
        )]),
        input_mode: InputMode::Argv,
    });

    let merged = registry.merge_params(
        "nested",
        &params(&[("output", json!({"limits": {"lines": 99}}))]),
    );
    assert_eq!(merged["output"]["format"], "text");
    assert_eq!(merged["output"]["limits"]["lines"], 99);
    assert_eq!(merged["output"]["limits"]["bytes"], 100);
}
