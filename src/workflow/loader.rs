use crate::deps::{InjectMode, InjectPosition, InjectSpec};
use crate::exec::CaptureMode;
use crate::provider::{InputMode, ProviderTemplate};
use crate::shared::path_safety;
use crate::wait::{self, WaitConfig};
use crate::workflow::{
    CommandLine, DependsOn, ForEachSpec, OnHandlers, ProviderStep, RetriesSpec, Step, StepKind,
    WhenCondition, Workflow, END_TARGET, INJECT_VERSION, SUPPORTED_VERSIONS,
};
use serde_json::Value as Json;
use serde_yaml::Value as Yaml;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("failed to read workflow {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("workflow validation failed:\n{}", errors.join("\n"))]
    Validation { errors: Vec<String> },
}

const TOP_LEVEL_FIELDS: [&str; 11] = [
    "version",
    "name",
    "strict_flow",
    "context",
    "providers",
    "secrets",
    "inbox_dir",
    "processed_dir",
    "failed_dir",
    "task_extension",
    "steps",
];

const STEP_FIELDS: [&str; 17] = [
    "name",
    "when",
    "on",
    "env",
    "secrets",
    "timeout_sec",
    "retries",
    "command",
    "provider",
    "provider_params",
    "input_file",
    "output_file",
    "depends_on",
    "wait_for",
    "for_each",
    "output_capture",
    "allow_parse_error",
];

const EXECUTION_FIELDS: [&str; 4] = ["command", "provider", "wait_for", "for_each"];

/// Loads and strictly validates a workflow document. Every violation is
/// accumulated; the caller sees the full list at once (exit 2).
pub fn load_workflow(path: &Path) -> Result<Workflow, WorkflowError> {
    let raw = fs::read_to_string(path).map_err(|source| WorkflowError::Read {
        path: path.display().to_string(),
        source,
    })?;
    let doc: Yaml = serde_yaml::from_str(&raw).map_err(|source| WorkflowError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    let mut validator = Validator::default();
    let workflow = validator.build_workflow(&doc);
    match workflow {
        Some(workflow) if validator.errors.is_empty() => Ok(workflow),
        _ => Err(WorkflowError::Validation {
            errors: validator.errors,
        }),
    }
}

#[derive(Default)]
struct Validator {
    errors: Vec<String>,
}

impl Validator {
    fn fail(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn build_workflow(&mut self, doc: &Yaml) -> Option<Workflow> {
        let Some(mapping) = doc.as_mapping() else {
            self.fail("workflow must be a YAML mapping");
            return None;
        };

        self.reject_env_tokens(doc);

        let version = match doc.get("version") {
            Some(Yaml::String(version)) => {
                if !SUPPORTED_VERSIONS.contains(&version.as_str()) {
                    self.fail(format!(
                        "unsupported version '{version}'; supported: {}",
                        SUPPORTED_VERSIONS.join(", ")
                    ));
                }
                version.clone()
            }
            Some(_) => {
                self.fail("'version' field must be a string");
                String::new()
            }
            None => {
                self.fail("'version' field is required");
                String::new()
            }
        };

        for key in mapping.keys() {
            let Some(key) = key.as_str() else {
                self.fail("top-level field keys must be strings");
                continue;
            };
            if !TOP_LEVEL_FIELDS.contains(&key) {
                self.fail(format!("unknown field '{key}' at version '{version}'"));
            }
        }

        let name = self.optional_string(doc, "name", "workflow");
        let strict_flow = match doc.get("strict_flow") {
            Some(Yaml::Bool(flag)) => *flag,
            Some(_) => {
                self.fail("'strict_flow' must be a boolean");
                true
            }
            None => true,
        };

        let context = self.build_context(doc.get("context"));
        let providers = self.build_providers(doc.get("providers"));
        let secrets = self.build_secrets(doc.get("secrets"));

        let inbox_dir = self.optional_dir(doc, "inbox_dir");
        let processed_dir = self.optional_dir(doc, "processed_dir");
        let failed_dir = self.optional_dir(doc, "failed_dir");
        let task_extension = self.optional_string(doc, "task_extension", "workflow");

        let steps = match doc.get("steps") {
            Some(Yaml::Sequence(raw_steps)) if !raw_steps.is_empty() => {
                self.build_steps(raw_steps, &version)
            }
            Some(Yaml::Sequence(_)) | None => {
                self.fail("'steps' field is required and must not be empty");
                Vec::new()
            }
            Some(_) => {
                self.fail("'steps' must be a sequence");
                Vec::new()
            }
        };

        self.check_goto_targets(&steps);

        Some(Workflow {
            version,
            name,
            strict_flow,
            context,
            providers,
            secrets,
            inbox_dir,
            processed_dir,
            failed_dir,
            task_extension,
            steps,
        })
    }

    fn build_context(&mut self, value: Option<&Yaml>) -> BTreeMap<String, String> {
        let mut context = BTreeMap::new();
        let Some(value) = value else {
            return context;
        };
        let Some(mapping) = value.as_mapping() else {
            self.fail("'context' must be a mapping");
            return context;
        };
        for (key, entry) in mapping {
            let Some(key) = key.as_str() else {
                self.fail("'context' keys must be strings");
                continue;
            };
            match scalar_to_string(entry) {
                Some(rendered) => {
                    context.insert(key.to_string(), rendered);
                }
                None => self.fail(format!("'context.{key}' must be a scalar value")),
            }
        }
        context
    }

    fn build_secrets(&mut self, value: Option<&Yaml>) -> Vec<String> {
        let mut secrets = Vec::new();
        let Some(value) = value else {
            return secrets;
        };
        let Some(entries) = value.as_sequence() else {
            self.fail("'secrets' must be a list of environment variable names");
            return secrets;
        };
        for (index, entry) in entries.iter().enumerate() {
            match entry.as_str() {
                Some("") => self.fail(format!("'secrets[{index}]' cannot be empty")),
                Some(name) => secrets.push(name.to_string()),
                None => self.fail(format!("'secrets[{index}]' must be a string")),
            }
        }
        secrets
    }

    fn build_providers(&mut self, value: Option<&Yaml>) -> Vec<ProviderTemplate> {
        let mut providers = Vec::new();
        let Some(value) = value else {
            return providers;
        };
        let Some(mapping) = value.as_mapping() else {
            self.fail("'providers' must be a mapping");
            return providers;
        };
        for (key, config) in mapping {
            let Some(name) = key.as_str() else {
                self.fail("provider names must be strings");
                continue;
            };
            let Some(config_map) = config.as_mapping() else {
                self.fail(format!("provider '{name}' must be a mapping"));
                continue;
            };

            for field in config_map.keys() {
                match field.as_str() {
                    Some("command") | Some("defaults") | Some("input_mode") => {}
                    Some(other) => {
                        self.fail(format!("provider '{name}': unknown field '{other}'"))
                    }
                    None => self.fail(format!("provider '{name}': field keys must be strings")),
                }
            }

            let command = match config.get("command") {
                Some(Yaml::Sequence(tokens)) => {
                    let mut argv = Vec::with_capacity(tokens.len());
                    for token in tokens {
                        match token.as_str() {
                            Some(token) => argv.push(token.to_string()),
                            None => self.fail(format!(
                                "provider '{name}': command tokens must be strings"
                            )),
                        }
                    }
                    argv
                }
                Some(_) => {
                    self.fail(format!("provider '{name}': command must be a list"));
                    Vec::new()
                }
                None => {
                    self.fail(format!("provider '{name}': missing required 'command' field"));
                    Vec::new()
                }
            };

            let input_mode = match config.get("input_mode") {
                Some(value) => match value.as_str().and_then(InputMode::parse) {
                    Some(mode) => mode,
                    None => {
                        self.fail(format!(
                            "provider '{name}': input_mode must be 'argv' or 'stdin'"
                        ));
                        InputMode::Argv
                    }
                },
                None => InputMode::Argv,
            };

            let defaults = match config.get("defaults") {
                Some(value) => match self.yaml_to_json(value, &format!("provider '{name}' defaults"))
                {
                    Some(Json::Object(map)) => map,
                    Some(_) => {
                        self.fail(format!("provider '{name}': defaults must be a mapping"));
                        Default::default()
                    }
                    None => Default::default(),
                },
                None => Default::default(),
            };

            let template = ProviderTemplate {
                name: name.to_string(),
                command,
                defaults,
                input_mode,
            };
            for error in template.validate() {
                self.fail(error);
            }
            providers.push(template);
        }
        providers
    }

    fn build_steps(&mut self, raw_steps: &[Yaml], version: &str) -> Vec<Step> {
        let mut names = BTreeSet::new();
        let mut steps = Vec::with_capacity(raw_steps.len());
        for (index, raw) in raw_steps.iter().enumerate() {
            if let Some(step) = self.build_step(raw, index, version, &mut names) {
                steps.push(step);
            }
        }
        steps
    }

    fn build_step(
        &mut self,
        raw: &Yaml,
        index: usize,
        version: &str,
        names: &mut BTreeSet<String>,
    ) -> Option<Step> {
        let Some(mapping) = raw.as_mapping() else {
            self.fail(format!("step {index} must be a mapping"));
            return None;
        };

        if raw.get("command_override").is_some() {
            self.fail(format!(
                "step {index}: deprecated 'command_override' not supported"
            ));
        }

        for key in mapping.keys() {
            let Some(key) = key.as_str() else {
                self.fail(format!("step {index}: field keys must be strings"));
                continue;
            };
            if key != "command_override" && !STEP_FIELDS.contains(&key) {
                self.fail(format!("step {index}: unknown field '{key}'"));
            }
        }

        let name = match raw.get("name") {
            Some(Yaml::String(name)) if !name.is_empty() => {
                if !names.insert(name.clone()) {
                    self.fail(format!("duplicate step name '{name}'"));
                }
                name.clone()
            }
            Some(_) => {
                self.fail(format!("step {index}: name must be a non-empty string"));
                format!("<step_{index}>")
            }
            None => {
                self.fail(format!("step {index}: missing required 'name' field"));
                format!("<step_{index}>")
            }
        };

        let present: Vec<&str> = EXECUTION_FIELDS
            .iter()
            .copied()
            .filter(|field| raw.get(*field).is_some())
            .collect();
        if present.len() != 1 {
            if present.is_empty() {
                self.fail(format!(
                    "step '{name}': exactly one of command/provider/wait_for/for_each is required"
                ));
            } else {
                self.fail(format!(
                    "step '{name}': mutually exclusive fields [{}]",
                    present.join(", ")
                ));
            }
        }

        for field in ["provider_params", "input_file", "depends_on"] {
            if raw.get(field).is_some() && raw.get("provider").is_none() {
                self.fail(format!(
                    "step '{name}': '{field}' requires a provider step"
                ));
            }
        }

        let when = self.build_when(raw.get("when"), &name);
        let on = self.build_on(raw.get("on"), &name);
        let env = self.build_env(raw.get("env"), &name);
        let secrets = self.build_step_secrets(raw.get("secrets"), &name);
        let timeout_sec = self.optional_u64(raw.get("timeout_sec"), &name, "timeout_sec");
        let retries = self.build_retries(raw.get("retries"), &name);
        let output_capture = self.build_capture_mode(raw.get("output_capture"), &name);
        let allow_parse_error = match raw.get("allow_parse_error") {
            Some(Yaml::Bool(flag)) => *flag,
            Some(_) => {
                self.fail(format!("step '{name}': allow_parse_error must be a boolean"));
                false
            }
            None => false,
        };
        let output_file = self.optional_safe_path(raw.get("output_file"), &name, "output_file");

        let kind = self.build_kind(raw, &name, version)?;

        Some(Step {
            name,
            when,
            on,
            env,
            secrets,
            timeout_sec,
            retries,
            output_capture,
            allow_parse_error,
            output_file,
            kind,
        })
    }

    fn build_kind(&mut self, raw: &Yaml, name: &str, version: &str) -> Option<StepKind> {
        if let Some(command) = raw.get("command") {
            return match command {
                Yaml::String(line) => Some(StepKind::Command(CommandLine::Shell(line.clone()))),
                Yaml::Sequence(tokens) => {
                    let mut argv = Vec::with_capacity(tokens.len());
                    for token in tokens {
                        match scalar_to_string(token) {
                            Some(token) => argv.push(token),
                            None => {
                                self.fail(format!(
                                    "step '{name}': command tokens must be scalars"
                                ));
                            }
                        }
                    }
                    Some(StepKind::Command(CommandLine::Argv(argv)))
                }
                _ => {
                    self.fail(format!("step '{name}': command must be a string or a list"));
                    None
                }
            };
        }

        if let Some(provider) = raw.get("provider") {
            let Some(provider) = provider.as_str() else {
                self.fail(format!("step '{name}': provider must be a string"));
                return None;
            };
            let provider_params = match raw.get("provider_params") {
                Some(value) => {
                    match self.yaml_to_json(value, &format!("step '{name}' provider_params")) {
                        Some(Json::Object(map)) => map,
                        Some(_) => {
                            self.fail(format!("step '{name}': provider_params must be a mapping"));
                            Default::default()
                        }
                        None => Default::default(),
                    }
                }
                None => Default::default(),
            };
            let input_file = self.optional_safe_path(raw.get("input_file"), name, "input_file");
            let depends_on = self.build_depends_on(raw.get("depends_on"), name, version);
            return Some(StepKind::Provider(ProviderStep {
                provider: provider.to_string(),
                provider_params,
                input_file,
                depends_on,
            }));
        }

        if let Some(wait_for) = raw.get("wait_for") {
            return self.build_wait_for(wait_for, name).map(StepKind::WaitFor);
        }

        if let Some(for_each) = raw.get("for_each") {
            return self
                .build_for_each(for_each, name, version)
                .map(StepKind::ForEach);
        }

        None
    }

    fn build_wait_for(&mut self, raw: &Yaml, name: &str) -> Option<WaitConfig> {
        let Some(mapping) = raw.as_mapping() else {
            self.fail(format!("step '{name}': wait_for must be a mapping"));
            return None;
        };
        for key in mapping.keys() {
            match key.as_str() {
                Some("glob") | Some("timeout_sec") | Some("poll_ms") | Some("min_count") => {}
                Some(other) => {
                    self.fail(format!("step '{name}': unknown wait_for field '{other}'"))
                }
                None => self.fail(format!("step '{name}': wait_for keys must be strings")),
            }
        }
        let pattern = match raw.get("glob") {
            Some(Yaml::String(pattern)) if !pattern.is_empty() => pattern.clone(),
            _ => {
                self.fail(format!(
                    "step '{name}': wait_for requires a non-empty 'glob' string"
                ));
                return None;
            }
        };
        Some(WaitConfig {
            pattern,
            timeout_sec: self
                .optional_u64(raw.get("timeout_sec"), name, "wait_for.timeout_sec")
                .unwrap_or(wait::DEFAULT_TIMEOUT_SEC),
            poll_ms: self
                .optional_u64(raw.get("poll_ms"), name, "wait_for.poll_ms")
                .unwrap_or(wait::DEFAULT_POLL_MS),
            min_count: self
                .optional_u64(raw.get("min_count"), name, "wait_for.min_count")
                .unwrap_or(wait::DEFAULT_MIN_COUNT as u64) as usize,
        })
    }

    fn build_for_each(&mut self, raw: &Yaml, name: &str, version: &str) -> Option<ForEachSpec> {
        let Some(mapping) = raw.as_mapping() else {
            self.fail(format!("step '{name}': for_each must be a mapping"));
            return None;
        };
        for key in mapping.keys() {
            match key.as_str() {
                Some("items") | Some("items_from") | Some("as") | Some("steps") => {}
                Some(other) => {
                    self.fail(format!("step '{name}': unknown for_each field '{other}'"))
                }
                None => self.fail(format!("step '{name}': for_each keys must be strings")),
            }
        }

        let has_items = raw.get("items").is_some();
        let has_from = raw.get("items_from").is_some();
        if !has_items && !has_from {
            self.fail(format!(
                "step '{name}': for_each requires 'items_from' or 'items'"
            ));
        } else if has_items && has_from {
            self.fail(format!(
                "step '{name}': for_each cannot have both 'items_from' and 'items'"
            ));
        }

        let items = match raw.get("items") {
            Some(Yaml::Sequence(entries)) => {
                let mut items = Vec::with_capacity(entries.len());
                for entry in entries {
                    if let Some(value) =
                        self.yaml_to_json(entry, &format!("step '{name}' for_each items"))
                    {
                        items.push(value);
                    }
                }
                Some(items)
            }
            Some(_) => {
                self.fail(format!("step '{name}': for_each items must be a sequence"));
                None
            }
            None => None,
        };

        let items_from = match raw.get("items_from") {
            Some(Yaml::String(pointer)) => Some(pointer.clone()),
            Some(_) => {
                self.fail(format!(
                    "step '{name}': for_each items_from must be a string"
                ));
                None
            }
            None => None,
        };

        let alias = match raw.get("as") {
            Some(Yaml::String(alias)) if !alias.is_empty() => alias.clone(),
            Some(_) => {
                self.fail(format!("step '{name}': for_each 'as' must be a string"));
                "item".to_string()
            }
            None => "item".to_string(),
        };

        let steps = match raw.get("steps") {
            Some(Yaml::Sequence(raw_steps)) if !raw_steps.is_empty() => {
                self.build_steps(raw_steps, version)
            }
            _ => {
                self.fail(format!("step '{name}': for_each missing required 'steps'"));
                Vec::new()
            }
        };

        Some(ForEachSpec {
            items,
            items_from,
            alias,
            steps,
        })
    }

    fn build_depends_on(&mut self, raw: Option<&Yaml>, name: &str, version: &str) -> Option<DependsOn> {
        let raw = raw?;
        let Some(mapping) = raw.as_mapping() else {
            self.fail(format!("step '{name}': depends_on must be a mapping"));
            return None;
        };
        for key in mapping.keys() {
            match key.as_str() {
                Some("required") | Some("optional") | Some("inject") => {}
                Some(other) => {
                    self.fail(format!("step '{name}': unknown depends_on field '{other}'"))
                }
                None => self.fail(format!("step '{name}': depends_on keys must be strings")),
            }
        }

        let required = self.pattern_list(raw.get("required"), name, "depends_on.required");
        let optional = self.pattern_list(raw.get("optional"), name, "depends_on.optional");

        let inject = match raw.get("inject") {
            Some(value) => {
                if version != INJECT_VERSION {
                    self.fail(format!(
                        "step '{name}': depends_on.inject requires version '{INJECT_VERSION}'"
                    ));
                }
                self.build_inject(value, name)
            }
            None => None,
        };

        Some(DependsOn {
            required,
            optional,
            inject,
        })
    }

    fn pattern_list(&mut self, raw: Option<&Yaml>, name: &str, field: &str) -> Vec<String> {
        let mut patterns = Vec::new();
        let Some(raw) = raw else {
            return patterns;
        };
        let Some(entries) = raw.as_sequence() else {
            self.fail(format!(
                "step '{name}': {field} must be a list of glob patterns"
            ));
            return patterns;
        };
        for entry in entries {
            match entry.as_str() {
                Some(pattern) => {
                    // Static patterns are checked now; variable-bearing ones
                    // are re-checked after substitution.
                    if let Err(violation) = path_safety::check_pattern(pattern) {
                        self.fail(format!("step '{name}' {field}: {violation}"));
                    }
                    patterns.push(pattern.to_string());
                }
                None => self.fail(format!("step '{name}': {field} entries must be strings")),
            }
        }
        patterns
    }

    fn build_inject(&mut self, raw: &Yaml, name: &str) -> Option<InjectSpec> {
        match raw {
            Yaml::Bool(true) => Some(InjectSpec::shorthand()),
            Yaml::Bool(false) => None,
            Yaml::Mapping(mapping) => {
                for key in mapping.keys() {
                    match key.as_str() {
                        Some("mode") | Some("position") | Some("instruction") => {}
                        Some(other) => {
                            self.fail(format!("step '{name}': unknown inject field '{other}'"))
                        }
                        None => self.fail(format!("step '{name}': inject keys must be strings")),
                    }
                }
                let mode = match raw.get("mode") {
                    Some(value) => match value.as_str().and_then(InjectMode::parse) {
                        Some(mode) => mode,
                        None => {
                            self.fail(format!(
                                "step '{name}': inject mode must be list, content, or none"
                            ));
                            InjectMode::List
                        }
                    },
                    None => InjectMode::List,
                };
                let position = match raw.get("position") {
                    Some(value) => match value.as_str().and_then(InjectPosition::parse) {
                        Some(position) => position,
                        None => {
                            self.fail(format!(
                                "step '{name}': inject position must be prepend or append"
                            ));
                            InjectPosition::Prepend
                        }
                    },
                    None => InjectPosition::Prepend,
                };
                let instruction = match raw.get("instruction") {
                    Some(Yaml::String(text)) => Some(text.clone()),
                    Some(_) => {
                        self.fail(format!("step '{name}': inject instruction must be a string"));
                        None
                    }
                    None => None,
                };
                Some(InjectSpec {
                    mode,
                    position,
                    instruction,
                })
            }
            _ => {
                self.fail(format!(
                    "step '{name}': inject must be true or a mapping"
                ));
                None
            }
        }
    }

    fn build_when(&mut self, raw: Option<&Yaml>, name: &str) -> Option<WhenCondition> {
        let raw = raw?;
        let Some(mapping) = raw.as_mapping() else {
            self.fail(format!("step '{name}': when must be a mapping"));
            return None;
        };

        let present: Vec<&str> = ["equals", "exists", "not_exists"]
            .into_iter()
            .filter(|key| raw.get(*key).is_some())
            .collect();
        for key in mapping.keys() {
            match key.as_str() {
                Some("equals") | Some("exists") | Some("not_exists") => {}
                Some(other) => self.fail(format!("step '{name}': unknown when field '{other}'")),
                None => self.fail(format!("step '{name}': when keys must be strings")),
            }
        }
        if present.len() != 1 {
            self.fail(format!(
                "step '{name}': when requires exactly one of equals/exists/not_exists"
            ));
            return None;
        }

        match present[0] {
            "equals" => {
                let equals = raw.get("equals")?;
                if equals.as_mapping().is_none() {
                    self.fail(format!("step '{name}': when.equals must be a mapping"));
                    return None;
                }
                let left = equals.get("left");
                let right = equals.get("right");
                if left.is_none() || right.is_none() {
                    self.fail(format!(
                        "step '{name}': when.equals must have 'left' and 'right'"
                    ));
                    return None;
                }
                let left = self.yaml_to_json(left?, &format!("step '{name}' when.equals.left"))?;
                let right =
                    self.yaml_to_json(right?, &format!("step '{name}' when.equals.right"))?;
                Some(WhenCondition::Equals { left, right })
            }
            "exists" => match raw.get("exists") {
                Some(Yaml::String(pattern)) => Some(WhenCondition::Exists(pattern.clone())),
                _ => {
                    self.fail(format!("step '{name}': when.exists must be a string"));
                    None
                }
            },
            _ => match raw.get("not_exists") {
                Some(Yaml::String(pattern)) => Some(WhenCondition::NotExists(pattern.clone())),
                _ => {
                    self.fail(format!("step '{name}': when.not_exists must be a string"));
                    None
                }
            },
        }
    }

    fn build_on(&mut self, raw: Option<&Yaml>, name: &str) -> Option<OnHandlers> {
        let raw = raw?;
        let Some(mapping) = raw.as_mapping() else {
            self.fail(format!("step '{name}': on must be a mapping"));
            return None;
        };

        let mut handlers = OnHandlers::default();
        for (key, value) in mapping {
            let handler = match key.as_str() {
                Some(handler @ ("success" | "failure" | "always")) => handler,
                Some(other) => {
                    self.fail(format!("step '{name}': unknown on handler '{other}'"));
                    continue;
                }
                None => {
                    self.fail(format!("step '{name}': on handler keys must be strings"));
                    continue;
                }
            };
            let Some(body) = value.as_mapping() else {
                self.fail(format!("step '{name}': on.{handler} must be a mapping"));
                continue;
            };
            for field in body.keys() {
                match field.as_str() {
                    Some("goto") => {}
                    Some(other) => self.fail(format!(
                        "step '{name}': unknown on.{handler} field '{other}'"
                    )),
                    None => {
                        self.fail(format!("step '{name}': on.{handler} keys must be strings"))
                    }
                }
            }
            let target = match value.get("goto") {
                Some(Yaml::String(target)) => Some(target.clone()),
                Some(_) => {
                    self.fail(format!("step '{name}': on.{handler}.goto must be a string"));
                    None
                }
                None => None,
            };
            match handler {
                "success" => handlers.success = target,
                "failure" => handlers.failure = target,
                _ => handlers.always = target,
            }
        }
        Some(handlers)
    }

    fn build_env(&mut self, raw: Option<&Yaml>, name: &str) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        let Some(raw) = raw else {
            return env;
        };
        let Some(mapping) = raw.as_mapping() else {
            self.fail(format!("step '{name}': env must be a mapping"));
            return env;
        };
        for (key, value) in mapping {
            let Some(key) = key.as_str() else {
                self.fail(format!("step '{name}': env keys must be strings"));
                continue;
            };
            match scalar_to_string(value) {
                Some(rendered) => {
                    env.insert(key.to_string(), rendered);
                }
                None => self.fail(format!("step '{name}': env.{key} must be a scalar")),
            }
        }
        env
    }

    fn build_step_secrets(&mut self, raw: Option<&Yaml>, name: &str) -> Vec<String> {
        let mut secrets = Vec::new();
        let Some(raw) = raw else {
            return secrets;
        };
        let Some(entries) = raw.as_sequence() else {
            self.fail(format!("step '{name}': secrets must be a list"));
            return secrets;
        };
        for entry in entries {
            match entry.as_str() {
                Some("") => self.fail(format!("step '{name}': secret names cannot be empty")),
                Some(secret) => secrets.push(secret.to_string()),
                None => self.fail(format!("step '{name}': secret names must be strings")),
            }
        }
        secrets
    }

    fn build_retries(&mut self, raw: Option<&Yaml>, name: &str) -> Option<RetriesSpec> {
        let raw = raw?;
        match raw {
            Yaml::Number(number) => match number.as_u64() {
                Some(max) => Some(RetriesSpec {
                    max: max as u32,
                    delay_ms: RetriesSpec::DEFAULT_DELAY_MS,
                }),
                None => {
                    self.fail(format!(
                        "step '{name}': retries must be a non-negative integer"
                    ));
                    None
                }
            },
            Yaml::Mapping(mapping) => {
                for key in mapping.keys() {
                    match key.as_str() {
                        Some("max") | Some("delay_ms") => {}
                        Some(other) => {
                            self.fail(format!("step '{name}': unknown retries field '{other}'"))
                        }
                        None => self.fail(format!("step '{name}': retries keys must be strings")),
                    }
                }
                let max = self
                    .optional_u64(raw.get("max"), name, "retries.max")
                    .unwrap_or(0) as u32;
                let delay_ms = self
                    .optional_u64(raw.get("delay_ms"), name, "retries.delay_ms")
                    .unwrap_or(RetriesSpec::DEFAULT_DELAY_MS);
                Some(RetriesSpec { max, delay_ms })
            }
            _ => {
                self.fail(format!(
                    "step '{name}': retries must be an integer or a mapping"
                ));
                None
            }
        }
    }

    fn build_capture_mode(&mut self, raw: Option<&Yaml>, name: &str) -> CaptureMode {
        match raw {
            Some(value) => match value.as_str().and_then(CaptureMode::parse) {
                Some(mode) => mode,
                None => {
                    self.fail(format!(
                        "step '{name}': output_capture must be text, lines, or json"
                    ));
                    CaptureMode::Text
                }
            },
            None => CaptureMode::Text,
        }
    }

    fn optional_string(&mut self, doc: &Yaml, field: &str, context: &str) -> Option<String> {
        match doc.get(field) {
            Some(Yaml::String(value)) => Some(value.clone()),
            Some(_) => {
                self.fail(format!("{context}: '{field}' must be a string"));
                None
            }
            None => None,
        }
    }

    fn optional_dir(&mut self, doc: &Yaml, field: &str) -> Option<String> {
        let value = self.optional_string(doc, field, "workflow")?;
        if let Err(violation) = path_safety::check_pattern(&value) {
            self.fail(format!("'{field}': {violation}"));
        }
        Some(value)
    }

    fn optional_safe_path(&mut self, raw: Option<&Yaml>, name: &str, field: &str) -> Option<String> {
        match raw? {
            Yaml::String(value) => {
                if let Err(violation) = path_safety::check_pattern(value) {
                    self.fail(format!("step '{name}' {field}: {violation}"));
                }
                Some(value.clone())
            }
            _ => {
                self.fail(format!("step '{name}': {field} must be a string"));
                None
            }
        }
    }

    fn optional_u64(&mut self, raw: Option<&Yaml>, name: &str, field: &str) -> Option<u64> {
        match raw? {
            Yaml::Number(number) => match number.as_u64() {
                Some(value) => Some(value),
                None => {
                    self.fail(format!(
                        "step '{name}': {field} must be a non-negative integer"
                    ));
                    None
                }
            },
            _ => {
                self.fail(format!("step '{name}': {field} must be an integer"));
                None
            }
        }
    }

    fn yaml_to_json(&mut self, value: &Yaml, context: &str) -> Option<Json> {
        match serde_json::to_value(value) {
            Ok(json) => Some(json),
            Err(_) => {
                self.fail(format!("{context}: value is not representable as JSON"));
                None
            }
        }
    }

    /// `${env.*}` is forbidden anywhere in the document.
    fn reject_env_tokens(&mut self, value: &Yaml) {
        match value {
            Yaml::String(text) => {
                if text.contains("${env.") {
                    self.fail(format!(
                        "${{env.*}} namespace not allowed in the DSL (found in '{text}')"
                    ));
                }
            }
            Yaml::Sequence(entries) => {
                for entry in entries {
                    self.reject_env_tokens(entry);
                }
            }
            Yaml::Mapping(mapping) => {
                for (_, entry) in mapping {
                    self.reject_env_tokens(entry);
                }
            }
            _ => {}
        }
    }

    fn check_goto_targets(&mut self, steps: &[Step]) {
        let mut valid: BTreeSet<String> = BTreeSet::new();
        valid.insert(END_TARGET.to_string());
        collect_step_names(steps, &mut valid);
        self.check_goto_references(steps, &valid);
    }

    fn check_goto_references(&mut self, steps: &[Step], valid: &BTreeSet<String>) {
        for step in steps {
            if let Some(handlers) = &step.on {
                for (handler, target) in [
                    ("success", &handlers.success),
                    ("failure", &handlers.failure),
                    ("always", &handlers.always),
                ] {
                    if let Some(target) = target {
                        if !valid.contains(target) {
                            self.fail(format!(
                                "step '{}' on.{handler}.goto references unknown target '{target}'",
                                step.name
                            ));
                        }
                    }
                }
            }
            if let StepKind::ForEach(spec) = &step.kind {
                self.check_goto_references(&spec.steps, valid);
            }
        }
    }
}

fn collect_step_names(steps: &[Step], names: &mut BTreeSet<String>) {
    for step in steps {
        names.insert(step.name.clone());
        if let StepKind::ForEach(spec) = &step.kind {
            collect_step_names(&spec.steps, names);
        }
    }
}

fn scalar_to_string(value: &Yaml) -> Option<String> {
    match value {
        Yaml::String(text) => Some(text.clone()),
        Yaml::Bool(flag) => Some(if *flag { "true" } else { "false" }.to_string()),
        Yaml::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
