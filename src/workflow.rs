pub mod conditions;
pub mod executor;
pub mod loader;
pub mod pointers;

pub use loader::load_workflow;

use crate::deps::InjectSpec;
use crate::exec::CaptureMode;
use crate::provider::ProviderTemplate;
use crate::wait::WaitConfig;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const SUPPORTED_VERSIONS: [&str; 2] = ["1.1", "1.1.1"];
pub const INJECT_VERSION: &str = "1.1.1";
/// Reserved goto target terminating the run successfully.
pub const END_TARGET: &str = "_end";

/// A validated workflow, immutable after load.
#[derive(Debug, Clone, PartialEq)]
pub struct Workflow {
    pub version: String,
    pub name: Option<String>,
    pub strict_flow: bool,
    pub context: BTreeMap<String, String>,
    pub providers: Vec<ProviderTemplate>,
    pub secrets: Vec<String>,
    pub inbox_dir: Option<String>,
    pub processed_dir: Option<String>,
    pub failed_dir: Option<String>,
    pub task_extension: Option<String>,
    pub steps: Vec<Step>,
}

impl Workflow {
    pub fn processed_dir(&self) -> &str {
        self.processed_dir.as_deref().unwrap_or("processed")
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub name: String,
    pub when: Option<WhenCondition>,
    pub on: Option<OnHandlers>,
    pub env: BTreeMap<String, String>,
    pub secrets: Vec<String>,
    pub timeout_sec: Option<u64>,
    pub retries: Option<RetriesSpec>,
    pub output_capture: CaptureMode,
    pub allow_parse_error: bool,
    pub output_file: Option<String>,
    pub kind: StepKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    Command(CommandLine),
    Provider(ProviderStep),
    WaitFor(WaitConfig),
    ForEach(ForEachSpec),
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandLine {
    /// A single string, tokenized by POSIX quoting rules at execution time.
    Shell(String),
    Argv(Vec<String>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProviderStep {
    pub provider: String,
    pub provider_params: Map<String, Value>,
    pub input_file: Option<String>,
    pub depends_on: Option<DependsOn>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DependsOn {
    pub required: Vec<String>,
    pub optional: Vec<String>,
    pub inject: Option<InjectSpec>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WhenCondition {
    Equals { left: Value, right: Value },
    Exists(String),
    NotExists(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnHandlers {
    pub success: Option<String>,
    pub failure: Option<String>,
    pub always: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetriesSpec {
    pub max: u32,
    pub delay_ms: u64,
}

impl RetriesSpec {
    pub const DEFAULT_DELAY_MS: u64 = 1000;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForEachSpec {
    pub items: Option<Vec<Value>>,
    pub items_from: Option<String>,
    /// Alias binding the current item inside the iteration scope.
    pub alias: String,
    pub steps: Vec<Step>,
}
