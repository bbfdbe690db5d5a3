use crate::workflow::executor::OnErrorMode;

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct CliError(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    fn parse(raw: &str) -> Option<Self> {
        match raw {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warn" => Some(Self::Warn),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    Run(RunOptions),
    Resume(ResumeOptions),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunOptions {
    pub workflow: String,
    pub context: Vec<(String, String)>,
    pub context_file: Option<String>,
    pub clean_processed: bool,
    pub archive_processed: Option<String>,
    pub dry_run: bool,
    pub debug: bool,
    pub backup_state: bool,
    pub on_error: OnErrorMode,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub quiet: bool,
    pub verbose: bool,
    pub log_level: LogLevel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeOptions {
    pub run_id: String,
    pub repair: bool,
    pub force_restart: bool,
    pub debug: bool,
    pub backup_state: bool,
}

const USAGE: &str = "usage: orchestrate <run|resume> ...\n\
  run <workflow.yaml> [--context KEY=VALUE]... [--context-file FILE] \
[--clean-processed] [--archive-processed DEST] [--dry-run] [--debug] \
[--backup-state] [--on-error stop|continue] [--max-retries N] \
[--retry-delay MS] [--quiet] [--verbose] [--log-level LEVEL]\n\
  resume <run-id> [--repair] [--force-restart] [--debug] [--backup-state]";

pub fn parse(args: &[String]) -> Result<CliCommand, CliError> {
    let mut args = args.iter();
    match args.next().map(String::as_str) {
        Some("run") => parse_run(&args.cloned().collect::<Vec<_>>()),
        Some("resume") => parse_resume(&args.cloned().collect::<Vec<_>>()),
        Some(other) => Err(CliError(format!("unknown command '{other}'\n{USAGE}"))),
        None => Err(CliError(USAGE.to_string())),
    }
}

fn parse_run(args: &[String]) -> Result<CliCommand, CliError> {
    let mut workflow = None;
    let mut options = RunOptions {
        workflow: String::new(),
        context: Vec::new(),
        context_file: None,
        clean_processed: false,
        archive_processed: None,
        dry_run: false,
        debug: false,
        backup_state: false,
        on_error: OnErrorMode::Stop,
        max_retries: 0,
        retry_delay_ms: 1000,
        quiet: false,
        verbose: false,
        log_level: LogLevel::Info,
    };

    let mut cursor = args.iter();
    while let Some(arg) = cursor.next() {
        match arg.as_str() {
            "--context" => {
                let pair = expect_value(&mut cursor, "--context")?;
                let Some((key, value)) = pair.split_once('=') else {
                    return Err(CliError(format!(
                        "invalid context format: {pair}; expected KEY=VALUE"
                    )));
                };
                options.context.push((key.to_string(), value.to_string()));
            }
            "--context-file" => {
                options.context_file = Some(expect_value(&mut cursor, "--context-file")?)
            }
            "--clean-processed" => options.clean_processed = true,
            "--archive-processed" => {
                options.archive_processed = Some(expect_value(&mut cursor, "--archive-processed")?)
            }
            "--dry-run" => options.dry_run = true,
            "--debug" => options.debug = true,
            "--backup-state" => options.backup_state = true,
            "--on-error" => {
                let raw = expect_value(&mut cursor, "--on-error")?;
                options.on_error = OnErrorMode::parse(&raw)
                    .ok_or_else(|| CliError(format!("--on-error must be stop or continue, got '{raw}'")))?;
            }
            "--max-retries" => {
                let raw = expect_value(&mut cursor, "--max-retries")?;
                options.max_retries = raw
                    .parse()
                    .map_err(|_| CliError(format!("--max-retries must be an integer, got '{raw}'")))?;
            }
            "--retry-delay" => {
                let raw = expect_value(&mut cursor, "--retry-delay")?;
                options.retry_delay_ms = raw
                    .parse()
                    .map_err(|_| CliError(format!("--retry-delay must be an integer, got '{raw}'")))?;
            }
            "--quiet" => options.quiet = true,
            "--verbose" => options.verbose = true,
            "--log-level" => {
                let raw = expect_value(&mut cursor, "--log-level")?;
                options.log_level = LogLevel::parse(&raw).ok_or_else(|| {
                    CliError(format!(
                        "--log-level must be debug, info, warn, or error, got '{raw}'"
                    ))
                })?;
            }
            flag if flag.starts_with("--") => {
                return Err(CliError(format!("unknown flag '{flag}'\n{USAGE}")))
            }
            positional => {
                if workflow.replace(positional.to_string()).is_some() {
                    return Err(CliError(format!(
                        "unexpected extra argument '{positional}'\n{USAGE}"
                    )));
                }
            }
        }
    }

    match workflow {
        Some(workflow) => {
            options.workflow = workflow;
            Ok(CliCommand::Run(options))
        }
        None => Err(CliError(format!("run requires a workflow path\n{USAGE}"))),
    }
}

fn parse_resume(args: &[String]) -> Result<CliCommand, CliError> {
    let mut run_id = None;
    let mut options = ResumeOptions {
        run_id: String::new(),
        repair: false,
        force_restart: false,
        debug: false,
        backup_state: false,
    };

    for arg in args {
        match arg.as_str() {
            "--repair" => options.repair = true,
            "--force-restart" => options.force_restart = true,
            "--debug" => options.debug = true,
            "--backup-state" => options.backup_state = true,
            flag if flag.starts_with("--") => {
                return Err(CliError(format!("unknown flag '{flag}'\n{USAGE}")))
            }
            positional => {
                if run_id.replace(positional.to_string()).is_some() {
                    return Err(CliError(format!(
                        "unexpected extra argument '{positional}'\n{USAGE}"
                    )));
                }
            }
        }
    }

    match run_id {
        Some(run_id) => {
            options.run_id = run_id;
            Ok(CliCommand::Resume(options))
        }
        None => Err(CliError(format!("resume requires a run id\n{USAGE}"))),
    }
}

fn expect_value(cursor: &mut std::slice::Iter<'_, String>, flag: &str) -> Result<String, CliError> {
    cursor
        .next()
        .cloned()
        .ok_or_else(|| CliError(format!("{flag} requires a value")))
}
