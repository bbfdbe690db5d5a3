pub mod cli;
pub mod resume;
pub mod run;

/// Dispatches a parsed command line and returns the process exit code.
pub fn run_cli(args: &[String]) -> i32 {
    match cli::parse(args) {
        Ok(cli::CliCommand::Run(options)) => run::execute(options),
        Ok(cli::CliCommand::Resume(options)) => resume::execute(options),
        Err(err) => {
            eprintln!("{err}");
            2
        }
    }
}
