use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::debug;

use formatci::client::{Engine, EngineFactory};
use formatci::commands::{DispatchError, Outcome, exit_status};
use formatci::context::InvocationContext;
use formatci::{command_tree, invoke, load_settings, logger};

#[derive(Parser, Debug)]
#[command(name = "formatci", version, about = "Run containerized code format checks")]
struct Cli {
    /// Path to config file (auto-detected if not specified)
    #[arg(short, long)]
    config: Option<String>,

    /// Engine running the checks (overrides the config file)
    #[arg(long, value_enum)]
    engine: Option<Engine>,

    /// Directory the checks run against (overrides the config file)
    #[arg(long)]
    workdir: Option<PathBuf>,

    /// Log file path (enables file logging in addition to stderr)
    #[arg(long)]
    log_file: Option<String>,

    /// Command to run, followed by its arguments, e.g. `check --list-errors python`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, value_name = "COMMAND")]
    command: Vec<OsString>,
}

fn main() -> ExitCode {
    match run() {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn run() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_file = cli.log_file.as_deref().map(std::fs::File::create).transpose()?;
    logger::init(log_file)?;

    let settings = load_settings(cli.config.as_deref())?;
    let engine = cli.engine.unwrap_or(settings.engine);
    let workdir = cli.workdir.unwrap_or(settings.workdir);
    debug!("Using {engine} engine in {}", workdir.display());

    let mut ctx = InvocationContext::new(EngineFactory::new(engine, workdir));
    let mut root = command_tree(settings.checks);
    let result = invoke(&mut root, &mut ctx, cli.command).await;

    match &result {
        Ok(Outcome::Success) => {}
        Ok(Outcome::Failure(failure)) => eprintln!("{}", failure.detail),
        Err(DispatchError::Usage(e)) => e.print()?,
        Err(e) => eprintln!("Error: {e}"),
    }
    Ok(ExitCode::from(exit_status(&result)))
}
