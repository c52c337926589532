pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "concord",
    about = "Concord operator CLI",
    long_about = "Inspect and maintain the durable state behind the dialogue governance core: \
                  migrations, configuration, readiness, the act-mode lock, and the incident log.",
    after_help = "Examples:\n  concord doctor --json\n  concord lock status\n  concord incidents --tail 5"
)]
pub struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution"
    )]
    Config,
    #[command(about = "Validate config, database connectivity, and act-mode lock state")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Inspect or clear the act-mode lock written by an emergency shutdown")]
    Lock {
        #[command(subcommand)]
        action: LockAction,
    },
    #[command(about = "Print the most recent incident and decision log entries")]
    Incidents {
        #[arg(long, default_value_t = 20, help = "Number of entries to show")]
        tail: usize,
    },
}

#[derive(Debug, Subcommand)]
enum LockAction {
    #[command(about = "Report whether an act-mode lock is present")]
    Status,
    #[command(about = "Remove the act-mode lock once the incident has been audited")]
    Clear,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Lock { action: LockAction::Status } => commands::lock::status(),
        Command::Lock { action: LockAction::Clear } => commands::lock::clear(),
        Command::Incidents { tail } => commands::incidents::run(tail),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
