pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "noteflow",
    about = "Noteflow operator CLI",
    long_about = "Operate the AI dispatch store: migrations, config inspection, quota administration and usage housekeeping.",
    after_help = "Examples:\n  noteflow doctor --json\n  noteflow quota show user-42\n  noteflow quota set-limits user-42 --max-requests 500 --max-tokens 200000\n  noteflow usage-report --days 7"
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
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, provider catalog coverage and database schema")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(subcommand, about = "Inspect and adjust per-user monthly quotas")]
    Quota(QuotaCommand),
    #[command(about = "Summarize recorded AI usage over a trailing window")]
    UsageReport {
        #[arg(long, default_value_t = 1, help = "Trailing window in days")]
        days: u32,
        #[arg(long, help = "Restrict the report to one user")]
        user: Option<String>,
    },
    #[command(about = "Delete usage records older than the retention window")]
    CleanupUsage {
        #[arg(long, help = "Override quota.usage_retention_days")]
        retention_days: Option<u32>,
    },
}

#[derive(Debug, Subcommand)]
enum QuotaCommand {
    #[command(about = "Show usage, reservations and limits for a user")]
    Show { user_id: String },
    #[command(about = "Set a user's monthly request and token limits")]
    SetLimits {
        user_id: String,
        #[arg(long)]
        max_requests: u32,
        #[arg(long)]
        max_tokens: u32,
    },
    #[command(about = "Start a new period for every quota whose reset time has passed")]
    ResetDue,
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Quota(QuotaCommand::Show { user_id }) => commands::quota::show(&user_id),
        Command::Quota(QuotaCommand::SetLimits { user_id, max_requests, max_tokens }) => {
            commands::quota::set_limits(&user_id, max_requests, max_tokens)
        }
        Command::Quota(QuotaCommand::ResetDue) => commands::quota::reset_due(),
        Command::UsageReport { days, user } => commands::usage::report(days, user),
        Command::CleanupUsage { retention_days } => commands::usage::cleanup(retention_days),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
