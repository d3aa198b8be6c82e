use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "agentwarden",
    version,
    about = "Policy enforcement for sandboxed coding agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write a starter policy file
    Init {
        #[arg(long)]
        path: Option<PathBuf>,
        #[arg(long)]
        force: bool,
    },
    /// Validate a policy file without activating it
    Check {
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Show the running daemon's status
    Status {
        #[arg(long)]
        json: bool,
    },
    Daemon {
        #[command(subcommand)]
        action: DaemonCommand,
    },
    Quarantine {
        #[command(subcommand)]
        action: QuarantineCommand,
    },
    Approvals {
        #[command(subcommand)]
        action: ApprovalsCommand,
    },
    /// Ask the daemon to re-read its policy file
    Reload,
    /// Redact stdin to stdout with the policy's DLP patterns
    Redact {
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Re-evaluate a recorded audit log against a policy
    Replay {
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        policy: Option<PathBuf>,
    },
}

#[derive(Subcommand, Debug)]
enum DaemonCommand {
    Start {
        #[arg(long)]
        socket: Option<PathBuf>,
        #[arg(long)]
        pid: Option<PathBuf>,
    },
    Stop {
        #[arg(long)]
        pid: Option<PathBuf>,
    },
    Ping {
        #[arg(long)]
        socket: Option<PathBuf>,
    },
    SocketPath,
    PidPath,
}

#[derive(Subcommand, Debug)]
enum QuarantineCommand {
    List,
    Restore {
        token: String,
    },
    Purge {
        /// Purge entries older than this age (e.g. "3days", "12h")
        #[arg(long)]
        older_than: Option<String>,
    },
}

#[derive(Subcommand, Debug)]
enum ApprovalsCommand {
    List,
    Grant { event_id: String },
    Deny { event_id: String },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Init { path, force } => commands::policy::init(path, force),
        Commands::Check { policy } => commands::policy::check(policy),
        Commands::Status { json } => commands::status::execute(json),
        Commands::Daemon { action } => {
            let action = match action {
                DaemonCommand::Start { socket, pid } => {
                    commands::daemon::DaemonAction::Start { socket, pid }
                }
                DaemonCommand::Stop { pid } => commands::daemon::DaemonAction::Stop { pid },
                DaemonCommand::Ping { socket } => commands::daemon::DaemonAction::Ping { socket },
                DaemonCommand::SocketPath => commands::daemon::DaemonAction::SocketPath,
                DaemonCommand::PidPath => commands::daemon::DaemonAction::PidPath,
            };
            commands::daemon::execute(action)
        }
        Commands::Quarantine { action } => {
            let action = match action {
                QuarantineCommand::List => commands::quarantine::QuarantineAction::List,
                QuarantineCommand::Restore { token } => {
                    commands::quarantine::QuarantineAction::Restore { token }
                }
                QuarantineCommand::Purge { older_than } => {
                    commands::quarantine::QuarantineAction::Purge { older_than }
                }
            };
            commands::quarantine::execute(action)
        }
        Commands::Approvals { action } => {
            let action = match action {
                ApprovalsCommand::List => commands::approvals::ApprovalsAction::List,
                ApprovalsCommand::Grant { event_id } => {
                    commands::approvals::ApprovalsAction::Resolve {
                        event_id,
                        approve: true,
                    }
                }
                ApprovalsCommand::Deny { event_id } => {
                    commands::approvals::ApprovalsAction::Resolve {
                        event_id,
                        approve: false,
                    }
                }
            };
            commands::approvals::execute(action)
        }
        Commands::Reload => commands::policy::reload(),
        Commands::Redact { policy } => commands::redact::execute(policy),
        Commands::Replay { input, policy } => commands::replay::execute(&input, policy),
    }
}
