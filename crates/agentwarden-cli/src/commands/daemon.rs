use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};

use agentwarden_core::ipc::{
    resolve_pid_path, resolve_socket_path, send_request, WardenRequest, WardenResponse,
};

#[derive(Debug)]
pub enum DaemonAction {
    Start {
        socket: Option<PathBuf>,
        pid: Option<PathBuf>,
    },
    Stop {
        pid: Option<PathBuf>,
    },
    Ping {
        socket: Option<PathBuf>,
    },
    SocketPath,
    PidPath,
}

pub fn execute(action: DaemonAction) -> Result<()> {
    match action {
        DaemonAction::Start { socket, pid } => start_daemon(socket, pid),
        DaemonAction::Stop { pid } => stop_daemon(pid),
        DaemonAction::Ping { socket } => ping(socket),
        DaemonAction::SocketPath => {
            println!("{}", resolve_socket_path().display());
            Ok(())
        }
        DaemonAction::PidPath => {
            println!("{}", resolve_pid_path().display());
            Ok(())
        }
    }
}

fn start_daemon(socket: Option<PathBuf>, pid: Option<PathBuf>) -> Result<()> {
    let mut cmd = Command::new("agentwarden-daemon");
    if let Some(socket) = socket {
        cmd.env("AGENTWARDEN_SOCKET", socket);
    }
    if let Some(pid) = pid {
        cmd.env("AGENTWARDEN_PID", pid);
    }
    cmd.spawn().context("start agentwarden-daemon")?;
    println!("agentwarden daemon started.");
    Ok(())
}

/// Asks politely over the socket first so the audit queue drains; falls
/// back to SIGTERM through the pid file if the socket is gone.
fn stop_daemon(pid_override: Option<PathBuf>) -> Result<()> {
    let socket = resolve_socket_path();
    if send_request(&socket, &WardenRequest::Shutdown).is_ok() {
        println!("agentwarden daemon stopped.");
        return Ok(());
    }

    let pid_path = pid_override.unwrap_or_else(resolve_pid_path);
    let pid_text = std::fs::read_to_string(&pid_path)
        .with_context(|| format!("read pid file {}", pid_path.display()))?;
    let pid: i32 = pid_text.trim().parse().context("parse pid")?;
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        return Err(anyhow::anyhow!("failed to stop daemon with pid {pid}"));
    }
    println!("agentwarden daemon stopped.");
    Ok(())
}

fn ping(socket_override: Option<PathBuf>) -> Result<()> {
    let socket = socket_override.unwrap_or_else(resolve_socket_path);
    let response = send_request(&socket, &WardenRequest::Ping)?;
    match response {
        WardenResponse::Pong => {
            println!("agentwarden daemon is healthy.");
            Ok(())
        }
        WardenResponse::Error(error) => Err(anyhow::anyhow!(error.message)),
        other => Err(anyhow::anyhow!("unexpected response: {other:?}")),
    }
}
