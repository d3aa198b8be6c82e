use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Notify;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use agentwarden_core::config::{ConfigPaths, PolicyFile};
use agentwarden_core::ipc::{resolve_pid_path, resolve_socket_path};

mod engine;
mod ipc;
mod tasks;

use engine::Engine;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let paths = ConfigPaths::resolve()?;
    let policy_path = std::env::var("AGENTWARDEN_POLICY")
        .map(PathBuf::from)
        .unwrap_or_else(|_| paths.policy_path.clone());
    let policy = load_policy(&policy_path)?;

    let socket_path = resolve_socket_path();
    let pid_path = resolve_pid_path();

    let quarantine_dir = paths.quarantine_dir_for(&policy);
    let purge_interval = policy.quarantine.purge_interval;
    let retention_days = policy.audit.retention_days;

    let engine = Engine::start(policy, policy_path, &paths.audit_dir, &quarantine_dir).await?;

    write_pid_file(&pid_path)?;
    tasks::spawn_purge_loop(Arc::clone(&engine), purge_interval);
    tasks::spawn_retention_loop(paths.audit_dir.clone(), retention_days);
    tasks::spawn_coverage_watch(Arc::clone(&engine));

    let shutdown = Arc::new(Notify::new());
    spawn_signal_handler(Arc::clone(&shutdown));

    info!(socket = %socket_path.display(), "agentwarden daemon listening");
    ipc::serve(&socket_path, Arc::clone(&engine), shutdown).await?;

    info!("shutting down");
    engine.shutdown().await;
    let _ = std::fs::remove_file(&socket_path);
    let _ = std::fs::remove_file(&pid_path);
    Ok(())
}

/// A missing policy file means the built-in defaults; an unreadable or
/// invalid one is fatal, never a silent fallback to weaker rules.
fn load_policy(path: &PathBuf) -> Result<PolicyFile> {
    if !path.exists() {
        warn!(path = %path.display(), "no policy file, starting with built-in defaults");
        return Ok(PolicyFile::default_config());
    }
    PolicyFile::load(path).with_context(|| format!("load policy {}", path.display()))
}

fn spawn_signal_handler(shutdown: Arc<Notify>) {
    tokio::spawn(async move {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(stream) => stream,
            Err(err) => {
                warn!(err = %err, "cannot install SIGTERM handler");
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => {}
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    warn!(err = %err, "ctrl-c handler failed");
                    return;
                }
            }
        }
        shutdown.notify_waiters();
    });
}

fn write_pid_file(path: &PathBuf) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create pid dir {}", parent.display()))?;
    }
    std::fs::write(path, std::process::id().to_string())
        .with_context(|| format!("write pid file {}", path.display()))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("set pid permissions {}", path.display()))?;
    Ok(())
}
