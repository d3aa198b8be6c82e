use std::path::PathBuf;

use anyhow::{Context, Result};

use agentwarden_core::config::{ConfigPaths, PolicyFile};
use agentwarden_core::ipc::{resolve_socket_path, send_request, WardenRequest, WardenResponse};
use dlp::Redactor;

pub fn init(path: Option<PathBuf>, force: bool) -> Result<()> {
    let target = match path {
        Some(path) => path,
        None => ConfigPaths::resolve()?.policy_path,
    };
    if target.exists() && !force {
        return Err(anyhow::anyhow!(
            "{} already exists (use --force to overwrite)",
            target.display()
        ));
    }
    let policy = PolicyFile::default_config();
    policy.save(&target)?;
    println!("Wrote starter policy to {}", target.display());
    Ok(())
}

/// Full validation: TOML parse, rule compilation, and DLP pattern
/// compilation, without touching the running daemon.
pub fn check(path: Option<PathBuf>) -> Result<()> {
    let target = match path {
        Some(path) => path,
        None => ConfigPaths::resolve()?.policy_path,
    };
    let policy =
        PolicyFile::load(&target).with_context(|| format!("load {}", target.display()))?;
    let ruleset = policy_engine::compile(&policy, 1)?;
    Redactor::compile(&policy.dlp)?;
    let counts = ruleset.rule_counts();
    println!("{} is valid.", target.display());
    println!(
        "Rules: {} command, {} network, {} file",
        counts.command, counts.network, counts.file
    );
    Ok(())
}

pub fn reload() -> Result<()> {
    let socket = resolve_socket_path();
    match send_request(&socket, &WardenRequest::Reload)? {
        WardenResponse::Reloaded(payload) => {
            println!(
                "Policy reloaded (version {}): {} command, {} network, {} file rules",
                payload.policy_version,
                payload.rule_counts.command,
                payload.rule_counts.network,
                payload.rule_counts.file
            );
            Ok(())
        }
        WardenResponse::Error(error) => Err(anyhow::anyhow!(error.message)),
        other => Err(anyhow::anyhow!("unexpected response: {other:?}")),
    }
}
