use anyhow::{Context, Result};
use time::format_description::well_known::Rfc3339;

use agentwarden_core::ids::RestoreToken;
use agentwarden_core::ipc::{
    resolve_socket_path, send_request, PurgePayload, RestorePayload, WardenRequest, WardenResponse,
};

#[derive(Debug)]
pub enum QuarantineAction {
    List,
    Restore { token: String },
    Purge { older_than: Option<String> },
}

pub fn execute(action: QuarantineAction) -> Result<()> {
    let socket = resolve_socket_path();
    match action {
        QuarantineAction::List => {
            let response = send_request(&socket, &WardenRequest::QuarantineList)?;
            let entries = match response {
                WardenResponse::QuarantineEntries(entries) => entries,
                WardenResponse::Error(error) => return Err(anyhow::anyhow!(error.message)),
                other => return Err(anyhow::anyhow!("unexpected response: {other:?}")),
            };
            if entries.is_empty() {
                println!("Quarantine is empty.");
                return Ok(());
            }
            for entry in entries {
                println!(
                    "{}  {}  {} bytes  deleted {}  expires {}",
                    entry.token,
                    entry.original_path.display(),
                    entry.size_bytes,
                    entry.deleted_at.format(&Rfc3339)?,
                    entry.expires_at.format(&Rfc3339)?
                );
            }
            Ok(())
        }
        QuarantineAction::Restore { token } => {
            let token: RestoreToken = token.parse().context("parse restore token")?;
            let request = WardenRequest::QuarantineRestore(RestorePayload { token });
            match send_request(&socket, &request)? {
                WardenResponse::Restored(payload) => {
                    println!("Restored {}", payload.path.display());
                    Ok(())
                }
                WardenResponse::Error(error) => Err(anyhow::anyhow!(error.message)),
                other => Err(anyhow::anyhow!("unexpected response: {other:?}")),
            }
        }
        QuarantineAction::Purge { older_than } => {
            let older_than_days = older_than
                .map(|text| parse_age_days(&text))
                .transpose()?;
            let request = WardenRequest::QuarantinePurge(PurgePayload { older_than_days });
            match send_request(&socket, &request)? {
                WardenResponse::Purged(payload) => {
                    println!("Purged {} entries.", payload.removed);
                    Ok(())
                }
                WardenResponse::Error(error) => Err(anyhow::anyhow!(error.message)),
                other => Err(anyhow::anyhow!("unexpected response: {other:?}")),
            }
        }
    }
}

/// Ages are tracked at day granularity; sub-day durations round up so
/// "12h" never purges more than asked.
fn parse_age_days(text: &str) -> Result<u32> {
    let duration =
        humantime::parse_duration(text).with_context(|| format!("parse duration {text:?}"))?;
    let days = duration.as_secs().div_ceil(24 * 60 * 60);
    u32::try_from(days).context("duration too large")
}
