use anyhow::Result;

use agentwarden_core::ipc::{resolve_socket_path, send_request, WardenRequest, WardenResponse};

pub fn execute(json: bool) -> Result<()> {
    let socket = resolve_socket_path();
    let response = send_request(&socket, &WardenRequest::Status)?;
    let payload = match response {
        WardenResponse::Status(payload) => payload,
        WardenResponse::Error(error) => return Err(anyhow::anyhow!(error.message)),
        other => return Err(anyhow::anyhow!("unexpected response: {other:?}")),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(());
    }

    println!("agentwarden daemon is running.");
    println!("Uptime: {}s", payload.uptime_seconds);
    println!(
        "Policy version {}: {} command, {} network, {} file rules",
        payload.policy_version,
        payload.rule_counts.command,
        payload.rule_counts.network,
        payload.rule_counts.file
    );
    println!("Pending approvals: {}", payload.pending_approvals);
    println!("Quarantine entries: {}", payload.quarantine_entries);
    println!(
        "Audit: {} queued, {} dropped, {} write failures, {} exported",
        payload.audit.queued,
        payload.audit.dropped,
        payload.audit.write_failures,
        payload.audit.exported
    );
    if payload.coverage.is_degraded() {
        println!(
            "Coverage DEGRADED: missing layers {}",
            payload.coverage.missing.join(", ")
        );
    } else {
        println!(
            "Coverage: all expected layers active ({})",
            payload.coverage.active.join(", ")
        );
    }
    Ok(())
}
