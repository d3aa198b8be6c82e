use anyhow::{Context, Result};
use time::format_description::well_known::Rfc3339;

use agentwarden_core::ids::EventId;
use agentwarden_core::ipc::{
    resolve_socket_path, send_request, ResolvePayload, WardenRequest, WardenResponse,
};

#[derive(Debug)]
pub enum ApprovalsAction {
    List,
    Resolve { event_id: String, approve: bool },
}

pub fn execute(action: ApprovalsAction) -> Result<()> {
    let socket = resolve_socket_path();
    match action {
        ApprovalsAction::List => {
            let response = send_request(&socket, &WardenRequest::ApprovalsList)?;
            let pending = match response {
                WardenResponse::Approvals(pending) => pending,
                WardenResponse::Error(error) => return Err(anyhow::anyhow!(error.message)),
                other => return Err(anyhow::anyhow!("unexpected response: {other:?}")),
            };
            if pending.is_empty() {
                println!("No pending approvals.");
                return Ok(());
            }
            for entry in pending {
                println!(
                    "{}  [{}] {}  expires {}",
                    entry.event_id,
                    entry.rule,
                    entry.summary,
                    entry.expires_at.format(&Rfc3339)?
                );
                println!("    {}", entry.message);
            }
            Ok(())
        }
        ApprovalsAction::Resolve { event_id, approve } => {
            let event_id: EventId = event_id.parse().context("parse event id")?;
            let request = WardenRequest::ApprovalResolve(ResolvePayload { event_id, approve });
            match send_request(&socket, &request)? {
                WardenResponse::Ack => {
                    println!(
                        "{} {}.",
                        if approve { "Granted" } else { "Denied" },
                        event_id
                    );
                    Ok(())
                }
                WardenResponse::Error(error) => Err(anyhow::anyhow!(error.message)),
                other => Err(anyhow::anyhow!("unexpected response: {other:?}")),
            }
        }
    }
}
