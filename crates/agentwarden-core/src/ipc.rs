use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::{EventId, RestoreToken};
use crate::types::{Decision, Event, PendingApproval};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitPayload {
    pub event: Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletePayload {
    pub event_id: EventId,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterLayerPayload {
    pub layer: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvePayload {
    pub event_id: EventId,
    pub approve: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestorePayload {
    pub token: RestoreToken,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgePayload {
    /// Override the configured TTL; entries older than this many days go.
    pub older_than_days: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextPayload {
    pub text: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvPayload {
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecidedPayload {
    pub decision: Decision,
    /// Set when the outcome is soft_delete; the caller must skip the real
    /// unlink because the content already moved to quarantine.
    pub restore_token: Option<RestoreToken>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusPayload {
    pub started_at: OffsetDateTime,
    pub uptime_seconds: u64,
    pub policy_version: u64,
    pub rule_counts: RuleCounts,
    pub pending_approvals: u32,
    pub quarantine_entries: u32,
    pub audit: AuditStats,
    pub coverage: CoveragePayload,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuleCounts {
    pub command: usize,
    pub network: usize,
    pub file: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditStats {
    pub queued: usize,
    pub dropped: u64,
    pub write_failures: u64,
    pub exported: u64,
    pub export_failures: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoveragePayload {
    pub expected: Vec<String>,
    pub active: Vec<String>,
    /// Expected layers that never registered.
    pub missing: Vec<String>,
}

impl CoveragePayload {
    pub fn is_degraded(&self) -> bool {
        !self.missing.is_empty()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuarantineEntryPayload {
    pub token: RestoreToken,
    pub original_path: PathBuf,
    pub deleted_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReloadedPayload {
    pub policy_version: u64,
    pub rule_counts: RuleCounts,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgedPayload {
    pub removed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoredPayload {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NotFound,
    Conflict,
    InvalidPolicy,
    Unavailable,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: ErrorCode,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WardenRequest {
    Ping,
    Status,
    Submit(SubmitPayload),
    Complete(CompletePayload),
    RegisterLayer(RegisterLayerPayload),
    ApprovalsList,
    ApprovalResolve(ResolvePayload),
    QuarantineList,
    QuarantineRestore(RestorePayload),
    QuarantinePurge(PurgePayload),
    Redact(TextPayload),
    Detokenize(TextPayload),
    /// Candidate environment from the caller; the daemon returns the
    /// policy-filtered, capped, inject-layered subset it may expose.
    EnvSnapshot(EnvPayload),
    Reload,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum WardenResponse {
    Pong,
    Status(StatusPayload),
    Decided(DecidedPayload),
    Ack,
    Approvals(Vec<PendingApproval>),
    QuarantineEntries(Vec<QuarantineEntryPayload>),
    Restored(RestoredPayload),
    Purged(PurgedPayload),
    Redacted(TextPayload),
    Environment(EnvPayload),
    Reloaded(ReloadedPayload),
    Error(ErrorPayload),
}

pub fn default_socket_path() -> PathBuf {
    if let Ok(runtime) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime)
            .join("agentwarden")
            .join("agentwarden.sock");
    }
    PathBuf::from("/tmp").join("agentwarden.sock")
}

pub fn default_pid_path() -> PathBuf {
    if let Ok(runtime) = std::env::var("XDG_RUNTIME_DIR") {
        return PathBuf::from(runtime)
            .join("agentwarden")
            .join("agentwarden.pid");
    }
    PathBuf::from("/tmp").join("agentwarden.pid")
}

pub fn resolve_socket_path() -> PathBuf {
    if let Ok(value) = std::env::var("AGENTWARDEN_SOCKET") {
        return PathBuf::from(value);
    }
    default_socket_path()
}

pub fn resolve_pid_path() -> PathBuf {
    if let Ok(value) = std::env::var("AGENTWARDEN_PID") {
        return PathBuf::from(value);
    }
    default_pid_path()
}

pub fn send_request(socket_path: &Path, request: &WardenRequest) -> Result<WardenResponse> {
    let stream = UnixStream::connect(socket_path)
        .with_context(|| format!("connect to daemon at {}", socket_path.display()))?;
    let mut writer = BufWriter::new(stream.try_clone()?);
    let payload = serde_json::to_string(request).context("serialize request")?;
    writer.write_all(payload.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let response = serde_json::from_str(&line).context("parse response")?;
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requests_round_trip_as_tagged_json() {
        let request = WardenRequest::ApprovalResolve(ResolvePayload {
            event_id: EventId::new(),
            approve: true,
        });
        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("\"type\":\"ApprovalResolve\""));
        let parsed: WardenRequest = serde_json::from_str(&json).unwrap();
        match parsed {
            WardenRequest::ApprovalResolve(payload) => assert!(payload.approve),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn error_codes_stay_snake_case() {
        let response = WardenResponse::Error(ErrorPayload {
            code: ErrorCode::NotFound,
            message: "unknown token".to_string(),
        });
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("not_found"));
    }
}
