use std::net::IpAddr;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::ids::{EventId, SessionId};

/// A single intercepted action submitted for a decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,
    pub session_id: SessionId,
    pub occurred_at: OffsetDateTime,
    pub payload: EventPayload,
    /// Process chain from the agent's top-level shell to the issuer,
    /// supplied by the interception layer. Absent when the shim itself
    /// is the issuer.
    pub ancestry: Option<AncestryReport>,
}

impl Event {
    pub fn new(session_id: SessionId, payload: EventPayload) -> Self {
        Self {
            id: EventId::new(),
            session_id,
            occurred_at: OffsetDateTime::now_utc(),
            payload,
            ancestry: None,
        }
    }

    pub fn with_ancestry(mut self, ancestry: AncestryReport) -> Self {
        self.ancestry = Some(ancestry);
        self
    }

    pub fn category(&self) -> Category {
        self.payload.category()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventPayload {
    Command {
        program: String,
        args: Vec<String>,
    },
    Network {
        host: String,
        ip: Option<IpAddr>,
        port: u16,
    },
    File {
        path: PathBuf,
        operation: FileOp,
    },
    Env {
        access: EnvAccess,
    },
}

impl EventPayload {
    pub fn category(&self) -> Category {
        match self {
            EventPayload::Command { .. } => Category::Command,
            EventPayload::Network { .. } => Category::Network,
            EventPayload::File { .. } => Category::File,
            EventPayload::Env { .. } => Category::Env,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Command,
    Network,
    File,
    Env,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Category::Command => "command",
            Category::Network => "network",
            Category::File => "file",
            Category::Env => "env",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOp {
    Read,
    Write,
    Delete,
}

impl std::fmt::Display for FileOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            FileOp::Read => "read",
            FileOp::Write => "write",
            FileOp::Delete => "delete",
        };
        write!(f, "{value}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", content = "key", rename_all = "snake_case")]
pub enum EnvAccess {
    /// Lookup of a single variable by name.
    Read(String),
    /// Listing the whole environment.
    Enumerate,
}

/// One hop in the process chain between the agent shell and the issuer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessHop {
    pub pid: u32,
    pub program: String,
}

/// Ordered chain of hops, index 0 being the top-level agent shell.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AncestryReport {
    pub chain: Vec<ProcessHop>,
}

impl AncestryReport {
    pub fn new(chain: Vec<ProcessHop>) -> Self {
        Self { chain }
    }
}

/// How many hops separate the issuer from the agent's own shell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub depth: u32,
    pub origin: Origin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    Direct,
    Nested,
}

impl std::fmt::Display for Origin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Origin::Direct => write!(f, "direct"),
            Origin::Nested => write!(f, "nested"),
        }
    }
}

/// What a rule prescribes when it matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Deny,
    Approve,
    SoftDelete,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let value = match self {
            Verdict::Allow => "allow",
            Verdict::Deny => "deny",
            Verdict::Approve => "approve",
            Verdict::SoftDelete => "soft_delete",
        };
        write!(f, "{value}")
    }
}

/// The engine's ruling on an event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub outcome: Outcome,
    pub matched_rule: Option<String>,
    pub rationale: String,
}

impl Decision {
    pub fn allow(matched_rule: Option<String>, rationale: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Allow,
            matched_rule,
            rationale: rationale.into(),
        }
    }

    pub fn deny(matched_rule: Option<String>, rationale: impl Into<String>) -> Self {
        Self {
            outcome: Outcome::Deny,
            matched_rule,
            rationale: rationale.into(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.outcome, Outcome::ApprovePending { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Allow,
    Deny,
    /// Deferred to the approval broker; folded into allow/deny before the
    /// decision becomes terminal.
    ApprovePending {
        message: String,
        /// Rule-level timeout in seconds, capped by the approval ceiling.
        timeout_secs: u64,
    },
    /// Allow-equivalent for a file delete whose side effect is quarantine.
    SoftDelete,
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Allow => "allow",
            Outcome::Deny => "deny",
            Outcome::ApprovePending { .. } => "approve_pending",
            Outcome::SoftDelete => "soft_delete",
        }
    }
}

/// Risk level attached to audit records, used by the telemetry filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Critical,
}

impl Decision {
    /// A denial no rule anticipated ranks highest; that is the signal
    /// worth shipping to an external sink.
    pub fn severity(&self) -> Severity {
        match (&self.outcome, &self.matched_rule) {
            (Outcome::Allow, _) => Severity::Info,
            (Outcome::SoftDelete, _) => Severity::Warn,
            (Outcome::Deny, Some(_)) => Severity::Warn,
            (Outcome::Deny, None) => Severity::Critical,
            (Outcome::ApprovePending { .. }, _) => Severity::Warn,
        }
    }
}

/// Exit status and output of a completed command, attached to its audit
/// record after the fact.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Capture {
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// One append-only line in the audit log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub event: Event,
    pub context: Context,
    pub decision: Decision,
    pub severity: Severity,
    pub recorded_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<Capture>,
}

impl AuditRecord {
    pub fn new(event: Event, context: Context, decision: Decision) -> Self {
        let severity = decision.severity();
        Self {
            event,
            context,
            decision,
            severity,
            recorded_at: OffsetDateTime::now_utc(),
            capture: None,
        }
    }
}

/// Operator decision on a pending approval, or its absence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    Approved,
    Denied,
    TimedOut,
}

/// A not-yet-resolved approval as shown to operators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingApproval {
    pub event_id: EventId,
    pub rule: String,
    pub message: String,
    pub summary: String,
    pub requested_at: OffsetDateTime,
    pub expires_at: OffsetDateTime,
}
