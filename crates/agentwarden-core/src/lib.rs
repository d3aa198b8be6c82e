pub mod config;
pub mod error;
pub mod ids;
pub mod ipc;
pub mod types;

pub use config::{ConfigPaths, DefaultVerdict, DlpMode, OverflowPolicy, PolicyFile};
pub use error::WardenError;
pub use ids::{EventId, RestoreToken, SessionId};
pub use ipc::{WardenRequest, WardenResponse};
pub use types::{
    AncestryReport, AuditRecord, Category, Context, Decision, EnvAccess, Event, EventPayload,
    FileOp, Origin, Outcome, PendingApproval, Resolution, Severity, Verdict,
};
