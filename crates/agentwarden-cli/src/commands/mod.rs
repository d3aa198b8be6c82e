pub mod approvals;
pub mod daemon;
pub mod policy;
pub mod quarantine;
pub mod redact;
pub mod replay;
pub mod status;
