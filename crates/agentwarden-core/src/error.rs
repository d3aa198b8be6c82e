use thiserror::Error;

#[derive(Debug, Error)]
pub enum WardenError {
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("ipc error: {0}")]
    Ipc(String),
}
