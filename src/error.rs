use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("Broker service is not running")]
    BrokerUnreachable,
    #[error("Permission to use the broker was denied")]
    PermissionDenied,
    #[error("Broker connection was lost before the process could be spawned")]
    BrokerUnavailable,
    #[error("Broker refused to spawn the process: {0}")]
    SpawnRejected(String),
    #[error("Internal broker entry point failed: {0}")]
    InternalEntryPointFailed(String),
    #[error("Failed to execute command: {0}")]
    ExecutionFailed(String),
    #[error("Invalid spawn request: {0}")]
    InvalidRequest(String),
    #[error("An invocation is already in flight")]
    Busy,
    #[error("Privilege escalation tool not found: {0}")]
    EscalationToolNotFound(String),
}

impl From<std::io::Error> for BrokerError {
    fn from(err: std::io::Error) -> Self {
        BrokerError::ExecutionFailed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BrokerError>;
