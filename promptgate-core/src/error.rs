use crate::protocol::ProtocolViolation;
use thiserror::Error;

pub type GateResult<T> = Result<T, GateError>;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Inference call failed: {0}")]
    Inference(String),

    #[error("Inference call timed out after {0} ms")]
    Timeout(u64),

    #[error("Protocol violation: {0}")]
    Protocol(ProtocolViolation),

    #[error("Store unavailable: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl GateError {
    /// Whether this error means the model's response could not be trusted,
    /// as opposed to the call simply not completing.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, GateError::Protocol(_))
    }
}
