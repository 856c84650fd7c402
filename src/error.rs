use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Broker connection or reconnection failure
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed topic or payload
    #[error("Parse error: {0}")]
    Parse(String),

    /// A single reading or event failed semantic checks
    #[error("Validation error: {0}")]
    Validation(String),

    /// Concurrent update on the same identity
    #[error("State conflict: {0}")]
    StateConflict(String),

    /// Outbound notification failure
    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
