use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// An operation was requested from a state it is not valid in. Always a bug in the caller,
    /// the entity is left untouched.
    #[error("{op} rejected for {entity} in state {state}")]
    InvalidState {
        op: &'static str,
        entity: String,
        state: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Daemon communication failed: {0}")]
    Ipc(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Failure reported by the radio for a single request, carried inside transport events
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<btleplug::Error> for TransportError {
    fn from(err: btleplug::Error) -> Self {
        Self(err.to_string())
    }
}
