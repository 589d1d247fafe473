use thiserror::Error;

/// Error surface of the control plane.
///
/// Synchronous API operations return these directly. Asynchronous failures
/// flow through the task engine and end up as terminal task records with
/// `error_message` populated.
#[derive(Debug, Error)]
pub enum LatticeError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("overloaded: {0}")]
    Overloaded(String),

    #[error("no candidates: {0}")]
    NoCandidates(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("node failure: {0}")]
    NodeFailure(String),

    #[error("node rejected task: {0}")]
    NodeRejected(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("task already terminal: {0}")]
    AlreadyTerminal(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("configuration error: {0}")]
    Configuration(String),
}

impl LatticeError {
    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        LatticeError::InvalidInput(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        LatticeError::NotFound(msg.into())
    }

    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        LatticeError::Conflict(msg.into())
    }

    pub fn overloaded<S: Into<String>>(msg: S) -> Self {
        LatticeError::Overloaded(msg.into())
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        LatticeError::Configuration(msg.into())
    }

    pub fn persistence<S: Into<String>>(msg: S) -> Self {
        LatticeError::Persistence(msg.into())
    }
}

impl From<serde_json::Error> for LatticeError {
    fn from(err: serde_json::Error) -> Self {
        LatticeError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for LatticeError {
    fn from(err: std::io::Error) -> Self {
        LatticeError::Persistence(err.to_string())
    }
}

impl From<sled::Error> for LatticeError {
    fn from(err: sled::Error) -> Self {
        LatticeError::Persistence(err.to_string())
    }
}
