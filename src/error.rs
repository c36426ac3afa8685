use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug, Clone)]
pub enum Error {
    #[error("stream is closed")]
    Closed,

    #[error("stream failed - {0}")]
    Fatal(String),

    #[error("Config Error - {0}")]
    Config(String),

    #[error("Transaction Log Error - {0}")]
    Log(String),

    #[error("Transport Error - {0}")]
    Transport(String),

    #[error("stage {stage} panicked - {reason}")]
    StagePanicked { stage: String, reason: String },
}

impl From<LogError> for Error {
    fn from(e: LogError) -> Self {
        Error::Log(e.to_string())
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e.to_string())
    }
}

/// Errors raised by the transaction log.
#[derive(Error, Debug)]
pub enum LogError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("bad log header in {0}")]
    BadHeader(String),

    #[error("corrupt entry at line {line}: {reason}")]
    Corrupt { line: usize, reason: String },
}

/// Errors returned by a [`crate::services::transport::Transport`].
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// Network failures, rate limits and server-side errors. Worth retrying.
    #[error("transient: {0}")]
    Transient(String),

    /// The remote refused the record; retrying will not help.
    #[error("permanent: {0}")]
    Permanent(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Transient(_))
    }
}

/// Errors returned by a responder when a result cannot be handed over.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("responder queue is full")]
    Full,

    #[error("responder is gone")]
    Disconnected,
}
