use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open storage namespace `{namespace}`: {message}")]
    Open { namespace: String, message: String },
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("stored data is corrupt: {0}")]
    Corrupt(String),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("wifi error: {0}")]
    Wifi(String),
    #[error("portal server error: {0}")]
    Server(String),
    #[error("telemetry pipeline used before endpoint validation")]
    NotValidated,
}

/// Failure reported by the time-series database client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DbError {
    /// The endpoint parameters are unusable: bad URL, unknown org or bucket,
    /// or a token the server refuses.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
    #[error("server responded with HTTP {status}: {message}")]
    Rejected { status: u16, message: String },
    #[error("transport failure: {0}")]
    Transport(String),
}

impl DbError {
    pub fn is_invalid_parameters(&self) -> bool {
        matches!(self, Self::InvalidParameters(_))
    }
}
