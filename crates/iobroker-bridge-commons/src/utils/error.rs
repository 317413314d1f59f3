use thiserror::Error;

/// Crate-wide error type returned by every fallible public operation of the
/// connection core.
///
/// Operation-level failures always carry one of these variants rather than
/// a raw transport error; the underlying cause is preserved via `#[from]`
/// for diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("no ready connection: {0}")]
    NotReady(String),

    #[error("connection destroyed")]
    Destroyed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Error::Other(anyhow::anyhow!(value))
    }
}

impl From<&str> for Error {
    fn from(value: &str) -> Self {
        Error::Other(anyhow::anyhow!(value.to_string()))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
