use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("External service unavailable: {0}")]
    External(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable kind string so callers can translate errors mechanically.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Config(_) => "config_error",
            Error::NotFound(_) => "not_found",
            Error::IndexCorrupt(_) => "index_corrupt",
            Error::External(_) => "external_unavailable",
            Error::Timeout(_) => "timeout",
            Error::Cancelled => "cancelled",
            Error::Parse(_) => "parse_error",
            Error::Internal(_) => "internal",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::External(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
