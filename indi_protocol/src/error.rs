use crate::config::ConfigError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IndiError>;

/// Longest slice of an offending message kept in a protocol error
const MAX_FRAGMENT_LEN: usize = 120;

#[derive(Error, Debug)]
pub enum IndiError {
    /// Transport-level failure; the session is gone and the caller must reconnect
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed or inconsistent server message; it is skipped and the session continues
    #[error("Protocol error: {reason} (near `{fragment}`)")]
    Protocol { reason: String, fragment: String },

    /// Caller tried to set something the server did not advertise as writable
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl IndiError {
    /// Build a protocol error, keeping at most a short prefix of the offending bytes
    pub fn protocol(reason: impl Into<String>, fragment: impl AsRef<[u8]>) -> Self {
        let bytes = fragment.as_ref();
        let end = bytes.len().min(MAX_FRAGMENT_LEN);
        let mut fragment = String::from_utf8_lossy(&bytes[..end]).into_owned();
        if bytes.len() > MAX_FRAGMENT_LEN {
            fragment.push_str("...");
        }

        IndiError::Protocol {
            reason: reason.into(),
            fragment,
        }
    }

    /// Whether the session can no longer be used after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, IndiError::Connection(_) | IndiError::Io(_))
    }
}
