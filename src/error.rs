//! Error taxonomy shared by the signer, transport, state store and engines

use thiserror::Error;

/// Errors produced while signing, transferring or persisting a transfer
#[derive(Error, Debug)]
pub enum TransferError {
    /// Bad caller input: empty identifiers, invalid expiry, invalid chunk size
    #[error("Validation error: {0}")]
    Validation(String),

    /// Timeout, connection reset, throttling or a 5xx response
    #[error("Transport error{}: {message}", fmt_status(.status))]
    Transport { status: Option<u16>, message: String },

    /// Unexpected status code or a malformed response body
    #[error("Protocol error{} {code}: {message}", fmt_status(.status))]
    Protocol {
        status: Option<u16>,
        code: String,
        message: String,
    },

    /// Checksum, ETag or length mismatch on a transferred chunk
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Persisted state is stale or its fingerprint no longer matches
    #[error("Resume state invalid: {0}")]
    ResumeInvalid(String),

    /// The transfer was cancelled cooperatively
    #[error("Transfer cancelled")]
    Cancelled,

    /// Local file I/O failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Persisted state could not be encoded or decoded
    #[error("State encoding error: {0}")]
    State(#[from] serde_json::Error),
}

fn fmt_status(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!(" (HTTP {})", code),
        None => String::new(),
    }
}

impl TransferError {
    pub fn validation(msg: impl Into<String>) -> Self {
        TransferError::Validation(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        TransferError::Transport {
            status: None,
            message: msg.into(),
        }
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        TransferError::Protocol {
            status: None,
            code: "MalformedResponse".to_string(),
            message: msg.into(),
        }
    }

    /// Whether the failure is plausibly transient (network, throttling, 5xx)
    pub fn is_transient(&self) -> bool {
        matches!(self, TransferError::Transport { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled)
    }

    /// Short stable name of the error kind, used in logs and persisted chunk records
    pub fn kind(&self) -> &'static str {
        match self {
            TransferError::Validation(_) => "validation",
            TransferError::Transport { .. } => "transport",
            TransferError::Protocol { .. } => "protocol",
            TransferError::Integrity(_) => "integrity",
            TransferError::ResumeInvalid(_) => "resume_invalid",
            TransferError::Cancelled => "cancelled",
            TransferError::Io(_) => "io",
            TransferError::State(_) => "state",
        }
    }
}

impl From<quick_xml::Error> for TransferError {
    fn from(err: quick_xml::Error) -> Self {
        TransferError::protocol(format!("XML parse error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, TransferError>;
