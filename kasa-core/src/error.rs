use thiserror::Error;

/// Core error type for the KASA client tools.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum KasaError {
    #[error("validation failed: {0}")]
    Validation(String),

    /// The streamed chat request could not be established: non-success
    /// status or no readable body.
    #[error("failed to start stream{}", .status.as_ref().map(|s| format!(" (status {s})")).unwrap_or_default())]
    ConnectionFailed { status: Option<u16> },

    /// The byte source raised an error mid-stream.
    #[error("stream interrupted: {0}")]
    TransportInterrupted(String),

    #[error("application not found: {application_id}")]
    NotFound { application_id: String },

    #[error("record store error: {code} {message}")]
    StoreError { code: String, message: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl KasaError {
    /// True for the two stream-fatal variants that the chat session maps to
    /// its user-visible fallback notice.
    pub fn is_stream_fatal(&self) -> bool {
        matches!(
            self,
            Self::ConnectionFailed { .. } | Self::TransportInterrupted(_)
        )
    }
}

pub type CoreResult<T> = std::result::Result<T, KasaError>;
