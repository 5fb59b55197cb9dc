use crate::StreamKind;

/// Result alias that carries the custom [`DumpError`] type.
pub type Result<T> = std::result::Result<T, DumpError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum DumpError {
    /// Invalid setup, such as registering two handlers for the same stream.
    #[error("invalid configuration: {0}")]
    Configuration(String),
    /// `start` was called before any frame handler was registered.
    #[error("no frame handler registered")]
    NoConsumers,
    /// The sensor is absent or one of its readers could not be opened.
    #[error("sensor unavailable: {0}")]
    DeviceUnavailable(String),
    #[error("frame source already started")]
    AlreadyStarted,
    #[error("frame source used after close")]
    UseAfterClose,
    /// Raised while acquiring or handling a single frame. Isolated to the
    /// stream it happened on.
    #[error("{kind} frame processing failed: {message}")]
    FrameProcess { kind: StreamKind, message: String },
    /// An output writer failed. Halts the session that owns the writer.
    #[error("writing {kind} output failed: {message}")]
    WriteFailure { kind: StreamKind, message: String },
    /// Free-form message, mostly used for poisoned locks.
    #[error("{0}")]
    Message(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Image(#[from] image::ImageError),
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl DumpError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    pub fn frame_process<T: Into<String>>(kind: StreamKind, message: T) -> Self {
        Self::FrameProcess {
            kind,
            message: message.into(),
        }
    }

    pub fn write_failure<T: Into<String>>(kind: StreamKind, message: T) -> Self {
        Self::WriteFailure {
            kind,
            message: message.into(),
        }
    }

    /// Whether the error terminates the capture loop of its session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::WriteFailure { .. })
    }
}

impl From<&str> for DumpError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for DumpError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
