//! Error types for the tiled-watermark crate.

/// Errors that can occur while embedding, detecting, removing or matching watermarks.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller-supplied input was rejected before any processing started.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A mask and its image disagree on shape and cannot be resampled.
    #[error("dimension mismatch: expected {expected:?}, got {actual:?}")]
    DimensionMismatch {
        /// Expected `(width, height)`.
        expected: (u32, u32),
        /// Actual `(width, height)`.
        actual: (u32, u32),
    },

    /// A rendering or reconstruction stage could not produce output.
    #[error("processing failed: {0}")]
    ProcessingFailure(String),

    /// A lookup by identifier found nothing.
    #[error("not found: {0}")]
    NotFound(String),

    /// An I/O error occurred while reading or writing files.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// An error occurred while decoding or encoding an image.
    #[error("image processing error: {0}")]
    Image(#[from] image::ImageError),

    /// A persisted feature record could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Coarse classification of an [`Error`], for branching without string matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad parameters, undecodable bytes or malformed records.
    InvalidInput,
    /// Mask and image shapes are irreconcilable.
    DimensionMismatch,
    /// A deterministic failure inside a processing stage.
    ProcessingFailure,
    /// No record with the requested identifier.
    NotFound,
    /// File-system failure in the surrounding service layer.
    Io,
}

impl Error {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidInput(_) | Self::Serialization(_) => ErrorKind::InvalidInput,
            Self::DimensionMismatch { .. } => ErrorKind::DimensionMismatch,
            Self::ProcessingFailure(_) => ErrorKind::ProcessingFailure,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Io(_) => ErrorKind::Io,
            Self::Image(image::ImageError::IoError(_)) => ErrorKind::Io,
            Self::Image(
                image::ImageError::Decoding(_)
                | image::ImageError::Unsupported(_)
                | image::ImageError::Parameter(_),
            ) => ErrorKind::InvalidInput,
            Self::Image(_) => ErrorKind::ProcessingFailure,
        }
    }

    /// Whether retrying the same call unchanged could succeed.
    ///
    /// Image stages are deterministic, so only file-system errors qualify.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Io
    }
}

/// A specialized `Result` type for this crate.
pub type Result<T> = std::result::Result<T, Error>;
