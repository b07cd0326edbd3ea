use thiserror::Error;

pub type Result<T> = std::result::Result<T, ImageError>;

/// Unified error type for the image drivers.
///
/// The variants follow how a caller is expected to react: a signature
/// mismatch means "try the next driver", `Corrupt` means the container is
/// damaged, and `Unsupported` means the container is well-formed but uses a
/// feature outside what this crate implements (e.g. compressed qcow2
/// clusters).
#[derive(Debug, Error)]
pub enum ImageError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a {0} image")]
    BadSignature(&'static str),

    #[error("corrupt disk image: {0}")]
    Corrupt(String),

    #[error("unsupported disk image feature: {0}")]
    Unsupported(&'static str),

    #[error("entry not found: {0}")]
    NotFound(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no space left on volume")]
    NoSpace,

    #[error("operation cancelled by user")]
    Cancelled,
}

impl ImageError {
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::Corrupt(msg.into())
    }

    /// Returns `true` for errors caused by a feature this crate does not implement.
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Unsupported(_))
    }
}
