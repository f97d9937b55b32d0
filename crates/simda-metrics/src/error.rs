use thiserror::Error;

/// Failure modes of the kernel-facing readers.
///
/// `Read` means the source could not be read at all; `Parse` means it was
/// read but its shape was not understood. Collectors treat both the same way
/// (log once, disable the family), the distinction is kept for the logs.
#[derive(Debug, Error)]
pub enum MetricError {
    #[error("read failed: {0}")]
    Read(#[from] std::io::Error),

    #[error("parse failed: {0}")]
    Parse(String),

    #[error("capture failed: {0}")]
    Capture(String),
}

impl MetricError {
    pub(crate) fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }
}
