use thiserror::Error;

/// Errors raised by exporters. Callers decide fatal-ness: the stream-through
/// processor logs and moves on, the multi-exporter joins failures.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Identifier could not be normalized to OTLP id bytes.
    #[error("invalid identifier: {0:?}")]
    InvalidId(String),

    /// OTLP send failed.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
