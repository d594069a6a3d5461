//! Error types for compression and decompression.

use thiserror::Error;

/// Errors surfaced by compressors, decompressors and model (de)serialization.
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying file or stream I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A block produced more coded material than the configured policy allows.
    /// Retry with a smaller block size.
    #[error("buffer overflow: observed {observed}, allowed {allowed}")]
    BufferOverflow { observed: usize, allowed: usize },

    /// Input does not match the schema (column count, attribute type, leaf
    /// count past the 16-bit id space).
    #[error("schema error: {0}")]
    Schema(String),

    /// The compressed stream or a serialized model is not self-consistent.
    #[error("corrupt stream: {0}")]
    Corrupt(String),
}

/// Result type for compression operations.
pub type Result<T> = std::result::Result<T, Error>;
