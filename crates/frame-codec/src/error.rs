use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated input: expected at least {expected} bytes, got {actual}")]
    TruncatedInput { expected: usize, actual: usize },

    #[error("truncated varint at offset {0}")]
    TruncatedVarint(usize),

    #[error("varint exceeds 64 bits at offset {0}")]
    VarintTooLong(usize),

    #[error("unknown wire type: {0}")]
    UnknownWireType(u8),
}

pub type Result<T> = std::result::Result<T, FrameError>;
