use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Uncorrectable errors in frame header")]
    HeaderDecode,

    #[error("Malformed frame header: {0}")]
    MalformedHeader(String),

    #[error("Invalid length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("Hop count out of range: hops={hops}, hops_remaining={hops_remaining}")]
    HopCountOutOfRange { hops: u8, hops_remaining: u8 },

    #[error("Payload too large: {0} bytes (max {max})", max = crate::MAX_PAYLOAD_SIZE)]
    PayloadTooLarge(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Payload error: {0}")]
    Payload(String),

    #[error("Audio channel closed")]
    ChannelClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, LinkError>;
