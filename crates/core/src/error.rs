use thiserror::Error;

#[derive(Error, Debug)]
pub enum TollwayError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Malformed metadata: {0}")]
    MalformedMetadata(String),

    #[error("Metadata too large: {0} bytes")]
    MetadataTooLarge(usize),

    #[error("Datagram too short: {0} bytes")]
    DatagramTooShort(usize),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to read config: {0}")]
    ReadError(std::io::Error),

    #[error("Failed to write config: {0}")]
    WriteError(std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TollwayError>;
