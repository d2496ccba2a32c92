use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

#[derive(Error, Debug)]
pub enum DomainError {
    #[error("Invalid topic: {0}")]
    InvalidTopic(String),

    #[error("Unknown topic leaf: {0}")]
    UnknownTopicLeaf(String),

    #[error("Invalid device-to-agents mapping: {0}")]
    InvalidDeviceMap(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Transport error: {0}")]
    TransportError(#[from] anyhow::Error),
}
