//! Crate-wide error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("queue error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("token error: {0}")]
    Token(#[from] jsonwebtoken::errors::Error),

    #[error("watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("encoder error: {0}")]
    Encoder(String),

    #[error("probe error: {0}")]
    Probe(String),

    #[error("pipe closed")]
    PipeClosed,

    #[error("upload {0} not found")]
    UploadNotFound(uuid::Uuid),

    #[error("multipart upload error: {0}")]
    Multipart(&'static str),

    #[error("upload already {0}")]
    UploadClosed(&'static str),

    #[error("operation timed out")]
    Timeout,

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
