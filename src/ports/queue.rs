//! Message queue ports for the offline path.

use async_trait::async_trait;

use crate::domain::task::{TranscodeRequest, TranscodeResult};
use crate::error::Result;

/// One received request plus the position needed to commit it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub request: TranscodeRequest,
    pub partition: i32,
    pub offset: i64,
}

#[async_trait]
pub trait RequestSource: Send + Sync {
    /// Blocks until the next decodable request arrives.
    async fn recv(&self) -> Result<Delivery>;

    /// Marks a delivery as processed. At-least-once: a crash between
    /// processing and commit redelivers the message.
    async fn commit(&self, delivery: &Delivery) -> Result<()>;
}

#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn publish(&self, result: &TranscodeResult) -> Result<()>;
}
