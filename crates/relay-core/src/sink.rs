//! The sink abstraction.
//!
//! A [`Sink`] receives every payload the upstream client reads. The relay does
//! not know what sits behind it; a failed push is reported and forgotten.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::SinkError;

/// Consumer of forwarded upstream payloads.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Push one payload.
    async fn push(&self, data: Bytes) -> Result<(), SinkError>;
}

#[async_trait]
impl Sink for mpsc::UnboundedSender<Bytes> {
    async fn push(&self, data: Bytes) -> Result<(), SinkError> {
        self.send(data)
            .map_err(|_| SinkError::Unavailable("receiver dropped".into()))
    }
}

#[async_trait]
impl Sink for mpsc::Sender<Bytes> {
    async fn push(&self, data: Bytes) -> Result<(), SinkError> {
        self.send(data)
            .await
            .map_err(|_| SinkError::Unavailable("receiver dropped".into()))
    }
}
