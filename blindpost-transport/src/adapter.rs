//! Transport adapter contract.

use async_trait::async_trait;
use blindpost_core::{Address, Destination, ReplyHandle};

use crate::error::TransportError;

/// One inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    /// Raw bytes as sent.
    pub payload: Vec<u8>,
    /// Present when the sender attached reply blocks.
    pub reply: Option<ReplyHandle>,
}

/// Send and receive over the anonymous channel.
///
/// Implementations are shared between tasks, so every method takes `&self`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue `payload` for `destination`.
    ///
    /// With `reply_budget > 0` that many single-use reply blocks are attached,
    /// and the receiver sees a reply handle. Sends to a reply handle consume
    /// one block and cannot attach more.
    async fn send(
        &self,
        payload: Vec<u8>,
        destination: Destination,
        reply_budget: u32,
    ) -> Result<(), TransportError>;

    /// Next inbound payload.
    async fn receive(&self) -> Result<Inbound, TransportError>;

    /// Our own directly addressable endpoint.
    fn address(&self) -> &Address;
}
