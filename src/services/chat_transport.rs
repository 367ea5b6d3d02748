//! Transport port consumed by the engine.
//!
//! The concrete QUIC transport lives outside this crate; it calls back into the
//! engine through an `IncomingHandler` for every wire message or receipt it
//! receives for this device.

use async_trait::async_trait;
use std::sync::Arc;

use super::chat_types::{MessageId, ReceiptKind, WireMessage};
use crate::error::Result;

/// Incoming message handler, implemented by `ChatService`'s adapter.
pub type IncomingHandler = Arc<dyn InboundHandler + Send + Sync>;

#[async_trait]
pub trait InboundHandler: Send + Sync {
    async fn handle_message(&self, message: WireMessage) -> std::result::Result<(), String>;

    async fn handle_receipt(
        &self,
        message_id: MessageId,
        kind: ReceiptKind,
    ) -> std::result::Result<(), String>;
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Hand one sealed message to the network. Completes once the transport
    /// has accepted it; any error leaves the message retryable.
    async fn send(&self, message: WireMessage) -> Result<()>;

    /// Register the callback for inbound traffic. Replaces any earlier one.
    fn on_receive(&self, handler: IncomingHandler);
}
