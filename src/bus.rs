//! In-process message bus between channel adapters and the agent.
//!
//! Adapters publish normalized [`InboundMessage`]s; the agent publishes
//! [`OutboundMessage`]s which the outbound dispatcher routes back to the
//! adapter named by their `channel` tag. Both directions are bounded mpsc
//! queues.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};

/// Errors from the message bus.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The receiving side of a queue has been dropped.
    #[error("message bus closed")]
    Closed,
}

/// A message received from a chat channel, normalized for the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Channel tag, e.g. `"matrix"`.
    pub channel: String,
    /// Platform identity of the sender.
    pub sender_id: String,
    /// Conversation identifier replies are addressed to.
    pub chat_id: String,
    /// Plain-text message content.
    pub content: String,
    /// When the adapter received the message.
    pub timestamp: DateTime<Utc>,
    /// Channel-specific extras (e.g. room display name).
    pub metadata: HashMap<String, String>,
}

impl InboundMessage {
    /// Key identifying the conversation across channels.
    pub fn session_key(&self) -> String {
        format!("{}:{}", self.channel, self.chat_id)
    }
}

/// A reply produced by the agent for a chat channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Channel tag the message is routed to.
    pub channel: String,
    /// Conversation identifier (room id for Matrix).
    pub chat_id: String,
    /// Plain-text content. Adapters may render it.
    pub content: String,
}

impl OutboundMessage {
    /// Build an outbound message.
    pub fn new(
        channel: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
        }
    }
}

/// Anything that accepts inbound messages from an adapter.
///
/// Implemented by [`MessageBus`]; tests substitute recorders.
#[async_trait]
pub trait InboundSink: Send + Sync {
    /// Hand a normalized inbound message to the agent side.
    async fn publish_inbound(&self, msg: InboundMessage) -> Result<(), BusError>;
}

/// Bounded inbound and outbound queues.
///
/// Receivers sit behind a mutex so the bus can be shared through an `Arc`
/// while a single consumer drains each direction.
#[derive(Debug)]
pub struct MessageBus {
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<mpsc::Receiver<InboundMessage>>,
    outbound_tx: mpsc::Sender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::Receiver<OutboundMessage>>,
}

impl MessageBus {
    /// Create a bus with `capacity` slots in each direction.
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(capacity);
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
        }
    }

    /// Wait for the next inbound message. `None` once all senders are gone.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Queue a reply for delivery by its channel adapter.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Closed`] if the outbound consumer is gone.
    pub async fn publish_outbound(&self, msg: OutboundMessage) -> Result<(), BusError> {
        self.outbound_tx.send(msg).await.map_err(|_| BusError::Closed)
    }

    /// Wait for the next outbound message.
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.lock().await.recv().await
    }
}

#[async_trait]
impl InboundSink for MessageBus {
    async fn publish_inbound(&self, msg: InboundMessage) -> Result<(), BusError> {
        self.inbound_tx.send(msg).await.map_err(|_| BusError::Closed)
    }
}
