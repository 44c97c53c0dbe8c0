//! Chat channel adapters.
//!
//! Each adapter maintains its protocol connection, admits inbound messages
//! according to its configured policy, and normalizes them into
//! [`InboundMessage`](crate::bus::InboundMessage)s for the bus. Replies come
//! back through [`dispatch_outbound`].

use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::bus::{BusError, MessageBus, OutboundMessage};

pub mod matrix;

use self::matrix::session::SessionError;

/// Errors surfaced by channel adapters.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Local setup failed (e.g. the store directory could not be created).
    #[error("channel setup failed: {0}")]
    Setup(String),
    /// The remote session reported an error.
    #[error(transparent)]
    Session(#[from] SessionError),
    /// The message bus is gone.
    #[error(transparent)]
    Bus(#[from] BusError),
}

/// Lifecycle and delivery surface shared by every chat adapter.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel tag used to route outbound messages, e.g. `"matrix"`.
    fn name(&self) -> &str;

    /// Connect and begin receiving messages in the background.
    async fn start(&mut self) -> Result<(), ChannelError>;

    /// Stop receiving and release the connection. Safe to call repeatedly.
    async fn stop(&mut self);

    /// Deliver a reply produced by the agent.
    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError>;
}

/// Whether `sender` may talk to the bot under `allow_from`.
///
/// An empty list admits everyone.
pub fn is_sender_allowed(allow_from: &[String], sender: &str) -> bool {
    allow_from.is_empty() || allow_from.iter().any(|allowed| allowed == sender)
}

/// Deliver one outbound message to the channel named by its tag.
///
/// Send failures are logged, not retried. Returns `false` when no channel
/// matches the tag or delivery failed.
pub async fn route_outbound(msg: &OutboundMessage, channels: &[&dyn Channel]) -> bool {
    let Some(channel) = channels.iter().find(|c| c.name() == msg.channel) else {
        warn!(channel = %msg.channel, "no adapter for outbound message, dropping");
        return false;
    };

    match channel.send(msg).await {
        Ok(()) => {
            debug!(channel = %msg.channel, chat_id = %msg.chat_id, "outbound message delivered");
            true
        }
        Err(e) => {
            error!(
                channel = %msg.channel,
                chat_id = %msg.chat_id,
                error = %e,
                "failed to deliver outbound message"
            );
            false
        }
    }
}

/// Drain the bus's outbound queue until it closes, routing each message.
pub async fn dispatch_outbound(bus: &MessageBus, channels: &[&dyn Channel]) {
    while let Some(msg) = bus.consume_outbound().await {
        route_outbound(&msg, channels).await;
    }
    debug!("outbound queue closed");
}
