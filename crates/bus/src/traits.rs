use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BusError;
use crate::message::Message;
use crate::reqrep::ReplyToken;

/// Publishes messages to subscribers via PUB/SUB.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a message. Subscribers filter by the message's topic.
    async fn publish(&self, message: Message) -> Result<(), BusError>;
}

/// Blanket implementation so `Arc<dyn EventPublisher>` can be used directly.
#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for Arc<T> {
    async fn publish(&self, message: Message) -> Result<(), BusError> {
        (**self).publish(message).await
    }
}

/// Receives messages matching topic prefixes via PUB/SUB.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Subscribe to topics starting with `topic_prefix`. Empty matches all.
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), BusError>;

    /// Receive the next message. Blocks until one is available.
    async fn recv(&self) -> Result<Message, BusError>;
}

/// Client side of request/reply.
#[async_trait]
pub trait RequestSender: Send + Sync {
    /// Send `msg` and wait for the reply carrying the same correlation id.
    async fn request(&self, msg: Message, timeout: Duration) -> Result<Message, BusError>;
}

/// Server side of request/reply. Replies may be sent out of order and
/// concurrently with further `recv_request` calls.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn recv_request(&self) -> Result<(ReplyToken, Message), BusError>;

    async fn send_reply(&self, token: ReplyToken, reply: Message) -> Result<(), BusError>;
}
