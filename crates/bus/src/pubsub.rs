use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};
use zeromq::prelude::*;
use zeromq::{PubSocket, SubSocket, ZmqMessage};

use crate::error::BusError;
use crate::message::Message;
use crate::traits::{EventPublisher, EventSubscriber};
use crate::transport::Endpoint;

/// ZeroMQ PUB socket publisher.
///
/// Messages are sent as two-frame ZMQ messages:
/// 1. Topic string (used by SUB sockets for prefix filtering)
/// 2. MessagePack-encoded [`Message`] envelope
///
/// Workers bind their heartbeat publisher; the coordinator's subscriber
/// connects to every configured worker.
pub struct ZmqPublisher {
    socket: Mutex<PubSocket>,
}

impl ZmqPublisher {
    /// Bind a PUB socket. Subscribers connect to it.
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, BusError> {
        endpoint.prepare_bind()?;
        let mut socket = PubSocket::new();
        info!("binding PUB socket");
        socket.bind(&endpoint.endpoint()).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }

    /// Connect a PUB socket to a subscriber that binds.
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, BusError> {
        let mut socket = PubSocket::new();
        info!("connecting PUB socket");
        socket.connect(&endpoint.endpoint()).await?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }
}

#[async_trait]
impl EventPublisher for ZmqPublisher {
    async fn publish(&self, message: Message) -> Result<(), BusError> {
        let envelope_bytes = message.to_bytes()?;

        let mut zmq_msg = ZmqMessage::from(message.topic.as_str());
        zmq_msg.push_back(envelope_bytes.into());

        let mut socket = self.socket.lock().await;
        socket.send(zmq_msg).await?;

        debug!(topic = %message.topic, "published message");
        Ok(())
    }
}

/// ZeroMQ SUB socket subscriber. One subscriber may connect to several
/// publishers; messages from all of them are interleaved.
pub struct ZmqSubscriber {
    socket: Mutex<SubSocket>,
}

impl ZmqSubscriber {
    /// Create an unconnected subscriber.
    pub fn new() -> Self {
        Self {
            socket: Mutex::new(SubSocket::new()),
        }
    }

    /// Create a subscriber connected to one publisher.
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, BusError> {
        let subscriber = Self::new();
        subscriber.add_publisher(endpoint).await?;
        Ok(subscriber)
    }

    /// Connect to one more publisher.
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn add_publisher(&self, endpoint: &Endpoint) -> Result<(), BusError> {
        let mut socket = self.socket.lock().await;
        info!("connecting SUB socket");
        socket.connect(&endpoint.endpoint()).await?;
        Ok(())
    }
}

impl Default for ZmqSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventSubscriber for ZmqSubscriber {
    async fn subscribe(&self, topic_prefix: &str) -> Result<(), BusError> {
        let mut socket = self.socket.lock().await;
        socket.subscribe(topic_prefix).await?;
        info!(topic_prefix = %topic_prefix, "subscribed to topic prefix");
        Ok(())
    }

    /// Expects `[topic, envelope]`; a lone frame is taken as the envelope.
    async fn recv(&self) -> Result<Message, BusError> {
        let mut socket = self.socket.lock().await;
        let zmq_msg = socket.recv().await?;

        let frames: Vec<_> = zmq_msg.iter().collect();
        let envelope: &[u8] = match frames.as_slice() {
            [_, envelope, ..] => envelope.as_ref(),
            [only] => only.as_ref(),
            [] => return Err(BusError::Transport("empty ZMQ message".into())),
        };
        let message = Message::from_bytes(envelope)?;
        debug!(topic = %message.topic, "received message");
        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zmq_message_two_frame_construction() {
        let topic = "exgraf.test.topic";
        let payload_bytes = b"test-payload";

        let mut msg = ZmqMessage::from(topic);
        msg.push_back(payload_bytes.to_vec().into());

        let frames: Vec<_> = msg.iter().collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].as_ref(), topic.as_bytes());
        assert_eq!(frames[1].as_ref(), payload_bytes);
    }
}
