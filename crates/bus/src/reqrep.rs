//! Request/reply over ZeroMQ DEALER/ROUTER sockets.
//!
//! - [`ZmqRequestClient`] wraps a DEALER socket for sending requests
//! - [`ZmqRequestServer`] wraps a ROUTER socket for receiving and replying
//! - [`ReplyToken`] is an opaque handle carrying the ZMQ identity frame
//!
//! Both sides hand their socket to a background task so sends and receives
//! never contend for it.
//!
//! ## Framing (zeromq-rs 0.4)
//!
//! zeromq-rs ROUTER pushes peer identity as first frame on recv and pops it
//! on send. DEALER sends/receives raw application frames. So:
//! - DEALER sends: `[topic, envelope]`
//! - ROUTER receives: `[identity, topic, envelope]`
//! - ROUTER sends: `[identity, topic, envelope]`
//! - DEALER receives: `[topic, envelope]`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use zeromq::prelude::*;
use zeromq::{DealerSocket, RouterSocket, ZmqMessage};

use crate::error::BusError;
use crate::message::Message;
use crate::traits::{RequestHandler, RequestSender};
use crate::transport::Endpoint;

/// Opaque token carrying the ZMQ routing identity bytes.
///
/// Pass it back to [`ZmqRequestServer::send_reply`] so the reply reaches
/// the DEALER that sent the request.
#[derive(Debug, Clone)]
pub struct ReplyToken {
    identity: Vec<u8>,
}

type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<Message>>>>;

/// Split `[.., topic, envelope]` off a multipart message, skipping empty
/// delimiter frames.
fn decode_frames(frames: &[&[u8]]) -> Result<Message, BusError> {
    let data: Vec<&[u8]> = frames.iter().copied().skip_while(|f| f.is_empty()).collect();
    match data.as_slice() {
        [_topic, envelope, ..] => Message::from_bytes(envelope),
        _ => Err(BusError::Transport(format!(
            "expected [topic, envelope], got {} data frames",
            data.len()
        ))),
    }
}

fn encode_frames(prefix: Option<Vec<u8>>, msg: &Message) -> Result<ZmqMessage, BusError> {
    let envelope_bytes = msg.to_bytes()?;
    let mut zmq_msg = match prefix {
        Some(identity) => {
            let mut m = ZmqMessage::from(identity);
            m.push_back(msg.topic.as_bytes().to_vec().into());
            m
        }
        None => ZmqMessage::from(msg.topic.as_str()),
    };
    zmq_msg.push_back(envelope_bytes.into());
    Ok(zmq_msg)
}

// ── Client ───────────────────────────────────────────────────────────

/// Removes the pending entry when a request finishes, times out, or its
/// future is dropped mid-flight.
struct PendingGuard<'a> {
    pending: &'a PendingMap,
    cid: Uuid,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.cid);
    }
}

/// ZeroMQ DEALER-socket client matching replies to requests by
/// `correlation_id`. Safe to share: many requests may be outstanding.
pub struct ZmqRequestClient {
    send_tx: mpsc::Sender<ZmqMessage>,
    pending: PendingMap,
    unmatched: Arc<AtomicU64>,
    loop_handle: JoinHandle<()>,
}

impl ZmqRequestClient {
    /// Connect a DEALER socket to a ROUTER endpoint.
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, BusError> {
        let mut socket = DealerSocket::new();
        info!("connecting DEALER socket");
        socket.connect(&endpoint.endpoint()).await?;

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let unmatched = Arc::new(AtomicU64::new(0));
        let (send_tx, send_rx) = mpsc::channel::<ZmqMessage>(256);

        let loop_handle = tokio::spawn(Self::event_loop(
            socket,
            send_rx,
            Arc::clone(&pending),
            Arc::clone(&unmatched),
        ));

        Ok(Self {
            send_tx,
            pending,
            unmatched,
            loop_handle,
        })
    }

    async fn event_loop(
        mut socket: DealerSocket,
        mut send_rx: mpsc::Receiver<ZmqMessage>,
        pending: PendingMap,
        unmatched: Arc<AtomicU64>,
    ) {
        loop {
            tokio::select! {
                Some(zmq_msg) = send_rx.recv() => {
                    if let Err(e) = socket.send(zmq_msg).await {
                        warn!(error = %e, "DEALER send failed");
                    }
                }
                result = socket.recv() => {
                    match result {
                        Ok(zmq_msg) => Self::route_reply(&pending, &unmatched, zmq_msg),
                        Err(e) => {
                            debug!(error = %e, "DEALER recv loop ending");
                            break;
                        }
                    }
                }
                else => break,
            }
        }
        // Dropping the senders wakes every waiting request.
        pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }

    fn route_reply(pending: &PendingMap, unmatched: &AtomicU64, zmq_msg: ZmqMessage) {
        let frames: Vec<&[u8]> = zmq_msg.iter().map(|f| f.as_ref()).collect();
        let message = match decode_frames(&frames) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to decode reply");
                return;
            }
        };

        let cid = message.correlation_id;
        let waiter = pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&cid);
        match waiter {
            Some(tx) => {
                let _ = tx.send(message);
            }
            None => {
                // Late reply after a timeout, or a duplicate delivery.
                unmatched.fetch_add(1, Ordering::Relaxed);
                debug!(correlation_id = %cid, "dropping reply with no waiting request");
            }
        }
    }

    /// Number of replies that matched no outstanding request.
    pub fn unmatched_replies(&self) -> u64 {
        self.unmatched.load(Ordering::Relaxed)
    }

    /// Requests currently awaiting a reply.
    pub fn outstanding(&self) -> usize {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

impl Drop for ZmqRequestClient {
    fn drop(&mut self) {
        self.loop_handle.abort();
    }
}

#[async_trait]
impl RequestSender for ZmqRequestClient {
    /// Returns [`BusError::Timeout`] if no reply arrives within `timeout`.
    async fn request(&self, msg: Message, timeout: Duration) -> Result<Message, BusError> {
        let cid = msg.correlation_id;
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cid, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            cid,
        };

        let zmq_msg = encode_frames(None, &msg)?;
        self.send_tx
            .send(zmq_msg)
            .await
            .map_err(|_| BusError::Transport("client event loop closed".into()))?;
        debug!(correlation_id = %cid, topic = %msg.topic, "sent request");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(BusError::Transport("connection closed before reply".into())),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }
}

// ── Server ───────────────────────────────────────────────────────────

/// ZeroMQ ROUTER-socket server.
///
/// Requests are queued by a background task; replies can be sent from any
/// task while another is blocked in [`RequestHandler::recv_request`].
pub struct ZmqRequestServer {
    incoming: tokio::sync::Mutex<mpsc::Receiver<(ReplyToken, Message)>>,
    outgoing: mpsc::Sender<ZmqMessage>,
    loop_handle: JoinHandle<()>,
}

impl ZmqRequestServer {
    /// Bind a ROUTER socket on the given endpoint.
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn bind(endpoint: &Endpoint) -> Result<Self, BusError> {
        endpoint.prepare_bind()?;
        let mut socket = RouterSocket::new();
        info!("binding ROUTER socket");
        socket.bind(&endpoint.endpoint()).await?;

        let (in_tx, in_rx) = mpsc::channel(256);
        let (out_tx, out_rx) = mpsc::channel(256);
        let loop_handle = tokio::spawn(Self::event_loop(socket, in_tx, out_rx));

        Ok(Self {
            incoming: tokio::sync::Mutex::new(in_rx),
            outgoing: out_tx,
            loop_handle,
        })
    }

    async fn event_loop(
        mut socket: RouterSocket,
        in_tx: mpsc::Sender<(ReplyToken, Message)>,
        mut out_rx: mpsc::Receiver<ZmqMessage>,
    ) {
        loop {
            tokio::select! {
                Some(zmq_msg) = out_rx.recv() => {
                    if let Err(e) = socket.send(zmq_msg).await {
                        warn!(error = %e, "ROUTER send failed");
                    }
                }
                result = socket.recv() => {
                    let zmq_msg = match result {
                        Ok(m) => m,
                        Err(e) => {
                            debug!(error = %e, "ROUTER recv loop ending");
                            break;
                        }
                    };
                    let frames: Vec<&[u8]> = zmq_msg.iter().map(|f| f.as_ref()).collect();
                    let Some((identity, rest)) = frames.split_first() else {
                        continue;
                    };
                    match decode_frames(rest) {
                        Ok(message) => {
                            debug!(
                                correlation_id = %message.correlation_id,
                                topic = %message.topic,
                                "received request"
                            );
                            let token = ReplyToken { identity: identity.to_vec() };
                            if in_tx.send((token, message)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "dropping malformed request"),
                    }
                }
            }
        }
    }
}

impl Drop for ZmqRequestServer {
    fn drop(&mut self) {
        self.loop_handle.abort();
    }
}

#[async_trait]
impl RequestHandler for ZmqRequestServer {
    async fn recv_request(&self) -> Result<(ReplyToken, Message), BusError> {
        self.incoming
            .lock()
            .await
            .recv()
            .await
            .ok_or_else(|| BusError::Transport("server event loop closed".into()))
    }

    async fn send_reply(&self, token: ReplyToken, reply: Message) -> Result<(), BusError> {
        let zmq_msg = encode_frames(Some(token.identity), &reply)?;
        self.outgoing
            .send(zmq_msg)
            .await
            .map_err(|_| BusError::Transport("server event loop closed".into()))?;
        debug!(
            correlation_id = %reply.correlation_id,
            topic = %reply.topic,
            "queued reply"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_skips_delimiters() {
        let msg = Message::new("exgraf.test", &5u8).unwrap();
        let env = msg.to_bytes().unwrap();
        let frames: Vec<&[u8]> = vec![&b""[..], &b"exgraf.test"[..], env.as_slice()];
        let decoded = decode_frames(&frames).unwrap();
        assert_eq!(decoded.correlation_id, msg.correlation_id);
    }

    #[test]
    fn decode_rejects_short_message() {
        let frames: Vec<&[u8]> = vec![&b"exgraf.test"[..]];
        assert!(matches!(decode_frames(&frames), Err(BusError::Transport(_))));
    }

    #[test]
    fn encode_prepends_identity() {
        let msg = Message::new("exgraf.dispatch.reply", &1u8).unwrap();
        let zmq_msg = encode_frames(Some(vec![9, 9]), &msg).unwrap();
        let frames: Vec<_> = zmq_msg.iter().collect();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].as_ref(), &[9u8, 9][..]);
        assert_eq!(frames[1].as_ref(), &b"exgraf.dispatch.reply"[..]);
    }
}
