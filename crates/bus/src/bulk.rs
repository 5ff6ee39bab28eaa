//! Bulk data plane: large tensors move over plain TCP, beside the
//! ZeroMQ control plane.
//!
//! Each frame is a big-endian `u32` length followed by a MessagePack body.
//! A connection carries one request and one response per round trip; the
//! client opens a fresh connection per operation.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::error::BusError;
use crate::message::serde_bytes;
use crate::transport::Endpoint;

/// Largest frame either side will read.
pub const DEFAULT_MAX_FRAME: usize = 512 * 1024 * 1024;

#[derive(Debug, Serialize, Deserialize)]
enum BulkRequest {
    Put {
        key: String,
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },
    /// Read and remove.
    Take { key: String },
}

#[derive(Debug, Serialize, Deserialize)]
enum BulkResponse {
    Stored,
    Blob(#[serde(with = "serde_bytes")] Vec<u8>),
    Missing,
    Error(String),
}

#[derive(Debug)]
struct Blob {
    data: Vec<u8>,
    stored_at: Instant,
}

/// In-memory blobs keyed by string. Clones share storage.
///
/// Blobs are consumed by [`BlobStore::take`]; ones whose consumer never
/// shows up are dropped by [`BlobStore::sweep`].
#[derive(Debug, Clone, Default)]
pub struct BlobStore {
    inner: Arc<Mutex<HashMap<String, Blob>>>,
}

impl BlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn blobs(&self) -> MutexGuard<'_, HashMap<String, Blob>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put(&self, key: impl Into<String>, data: Vec<u8>) {
        let blob = Blob {
            data,
            stored_at: Instant::now(),
        };
        self.blobs().insert(key.into(), blob);
    }

    /// Remove and return a blob. Each blob is consumed exactly once.
    pub fn take(&self, key: &str) -> Option<Vec<u8>> {
        self.blobs().remove(key).map(|b| b.data)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.blobs().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.blobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop blobs stored more than `max_age` ago. Returns how many went.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let mut blobs = self.blobs();
        let before = blobs.len();
        blobs.retain(|_, b| b.stored_at.elapsed() <= max_age);
        let dropped = before - blobs.len();
        if dropped > 0 {
            warn!(dropped, kept = blobs.len(), "dropped unclaimed blobs");
        }
        dropped
    }

    /// Sweep every `period` until the handle is aborted.
    pub fn spawn_sweeper(&self, max_age: Duration, period: Duration) -> JoinHandle<()> {
        let store = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                store.sweep(max_age);
            }
        })
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<(), BusError> {
    let len = u32::try_from(body.len()).map_err(|_| BusError::FrameTooLarge {
        len: body.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_u32(len).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

/// `Ok(None)` on a clean EOF before the length prefix.
async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> Result<Option<Vec<u8>>, BusError> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > max {
        return Err(BusError::FrameTooLarge { len, max });
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// TCP server exposing a [`BlobStore`].
pub struct BulkServer {
    local_addr: SocketAddr,
    store: BlobStore,
    accept_handle: JoinHandle<()>,
}

impl BulkServer {
    /// Bind on a TCP endpoint. Port 0 picks a free port; see
    /// [`BulkServer::local_addr`].
    #[instrument(skip_all, fields(endpoint = %endpoint))]
    pub async fn bind(endpoint: &Endpoint, store: BlobStore) -> Result<Self, BusError> {
        let addr = endpoint
            .socket_addr()
            .ok_or_else(|| BusError::InvalidEndpoint(endpoint.to_string()))?;
        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "bulk server listening");

        let accept_handle = tokio::spawn(Self::accept_loop(listener, store.clone()));
        Ok(Self {
            local_addr,
            store,
            accept_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Endpoint clients should connect to.
    pub fn endpoint(&self) -> Endpoint {
        Endpoint::tcp(self.local_addr.ip().to_string(), self.local_addr.port())
    }

    pub fn store(&self) -> &BlobStore {
        &self.store
    }

    async fn accept_loop(listener: TcpListener, store: BlobStore) {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let store = store.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::serve_connection(stream, store).await {
                            warn!(%peer, error = %e, "bulk connection failed");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "bulk accept failed");
                }
            }
        }
    }

    async fn serve_connection(mut stream: TcpStream, store: BlobStore) -> Result<(), BusError> {
        while let Some(body) = read_frame(&mut stream, DEFAULT_MAX_FRAME).await? {
            let response = match rmp_serde::from_slice::<BulkRequest>(&body) {
                Ok(BulkRequest::Put { key, data }) => {
                    debug!(%key, bytes = data.len(), "bulk put");
                    store.put(key, data);
                    BulkResponse::Stored
                }
                Ok(BulkRequest::Take { key }) => match store.take(&key) {
                    Some(data) => {
                        debug!(%key, bytes = data.len(), "bulk take");
                        BulkResponse::Blob(data)
                    }
                    None => BulkResponse::Missing,
                },
                Err(e) => BulkResponse::Error(e.to_string()),
            };
            write_frame(&mut stream, &rmp_serde::to_vec(&response)?).await?;
        }
        Ok(())
    }
}

impl Drop for BulkServer {
    fn drop(&mut self) {
        self.accept_handle.abort();
    }
}

/// Client for a peer's [`BulkServer`].
#[derive(Debug, Clone)]
pub struct BulkClient {
    addr: String,
    max_frame: usize,
}

impl BulkClient {
    pub fn new(endpoint: &Endpoint) -> Result<Self, BusError> {
        let addr = endpoint
            .socket_addr()
            .ok_or_else(|| BusError::InvalidEndpoint(endpoint.to_string()))?;
        Ok(Self {
            addr,
            max_frame: DEFAULT_MAX_FRAME,
        })
    }

    pub fn with_max_frame(mut self, max_frame: usize) -> Self {
        self.max_frame = max_frame;
        self
    }

    async fn round_trip(&self, request: &BulkRequest) -> Result<BulkResponse, BusError> {
        let mut stream = TcpStream::connect(&self.addr).await?;
        write_frame(&mut stream, &rmp_serde::to_vec(request)?).await?;
        let body = read_frame(&mut stream, self.max_frame)
            .await?
            .ok_or_else(|| BusError::Transport(format!("bulk peer {} closed without reply", self.addr)))?;
        Ok(rmp_serde::from_slice(&body)?)
    }

    /// Store `data` under `key` on the peer.
    pub async fn put(&self, key: &str, data: Vec<u8>) -> Result<(), BusError> {
        let request = BulkRequest::Put {
            key: key.to_string(),
            data,
        };
        match self.round_trip(&request).await? {
            BulkResponse::Stored => Ok(()),
            BulkResponse::Error(e) => Err(BusError::Transport(e)),
            other => Err(BusError::Transport(format!("unexpected bulk response {other:?}"))),
        }
    }

    /// Fetch and remove `key` from the peer. `None` if it is not there.
    pub async fn take(&self, key: &str) -> Result<Option<Vec<u8>>, BusError> {
        let request = BulkRequest::Take { key: key.to_string() };
        match self.round_trip(&request).await? {
            BulkResponse::Blob(data) => Ok(Some(data)),
            BulkResponse::Missing => Ok(None),
            BulkResponse::Error(e) => Err(BusError::Transport(e)),
            BulkResponse::Stored => Err(BusError::Transport("unexpected bulk response Stored".into())),
        }
    }
}
