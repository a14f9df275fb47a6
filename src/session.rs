//! A live framed connection to one remote peer.
//!
//! The session splits the TCP stream: the write half sits behind a lock so
//! frame writes never interleave, the read half is owned by a single demux
//! task. Responses carry the request's id with the reply bit set, so both
//! directions can run the same RPC concurrently; inbound replies match FIFO
//! against pending outbound calls, everything else is a request for the RPC
//! registry.
//!
//! Any read or write error moves the session to closed and it stays that way.
//! Close is idempotent and wakes every pending caller with `PeerClosed`.

use crate::addr::NetAddress;
use crate::error::{Error, Result};
use crate::ratelimit::{LimitedReader, LimitedWriter, RateLimiter};
use crate::wire::{self, Handshake, RpcId};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};

/// The read half of a session, held by its demux loop.
pub(crate) type SessionReader = LimitedReader<OwnedReadHalf>;

#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    /// The remote's observed socket address (not its advertised dialback).
    remote: NetAddress,
    writer: tokio::sync::Mutex<LimitedWriter<OwnedWriteHalf>>,
    /// Pending outbound calls awaiting a response, FIFO per rpc id.
    pending: Mutex<HashMap<RpcId, VecDeque<oneshot::Sender<Vec<u8>>>>>,
    closed_tx: watch::Sender<bool>,
}

impl PeerSession {
    pub(crate) fn new(stream: TcpStream, rate: RateLimiter) -> Result<(PeerSession, SessionReader)> {
        let sock = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        let (r, w) = stream.into_split();
        let (closed_tx, _) = watch::channel(false);
        let session = PeerSession {
            inner: Arc::new(SessionInner {
                remote: NetAddress::from_parts(&sock.ip().to_string(), sock.port()),
                writer: tokio::sync::Mutex::new(LimitedWriter::new(w, rate.clone())),
                pending: Mutex::new(HashMap::new()),
                closed_tx,
            }),
        };
        Ok((session, LimitedReader::new(r, rate)))
    }

    /// The observed socket address of the remote end.
    pub fn remote(&self) -> &NetAddress {
        &self.inner.remote
    }

    /// Whether two handles refer to the same underlying connection.
    pub(crate) fn same(&self, other: &PeerSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.closed_tx.borrow()
    }

    /// A receiver that flips to `true` when the session closes.
    pub(crate) fn closed_signal(&self) -> watch::Receiver<bool> {
        self.inner.closed_tx.subscribe()
    }

    pub(crate) async fn write_handshake(&self, hs: &Handshake) -> Result<()> {
        let blob = wire::encode_handshake(hs);
        let mut msg = Vec::with_capacity(8 + blob.len());
        msg.extend_from_slice(&(blob.len() as u64).to_le_bytes());
        msg.extend_from_slice(&blob);
        self.write_raw(&msg).await
    }

    pub(crate) async fn read_handshake(&self, r: &mut SessionReader) -> Result<Handshake> {
        let mut len_buf = [0u8; 8];
        self.read_raw(r, &mut len_buf).await?;
        let len = u64::from_le_bytes(len_buf);
        if len > wire::MAX_HANDSHAKE_LEN {
            self.close().await;
            return Err(Error::InvalidArgument(format!("handshake of {len} bytes too large")));
        }
        let mut blob = vec![0u8; len as usize];
        self.read_raw(r, &mut blob).await?;
        wire::decode_handshake(&blob)
    }

    /// Read one frame, closing the session on any failure.
    pub(crate) async fn read_frame(&self, r: &mut SessionReader) -> Result<(RpcId, Vec<u8>)> {
        let mut header = [0u8; 16];
        self.read_raw(r, &mut header).await?;
        let mut id: RpcId = [0u8; 8];
        id.copy_from_slice(&header[..8]);
        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&header[8..16]);
        let len = u64::from_le_bytes(len_bytes);
        if len > wire::MAX_FRAME_PAYLOAD {
            self.close().await;
            return Err(Error::InvalidArgument(format!("frame payload of {len} bytes too large")));
        }
        let mut payload = vec![0u8; len as usize];
        self.read_raw(r, &mut payload).await?;
        Ok((id, payload))
    }

    /// Write a raw frame to the peer.
    pub async fn send(&self, id: RpcId, payload: &[u8]) -> Result<()> {
        let frame = wire::encode_frame(id, payload)?;
        self.write_raw(&frame).await
    }

    /// Send the response to a request received under `id`.
    pub async fn reply(&self, id: RpcId, payload: &[u8]) -> Result<()> {
        self.send(wire::reply_id(&id), payload).await
    }

    /// Issue an outbound call and wait for the FIFO-matched reply frame.
    pub async fn call(&self, id: RpcId, payload: &[u8]) -> Result<Vec<u8>> {
        // Encode before enqueuing: a failed write closes the session and
        // drains pending, but an encode error must not leave a dead entry in
        // the FIFO queue.
        let frame = wire::encode_frame(id, payload)?;
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
            if self.is_closed() {
                return Err(Error::PeerClosed);
            }
            pending.entry(id).or_default().push_back(tx);
        }
        self.write_raw(&frame).await?;

        let mut closed = self.closed_signal();
        tokio::select! {
            biased;
            res = rx => res.map_err(|_| Error::PeerClosed),
            _ = closed.changed() => Err(Error::PeerClosed),
        }
    }

    /// Route an inbound reply to the eldest pending call for its request id.
    /// Returns `false` when no call was waiting.
    pub(crate) fn match_response(&self, request: &RpcId, payload: Vec<u8>) -> bool {
        let mut pending = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(queue) = pending.get_mut(request) else { return false };
        match queue.pop_front() {
            Some(tx) => {
                if queue.is_empty() {
                    pending.remove(request);
                }
                // A caller that gave up (timeout) just drops the receiver.
                let _ = tx.send(payload);
                true
            }
            None => false,
        }
    }

    /// Close the session. Idempotent; pending callers observe `PeerClosed`.
    pub async fn close(&self) {
        if self.inner.closed_tx.send_replace(true) {
            return;
        }
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner).clear();
        let mut w = self.inner.writer.lock().await;
        w.shutdown().await;
    }

    async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::PeerClosed);
        }
        let res = {
            let mut w = self.inner.writer.lock().await;
            w.write_all(bytes).await
        };
        if let Err(e) = res {
            self.close().await;
            return Err(e);
        }
        Ok(())
    }

    async fn read_raw(&self, r: &mut SessionReader, buf: &mut [u8]) -> Result<()> {
        if self.is_closed() {
            return Err(Error::PeerClosed);
        }
        if let Err(e) = r.read_exact(buf).await {
            self.close().await;
            return Err(e);
        }
        Ok(())
    }
}
