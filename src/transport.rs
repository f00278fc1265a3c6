// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The framed source↔sink transport.
//!
//! [`Transport`] owns one stream-oriented connection framed by
//! [`FrameCodec`](crate::wire::FrameCodec): 4-byte length prefix, tag
//! byte split off as a header token. TCP construction enables
//! keepalive and disables Nagle; receives are driven one frame at a
//! time, only when a reply is expected.
//!
//! # Ownership
//!
//! The transport is a single-writer resource: at every instant exactly
//! one task owns it. The exchange engine holds it by value and, during
//! key exchange, moves it into a [`SocketSlot`], a single-slot
//! ownership cell the comparison worker borrows from per operation.
//! The engine reclaims the transport from the slot once the worker is
//! done.

use crate::error::ExchangeError;
use crate::wire::{Frame, FrameCodec, MsgTag, SyncReply};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpSocket;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::codec::Framed;

/// Object-safe alias for anything a transport can run over.
pub trait SocketIo: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SocketIo for T {}

/// One framed connection to the sink.
pub struct Transport {
    io: Framed<Box<dyn SocketIo>, FrameCodec>,
    peer: String,
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").field("peer", &self.peer).finish()
    }
}

impl Transport {
    /// Connect over TCP with keepalive on and Nagle off.
    pub async fn connect(addr: SocketAddr) -> std::io::Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::from_io(stream, addr.to_string()))
    }

    /// Wrap an already-connected stream. Used by tests with in-memory
    /// duplex pipes.
    pub fn from_io<S: SocketIo + 'static>(io: S, peer: impl Into<String>) -> Self {
        Self {
            io: Framed::new(Box::new(io) as Box<dyn SocketIo>, FrameCodec::new()),
            peer: peer.into(),
        }
    }

    /// The peer this transport is connected to, for logs.
    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Send a frame without awaiting a reply (`PUT_OBJ`, `COMPLETE`).
    pub async fn send_async(&mut self, frame: Frame) -> Result<(), ExchangeError> {
        self.io.send(frame).await.map_err(ExchangeError::from)
    }

    /// Send a frame and block until the sink's `REPLY` arrives.
    ///
    /// Any non-`REPLY` frame, decode failure, or connection loss while
    /// waiting is fatal to the exchange.
    pub async fn send_sync(&mut self, frame: Frame) -> Result<SyncReply, ExchangeError> {
        let tag = frame.tag;
        self.io.send(frame).await?;
        let reply = match self.io.next().await {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => return Err(ExchangeError::from(e)),
            None => {
                return Err(ExchangeError::Transport(format!(
                    "connection to {} closed awaiting reply to {tag}",
                    self.peer
                )))
            }
        };
        if reply.tag != MsgTag::Reply {
            return Err(ExchangeError::Protocol(format!(
                "expected REPLY to {tag}, got {}",
                reply.tag
            )));
        }
        reply
            .decode_payload::<SyncReply>()
            .map_err(|e| ExchangeError::Protocol(format!("undecodable reply to {tag}: {e}")))
    }
}

/// Single-slot ownership cell for the engine↔worker socket handoff.
///
/// Either the slot holds the transport or some task does; the mutex
/// guarantees at most one borrower at a time. [`take`](Self::take)
/// moves ownership out entirely.
#[derive(Clone, Default)]
pub struct SocketSlot {
    inner: Arc<Mutex<Option<Transport>>>,
}

impl SocketSlot {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Move a transport into the slot.
    pub async fn put(&self, transport: Transport) {
        let mut guard = self.inner.lock().await;
        debug_assert!(guard.is_none(), "socket slot already occupied");
        *guard = Some(transport);
    }

    /// Move the transport out of the slot, if present.
    pub async fn take(&self) -> Option<Transport> {
        self.inner.lock().await.take()
    }

    /// Borrow the transport in place for one operation.
    pub async fn borrow(&self) -> MutexGuard<'_, Option<Transport>> {
        self.inner.lock().await
    }
}
