//! Framed TCP connections.
//!
//! An accepted socket is split in two. The read half stays with the task that
//! serves the connection; the write half is owned by a background writer task
//! fed through a bounded channel. The cloneable [`ConnectionHandle`] is the
//! sending side of that channel, so any task can queue a message for a peer
//! without awaiting and without holding the socket. Messages queued on one
//! handle reach the wire in order. A peer that stops reading fills its queue;
//! further messages are refused rather than buffered. Once every handle is
//! dropped the writer drains what is left and the socket is released.

use std::io;
use std::net::SocketAddr;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{Framed, FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::error::{LockError, Result};
use crate::protocol::{Message, ProtocolError, WireCodec};

/// Read side of a split connection.
pub type MessageStream = FramedRead<OwnedReadHalf, WireCodec>;

/// A connection used for strict request/reply exchanges by a single owner.
pub type MessageChannel = Framed<TcpStream, WireCodec>;

/// Messages a connection's writer may have queued before sends are refused.
pub const WRITE_QUEUE_CAPACITY: usize = 1024;

/// Queueing handle to a connection's writer task.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    tx: mpsc::Sender<Message>,
    peer: SocketAddr,
}

impl ConnectionHandle {
    /// Queue a message for the peer without waiting.
    ///
    /// Fails with [`LockError::QueueFull`] when the peer is not draining its
    /// queue, and with [`LockError::ConnectionClosed`] once the writer task
    /// has stopped after a write error.
    pub fn send(&self, message: Message) -> Result<()> {
        self.tx.try_send(message).map_err(|e| match e {
            TrySendError::Full(_) => LockError::QueueFull(self.peer),
            TrySendError::Closed(_) => LockError::ConnectionClosed,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Whether both handles feed the same socket.
    pub fn same_connection(&self, other: &ConnectionHandle) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

/// Split an accepted socket into its message stream and a writer handle.
pub fn split(stream: TcpStream, max_frame_length: usize) -> io::Result<(MessageStream, ConnectionHandle)> {
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    let (read_half, write_half) = stream.into_split();

    let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
    let sink = FramedWrite::new(write_half, WireCodec::with_max_frame_length(max_frame_length));
    tokio::spawn(write_loop(sink, rx, peer));

    let reader = FramedRead::new(read_half, WireCodec::with_max_frame_length(max_frame_length));
    Ok((reader, ConnectionHandle { tx, peer }))
}

async fn write_loop(
    mut sink: FramedWrite<OwnedWriteHalf, WireCodec>,
    mut rx: mpsc::Receiver<Message>,
    peer: SocketAddr,
) {
    while let Some(message) = rx.recv().await {
        if let Err(e) = sink.send(message).await {
            debug!(peer = %peer, error = %e, "Write failed, stopping connection writer");
            return;
        }
    }

    debug!(peer = %peer, "Connection writer exiting (all handles dropped)");
}

/// Open a framed connection to `addr`.
pub async fn dial(addr: impl ToSocketAddrs, max_frame_length: usize) -> io::Result<MessageChannel> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    Ok(Framed::new(
        stream,
        WireCodec::with_max_frame_length(max_frame_length),
    ))
}

/// Next well-formed message from a framed stream.
///
/// Malformed messages are logged and skipped. `Ok(None)` means the peer
/// closed the connection cleanly.
pub async fn next_message<S>(stream: &mut S) -> Result<Option<Message>>
where
    S: Stream<Item = io::Result<std::result::Result<Message, ProtocolError>>> + Unpin,
{
    while let Some(frame) = stream.next().await {
        match frame? {
            Ok(message) => return Ok(Some(message)),
            Err(e) => warn!(error = %e, "Discarding malformed message"),
        }
    }

    Ok(None)
}
