//! Length-prefixed framed connection.
//!
//! Every message on the wire is a length-prefixed frame:
//!
//! ```text
//! +-------------------+--------------------+
//! | length (4 bytes)  |   payload          |
//! | u32 big-endian    |   (length bytes)   |
//! +-------------------+--------------------+
//! ```
//!
//! The length does not include the prefix itself. Reassembly is handled by
//! `tokio_util`'s `LengthDelimitedCodec`: bytes are accumulated until a
//! whole frame is buffered, so a frame split across several TCP segments
//! (or several frames packed into one) is never lost or merged.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::{Connection, ConnectionId, TransportError};

/// Size of the length prefix in front of every frame.
pub const FRAME_HEADER_LEN: usize = 4;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Configuration for the framing layer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum allowed payload size in bytes. Default: 1 MiB.
    ///
    /// An inbound length prefix above this fails the read; the stream
    /// cannot be resynchronized afterwards, so the connection must close.
    pub max_frame_len: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_len: 1024 * 1024,
        }
    }
}

impl FrameConfig {
    /// Builds the codec shared by both directions.
    pub fn codec(&self) -> LengthDelimitedCodec {
        LengthDelimitedCodec::builder()
            .length_field_length(FRAME_HEADER_LEN)
            .big_endian()
            .max_frame_length(self.max_frame_len)
            .new_codec()
    }
}

/// A connection that exchanges length-prefixed frames over any byte stream.
///
/// The read and write halves sit behind separate locks. The write lock is
/// held for the full duration of one frame write, which is what keeps
/// concurrent senders from interleaving bytes on the wire.
pub struct FramedConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    max_frame_len: usize,
    /// Set once the write side has been shut down.
    write_closed: AtomicBool,
    reader: Mutex<FramedRead<BoxedReader, LengthDelimitedCodec>>,
    writer: Mutex<FramedWrite<BoxedWriter, LengthDelimitedCodec>>,
}

impl FramedConnection {
    /// Wraps a pair of stream halves into a framed connection.
    pub fn new<R, W>(
        id: ConnectionId,
        remote_addr: SocketAddr,
        reader: R,
        writer: W,
        config: &FrameConfig,
    ) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let reader: BoxedReader = Box::new(reader);
        let writer: BoxedWriter = Box::new(writer);
        Self {
            id,
            remote_addr,
            max_frame_len: config.max_frame_len,
            write_closed: AtomicBool::new(false),
            reader: Mutex::new(FramedRead::new(reader, config.codec())),
            writer: Mutex::new(FramedWrite::new(writer, config.codec())),
        }
    }
}

impl Connection for FramedConnection {
    type Error = TransportError;

    async fn send(&self, data: &[u8]) -> Result<(), Self::Error> {
        if self.write_closed.load(Ordering::Acquire) {
            return Err(TransportError::ConnectionClosed(format!(
                "{} write side already closed",
                self.id
            )));
        }
        if data.len() > self.max_frame_len {
            return Err(TransportError::FrameTooLarge {
                len: data.len(),
                max: self.max_frame_len,
            });
        }
        self.writer
            .lock()
            .await
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(TransportError::SendFailed)
    }

    async fn recv(&self) -> Result<Option<Bytes>, Self::Error> {
        match self.reader.lock().await.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(TransportError::ReceiveFailed(e)),
            None => Ok(None),
        }
    }

    async fn close(&self) -> Result<(), Self::Error> {
        self.write_closed.store(true, Ordering::Release);
        SinkExt::<Bytes>::close(&mut *self.writer.lock().await)
            .await
            .map_err(TransportError::SendFailed)
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}
