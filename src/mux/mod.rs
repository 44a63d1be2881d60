//! Multiplexing layer
//!
//! Provides:
//! - Frame encoding/decoding over the base stream
//! - Per-channel byte streams with single-slot receive buffering
//! - Channel registries keyed by kind and name
//! - Joints splicing two channels into a proxy pipe
//! - Control payload codecs for relay signalling

mod channel;
mod control;
mod frame;
mod joint;
mod registry;

pub use channel::{ChannelKind, MuxChannel};
pub(crate) use channel::ChannelHost;
pub use control::{decode_peer_list, encode_peer_list, RelayRequest};
pub use frame::{Frame, FrameCodec, Signal, FRAME_HEADER_SIZE, MAX_FRAME_SIZE, MAX_PAYLOAD_SIZE};
pub use joint::Joint;
pub use registry::ChannelRegistry;

use crate::ident::ChannelName;
use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;

/// Size of a channel's single-slot receive buffer
pub const CHANNEL_BUFFER_SIZE: usize = 65535;

/// Multiplexing layer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("channel closed")]
    ChannelClosed,

    #[error("timed out")]
    Timeout,

    #[error("duplicate channel: {0}")]
    DuplicateChannel(ChannelName),

    #[error("no such channel: {0}")]
    ChannelNotFound(ChannelName),
}

/// Reliable byte stream a connection multiplexes over.
///
/// Implemented by [`IoBase`] for ordinary sockets and by [`MuxChannel`] when
/// a channel of an outer connection carries a nested one (virtual
/// connection). Exactly one task reads and frame emission is serialized by
/// the codec, so `recv` and `send` never race against themselves.
#[async_trait]
pub trait BaseStream: Send + Sync {
    /// Read up to `buf.len()` bytes; 0 means the stream is closed
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write all of `buf` and flush
    async fn send(&self, buf: &[u8]) -> io::Result<()>;

    /// Tear the stream down; subsequent operations fail
    async fn shutdown(&self);

    /// Whether this stream is itself a channel of another connection
    fn is_virtual(&self) -> bool {
        false
    }
}

/// Adapts any async byte stream into a [`BaseStream`]
pub struct IoBase<S> {
    reader: Mutex<ReadHalf<S>>,
    writer: Mutex<WriteHalf<S>>,
}

impl<S: AsyncRead + AsyncWrite + Send + 'static> IoBase<S> {
    pub fn new(stream: S) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<S: AsyncRead + AsyncWrite + Send + 'static> BaseStream for IoBase<S> {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.lock().await.read(buf).await
    }

    async fn send(&self, buf: &[u8]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;
        writer.write_all(buf).await?;
        writer.flush().await
    }

    async fn shutdown(&self) {
        let _ = self.writer.lock().await.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_io_base_roundtrip() {
        let (near, far) = tokio::io::duplex(256);
        let near = IoBase::new(near);
        let far = IoBase::new(far);

        near.send(b"over the wire").await.unwrap();

        let mut buf = [0u8; 32];
        let n = far.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"over the wire");
    }

    #[tokio::test]
    async fn test_io_base_shutdown_signals_eof() {
        let (near, far) = tokio::io::duplex(256);
        let near = IoBase::new(near);
        let far = IoBase::new(far);

        near.shutdown().await;

        let mut buf = [0u8; 8];
        assert_eq!(far.recv(&mut buf).await.unwrap(), 0);
    }
}
