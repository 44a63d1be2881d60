//! Frame encoding/decoding for the mux protocol
//!
//! Frame format:
//! ```text
//! +--------+----------------------+----------------+-----------+
//! | Signal |  Channel name (20B)  | Length (2B LE) |  Payload  |
//! +--------+----------------------+----------------+-----------+
//! ```
//!
//! A logical write larger than one frame's capacity is split into
//! consecutive frames carrying the same signal and channel name; the
//! receiver treats every frame independently.

use super::{BaseStream, MuxError};
use crate::ident::{ChannelName, ID_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use std::io;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Frame header size in bytes: signal + channel name + payload length
pub const FRAME_HEADER_SIZE: usize = 1 + ID_LEN + 2;

/// Maximum frame size (64 KB minus a 256-byte allowance for lower-layer
/// headers)
pub const MAX_FRAME_SIZE: usize = 65535 - 256;

/// Maximum payload carried by a single frame
pub const MAX_PAYLOAD_SIZE: usize = MAX_FRAME_SIZE - FRAME_HEADER_SIZE;

/// Signal kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Signal {
    /// Keepalive, ignored by the receiver
    Noop = 0,
    /// Open a chat-network channel
    ConnectNetworkChannel = 1,
    /// Data on a chat-network channel
    NetworkChannelData = 2,
    /// Close a chat-network channel
    DisconnectNetworkChannel = 3,
    /// Open a proxy-tunnel channel toward the endpoint in the name
    ConnectProxyChannel = 4,
    /// Data on a proxy-tunnel channel
    ProxyChannelData = 5,
    /// Close a proxy-tunnel channel
    DisconnectProxyChannel = 6,
    /// Open a channel that carries a nested connection
    ConnectVirtualChannel = 7,
    /// Data on a virtual-connection channel
    VirtualChannelData = 8,
    /// Close a virtual-connection channel
    DisconnectVirtualChannel = 9,
    /// Ask whether the peer has a live connection to the named endpoint
    PeerStatusQuery = 10,
    /// Affirmative reply to a peer-status query
    PeerStatusAvailable = 11,
    /// Register TCP relays for the masked network ids in the payload
    StartTcpRelay = 12,
    /// Stop previously registered TCP relays
    StopTcpRelay = 13,
    /// Relay start/stop acknowledged
    TcpRelaySuccess = 14,
    /// Known relay peer endpoints for the named channel
    TcpRelayPeerList = 15,
    /// Out-of-band DHT datagram
    DhtPacket = 16,
    /// Chat-network invitation message
    NetworkInvitation = 17,
}

impl TryFrom<u8> for Signal {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Signal::Noop),
            1 => Ok(Signal::ConnectNetworkChannel),
            2 => Ok(Signal::NetworkChannelData),
            3 => Ok(Signal::DisconnectNetworkChannel),
            4 => Ok(Signal::ConnectProxyChannel),
            5 => Ok(Signal::ProxyChannelData),
            6 => Ok(Signal::DisconnectProxyChannel),
            7 => Ok(Signal::ConnectVirtualChannel),
            8 => Ok(Signal::VirtualChannelData),
            9 => Ok(Signal::DisconnectVirtualChannel),
            10 => Ok(Signal::PeerStatusQuery),
            11 => Ok(Signal::PeerStatusAvailable),
            12 => Ok(Signal::StartTcpRelay),
            13 => Ok(Signal::StopTcpRelay),
            14 => Ok(Signal::TcpRelaySuccess),
            15 => Ok(Signal::TcpRelayPeerList),
            16 => Ok(Signal::DhtPacket),
            17 => Ok(Signal::NetworkInvitation),
            _ => Err(MuxError::Protocol(format!("invalid signal: {value}"))),
        }
    }
}

/// A decoded protocol frame
#[derive(Debug, Clone)]
pub struct Frame {
    pub signal: Signal,
    pub name: ChannelName,
    pub payload: Bytes,
}

/// Frame reader/writer over the base stream.
///
/// All outbound frames flow through `write_frame`, which holds the write
/// buffer lock for the whole frame so concurrent writers never interleave
/// partial frames on the wire. Only the connection's reader task calls
/// `read_frame`.
pub struct FrameCodec {
    stream: Arc<dyn BaseStream>,
    write_buf: Mutex<BytesMut>,
}

impl FrameCodec {
    pub fn new(stream: Arc<dyn BaseStream>) -> Self {
        Self {
            stream,
            write_buf: Mutex::new(BytesMut::with_capacity(MAX_FRAME_SIZE)),
        }
    }

    pub fn stream(&self) -> &Arc<dyn BaseStream> {
        &self.stream
    }

    /// Emit `payload` as one or more frames with the given signal and
    /// channel name. A zero-length payload emits exactly one frame.
    pub async fn write_frame(
        &self,
        signal: Signal,
        name: &ChannelName,
        payload: &[u8],
    ) -> Result<(), MuxError> {
        let mut buf = self.write_buf.lock().await;
        let mut rest = payload;

        loop {
            let n = rest.len().min(MAX_PAYLOAD_SIZE);

            buf.clear();
            buf.put_u8(signal as u8);
            buf.extend_from_slice(name.as_bytes());
            buf.put_u16_le(n as u16);
            buf.extend_from_slice(&rest[..n]);

            self.stream.send(&buf).await?;

            rest = &rest[n..];
            if rest.is_empty() {
                break;
            }
        }

        Ok(())
    }

    /// Read the next frame, retrying on short reads until header and
    /// payload are complete.
    pub async fn read_frame(&self) -> Result<Frame, MuxError> {
        let mut header = [0u8; FRAME_HEADER_SIZE];
        self.recv_exact(&mut header).await?;

        let signal = Signal::try_from(header[0])?;
        let name = ChannelName::try_from_slice(&header[1..1 + ID_LEN])?;
        let len = u16::from_le_bytes([header[FRAME_HEADER_SIZE - 2], header[FRAME_HEADER_SIZE - 1]]);

        let mut payload = vec![0u8; len as usize];
        self.recv_exact(&mut payload).await?;

        Ok(Frame {
            signal,
            name,
            payload: Bytes::from(payload),
        })
    }

    async fn recv_exact(&self, buf: &mut [u8]) -> Result<(), MuxError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.stream.recv(&mut buf[filled..]).await?;
            if n == 0 {
                return Err(MuxError::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "base stream closed",
                )));
            }
            filled += n;
        }
        Ok(())
    }
}
