//! Per-channel byte stream with single-slot receive buffering

use super::frame::{FrameCodec, Signal};
use super::registry::ChannelRegistry;
use super::{BaseStream, MuxError, CHANNEL_BUFFER_SIZE};
use crate::ident::ChannelName;
use async_trait::async_trait;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex as StdMutex, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, timeout_at, Instant};
use tracing::trace;

/// Default read/write timeout for channel operations
pub const DEFAULT_CHANNEL_TIMEOUT: Duration = Duration::from_secs(30);

/// The three kinds of multiplexed channel. Names are independent across
/// kinds; a `(kind, name)` pair identifies a channel within a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Chat-network channel (name derived from the network id)
    Network,
    /// Proxy tunnel toward the endpoint encoded in the name
    Proxy,
    /// Channel carrying a nested connection
    Virtual,
}

impl ChannelKind {
    pub(crate) fn connect_signal(self) -> Signal {
        match self {
            ChannelKind::Network => Signal::ConnectNetworkChannel,
            ChannelKind::Proxy => Signal::ConnectProxyChannel,
            ChannelKind::Virtual => Signal::ConnectVirtualChannel,
        }
    }

    pub(crate) fn data_signal(self) -> Signal {
        match self {
            ChannelKind::Network => Signal::NetworkChannelData,
            ChannelKind::Proxy => Signal::ProxyChannelData,
            ChannelKind::Virtual => Signal::VirtualChannelData,
        }
    }

    pub(crate) fn disconnect_signal(self) -> Signal {
        match self {
            ChannelKind::Network => Signal::DisconnectNetworkChannel,
            ChannelKind::Proxy => Signal::DisconnectProxyChannel,
            ChannelKind::Virtual => Signal::DisconnectVirtualChannel,
        }
    }
}

/// What a channel needs from the connection that owns it. Channels keep a
/// weak handle so disposal of the connection is never kept alive by a
/// surviving channel; once the connection is gone, channel operations fail
/// with [`MuxError::ChannelClosed`].
pub(crate) trait ChannelHost: Send + Sync {
    fn codec(&self) -> &FrameCodec;
    fn registry(&self, kind: ChannelKind) -> &ChannelRegistry;
    fn detach_joint(&self, id: u64);
}

/// Single-slot receive state: at most one in-flight payload
struct Slot {
    buf: Vec<u8>,
    offset: usize,
    count: usize,
}

/// A logical bidirectional byte stream within a connection.
///
/// Inbound data arrives through [`deliver`](MuxChannel::deliver), which
/// parks until the single slot is free; the consumer drains it with
/// [`read`](MuxChannel::read). The slot holding at most one payload couples
/// wire back-pressure to the consumer's pace. A channel also acts as a
/// [`BaseStream`] so an outer channel can carry a nested connection.
pub struct MuxChannel {
    host: Weak<dyn ChannelHost>,
    kind: ChannelKind,
    name: ChannelName,
    slot: Mutex<Slot>,
    readable: Notify,
    drained: Notify,
    disposed: AtomicBool,
    read_timeout: StdMutex<Duration>,
}

impl MuxChannel {
    pub(crate) fn new(host: Weak<dyn ChannelHost>, kind: ChannelKind, name: ChannelName) -> Self {
        Self {
            host,
            kind,
            name,
            slot: Mutex::new(Slot {
                buf: vec![0u8; CHANNEL_BUFFER_SIZE],
                offset: 0,
                count: 0,
            }),
            readable: Notify::new(),
            drained: Notify::new(),
            disposed: AtomicBool::new(false),
            read_timeout: StdMutex::new(DEFAULT_CHANNEL_TIMEOUT),
        }
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn name(&self) -> &ChannelName {
        &self.name
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn read_timeout(&self) -> Duration {
        *self.read_timeout.lock().expect("timeout lock poisoned")
    }

    pub fn set_read_timeout(&self, timeout: Duration) {
        *self.read_timeout.lock().expect("timeout lock poisoned") = timeout;
    }

    /// Read up to `buf.len()` bytes, waiting up to the configured read
    /// timeout for data. Returns 0 when the channel closes while waiting.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, MuxError> {
        let wait = self.read_timeout();
        self.read_slot(buf, Some(wait)).await
    }

    pub(crate) async fn read_slot(
        &self,
        buf: &mut [u8],
        wait: Option<Duration>,
    ) -> Result<usize, MuxError> {
        if buf.is_empty() {
            return Ok(0);
        }

        let mut waited = false;
        loop {
            {
                let mut slot = self.slot.lock().await;
                if slot.count > 0 {
                    let n = buf.len().min(slot.count);
                    let start = slot.offset;
                    buf[..n].copy_from_slice(&slot.buf[start..start + n]);
                    slot.offset += n;
                    slot.count -= n;
                    if slot.count == 0 {
                        self.drained.notify_one();
                    }
                    return Ok(n);
                }
            }

            if self.is_disposed() {
                // Disposal observed while blocked is an orderly end of
                // stream; a read that starts on a dead channel is an error.
                return if waited {
                    Ok(0)
                } else {
                    Err(MuxError::ChannelClosed)
                };
            }

            waited = true;
            match wait {
                Some(t) => timeout(t, self.readable.notified())
                    .await
                    .map_err(|_| MuxError::Timeout)?,
                None => self.readable.notified().await,
            }
        }
    }

    /// Send `buf` to the peer as data frames for this channel. Blocks only
    /// on base-stream back-pressure.
    pub async fn write(&self, buf: &[u8]) -> Result<(), MuxError> {
        if self.is_disposed() {
            return Err(MuxError::ChannelClosed);
        }
        let host = self.host.upgrade().ok_or(MuxError::ChannelClosed)?;
        host.codec()
            .write_frame(self.kind.data_signal(), &self.name, buf)
            .await
    }

    /// Place an inbound payload into the slot, waiting up to `wait` for the
    /// consumer to drain the previous one. Failure means the channel is
    /// stalled or closed; the caller is expected to dispose it.
    pub(crate) async fn deliver(&self, payload: &[u8], wait: Duration) -> Result<(), MuxError> {
        if payload.is_empty() {
            return Ok(());
        }

        let deadline = Instant::now() + wait;
        loop {
            if self.is_disposed() {
                return Err(MuxError::ChannelClosed);
            }

            {
                let mut slot = self.slot.lock().await;
                if slot.count == 0 {
                    slot.buf[..payload.len()].copy_from_slice(payload);
                    slot.offset = 0;
                    slot.count = payload.len();
                    self.readable.notify_one();
                    return Ok(());
                }
            }

            timeout_at(deadline, self.drained.notified())
                .await
                .map_err(|_| MuxError::Timeout)?;
        }
    }

    /// Tear the channel down: drop it from the owning registry, tell the
    /// peer best-effort, wake all waiters. Idempotent.
    pub async fn dispose(&self) {
        self.dispose_inner(true).await;
    }

    pub(crate) async fn dispose_inner(&self, announce: bool) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        trace!(name = %self.name, kind = ?self.kind, "channel disposed");

        if let Some(host) = self.host.upgrade() {
            host.registry(self.kind).remove_entry(&self.name, self);
            if announce {
                let _ = host
                    .codec()
                    .write_frame(self.kind.disconnect_signal(), &self.name, &[])
                    .await;
            }
        }

        self.readable.notify_waiters();
        self.drained.notify_waiters();
    }
}

#[async_trait]
impl BaseStream for MuxChannel {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        // A nested connection reads like a socket: no channel read timeout,
        // liveness comes from the outer layer's keepalives.
        match self.read_slot(buf, None).await {
            Ok(n) => Ok(n),
            Err(MuxError::ChannelClosed) => Ok(0),
            Err(e) => Err(io::Error::new(io::ErrorKind::BrokenPipe, e.to_string())),
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<()> {
        self.write(buf)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e.to_string()))
    }

    async fn shutdown(&self) {
        self.dispose().await;
    }

    fn is_virtual(&self) -> bool {
        true
    }
}
