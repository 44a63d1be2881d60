//! Connection facade
//!
//! A [`Connection`] multiplexes channels and control signalling over one
//! base stream to a single remote peer. It owns the frame codec, the three
//! channel registries, the joint set, the pending-response tables and the
//! relays hosted for the peer; `start` spawns the single reader task and
//! `dispose` tears everything down.

mod hooks;
mod reader;

pub use hooks::{ConnectionManager, DhtClient, Hooks, MuxEvents, RelayHandle, RelayService};

use crate::ident::{ChannelName, NetworkId, PeerId};
use crate::mux::{
    BaseStream, ChannelHost, ChannelKind, ChannelRegistry, FrameCodec, Joint, MuxChannel,
    MuxError, RelayRequest, Signal,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

/// Bounded waits used by a connection. Defaults are the protocol values.
#[derive(Debug, Clone)]
pub struct ConnectionTimeouts {
    /// Initial read timeout applied to every channel
    pub channel_read: Duration,
    /// How long an inbound payload may wait for a stalled channel's slot
    pub channel_write: Duration,
    /// Wait for a peer-status reply
    pub peer_status: Duration,
    /// Wait for a start-relay acknowledgement
    pub relay_start: Duration,
    /// Wait for a stop-relay acknowledgement
    pub relay_stop: Duration,
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self {
            channel_read: Duration::from_secs(30),
            channel_write: Duration::from_secs(30),
            peer_status: Duration::from_secs(10),
            relay_start: Duration::from_secs(120),
            relay_stop: Duration::from_secs(10),
        }
    }
}

/// One-shot notifiers keyed by channel name, correlating control replies
/// with their pending requests.
struct PendingTable {
    waiters: StdMutex<HashMap<ChannelName, Arc<Notify>>>,
}

impl PendingTable {
    fn new() -> Self {
        Self {
            waiters: StdMutex::new(HashMap::new()),
        }
    }

    fn register(&self, name: ChannelName) -> Arc<Notify> {
        let notify = Arc::new(Notify::new());
        self.waiters
            .lock()
            .expect("pending lock poisoned")
            .insert(name, notify.clone());
        notify
    }

    /// Wake the waiter for `name`, if any. A miss is a benign race with
    /// request timeout or disposal.
    fn signal(&self, name: &ChannelName) -> bool {
        match self
            .waiters
            .lock()
            .expect("pending lock poisoned")
            .remove(name)
        {
            Some(notify) => {
                notify.notify_one();
                true
            }
            None => false,
        }
    }

    fn remove(&self, name: &ChannelName) {
        self.waiters
            .lock()
            .expect("pending lock poisoned")
            .remove(name);
    }
}

pub(crate) struct ConnectionShared {
    codec: FrameCodec,
    local_peer: PeerId,
    remote_peer: PeerId,
    remote_endpoint: SocketAddr,
    hooks: Hooks,
    network_channels: ChannelRegistry,
    proxy_channels: ChannelRegistry,
    virtual_channels: ChannelRegistry,
    joints: StdMutex<HashMap<u64, Arc<Joint>>>,
    next_joint_id: AtomicU64,
    probe_waiters: PendingTable,
    relay_waiters: PendingTable,
    hosted_relays: Mutex<HashMap<NetworkId, Box<dyn RelayHandle>>>,
    timeouts: ConnectionTimeouts,
    channel_write_timeout: StdMutex<Duration>,
    reader: StdMutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl ChannelHost for ConnectionShared {
    fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    fn registry(&self, kind: ChannelKind) -> &ChannelRegistry {
        match kind {
            ChannelKind::Network => &self.network_channels,
            ChannelKind::Proxy => &self.proxy_channels,
            ChannelKind::Virtual => &self.virtual_channels,
        }
    }

    fn detach_joint(&self, id: u64) {
        self.joints.lock().expect("joint lock poisoned").remove(&id);
    }
}

impl ConnectionShared {
    pub(crate) fn channel_write_timeout(&self) -> Duration {
        *self
            .channel_write_timeout
            .lock()
            .expect("timeout lock poisoned")
    }

    /// Build a channel owned by this connection, not yet registered
    pub(crate) fn make_channel(
        shared: &Arc<Self>,
        kind: ChannelKind,
        name: ChannelName,
    ) -> Arc<MuxChannel> {
        let host: Arc<dyn ChannelHost> = shared.clone();
        let channel = Arc::new(MuxChannel::new(Arc::downgrade(&host), kind, name));
        channel.set_read_timeout(shared.timeouts.channel_read);
        channel
    }

    /// Splice two channels into a proxy pipe and track the joint
    pub(crate) fn attach_joint(shared: &Arc<Self>, a: Arc<MuxChannel>, b: Arc<MuxChannel>) {
        let id = shared.next_joint_id.fetch_add(1, Ordering::Relaxed);
        let host: Arc<dyn ChannelHost> = shared.clone();
        let joint = Joint::splice(id, Arc::downgrade(&host), a, b);
        shared
            .joints
            .lock()
            .expect("joint lock poisoned")
            .insert(id, joint);
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Full teardown. `reader_exit` skips aborting the reader task when the
    /// reader itself is the caller.
    pub(crate) async fn dispose_from(&self, reader_exit: bool) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!(peer = %self.remote_peer, "connection disposed");

        if !reader_exit {
            if let Some(handle) = self.reader.lock().expect("reader lock poisoned").take() {
                handle.abort();
            }
        }

        self.codec.stream().shutdown().await;

        // Channels are disposed from snapshots without announcing: no frame
        // leaves the connection once dispose has begun.
        for channel in self.network_channels.drain() {
            channel.dispose_inner(false).await;
        }
        for channel in self.proxy_channels.drain() {
            channel.dispose_inner(false).await;
        }
        for channel in self.virtual_channels.drain() {
            channel.dispose_inner(false).await;
        }

        let joints: Vec<Arc<Joint>> = self
            .joints
            .lock()
            .expect("joint lock poisoned")
            .drain()
            .map(|(_, joint)| joint)
            .collect();
        for joint in joints {
            joint.dispose().await;
        }

        let relays: Vec<Box<dyn RelayHandle>> = self
            .hosted_relays
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        for relay in relays {
            relay.stop().await;
        }

        let events = self.hooks.events.clone();
        let remote = self.remote_peer;
        tokio::spawn(async move {
            events.on_disposed(remote).await;
        });
    }
}

/// Handle to a multiplexed connection with one remote peer. Cloning is
/// cheap; all clones drive the same connection.
#[derive(Clone)]
pub struct Connection {
    shared: Arc<ConnectionShared>,
}

impl Connection {
    pub fn new(
        base: Arc<dyn BaseStream>,
        local_peer: PeerId,
        remote_peer: PeerId,
        remote_endpoint: SocketAddr,
        hooks: Hooks,
        timeouts: ConnectionTimeouts,
    ) -> Self {
        let channel_write = timeouts.channel_write;
        Self {
            shared: Arc::new(ConnectionShared {
                codec: FrameCodec::new(base),
                local_peer,
                remote_peer,
                remote_endpoint,
                hooks,
                network_channels: ChannelRegistry::new(),
                proxy_channels: ChannelRegistry::new(),
                virtual_channels: ChannelRegistry::new(),
                joints: StdMutex::new(HashMap::new()),
                next_joint_id: AtomicU64::new(0),
                probe_waiters: PendingTable::new(),
                relay_waiters: PendingTable::new(),
                hosted_relays: Mutex::new(HashMap::new()),
                timeouts,
                channel_write_timeout: StdMutex::new(channel_write),
                reader: StdMutex::new(None),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Spawn the reader task. Idempotent; a disposed connection stays down.
    pub fn start(&self) {
        let mut reader = self
            .shared
            .reader
            .lock()
            .expect("reader lock poisoned");
        if reader.is_some() || self.shared.is_disposed() {
            return;
        }
        *reader = Some(tokio::spawn(reader::run(self.shared.clone())));
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.shared.local_peer
    }

    pub fn remote_peer_id(&self) -> PeerId {
        self.shared.remote_peer
    }

    pub fn remote_endpoint(&self) -> SocketAddr {
        self.shared.remote_endpoint
    }

    /// True when the base stream is itself a channel of another connection
    pub fn is_virtual(&self) -> bool {
        self.shared.codec.stream().is_virtual()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    pub fn channel_write_timeout(&self) -> Duration {
        self.shared.channel_write_timeout()
    }

    pub fn set_channel_write_timeout(&self, timeout: Duration) {
        *self
            .shared
            .channel_write_timeout
            .lock()
            .expect("timeout lock poisoned") = timeout;
    }

    /// Open a chat-network channel under `name` and announce it to the peer
    pub async fn open_network_channel(&self, name: ChannelName) -> Result<Arc<MuxChannel>, MuxError> {
        self.open_channel(ChannelKind::Network, name).await
    }

    pub fn has_network_channel(&self, name: &ChannelName) -> bool {
        self.shared.network_channels.contains(name)
    }

    /// Open a proxy tunnel toward `endpoint` through this peer
    pub async fn open_proxy_tunnel(&self, endpoint: SocketAddr) -> Result<Arc<MuxChannel>, MuxError> {
        self.open_channel(ChannelKind::Proxy, ChannelName::for_endpoint(endpoint))
            .await
    }

    /// Open the local end of a virtual connection naming `endpoint` as the
    /// nested peer. Used while servicing a proxy-tunnel request.
    pub(crate) async fn request_virtual_channel(
        &self,
        endpoint: SocketAddr,
    ) -> Result<Arc<MuxChannel>, MuxError> {
        self.open_channel(ChannelKind::Virtual, ChannelName::for_endpoint(endpoint))
            .await
    }

    async fn open_channel(
        &self,
        kind: ChannelKind,
        name: ChannelName,
    ) -> Result<Arc<MuxChannel>, MuxError> {
        if self.shared.is_disposed() {
            return Err(MuxError::ChannelClosed);
        }

        let channel = ConnectionShared::make_channel(&self.shared, kind, name);
        self.shared.registry(kind).insert(channel.clone())?;

        if let Err(e) = self
            .shared
            .codec
            .write_frame(kind.connect_signal(), &name, &[])
            .await
        {
            channel.dispose_inner(false).await;
            return Err(e);
        }

        Ok(channel)
    }

    /// Ask the peer whether it holds a live connection to `endpoint`.
    /// Returns true iff an affirmative reply arrives within the probe
    /// timeout; an unreachable peer simply lets the timeout lapse.
    pub async fn request_peer_status(&self, endpoint: SocketAddr) -> Result<bool, MuxError> {
        let name = ChannelName::for_endpoint(endpoint);
        let notify = self.shared.probe_waiters.register(name);

        if let Err(e) = self
            .shared
            .codec
            .write_frame(Signal::PeerStatusQuery, &name, &[])
            .await
        {
            self.shared.probe_waiters.remove(&name);
            return Err(e);
        }

        let hit = timeout(self.shared.timeouts.peer_status, notify.notified())
            .await
            .is_ok();
        self.shared.probe_waiters.remove(&name);
        Ok(hit)
    }

    /// Ask the peer to host relays for `networks`, announced to `trackers`
    pub async fn request_start_relay(
        &self,
        networks: Vec<NetworkId>,
        trackers: Vec<String>,
    ) -> Result<bool, MuxError> {
        let request = RelayRequest { networks, trackers };
        let name = ChannelName::random();
        let payload = request.encode_start(&name)?;
        self.relay_request(Signal::StartTcpRelay, name, &payload, self.shared.timeouts.relay_start)
            .await
    }

    /// Ask the peer to stop hosting relays for `networks`
    pub async fn request_stop_relay(&self, networks: Vec<NetworkId>) -> Result<bool, MuxError> {
        let request = RelayRequest {
            networks,
            trackers: Vec::new(),
        };
        let name = ChannelName::random();
        let payload = request.encode_stop(&name)?;
        self.relay_request(Signal::StopTcpRelay, name, &payload, self.shared.timeouts.relay_stop)
            .await
    }

    async fn relay_request(
        &self,
        signal: Signal,
        name: ChannelName,
        payload: &[u8],
        wait: Duration,
    ) -> Result<bool, MuxError> {
        let notify = self.shared.relay_waiters.register(name);

        if let Err(e) = self.shared.codec.write_frame(signal, &name, payload).await {
            self.shared.relay_waiters.remove(&name);
            return Err(e);
        }

        let ok = timeout(wait, notify.notified()).await.is_ok();
        self.shared.relay_waiters.remove(&name);
        Ok(ok)
    }

    /// Keepalive frame; the channel name is random and ignored by the peer
    pub async fn send_noop(&self) -> Result<(), MuxError> {
        self.shared
            .codec
            .write_frame(Signal::Noop, &ChannelName::random(), &[])
            .await
    }

    /// Forward a DHT datagram out of band
    pub async fn send_dht_packet(&self, payload: &[u8]) -> Result<(), MuxError> {
        self.shared
            .codec
            .write_frame(Signal::DhtPacket, &ChannelName::random(), payload)
            .await
    }

    /// Invite the peer to a chat network
    pub async fn send_invitation(&self, network: &NetworkId, message: &str) -> Result<(), MuxError> {
        self.shared
            .codec
            .write_frame(
                Signal::NetworkInvitation,
                &ChannelName::from(network),
                message.as_bytes(),
            )
            .await
    }

    /// Tear the connection down: reader, channels, joints, hosted relays
    /// and the base stream. Idempotent and safe from any task.
    pub async fn dispose(&self) {
        self.shared.dispose_from(false).await;
    }
}
