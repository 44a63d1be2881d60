//! Integration tests for the connection multiplexer
//!
//! Drives pairs (and triples) of real connections over in-memory duplex
//! pipes with stub collaborators, covering:
//! - Channel open/data/disconnect across the wire
//! - Large-write fragmentation
//! - Peer-status probes, relay registration, invitations, DHT datagrams
//! - Proxy tunnel splicing and nested virtual connections
//! - Stall handling and disposal cascades

use async_trait::async_trait;
use peermux::{
    BaseStream, ChannelName, Connection, ConnectionManager, ConnectionTimeouts, DhtClient, Hooks,
    IoBase, MuxChannel, MuxError, MuxEvents, NetworkId, PeerId, RelayHandle, RelayService,
};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;

const EP_A: &str = "10.1.1.1:4001";
const EP_B: &str = "10.2.2.2:4002";
const EP_C: &str = "10.3.3.3:4003";

fn ep(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

fn fast_timeouts() -> ConnectionTimeouts {
    ConnectionTimeouts {
        channel_read: Duration::from_secs(5),
        channel_write: Duration::from_secs(5),
        peer_status: Duration::from_secs(2),
        relay_start: Duration::from_secs(2),
        relay_stop: Duration::from_secs(2),
    }
}

#[derive(Default)]
struct StubManager {
    reachable: Mutex<HashSet<SocketAddr>>,
    connections: Mutex<HashMap<SocketAddr, Connection>>,
    accepted: Mutex<Vec<(Arc<MuxChannel>, SocketAddr)>>,
}

#[async_trait]
impl ConnectionManager for StubManager {
    async fn connect(&self, endpoint: SocketAddr) -> Result<Connection, MuxError> {
        self.connections
            .lock()
            .unwrap()
            .get(&endpoint)
            .cloned()
            .ok_or_else(|| MuxError::Protocol(format!("no route to {endpoint}")))
    }

    async fn is_peer_connected(&self, endpoint: SocketAddr) -> bool {
        self.reachable.lock().unwrap().contains(&endpoint)
    }

    async fn accept_virtual(&self, channel: Arc<MuxChannel>, endpoint: SocketAddr) {
        self.accepted.lock().unwrap().push((channel, endpoint));
    }
}

#[derive(Default)]
struct StubDht {
    packets: Mutex<Vec<(Vec<u8>, IpAddr)>>,
}

#[async_trait]
impl DhtClient for StubDht {
    async fn handle_packet(&self, payload: bytes::Bytes, source: IpAddr) {
        self.packets.lock().unwrap().push((payload.to_vec(), source));
    }
}

struct StubRelayHandle {
    network: NetworkId,
    stopped: Arc<Mutex<Vec<NetworkId>>>,
}

#[async_trait]
impl RelayHandle for StubRelayHandle {
    async fn stop(&self) {
        self.stopped.lock().unwrap().push(self.network);
    }
}

#[derive(Default)]
struct StubRelays {
    known_peers: Mutex<Vec<SocketAddr>>,
    started: Mutex<Vec<(NetworkId, Vec<String>)>>,
    stopped: Arc<Mutex<Vec<NetworkId>>>,
}

#[async_trait]
impl RelayService for StubRelays {
    async fn peers_for(&self, _name: &ChannelName, _exclude: SocketAddr) -> Vec<SocketAddr> {
        self.known_peers.lock().unwrap().clone()
    }

    async fn start(
        &self,
        network: NetworkId,
        trackers: &[String],
    ) -> Result<Box<dyn RelayHandle>, MuxError> {
        self.started
            .lock()
            .unwrap()
            .push((network, trackers.to_vec()));
        Ok(Box::new(StubRelayHandle {
            network,
            stopped: self.stopped.clone(),
        }))
    }
}

struct StubEvents {
    opened: UnboundedSender<Arc<MuxChannel>>,
    invitations: UnboundedSender<(NetworkId, SocketAddr, String)>,
    relay_peers: UnboundedSender<(ChannelName, Vec<SocketAddr>)>,
    disposed: UnboundedSender<PeerId>,
}

#[async_trait]
impl MuxEvents for StubEvents {
    async fn on_channel_open(&self, channel: Arc<MuxChannel>) {
        let _ = self.opened.send(channel);
    }

    async fn on_invitation(&self, network: NetworkId, from: SocketAddr, message: String) {
        let _ = self.invitations.send((network, from, message));
    }

    async fn on_relay_peers(&self, name: ChannelName, peers: Vec<SocketAddr>) {
        let _ = self.relay_peers.send((name, peers));
    }

    async fn on_disposed(&self, remote: PeerId) {
        let _ = self.disposed.send(remote);
    }
}

struct TestPeer {
    conn: Connection,
    manager: Arc<StubManager>,
    relays: Arc<StubRelays>,
    dht: Arc<StubDht>,
    opened: UnboundedReceiver<Arc<MuxChannel>>,
    invitations: UnboundedReceiver<(NetworkId, SocketAddr, String)>,
    relay_peers: UnboundedReceiver<(ChannelName, Vec<SocketAddr>)>,
    disposed: UnboundedReceiver<PeerId>,
}

/// Route crate logs through the test harness; repeated calls are no-ops.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn make_peer(
    base: Arc<dyn BaseStream>,
    local: PeerId,
    remote: PeerId,
    remote_endpoint: SocketAddr,
    timeouts: ConnectionTimeouts,
) -> TestPeer {
    init_tracing();

    let manager = Arc::new(StubManager::default());
    let relays = Arc::new(StubRelays::default());
    let dht = Arc::new(StubDht::default());

    let (opened_tx, opened) = unbounded_channel();
    let (invitations_tx, invitations) = unbounded_channel();
    let (relay_peers_tx, relay_peers) = unbounded_channel();
    let (disposed_tx, disposed) = unbounded_channel();

    let hooks = Hooks {
        manager: manager.clone(),
        dht: dht.clone(),
        relays: relays.clone(),
        events: Arc::new(StubEvents {
            opened: opened_tx,
            invitations: invitations_tx,
            relay_peers: relay_peers_tx,
            disposed: disposed_tx,
        }),
    };

    let conn = Connection::new(base, local, remote, remote_endpoint, hooks, timeouts);
    conn.start();

    TestPeer {
        conn,
        manager,
        relays,
        dht,
        opened,
        invitations,
        relay_peers,
        disposed,
    }
}

/// Two started connections joined by an in-memory pipe
fn connect_pair(timeouts: ConnectionTimeouts) -> (TestPeer, TestPeer) {
    let (stream_a, stream_b) = tokio::io::duplex(1 << 20);
    let peer_a = PeerId::random();
    let peer_b = PeerId::random();

    (
        make_peer(
            Arc::new(IoBase::new(stream_a)),
            peer_a,
            peer_b,
            ep(EP_B),
            timeouts.clone(),
        ),
        make_peer(
            Arc::new(IoBase::new(stream_b)),
            peer_b,
            peer_a,
            ep(EP_A),
            timeouts,
        ),
    )
}

async fn recv_within<T>(rx: &mut UnboundedReceiver<T>, what: &str) -> T {
    timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {what}"))
        .unwrap_or_else(|| panic!("event channel closed waiting for {what}"))
}

async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition never held: {what}");
}

#[tokio::test]
async fn test_open_channel_and_exchange_data() {
    let (a, mut b) = connect_pair(fast_timeouts());

    let network = NetworkId::random();
    let name = ChannelName::for_network(&network, &a.conn.local_peer_id(), &a.conn.remote_peer_id());

    let a_chan = a.conn.open_network_channel(name).await.unwrap();
    assert!(a.conn.has_network_channel(&name));

    let b_chan = recv_within(&mut b.opened, "channel open").await;
    assert_eq!(b_chan.name(), &name);
    assert!(b.conn.has_network_channel(&name));

    a_chan.write(b"hello from a").await.unwrap();
    let mut buf = [0u8; 64];
    let n = b_chan.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello from a");

    b_chan.write(b"hello from b").await.unwrap();
    let n = a_chan.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"hello from b");
}

#[tokio::test]
async fn test_large_write_arrives_reassembled() {
    let (a, mut b) = connect_pair(fast_timeouts());

    let name = ChannelName::random();
    let a_chan = a.conn.open_network_channel(name).await.unwrap();
    let b_chan = recv_within(&mut b.opened, "channel open").await;

    let payload: Vec<u8> = (0..200_000).map(|i| (i % 249) as u8).collect();

    let writer = tokio::spawn({
        let payload = payload.clone();
        async move {
            a_chan.write(&payload).await.unwrap();
        }
    });

    let mut collected = Vec::with_capacity(payload.len());
    let mut buf = vec![0u8; 65536];
    while collected.len() < payload.len() {
        let n = b_chan.read(&mut buf).await.unwrap();
        assert!(n > 0, "stream ended early at {} bytes", collected.len());
        collected.extend_from_slice(&buf[..n]);
    }

    assert_eq!(collected, payload);
    writer.await.unwrap();
}

#[tokio::test]
async fn test_peer_status_hit() {
    let (a, b) = connect_pair(fast_timeouts());
    b.manager.reachable.lock().unwrap().insert(ep(EP_C));

    assert!(a.conn.request_peer_status(ep(EP_C)).await.unwrap());
}

#[tokio::test]
async fn test_peer_status_miss_waits_full_deadline() {
    let mut timeouts = fast_timeouts();
    timeouts.peer_status = Duration::from_millis(200);
    let (a, _b) = connect_pair(timeouts);

    let started = tokio::time::Instant::now();
    let reachable = a.conn.request_peer_status(ep(EP_C)).await.unwrap();

    assert!(!reachable);
    assert!(started.elapsed() >= Duration::from_millis(200));
}

#[tokio::test]
async fn test_relay_registration_roundtrip() {
    let (a, b) = connect_pair(fast_timeouts());

    let n1 = NetworkId::random();
    let n2 = NetworkId::random();
    let trackers = vec!["http://t1/".to_string(), "http://t2/".to_string()];

    assert!(a
        .conn
        .request_start_relay(vec![n1, n2], trackers.clone())
        .await
        .unwrap());

    {
        let started = b.relays.started.lock().unwrap();
        assert_eq!(started.len(), 2);
        assert_eq!(started[0], (n1, trackers.clone()));
        assert_eq!(started[1], (n2, trackers.clone()));
    }

    // Re-registering an already hosted network is a no-op.
    assert!(a
        .conn
        .request_start_relay(vec![n1], trackers.clone())
        .await
        .unwrap());
    assert_eq!(b.relays.started.lock().unwrap().len(), 2);

    assert!(a.conn.request_stop_relay(vec![n1]).await.unwrap());
    assert_eq!(*b.relays.stopped.lock().unwrap(), vec![n1]);
}

#[tokio::test]
async fn test_relay_peers_offered_on_channel_open() {
    let (mut a, b) = connect_pair(fast_timeouts());
    let peers = vec![ep(EP_B), ep("10.9.9.9:6881")];
    *b.relays.known_peers.lock().unwrap() = peers.clone();

    let name = ChannelName::random();
    let _chan = a.conn.open_network_channel(name).await.unwrap();

    let (peer_name, listed) = recv_within(&mut a.relay_peers, "relay peer list").await;
    assert_eq!(peer_name, name);
    assert_eq!(listed, peers);
}

#[tokio::test]
async fn test_invitation_delivery() {
    let (a, mut b) = connect_pair(fast_timeouts());

    let network = NetworkId::random();
    a.conn.send_invitation(&network, "join my network").await.unwrap();

    let (got_network, from, message) = recv_within(&mut b.invitations, "invitation").await;
    assert_eq!(got_network, network);
    assert_eq!(from, ep(EP_A));
    assert_eq!(message, "join my network");
}

#[tokio::test]
async fn test_dht_packet_delivery() {
    let (a, b) = connect_pair(fast_timeouts());

    a.conn.send_noop().await.unwrap();
    a.conn.send_dht_packet(b"find_node q").await.unwrap();

    eventually("dht packet received", || {
        !b.dht.packets.lock().unwrap().is_empty()
    })
    .await;

    let packets = b.dht.packets.lock().unwrap();
    assert_eq!(packets[0].0, b"find_node q");
    assert_eq!(packets[0].1, ep(EP_A).ip());
}

#[tokio::test]
async fn test_stalled_channel_is_disposed() {
    let mut timeouts = fast_timeouts();
    timeouts.channel_write = Duration::from_millis(150);
    let (a, mut b) = connect_pair(timeouts);

    let name = ChannelName::random();
    let a_chan = a.conn.open_network_channel(name).await.unwrap();
    let b_chan = recv_within(&mut b.opened, "channel open").await;

    // Fill the slot, then send again without anyone draining it.
    a_chan.write(b"first").await.unwrap();
    a_chan.write(b"second").await.unwrap();

    eventually("stalled channel disposed on receiver", || {
        b_chan.is_disposed() && !b.conn.has_network_channel(&name)
    })
    .await;

    // The Disconnect frame makes it back and closes our end too.
    eventually("local channel closed by disconnect", || {
        a_chan.is_disposed()
    })
    .await;
}

#[tokio::test]
async fn test_duplicate_inbound_connect_is_dropped_silently() {
    let (raw, stream_b) = tokio::io::duplex(1 << 16);
    let mut b = make_peer(
        Arc::new(IoBase::new(stream_b)),
        PeerId::random(),
        PeerId::random(),
        ep(EP_A),
        fast_timeouts(),
    );

    let name = ChannelName::random();
    let mut connect_frame = vec![1u8]; // open network channel
    connect_frame.extend_from_slice(name.as_bytes());
    connect_frame.extend_from_slice(&0u16.to_le_bytes());

    let (mut raw_read, mut raw_write) = tokio::io::split(raw);
    raw_write.write_all(&connect_frame).await.unwrap();
    raw_write.write_all(&connect_frame).await.unwrap();

    let b_chan = recv_within(&mut b.opened, "channel open").await;
    assert_eq!(b_chan.name(), &name);

    // The second connect is swallowed: no extra callback, no Disconnect
    // frame on the wire, and the established channel still works.
    assert!(timeout(Duration::from_millis(300), b.opened.recv())
        .await
        .is_err());

    let mut wire = [0u8; 64];
    assert!(
        timeout(Duration::from_millis(300), raw_read.read(&mut wire))
            .await
            .is_err(),
        "no frame should come back"
    );

    let mut data_frame = vec![2u8]; // network channel data
    data_frame.extend_from_slice(name.as_bytes());
    data_frame.extend_from_slice(&5u16.to_le_bytes());
    data_frame.extend_from_slice(b"still");
    raw_write.write_all(&data_frame).await.unwrap();

    let mut buf = [0u8; 16];
    let n = b_chan.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"still");
}

#[tokio::test]
async fn test_dispose_cascades_to_both_sides() {
    let (mut a, mut b) = connect_pair(fast_timeouts());

    let name = ChannelName::random();
    let a_chan = a.conn.open_network_channel(name).await.unwrap();
    let b_chan = recv_within(&mut b.opened, "channel open").await;

    a.conn.dispose().await;
    assert!(a.conn.is_disposed());
    assert!(a_chan.is_disposed());

    let gone = recv_within(&mut a.disposed, "local disposed event").await;
    assert_eq!(gone, a.conn.remote_peer_id());

    // The dead base stream takes the peer's reader loop down with it.
    recv_within(&mut b.disposed, "remote disposed event").await;
    assert!(b.conn.is_disposed());
    eventually("peer channel closed", || b_chan.is_disposed()).await;

    // Disposal is idempotent and later opens fail.
    a.conn.dispose().await;
    assert!(a.conn.open_network_channel(ChannelName::random()).await.is_err());
}

#[tokio::test]
async fn test_proxy_tunnel_splices_to_third_peer() {
    let peer_a = PeerId::random();
    let peer_b = PeerId::random();
    let peer_c = PeerId::random();

    let (stream_ab, stream_ba) = tokio::io::duplex(1 << 20);
    let (stream_bc, stream_cb) = tokio::io::duplex(1 << 20);

    let a = make_peer(
        Arc::new(IoBase::new(stream_ab)),
        peer_a,
        peer_b,
        ep(EP_B),
        fast_timeouts(),
    );
    let b_toward_a = make_peer(
        Arc::new(IoBase::new(stream_ba)),
        peer_b,
        peer_a,
        ep(EP_A),
        fast_timeouts(),
    );
    let b_toward_c = make_peer(
        Arc::new(IoBase::new(stream_bc)),
        peer_b,
        peer_c,
        ep(EP_C),
        fast_timeouts(),
    );
    let c = make_peer(
        Arc::new(IoBase::new(stream_cb)),
        peer_c,
        peer_b,
        ep(EP_B),
        fast_timeouts(),
    );

    // B can reach C when A asks it to proxy.
    b_toward_a
        .manager
        .connections
        .lock()
        .unwrap()
        .insert(ep(EP_C), b_toward_c.conn.clone());

    let a_chan = a.conn.open_proxy_tunnel(ep(EP_C)).await.unwrap();

    eventually("virtual connection handed to c", || {
        !c.manager.accepted.lock().unwrap().is_empty()
    })
    .await;

    let (c_chan, nested_peer) = c.manager.accepted.lock().unwrap()[0].clone();
    assert_eq!(nested_peer, ep(EP_A));

    a_chan.write(b"ping through").await.unwrap();
    let mut buf = [0u8; 64];
    let n = c_chan.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"ping through");

    c_chan.write(b"pong back").await.unwrap();
    let n = a_chan.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"pong back");

    // Closing one end of the pipe tears the whole splice down.
    a_chan.dispose().await;
    eventually("far end closed", || c_chan.is_disposed()).await;
}

#[tokio::test]
async fn test_virtual_connection_nests_a_full_mux() {
    let (outer_a, mut outer_b) = connect_pair(fast_timeouts());

    let carrier = ChannelName::random();
    let a_chan = outer_a.conn.open_network_channel(carrier).await.unwrap();
    let b_chan = recv_within(&mut outer_b.opened, "carrier channel").await;

    let nested_a_peer = PeerId::random();
    let nested_b_peer = PeerId::random();

    let nested_a = {
        let base: Arc<dyn BaseStream> = a_chan.clone();
        make_peer(base, nested_a_peer, nested_b_peer, ep(EP_B), fast_timeouts())
    };
    let mut nested_b = {
        let base: Arc<dyn BaseStream> = b_chan.clone();
        make_peer(base, nested_b_peer, nested_a_peer, ep(EP_A), fast_timeouts())
    };

    assert!(nested_a.conn.is_virtual());
    assert!(nested_b.conn.is_virtual());
    assert!(!outer_a.conn.is_virtual());

    let inner_name = ChannelName::random();
    let inner_a = nested_a.conn.open_network_channel(inner_name).await.unwrap();
    let inner_b = recv_within(&mut nested_b.opened, "nested channel").await;

    inner_a.write(b"tunneled twice").await.unwrap();
    let mut buf = [0u8; 64];
    let n = inner_b.read(&mut buf).await.unwrap();
    assert_eq!(&buf[..n], b"tunneled twice");

    // Dropping the carrier channel ends the nested connection.
    nested_a.conn.dispose().await;
    recv_within(&mut nested_b.disposed, "nested teardown").await;
}
