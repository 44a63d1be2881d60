//! Collaborator seams
//!
//! The connection layer never owns peer discovery, relay hosting, DHT
//! processing or application event handling; those arrive as injected trait
//! objects so the mux stays free of process-global state.

use super::Connection;
use crate::ident::{ChannelName, NetworkId, PeerId};
use crate::mux::{MuxChannel, MuxError};
use async_trait::async_trait;
use bytes::Bytes;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Establishes and tracks connections to other peers
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Establish or retrieve a connection to the peer at `endpoint`
    async fn connect(&self, endpoint: SocketAddr) -> Result<Connection, MuxError>;

    /// Whether a live connection to `endpoint` exists right now
    async fn is_peer_connected(&self, endpoint: SocketAddr) -> bool;

    /// Adopt `channel` as the base stream of a new inbound connection with
    /// the peer at `endpoint`
    async fn accept_virtual(&self, channel: Arc<MuxChannel>, endpoint: SocketAddr);
}

/// Consumes out-of-band DHT datagrams received over a connection
#[async_trait]
pub trait DhtClient: Send + Sync {
    async fn handle_packet(&self, payload: Bytes, source: IpAddr);
}

/// A relay hosted on behalf of a remote peer
#[async_trait]
pub trait RelayHandle: Send + Sync {
    async fn stop(&self);
}

/// Registry of relays this process hosts
#[async_trait]
pub trait RelayService: Send + Sync {
    /// Endpoints of relay peers known for the named channel, excluding the
    /// peer at `exclude`
    async fn peers_for(&self, name: &ChannelName, exclude: SocketAddr) -> Vec<SocketAddr>;

    /// Host a relay for `network`, announcing to `trackers`
    async fn start(
        &self,
        network: NetworkId,
        trackers: &[String],
    ) -> Result<Box<dyn RelayHandle>, MuxError>;
}

/// Events a connection surfaces to the application layer. Every callback is
/// dispatched on a worker task with no mux lock held, so implementations
/// may block or call back into the connection.
#[async_trait]
pub trait MuxEvents: Send + Sync {
    /// The peer opened a chat-network channel
    async fn on_channel_open(&self, _channel: Arc<MuxChannel>) {}

    /// The peer sent an invitation to a chat network
    async fn on_invitation(&self, _network: NetworkId, _from: SocketAddr, _message: String) {}

    /// The peer reported relay peers for a channel
    async fn on_relay_peers(&self, _name: ChannelName, _peers: Vec<SocketAddr>) {}

    /// The connection finished tearing down
    async fn on_disposed(&self, _remote: PeerId) {}
}

/// Collaborator bundle a connection is constructed with
#[derive(Clone)]
pub struct Hooks {
    pub manager: Arc<dyn ConnectionManager>,
    pub dht: Arc<dyn DhtClient>,
    pub relays: Arc<dyn RelayService>,
    pub events: Arc<dyn MuxEvents>,
}
