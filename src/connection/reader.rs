//! Single reader task: pulls frames off the base stream and dispatches by
//! signal kind.
//!
//! Per-signal failures dispose the affected channel and keep the loop
//! alive; a failure to read the next frame, an unknown signal or a
//! malformed control payload terminates the loop and takes the connection
//! down with it. Channels see their frames in arrival order because this is
//! the only reader.

use super::ConnectionShared;
use crate::ident::NetworkId;
use crate::mux::{
    decode_peer_list, encode_peer_list, ChannelHost, ChannelKind, Frame, MuxError, RelayRequest,
    Signal,
};
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) async fn run(shared: Arc<ConnectionShared>) {
    loop {
        let frame = match shared.codec.read_frame().await {
            Ok(frame) => frame,
            Err(e) => {
                debug!(peer = %shared.remote_peer, error = %e, "reader loop ended");
                break;
            }
        };

        if let Err(e) = dispatch(&shared, frame).await {
            warn!(peer = %shared.remote_peer, error = %e, "protocol fault, closing connection");
            break;
        }
    }

    shared.dispose_from(true).await;
}

/// Route one frame. `Err` means a protocol fault the connection cannot
/// survive; recoverable per-channel problems are handled in place.
async fn dispatch(shared: &Arc<ConnectionShared>, frame: Frame) -> Result<(), MuxError> {
    match frame.signal {
        Signal::Noop => {}

        Signal::ConnectNetworkChannel => on_connect_network(shared, frame).await,
        Signal::NetworkChannelData => on_data(shared, ChannelKind::Network, frame).await,
        Signal::DisconnectNetworkChannel => on_disconnect(shared, ChannelKind::Network, frame).await,

        Signal::ConnectProxyChannel => on_connect_proxy(shared, frame).await?,
        Signal::ProxyChannelData => on_data(shared, ChannelKind::Proxy, frame).await,
        Signal::DisconnectProxyChannel => on_disconnect(shared, ChannelKind::Proxy, frame).await,

        Signal::ConnectVirtualChannel => on_connect_virtual(shared, frame).await?,
        Signal::VirtualChannelData => on_data(shared, ChannelKind::Virtual, frame).await,
        Signal::DisconnectVirtualChannel => {
            on_disconnect(shared, ChannelKind::Virtual, frame).await
        }

        Signal::PeerStatusQuery => on_peer_status_query(shared, frame)?,
        Signal::PeerStatusAvailable => {
            if !shared.probe_waiters.signal(&frame.name) {
                debug!(name = %frame.name, "unsolicited peer-status reply");
            }
        }

        Signal::StartTcpRelay => on_start_relay(shared, frame)?,
        Signal::StopTcpRelay => on_stop_relay(shared, frame)?,
        Signal::TcpRelaySuccess => {
            if !shared.relay_waiters.signal(&frame.name) {
                debug!(name = %frame.name, "unsolicited relay acknowledgement");
            }
        }
        Signal::TcpRelayPeerList => on_relay_peer_list(shared, frame)?,

        Signal::DhtPacket => {
            let dht = shared.hooks.dht.clone();
            let source = shared.remote_endpoint.ip();
            tokio::spawn(async move {
                dht.handle_packet(frame.payload, source).await;
            });
        }

        Signal::NetworkInvitation => on_invitation(shared, frame)?,
    }

    Ok(())
}

/// Inbound chat-network channel: register it, surface it to the
/// application, and volunteer any relay peers we host for the same channel.
async fn on_connect_network(shared: &Arc<ConnectionShared>, frame: Frame) {
    let channel = ConnectionShared::make_channel(shared, ChannelKind::Network, frame.name);

    if shared.network_channels.insert(channel.clone()).is_err() {
        debug!(name = %frame.name, "duplicate inbound network channel dropped");
        channel.dispose_inner(false).await;
        return;
    }

    let events = shared.hooks.events.clone();
    tokio::spawn(async move {
        events.on_channel_open(channel).await;
    });

    let shared = shared.clone();
    let name = frame.name;
    tokio::spawn(async move {
        let peers = shared
            .hooks
            .relays
            .peers_for(&name, shared.remote_endpoint)
            .await;
        if peers.is_empty() {
            return;
        }
        match encode_peer_list(&peers) {
            Ok(payload) => {
                let _ = shared
                    .codec
                    .write_frame(Signal::TcpRelayPeerList, &name, &payload)
                    .await;
            }
            Err(e) => debug!(name = %name, error = %e, "relay peer list not sent"),
        }
    });
}

/// Deliver a data frame into the channel's slot; a stalled or closed
/// channel is disposed, which tells the peer to stop sending.
async fn on_data(shared: &Arc<ConnectionShared>, kind: ChannelKind, frame: Frame) {
    let Some(channel) = shared.registry(kind).get(&frame.name) else {
        debug!(name = %frame.name, kind = ?kind, "data for unknown channel dropped");
        return;
    };

    let wait = shared.channel_write_timeout();
    if let Err(e) = channel.deliver(&frame.payload, wait).await {
        warn!(name = %frame.name, kind = ?kind, error = %e, "channel stalled, disposing");
        channel.dispose().await;
    }
}

async fn on_disconnect(shared: &Arc<ConnectionShared>, kind: ChannelKind, frame: Frame) {
    match shared.registry(kind).get(&frame.name) {
        // The peer already tore its end down; no Disconnect echo needed.
        Some(channel) => channel.dispose_inner(false).await,
        None => debug!(name = %frame.name, kind = ?kind, "disconnect for unknown channel"),
    }
}

/// The peer asks us to proxy to a third party: open the local tunnel end,
/// reach the target through the connection manager, ask it for a virtual
/// connection channel, and splice the two.
async fn on_connect_proxy(shared: &Arc<ConnectionShared>, frame: Frame) -> Result<(), MuxError> {
    let target = frame.name.to_endpoint()?;

    let channel = ConnectionShared::make_channel(shared, ChannelKind::Proxy, frame.name);
    if shared.proxy_channels.insert(channel.clone()).is_err() {
        debug!(name = %frame.name, "duplicate inbound proxy channel dropped");
        channel.dispose_inner(false).await;
        return Ok(());
    }

    let shared = shared.clone();
    tokio::spawn(async move {
        let requester = shared.remote_endpoint;
        let far_end = async {
            let conn = shared.hooks.manager.connect(target).await?;
            conn.request_virtual_channel(requester).await
        }
        .await;

        match far_end {
            Ok(far) => ConnectionShared::attach_joint(&shared, channel, far),
            Err(e) => {
                debug!(endpoint = %target, error = %e, "proxy tunnel failed");
                channel.dispose().await;
            }
        }
    });

    Ok(())
}

/// The peer opens a channel that will carry a nested connection; hand it to
/// the connection manager as a new inbound base stream.
async fn on_connect_virtual(shared: &Arc<ConnectionShared>, frame: Frame) -> Result<(), MuxError> {
    let endpoint = frame.name.to_endpoint()?;

    let channel = ConnectionShared::make_channel(shared, ChannelKind::Virtual, frame.name);
    if shared.virtual_channels.insert(channel.clone()).is_err() {
        debug!(name = %frame.name, "duplicate inbound virtual channel dropped");
        channel.dispose_inner(false).await;
        return Ok(());
    }

    let manager = shared.hooks.manager.clone();
    tokio::spawn(async move {
        manager.accept_virtual(channel, endpoint).await;
    });

    Ok(())
}

fn on_peer_status_query(shared: &Arc<ConnectionShared>, frame: Frame) -> Result<(), MuxError> {
    let endpoint = frame.name.to_endpoint()?;

    let shared = shared.clone();
    tokio::spawn(async move {
        if shared.hooks.manager.is_peer_connected(endpoint).await {
            let _ = shared
                .codec
                .write_frame(Signal::PeerStatusAvailable, &frame.name, &[])
                .await;
        }
    });

    Ok(())
}

fn on_start_relay(shared: &Arc<ConnectionShared>, frame: Frame) -> Result<(), MuxError> {
    let request = RelayRequest::decode_start(&frame.payload, &frame.name)?;

    let shared = shared.clone();
    tokio::spawn(async move {
        {
            let mut hosted = shared.hosted_relays.lock().await;
            for network in request.networks {
                if hosted.contains_key(&network) {
                    continue;
                }
                match shared.hooks.relays.start(network, &request.trackers).await {
                    Ok(handle) => {
                        hosted.insert(network, handle);
                    }
                    Err(e) => warn!(network = %network, error = %e, "relay start failed"),
                }
            }
        }
        let _ = shared
            .codec
            .write_frame(Signal::TcpRelaySuccess, &frame.name, &[])
            .await;
    });

    Ok(())
}

fn on_stop_relay(shared: &Arc<ConnectionShared>, frame: Frame) -> Result<(), MuxError> {
    let request = RelayRequest::decode_stop(&frame.payload, &frame.name)?;

    let shared = shared.clone();
    tokio::spawn(async move {
        let stopped: Vec<_> = {
            let mut hosted = shared.hosted_relays.lock().await;
            request
                .networks
                .iter()
                .filter_map(|network| hosted.remove(network))
                .collect()
        };
        for relay in stopped {
            relay.stop().await;
        }
        let _ = shared
            .codec
            .write_frame(Signal::TcpRelaySuccess, &frame.name, &[])
            .await;
    });

    Ok(())
}

fn on_relay_peer_list(shared: &Arc<ConnectionShared>, frame: Frame) -> Result<(), MuxError> {
    let peers = decode_peer_list(&frame.payload)?;

    let events = shared.hooks.events.clone();
    tokio::spawn(async move {
        events.on_relay_peers(frame.name, peers).await;
    });

    Ok(())
}

fn on_invitation(shared: &Arc<ConnectionShared>, frame: Frame) -> Result<(), MuxError> {
    let message = std::str::from_utf8(&frame.payload)
        .map_err(|_| MuxError::Protocol("invitation message is not UTF-8".into()))?
        .to_owned();

    let events = shared.hooks.events.clone();
    let network = NetworkId::from(&frame.name);
    let from = shared.remote_endpoint;
    tokio::spawn(async move {
        events.on_invitation(network, from, message).await;
    });

    Ok(())
}
