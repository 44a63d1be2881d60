//! Control payload codecs for relay signalling
//!
//! Relay start/stop payloads:
//! ```text
//! n_networks: u8 || n_networks x (20B network id XOR channel name)
//! [ n_trackers: u8 || n_trackers x (len: u8 || UTF-8 bytes) ]   (start only)
//! ```
//! Network ids are masked with the request's random channel name so a
//! passive observer never sees them in the clear.
//!
//! Peer-list payloads: `n: u8 || n x endpoint`, each endpoint a family tag
//! (0=IPv4, 1=IPv6), address bytes, then port little-endian.

use super::MuxError;
use crate::ident::{ChannelName, NetworkId, ID_LEN};
use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// A relay start/stop request: which networks to relay for, and which
/// trackers the relay should announce to (start only).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayRequest {
    pub networks: Vec<NetworkId>,
    pub trackers: Vec<String>,
}

impl RelayRequest {
    /// Encode a start-relay payload, masking network ids with `mask`
    pub fn encode_start(&self, mask: &ChannelName) -> Result<Bytes, MuxError> {
        let mut buf = BytesMut::new();
        self.put_networks(&mut buf, mask)?;

        if self.trackers.len() > u8::MAX as usize {
            return Err(MuxError::Protocol(format!(
                "too many trackers: {}",
                self.trackers.len()
            )));
        }
        buf.put_u8(self.trackers.len() as u8);
        for tracker in &self.trackers {
            let bytes = tracker.as_bytes();
            if bytes.len() > u8::MAX as usize {
                return Err(MuxError::Protocol(format!(
                    "tracker URI too long: {} bytes",
                    bytes.len()
                )));
            }
            buf.put_u8(bytes.len() as u8);
            buf.extend_from_slice(bytes);
        }

        Ok(buf.freeze())
    }

    /// Encode a stop-relay payload (networks only)
    pub fn encode_stop(&self, mask: &ChannelName) -> Result<Bytes, MuxError> {
        let mut buf = BytesMut::new();
        self.put_networks(&mut buf, mask)?;
        Ok(buf.freeze())
    }

    fn put_networks(&self, buf: &mut BytesMut, mask: &ChannelName) -> Result<(), MuxError> {
        if self.networks.len() > u8::MAX as usize {
            return Err(MuxError::Protocol(format!(
                "too many networks: {}",
                self.networks.len()
            )));
        }
        buf.put_u8(self.networks.len() as u8);
        for network in &self.networks {
            buf.extend_from_slice(&mask.mask(network.as_bytes()));
        }
        Ok(())
    }

    /// Decode a start-relay payload, unmasking with the frame's channel name
    pub fn decode_start(payload: &[u8], mask: &ChannelName) -> Result<Self, MuxError> {
        let (networks, rest) = take_networks(payload, mask)?;

        let (&n_trackers, mut rest) = rest
            .split_first()
            .ok_or_else(|| MuxError::Protocol("relay payload missing tracker count".into()))?;

        let mut trackers = Vec::with_capacity(n_trackers as usize);
        for _ in 0..n_trackers {
            let (&len, tail) = rest
                .split_first()
                .ok_or_else(|| MuxError::Protocol("relay payload truncated".into()))?;
            if tail.len() < len as usize {
                return Err(MuxError::Protocol("relay payload truncated".into()));
            }
            let (uri, tail) = tail.split_at(len as usize);
            trackers.push(
                std::str::from_utf8(uri)
                    .map_err(|_| MuxError::Protocol("tracker URI is not UTF-8".into()))?
                    .to_owned(),
            );
            rest = tail;
        }

        Ok(Self { networks, trackers })
    }

    /// Decode a stop-relay payload
    pub fn decode_stop(payload: &[u8], mask: &ChannelName) -> Result<Self, MuxError> {
        let (networks, _) = take_networks(payload, mask)?;
        Ok(Self {
            networks,
            trackers: Vec::new(),
        })
    }
}

fn take_networks<'a>(
    payload: &'a [u8],
    mask: &ChannelName,
) -> Result<(Vec<NetworkId>, &'a [u8]), MuxError> {
    let (&count, mut rest) = payload
        .split_first()
        .ok_or_else(|| MuxError::Protocol("empty relay payload".into()))?;

    let mut networks = Vec::with_capacity(count as usize);
    for _ in 0..count {
        if rest.len() < ID_LEN {
            return Err(MuxError::Protocol("relay payload truncated".into()));
        }
        let (masked, tail) = rest.split_at(ID_LEN);
        let masked: [u8; ID_LEN] = masked.try_into().expect("split length");
        networks.push(NetworkId::from_bytes(mask.mask(&masked)));
        rest = tail;
    }

    Ok((networks, rest))
}

/// Encode a relay peer list
pub fn encode_peer_list(peers: &[SocketAddr]) -> Result<Bytes, MuxError> {
    if peers.len() > u8::MAX as usize {
        return Err(MuxError::Protocol(format!("too many peers: {}", peers.len())));
    }

    let mut buf = BytesMut::new();
    buf.put_u8(peers.len() as u8);
    for peer in peers {
        match peer.ip() {
            IpAddr::V4(ip) => {
                buf.put_u8(0);
                buf.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf.put_u8(1);
                buf.extend_from_slice(&ip.octets());
            }
        }
        buf.put_u16_le(peer.port());
    }

    Ok(buf.freeze())
}

/// Decode a relay peer list
pub fn decode_peer_list(payload: &[u8]) -> Result<Vec<SocketAddr>, MuxError> {
    let (&count, mut rest) = payload
        .split_first()
        .ok_or_else(|| MuxError::Protocol("empty peer list".into()))?;

    let mut peers = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (&family, tail) = rest
            .split_first()
            .ok_or_else(|| MuxError::Protocol("peer list truncated".into()))?;

        let addr_len = match family {
            0 => 4,
            1 => 16,
            other => {
                return Err(MuxError::Protocol(format!(
                    "unsupported address family: {other}"
                )))
            }
        };
        if tail.len() < addr_len + 2 {
            return Err(MuxError::Protocol("peer list truncated".into()));
        }

        let (addr, tail) = tail.split_at(addr_len);
        let ip = match family {
            0 => {
                let octets: [u8; 4] = addr.try_into().expect("split length");
                IpAddr::V4(Ipv4Addr::from(octets))
            }
            _ => {
                let octets: [u8; 16] = addr.try_into().expect("split length");
                IpAddr::V6(Ipv6Addr::from(octets))
            }
        };
        let port = u16::from_le_bytes([tail[0], tail[1]]);
        peers.push(SocketAddr::new(ip, port));
        rest = &tail[2..];
    }

    Ok(peers)
}
