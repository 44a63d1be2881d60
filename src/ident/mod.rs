//! Peer, network and channel identifiers
//!
//! All three are opaque 20-byte values. Network identifiers never appear on
//! the wire directly: channel names for network channels are derived with
//! HMAC-SHA1 keyed by the network id, and relay requests mask network ids by
//! XOR with the request's random channel name.

use crate::mux::MuxError;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::ops::BitXor;

/// Length of every identifier in bytes
pub const ID_LEN: usize = 20;

/// Address family tag for IPv4 endpoints encoded into a channel name
const FAMILY_IPV4: u8 = 0;

/// Address family tag for IPv6 endpoints
const FAMILY_IPV6: u8 = 1;

/// Fill a buffer with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).expect("system RNG failure");
}

macro_rules! ident_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name([u8; ID_LEN]);

        impl $name {
            /// Wrap raw identifier bytes
            pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
                Self(bytes)
            }

            /// Parse from a slice; fails unless it is exactly 20 bytes
            pub fn try_from_slice(slice: &[u8]) -> Result<Self, MuxError> {
                let bytes: [u8; ID_LEN] = slice
                    .try_into()
                    .map_err(|_| MuxError::Protocol(format!(
                        "identifier must be {} bytes, got {}",
                        ID_LEN,
                        slice.len()
                    )))?;
                Ok(Self(bytes))
            }

            /// Generate a random identifier
            pub fn random() -> Self {
                let mut bytes = [0u8; ID_LEN];
                random_bytes(&mut bytes);
                Self(bytes)
            }

            /// Raw identifier bytes
            pub fn as_bytes(&self) -> &[u8; ID_LEN] {
                &self.0
            }
        }

        impl BitXor for &$name {
            type Output = [u8; ID_LEN];

            fn bitxor(self, rhs: Self) -> [u8; ID_LEN] {
                let mut out = [0u8; ID_LEN];
                for (i, byte) in out.iter_mut().enumerate() {
                    *byte = self.0[i] ^ rhs.0[i];
                }
                out
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "("))?;
                for byte in &self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                write!(f, ")")
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                for byte in &self.0 {
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
    };
}

ident_type! {
    /// Identity of a peer on the overlay
    PeerId
}

ident_type! {
    /// Identity of a chat network; kept off the wire
    NetworkId
}

ident_type! {
    /// Name of a multiplexed channel within a connection
    ChannelName
}

impl ChannelName {
    /// Derive the channel name both peers use for a network's channel:
    /// `HMAC-SHA1(key = network id, message = local peer id XOR remote peer id)`.
    ///
    /// XOR makes the message symmetric, so both ends derive the same name
    /// without agreeing on an ordering, and a passive observer cannot
    /// recover the network id from the name.
    pub fn for_network(network: &NetworkId, local: &PeerId, remote: &PeerId) -> Self {
        use ring::hmac;

        let key = hmac::Key::new(hmac::HMAC_SHA1_FOR_LEGACY_USE_ONLY, network.as_bytes());
        let tag = hmac::sign(&key, &(local ^ remote));

        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(tag.as_ref());
        Self(bytes)
    }

    /// Encode an IP endpoint into a channel name: family tag, address
    /// bytes, port little-endian, zero padding to 20 bytes.
    pub fn for_endpoint(endpoint: SocketAddr) -> Self {
        let mut bytes = [0u8; ID_LEN];
        let port = endpoint.port().to_le_bytes();

        match endpoint.ip() {
            IpAddr::V4(ip) => {
                bytes[0] = FAMILY_IPV4;
                bytes[1..5].copy_from_slice(&ip.octets());
                bytes[5..7].copy_from_slice(&port);
            }
            IpAddr::V6(ip) => {
                bytes[0] = FAMILY_IPV6;
                bytes[1..17].copy_from_slice(&ip.octets());
                bytes[17..19].copy_from_slice(&port);
            }
        }

        Self(bytes)
    }

    /// Recover the endpoint encoded by [`ChannelName::for_endpoint`]
    pub fn to_endpoint(&self) -> Result<SocketAddr, MuxError> {
        match self.0[0] {
            FAMILY_IPV4 => {
                let ip = Ipv4Addr::new(self.0[1], self.0[2], self.0[3], self.0[4]);
                let port = u16::from_le_bytes([self.0[5], self.0[6]]);
                Ok(SocketAddr::new(IpAddr::V4(ip), port))
            }
            FAMILY_IPV6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&self.0[1..17]);
                let port = u16::from_le_bytes([self.0[17], self.0[18]]);
                Ok(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port))
            }
            family => Err(MuxError::Protocol(format!(
                "unsupported address family: {family}"
            ))),
        }
    }

    /// Mask (or unmask) an identifier by XOR with this name's bytes
    pub fn mask(&self, id: &[u8; ID_LEN]) -> [u8; ID_LEN] {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ id[i];
        }
        out
    }
}

impl From<&ChannelName> for NetworkId {
    fn from(name: &ChannelName) -> Self {
        NetworkId(name.0)
    }
}

impl From<&NetworkId> for ChannelName {
    fn from(network: &NetworkId) -> Self {
        ChannelName(network.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_ids_differ() {
        assert_ne!(ChannelName::random(), ChannelName::random());
    }

    #[test]
    fn test_xor_symmetric() {
        let a = PeerId::random();
        let b = PeerId::random();
        assert_eq!(&a ^ &b, &b ^ &a);
    }

    #[test]
    fn test_network_channel_name_deterministic_and_symmetric() {
        let network = NetworkId::random();
        let local = PeerId::random();
        let remote = PeerId::random();

        let ours = ChannelName::for_network(&network, &local, &remote);
        let theirs = ChannelName::for_network(&network, &remote, &local);
        assert_eq!(ours, theirs);

        // Deterministic across invocations
        assert_eq!(ours, ChannelName::for_network(&network, &local, &remote));

        // A different network yields a different name
        let other = ChannelName::for_network(&NetworkId::random(), &local, &remote);
        assert_ne!(ours, other);
    }

    #[test]
    fn test_endpoint_roundtrip_ipv4() {
        let endpoint: SocketAddr = "192.168.1.7:45123".parse().unwrap();
        let name = ChannelName::for_endpoint(endpoint);
        assert_eq!(name.as_bytes()[0], 0);
        assert_eq!(name.to_endpoint().unwrap(), endpoint);
    }

    #[test]
    fn test_endpoint_roundtrip_ipv6() {
        let endpoint: SocketAddr = "[2001:db8::dead:beef]:6881".parse().unwrap();
        let name = ChannelName::for_endpoint(endpoint);
        assert_eq!(name.as_bytes()[0], 1);
        assert_eq!(name.to_endpoint().unwrap(), endpoint);
    }

    #[test]
    fn test_endpoint_port_is_little_endian() {
        let endpoint: SocketAddr = "10.0.0.1:258".parse().unwrap(); // 0x0102
        let name = ChannelName::for_endpoint(endpoint);
        assert_eq!(name.as_bytes()[5], 0x02);
        assert_eq!(name.as_bytes()[6], 0x01);
    }

    #[test]
    fn test_unknown_family_rejected() {
        let mut bytes = [0u8; ID_LEN];
        bytes[0] = 9;
        let name = ChannelName::from_bytes(bytes);
        assert!(name.to_endpoint().is_err());
    }

    #[test]
    fn test_mask_roundtrip() {
        let name = ChannelName::random();
        let network = NetworkId::random();
        let masked = name.mask(network.as_bytes());
        assert_eq!(name.mask(&masked), *network.as_bytes());
    }
}
