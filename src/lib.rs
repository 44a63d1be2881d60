//! # peermux
//!
//! A peer-to-peer connection multiplexer: a framed byte protocol layered on
//! a single reliable stream between two peers, carrying many independent
//! logical channels plus control signalling.
//!
//! ## Features
//!
//! - **Channel multiplexing** with per-channel single-slot flow control
//! - **Proxy tunnels** splicing two channels across connections
//! - **Virtual connections**: a channel serving as the base stream of a
//!   nested connection
//! - **Relay signalling** with XOR-masked network identifiers
//! - **Peer-status probes**, out-of-band DHT datagrams and invitations
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Application Layer                    │
//! │     (chat networks, DHT client, relay registry)      │
//! ├─────────────────────────────────────────────────────┤
//! │                 Connection Facade                    │
//! │     (open/request channels, control requests)        │
//! ├─────────────────────────────────────────────────────┤
//! │                Multiplexing Layer                    │
//! │   (reader loop, registries, channel slots, joints)   │
//! ├─────────────────────────────────────────────────────┤
//! │                   Frame Codec                        │
//! │      (signal, 20-byte channel name, payload)         │
//! ├─────────────────────────────────────────────────────┤
//! │                   Base Stream                        │
//! │    (secured socket, or a channel of an outer mux)    │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod connection;
pub mod ident;
pub mod mux;

pub use config::Config;
pub use connection::{
    Connection, ConnectionManager, ConnectionTimeouts, DhtClient, Hooks, MuxEvents, RelayHandle,
    RelayService,
};
pub use ident::{ChannelName, NetworkId, PeerId};
pub use mux::{BaseStream, ChannelKind, IoBase, MuxChannel, MuxError};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Mux error: {0}")]
    Mux(#[from] mux::MuxError),

    #[error("Configuration error: {0}")]
    Config(String),
}
