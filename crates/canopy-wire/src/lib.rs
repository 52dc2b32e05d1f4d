// SPDX-License-Identifier: MIT

//! The p2p side of a canopy node.
//!
//! The main type here is [Peer], that owns one connection and speaks the protocol on it.
//! What a peer does with the messages it gets is up to the [MessageListener] in its
//! [PeerConfig]. Compact filter requests can be answered directly from a
//! [canopy_compact_filters::NetworkFilters].

mod p2p_wire;

pub use p2p_wire::config_file;
pub use p2p_wire::error;
pub use p2p_wire::listener;
pub use p2p_wire::message;
pub use p2p_wire::network;
pub use p2p_wire::peer;
pub use p2p_wire::transport;
pub use p2p_wire::PeerConfig;
pub use p2p_wire::DEFAULT_HANDSHAKE_TIMEOUT;
pub use p2p_wire::DEFAULT_PING_INTERVAL;
pub use p2p_wire::DEFAULT_PING_TIMEOUT;
pub use p2p_wire::DEFAULT_STALL_TIMEOUT;
pub use p2p_wire::DEFAULT_TRICKLE_INTERVAL;

pub use self::error::DisconnectReason;
pub use self::error::PeerError;
pub use self::listener::MessageListener;
pub use self::network::Network;
pub use self::peer::HandshakeState;
pub use self::peer::Peer;
