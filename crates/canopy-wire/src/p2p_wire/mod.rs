//! Main module for the p2p layer. A [peer::Peer] owns one connection to a remote node and
//! drives it: version handshake, message dispatch to a [listener::MessageListener],
//! inventory trickling, ping keep-alive and teardown.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::p2p::ServiceFlags;
use canopy_compact_filters::NetworkFilters;

use self::listener::MessageListener;
use self::listener::NoopListener;
use self::message::PROTOCOL_VERSION;
use self::network::Network;

pub mod config_file;
pub mod error;
pub mod listener;
pub mod message;
pub mod network;
pub mod peer;
pub mod transport;

#[cfg(test)]
mod tests;

/// How often we flush queued inventory to a peer
pub const DEFAULT_TRICKLE_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(2 * 60);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(5 * 60);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
/// Configuration shared by every peer we create. Peers never change it.
pub struct PeerConfig {
    /// Our name in the user agent, like `canopy-node`. May be empty.
    pub user_agent_name: String,
    /// Our version in the user agent, like `0.1.0`
    pub user_agent_version: String,
    /// Extra comments, shown in parentheses after our version
    pub user_agent_comments: Vec<String>,
    /// Which network we are in. Defaults to mainnet.
    pub network: Network,
    /// Services we advertise. Defaults to none.
    pub services: ServiceFlags,
    /// Protocol version we advertise. Peers end up speaking the lowest of theirs and ours.
    pub protocol_version: u32,
    /// Height of our best block, as told in our version message
    pub start_height: i32,
    /// Asks peers not to relay transactions to us
    pub disable_relay_tx: bool,
    /// Lets a peer connect to ourselves. Only useful for tests, where both ends of a connection
    /// live in the same process.
    pub allow_self_connections: bool,
    /// How often queued inventory is flushed. Defaults to 10 seconds.
    pub trickle_interval: Duration,
    /// How often we ping a ready peer. Defaults to 2 minutes.
    pub ping_interval: Duration,
    /// How long a peer has to answer our ping. Defaults to 30 seconds.
    pub ping_timeout: Duration,
    /// If a peer doesn't send anything for this long, we drop it. This is also our deadline
    /// for writing a single message. Defaults to 5 minutes.
    pub stall_timeout: Duration,
    /// How long version and verack may take. Defaults to 30 seconds.
    pub handshake_timeout: Duration,
    /// Who gets the messages this peer receives
    pub listener: Arc<dyn MessageListener>,
    /// Compact filters we serve to peers. If `None`, `getcfilters` is left to the listener.
    pub filters: Option<Arc<NetworkFilters>>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        PeerConfig {
            user_agent_name: "canopy".to_string(),
            user_agent_version: env!("CARGO_PKG_VERSION").to_string(),
            user_agent_comments: Vec::new(),
            network: Network::Mainnet,
            services: ServiceFlags::NONE,
            protocol_version: PROTOCOL_VERSION,
            start_height: 0,
            disable_relay_tx: false,
            allow_self_connections: false,
            trickle_interval: DEFAULT_TRICKLE_INTERVAL,
            ping_interval: DEFAULT_PING_INTERVAL,
            ping_timeout: DEFAULT_PING_TIMEOUT,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            listener: Arc::new(NoopListener),
            filters: None,
        }
    }
}

impl Debug for PeerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerConfig")
            .field("user_agent", &self.user_agent())
            .field("network", &self.network)
            .field("services", &self.services)
            .field("protocol_version", &self.protocol_version)
            .field("start_height", &self.start_height)
            .field("disable_relay_tx", &self.disable_relay_tx)
            .field("allow_self_connections", &self.allow_self_connections)
            .field("trickle_interval", &self.trickle_interval)
            .field("ping_interval", &self.ping_interval)
            .field("ping_timeout", &self.ping_timeout)
            .field("stall_timeout", &self.stall_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

impl PeerConfig {
    /// The user agent we send in our version message, following BIP14:
    /// `/canopy-wire:0.1.0/name:version(comment; comment)/`
    pub fn user_agent(&self) -> String {
        let mut user_agent = format!("/canopy-wire:{}/", env!("CARGO_PKG_VERSION"));
        if self.user_agent_name.is_empty() {
            return user_agent;
        }

        user_agent.push_str(&format!(
            "{}:{}",
            self.user_agent_name, self.user_agent_version
        ));
        if !self.user_agent_comments.is_empty() {
            user_agent.push_str(&format!("({})", self.user_agent_comments.join("; ")));
        }
        user_agent.push('/');

        user_agent
    }
}

#[cfg(test)]
mod config_tests {
    use super::PeerConfig;

    #[test]
    fn test_user_agent() {
        let version = env!("CARGO_PKG_VERSION");
        let mut config = PeerConfig {
            user_agent_name: "peer".into(),
            user_agent_version: "1.0.0".into(),
            ..Default::default()
        };
        assert_eq!(
            config.user_agent(),
            format!("/canopy-wire:{version}/peer:1.0.0/")
        );

        config.user_agent_comments = vec!["simnet".into(), "test".into()];
        assert_eq!(
            config.user_agent(),
            format!("/canopy-wire:{version}/peer:1.0.0(simnet; test)/")
        );

        config.user_agent_name.clear();
        assert_eq!(config.user_agent(), format!("/canopy-wire:{version}/"));
    }
}
