//! The `[peer]` and `[filters]` sections of our TOML config file. Everything is optional,
//! whatever is missing keeps the value from [PeerConfig::default] or whatever config it's
//! applied on.
//!
//! ```toml
//! [peer]
//! network = "simnet"
//! user_agent_name = "my-node"
//! user_agent_version = "1.0.0"
//! trickle_interval = 10000 # milliseconds
//!
//! [filters]
//! cache_size = 33554432 # bytes
//! ```
use std::time::Duration;

use bitcoin::p2p::ServiceFlags;
use canopy_compact_filters::filter_cache::DEFAULT_CACHE_SIZE;
use serde::Deserialize;
use thiserror::Error;

use super::network::Network;
use super::PeerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("couldn't read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("couldn't parse config file: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Default, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Peer {
    pub network: Option<Network>,
    pub user_agent_name: Option<String>,
    pub user_agent_version: Option<String>,
    pub user_agent_comments: Option<Vec<String>>,
    /// Raw service bits
    pub services: Option<u64>,
    pub protocol_version: Option<u32>,
    pub start_height: Option<i32>,
    pub disable_relay_tx: Option<bool>,
    pub trickle_interval: Option<u64>,
    pub ping_interval: Option<u64>,
    pub ping_timeout: Option<u64>,
    pub stall_timeout: Option<u64>,
    pub handshake_timeout: Option<u64>,
}

#[derive(Default, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Filters {
    /// How many bytes of filters we keep in memory
    pub cache_size: Option<usize>,
}

#[derive(Default, Debug, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub peer: Peer,
    #[serde(default)]
    pub filters: Filters,
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl ConfigFile {
    pub fn from_file(filename: &str) -> Result<Self, ConfigError> {
        let file = std::fs::read_to_string(filename)?;
        Self::from_str_config(&file)
    }

    pub fn from_str_config(config: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(config)?)
    }

    /// Overrides `config` with whatever this file sets
    pub fn apply(&self, config: PeerConfig) -> PeerConfig {
        let peer = &self.peer;

        PeerConfig {
            network: peer.network.unwrap_or(config.network),
            user_agent_name: peer
                .user_agent_name
                .clone()
                .unwrap_or(config.user_agent_name),
            user_agent_version: peer
                .user_agent_version
                .clone()
                .unwrap_or(config.user_agent_version),
            user_agent_comments: peer
                .user_agent_comments
                .clone()
                .unwrap_or(config.user_agent_comments),
            services: peer
                .services
                .map(ServiceFlags::from)
                .unwrap_or(config.services),
            protocol_version: peer.protocol_version.unwrap_or(config.protocol_version),
            start_height: peer.start_height.unwrap_or(config.start_height),
            disable_relay_tx: peer.disable_relay_tx.unwrap_or(config.disable_relay_tx),
            trickle_interval: millis(peer.trickle_interval, config.trickle_interval),
            ping_interval: millis(peer.ping_interval, config.ping_interval),
            ping_timeout: millis(peer.ping_timeout, config.ping_timeout),
            stall_timeout: millis(peer.stall_timeout, config.stall_timeout),
            handshake_timeout: millis(peer.handshake_timeout, config.handshake_timeout),
            ..config
        }
    }

    pub fn filter_cache_size(&self) -> usize {
        self.filters.cache_size.unwrap_or(DEFAULT_CACHE_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bitcoin::p2p::ServiceFlags;
    use canopy_common::assert_err;
    use canopy_compact_filters::filter_cache::DEFAULT_CACHE_SIZE;

    use super::ConfigFile;
    use crate::p2p_wire::network::Network;
    use crate::p2p_wire::PeerConfig;

    #[test]
    fn test_apply() {
        let file = ConfigFile::from_str_config(
            r#"
            [peer]
            network = "simnet"
            user_agent_name = "peer"
            user_agent_version = "1.0.0"
            services = 9
            trickle_interval = 500

            [filters]
            cache_size = 1024
            "#,
        )
        .unwrap();

        let config = file.apply(PeerConfig {
            start_height: 100,
            ..Default::default()
        });

        assert_eq!(config.network, Network::Simnet);
        assert_eq!(config.user_agent_name, "peer");
        assert_eq!(
            config.services,
            ServiceFlags::NETWORK | ServiceFlags::WITNESS
        );
        assert_eq!(config.trickle_interval, Duration::from_millis(500));
        // untouched fields keep what we had
        assert_eq!(config.start_height, 100);
        assert_eq!(config.ping_interval, PeerConfig::default().ping_interval);
        assert_eq!(file.filter_cache_size(), 1024);
    }

    #[test]
    fn test_empty_file() {
        let file = ConfigFile::from_str_config("").unwrap();
        let config = file.apply(PeerConfig::default());

        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(file.filter_cache_size(), DEFAULT_CACHE_SIZE);
    }

    #[test]
    fn test_bad_file() {
        assert_err!(ConfigFile::from_str_config("[peer]\nnetwork = \"moon\""));
        assert_err!(ConfigFile::from_str_config("[peer]\nfoo = 1"));
        assert_err!(ConfigFile::from_file("/this/file/does/not/exist.toml"));
    }
}
