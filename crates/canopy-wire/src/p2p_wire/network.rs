//! Parameters of each network we can join. Peers only need the bits that show up on the
//! wire: the magic that starts every message, the port we listen on by default, the
//! genesis block and how big a message may be.
use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;

use bitcoin::p2p::Magic;
use bitcoin::BlockHash;
use canopy_common::bhash;
use serde::Deserialize;

/// The largest payload we accept by default, 32 MiB
pub const MAX_MESSAGE_PAYLOAD: u32 = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    #[serde(alias = "main", alias = "bitcoin")]
    Mainnet,
    #[serde(alias = "test", alias = "testnet3")]
    Testnet,
    #[serde(alias = "sim")]
    Simnet,
    #[serde(alias = "regressiontest")]
    Regtest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetParams {
    /// Human readable name, as used in config files
    pub name: &'static str,
    /// The four bytes every message starts with, in wire order
    pub magic: [u8; 4],
    /// Port we listen and connect to if nothing else is said
    pub default_port: u16,
    /// Hash of the first block
    pub genesis_hash: &'static str,
    /// Peers sending a message with a larger payload are disconnected
    pub max_message_payload: u32,
}

const MAINNET_GENESIS: &str = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";
const TESTNET_GENESIS: &str = "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943";
const SIMNET_GENESIS: &str = "683e86bd5c6d110d91b94b97137ba6bfe02dbbdb8e3dff722a669b5d69d77af6";
const REGTEST_GENESIS: &str = "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206";

const MAINNET_PARAMS: NetParams = NetParams {
    name: "mainnet",
    magic: [0xf9, 0xbe, 0xb4, 0xd9],
    default_port: 8333,
    genesis_hash: MAINNET_GENESIS,
    max_message_payload: MAX_MESSAGE_PAYLOAD,
};

const TESTNET_PARAMS: NetParams = NetParams {
    name: "testnet",
    magic: [0x0b, 0x11, 0x09, 0x07],
    default_port: 18333,
    genesis_hash: TESTNET_GENESIS,
    max_message_payload: MAX_MESSAGE_PAYLOAD,
};

const SIMNET_PARAMS: NetParams = NetParams {
    name: "simnet",
    magic: [0x16, 0x1c, 0x14, 0x12],
    default_port: 18555,
    genesis_hash: SIMNET_GENESIS,
    max_message_payload: MAX_MESSAGE_PAYLOAD,
};

const REGTEST_PARAMS: NetParams = NetParams {
    name: "regtest",
    magic: [0xfa, 0xbf, 0xb5, 0xda],
    default_port: 18444,
    genesis_hash: REGTEST_GENESIS,
    max_message_payload: MAX_MESSAGE_PAYLOAD,
};

impl Network {
    pub fn params(&self) -> &'static NetParams {
        match self {
            Network::Mainnet => &MAINNET_PARAMS,
            Network::Testnet => &TESTNET_PARAMS,
            Network::Simnet => &SIMNET_PARAMS,
            Network::Regtest => &REGTEST_PARAMS,
        }
    }

    pub fn magic(&self) -> Magic {
        Magic::from_bytes(self.params().magic)
    }

    pub fn default_port(&self) -> u16 {
        self.params().default_port
    }

    pub fn genesis_hash(&self) -> BlockHash {
        match self {
            Network::Mainnet => bhash!(MAINNET_GENESIS),
            Network::Testnet => bhash!(TESTNET_GENESIS),
            Network::Simnet => bhash!(SIMNET_GENESIS),
            Network::Regtest => bhash!(REGTEST_GENESIS),
        }
    }

    /// Finds the network a magic belongs to
    pub fn from_magic(magic: Magic) -> Option<Network> {
        [
            Network::Mainnet,
            Network::Testnet,
            Network::Simnet,
            Network::Regtest,
        ]
        .into_iter()
        .find(|network| network.magic() == magic)
    }
}

impl Display for Network {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.params().name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownNetwork(pub String);

impl Display for UnknownNetwork {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "unknown network {}", self.0)
    }
}

impl std::error::Error for UnknownNetwork {}

impl FromStr for Network {
    type Err = UnknownNetwork;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mainnet" | "main" | "bitcoin" => Ok(Network::Mainnet),
            "testnet" | "test" | "testnet3" => Ok(Network::Testnet),
            "simnet" | "sim" => Ok(Network::Simnet),
            "regtest" | "regressiontest" => Ok(Network::Regtest),
            _ => Err(UnknownNetwork(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use bitcoin::p2p::Magic;

    use super::Network;

    #[test]
    fn test_params() {
        assert_eq!(Network::Mainnet.magic(), Magic::BITCOIN);
        assert_eq!(Network::Regtest.magic(), Magic::REGTEST);
        assert_eq!(Network::Simnet.default_port(), 18555);
        assert_eq!(
            Network::from_magic(Network::Simnet.magic()),
            Some(Network::Simnet)
        );
        assert_eq!(Network::from_magic(Magic::SIGNET), None);
    }

    #[test]
    fn test_genesis_hash() {
        for network in [
            Network::Mainnet,
            Network::Testnet,
            Network::Simnet,
            Network::Regtest,
        ] {
            assert_eq!(
                network.genesis_hash().to_string(),
                network.params().genesis_hash
            );
        }

        assert_eq!(
            Network::Regtest.genesis_hash().to_string(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn test_from_str() {
        assert_eq!(Network::from_str("SimNet").unwrap(), Network::Simnet);
        assert_eq!(Network::from_str("main").unwrap(), Network::Mainnet);
        assert!(Network::from_str("signet").is_err());
    }
}
