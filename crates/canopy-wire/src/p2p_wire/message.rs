//! The message envelope. Every message on the wire is a 24 bytes header followed by a
//! payload:
//!
//! ```text
//! | magic (4) | command (12, NUL padded) | payload length (4, LE) | checksum (4) | payload |
//! ```
//!
//! where the checksum is the first four bytes of the double sha256 of the payload. Payloads
//! themselves are [NetworkMessage]s, encoded with their consensus encoding.
use bitcoin::consensus::encode;
use bitcoin::consensus::serialize;
use bitcoin::consensus::Decodable;
use bitcoin::consensus::Encodable;
use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message::RawNetworkMessage;
use bitcoin::p2p::Magic;

use super::network::Network;

/// Size of the fixed part of every message
pub const HEADER_SIZE: usize = 24;

/// The protocol version we speak, if nothing else is configured
pub const PROTOCOL_VERSION: u32 = 70016;

/// Peers older than this don't know about pong nonces nor reject messages, we won't talk to them
pub const MIN_PROTOCOL_VERSION: u32 = 70001;

/// Maximum number of entries in a single `inv`, `getdata` or `notfound`
pub const MAX_INV_PER_MSG: usize = 50_000;

/// Maximum number of filters a single `getcfilters` may ask for
pub const MAX_GETCFILTERS_SIZE: usize = 1_000;

/// The BIP158 basic filter type, the only one we serve
pub const BASIC_FILTER_TYPE: u8 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: Magic,
    pub command: [u8; 12],
    pub length: u32,
    pub checksum: [u8; 4],
}

impl MessageHeader {
    /// Builds the header for a given payload
    pub fn new(magic: Magic, command: &str, payload: &[u8]) -> Self {
        let mut padded = [0u8; 12];
        let len = command.len().min(12);
        padded[..len].copy_from_slice(&command.as_bytes()[..len]);

        MessageHeader {
            magic,
            command: padded,
            length: payload.len() as u32,
            checksum: checksum(payload),
        }
    }

    /// The command name, without the NUL padding
    pub fn command(&self) -> String {
        self.command
            .iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect()
    }
}

impl Encodable for MessageHeader {
    fn consensus_encode<W: bitcoin::io::Write + ?Sized>(
        &self,
        writer: &mut W,
    ) -> Result<usize, bitcoin::io::Error> {
        let mut len = self.magic.consensus_encode(writer)?;
        len += self.command.consensus_encode(writer)?;
        len += self.length.consensus_encode(writer)?;
        len += self.checksum.consensus_encode(writer)?;

        Ok(len)
    }
}

impl Decodable for MessageHeader {
    fn consensus_decode<R: bitcoin::io::Read + ?Sized>(
        reader: &mut R,
    ) -> Result<Self, encode::Error> {
        let magic = Magic::consensus_decode(reader)?;
        let command = <[u8; 12]>::consensus_decode(reader)?;
        let length = u32::consensus_decode(reader)?;
        let checksum = <[u8; 4]>::consensus_decode(reader)?;

        Ok(Self {
            magic,
            command,
            length,
            checksum,
        })
    }
}

/// First four bytes of sha256d(payload)
pub fn checksum(payload: &[u8]) -> [u8; 4] {
    let hash = sha256d::Hash::hash(payload).to_byte_array();
    [hash[0], hash[1], hash[2], hash[3]]
}

/// Serializes a message, header included, ready to be written to a socket
pub fn serialize_message(network: Network, message: NetworkMessage) -> Vec<u8> {
    serialize(&RawNetworkMessage::new(network.magic(), message))
}

#[cfg(test)]
mod tests {
    use bitcoin::consensus::deserialize;
    use bitcoin::consensus::serialize;
    use bitcoin::p2p::message::NetworkMessage;

    use super::checksum;
    use super::serialize_message;
    use super::MessageHeader;
    use super::HEADER_SIZE;
    use crate::p2p_wire::network::Network;

    #[test]
    fn test_empty_payload_checksum() {
        // sha256d("") starts with 5df6e0e2, every empty message carries it
        assert_eq!(checksum(&[]), [0x5d, 0xf6, 0xe0, 0xe2]);
    }

    #[test]
    fn test_verack_frame() {
        let frame = serialize_message(Network::Mainnet, NetworkMessage::Verack);
        assert_eq!(frame.len(), HEADER_SIZE);

        let header: MessageHeader = deserialize(&frame).unwrap();
        assert_eq!(header.magic, Network::Mainnet.magic());
        assert_eq!(header.command(), "verack");
        assert_eq!(header.length, 0);
        assert_eq!(header.checksum, checksum(&[]));
    }

    #[test]
    fn test_header_matches_raw_message() {
        let frame = serialize_message(Network::Simnet, NetworkMessage::Ping(42));
        let payload = &frame[HEADER_SIZE..];
        let header = MessageHeader::new(Network::Simnet.magic(), "ping", payload);

        assert_eq!(serialize(&header), frame[..HEADER_SIZE]);
        assert_eq!(payload, 42u64.to_le_bytes());
    }
}
