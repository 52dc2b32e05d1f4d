use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_filter::CFilter;
use bitcoin::p2p::message_network::Reject;
use bitcoin::p2p::message_network::RejectReason;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::ServiceFlags;
use bitcoin::Txid;
use tokio::io::duplex;
use tokio::io::BufReader;
use tokio::io::DuplexStream;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::UnboundedSender;

use crate::p2p_wire::error::DisconnectReason;
use crate::p2p_wire::listener::MessageListener;
use crate::p2p_wire::message::PROTOCOL_VERSION;
use crate::p2p_wire::network::Network;
use crate::p2p_wire::peer::Peer;
use crate::p2p_wire::transport::split;
use crate::p2p_wire::transport::ReadTransport;
use crate::p2p_wire::transport::TransportError;
use crate::p2p_wire::transport::WriteTransport;
use crate::p2p_wire::PeerConfig;

/// How long we wait for anything to happen. Tests with paused time will just skip ahead.
pub const WAIT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Version(u32),
    Verack,
    Ping(u64),
    Pong(u64),
    Inv(Vec<Inventory>),
    GetData(Vec<Inventory>),
    CFilter(CFilter),
    Reject(String),
    Disconnect(DisconnectReason),
}

/// A listener that forwards everything it sees to a channel, tagged with the peer id
pub struct RecordingListener {
    events: UnboundedSender<(u32, Event)>,
    /// If set, every version is refused with this reason
    veto: Option<String>,
    /// How long `on_inv` blocks the read loop
    inv_delay: Duration,
}

impl RecordingListener {
    pub fn new() -> (Arc<Self>, UnboundedReceiver<(u32, Event)>) {
        Self::build(None, Duration::ZERO)
    }

    pub fn vetoing(reason: &str) -> (Arc<Self>, UnboundedReceiver<(u32, Event)>) {
        Self::build(Some(reason.to_string()), Duration::ZERO)
    }

    pub fn slow(inv_delay: Duration) -> (Arc<Self>, UnboundedReceiver<(u32, Event)>) {
        Self::build(None, inv_delay)
    }

    fn build(
        veto: Option<String>,
        inv_delay: Duration,
    ) -> (Arc<Self>, UnboundedReceiver<(u32, Event)>) {
        let (events, rx) = unbounded_channel();
        let listener = RecordingListener {
            events,
            veto,
            inv_delay,
        };

        (Arc::new(listener), rx)
    }

    fn record(&self, peer: &Peer, event: Event) {
        let _ = self.events.send((peer.id(), event));
    }
}

impl MessageListener for RecordingListener {
    fn on_version(&self, peer: &Peer, version: &VersionMessage) -> Option<Reject> {
        self.record(peer, Event::Version(version.version));

        self.veto.as_ref().map(|reason| Reject {
            message: "version".into(),
            ccode: RejectReason::NonStandard,
            reason: reason.clone().into(),
            hash: sha256d::Hash::all_zeros(),
        })
    }

    fn on_verack(&self, peer: &Peer) {
        self.record(peer, Event::Verack);
    }

    fn on_ping(&self, peer: &Peer, nonce: u64) {
        self.record(peer, Event::Ping(nonce));
    }

    fn on_pong(&self, peer: &Peer, nonce: u64) {
        self.record(peer, Event::Pong(nonce));
    }

    fn on_inv(&self, peer: &Peer, inventory: &[Inventory]) {
        if !self.inv_delay.is_zero() {
            std::thread::sleep(self.inv_delay);
        }

        self.record(peer, Event::Inv(inventory.to_vec()));
    }

    fn on_get_data(&self, peer: &Peer, inventory: &[Inventory]) {
        self.record(peer, Event::GetData(inventory.to_vec()));
    }

    fn on_cfilter(&self, peer: &Peer, filter: &CFilter) {
        self.record(peer, Event::CFilter(filter.clone()));
    }

    fn on_reject(&self, peer: &Peer, reject: &Reject) {
        self.record(peer, Event::Reject(reject.reason.to_string()));
    }

    fn on_disconnect(&self, peer: &Peer, reason: &DisconnectReason) {
        self.record(peer, Event::Disconnect(reason.clone()));
    }
}

/// Waits for the first event matching `filter`, dropping everything before it
pub async fn wait_for<T>(
    events: &mut UnboundedReceiver<(u32, Event)>,
    mut filter: impl FnMut(u32, &Event) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            let (peer, event) = events.recv().await.expect("listener is gone");
            if let Some(found) = filter(peer, &event) {
                return found;
            }
        }
    })
    .await
    .expect("event never came")
}

/// Everything recorded so far, without waiting
pub fn drain(events: &mut UnboundedReceiver<(u32, Event)>) -> Vec<(u32, Event)> {
    let mut drained = Vec::new();
    while let Ok(event) = events.try_recv() {
        drained.push(event);
    }

    drained
}

pub fn test_config(listener: Arc<dyn MessageListener>) -> PeerConfig {
    PeerConfig {
        user_agent_name: "test".into(),
        user_agent_version: "0.0.1".into(),
        network: Network::Regtest,
        allow_self_connections: true,
        listener,
        ..Default::default()
    }
}

pub fn test_addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

pub fn txid(n: u8) -> Inventory {
    Inventory::Transaction(Txid::from_byte_array([n; 32]))
}

/// Two peers talking over an in-memory pipe, handshake already under way
pub fn connected_pair(outbound: PeerConfig, inbound: PeerConfig) -> (Peer, Peer) {
    let (local, remote) = duplex(1024 * 1024);

    let outbound = Peer::new_outbound(outbound, test_addr(18444));
    let inbound = Peer::new_inbound(inbound);

    outbound.associate_stream(local, test_addr(18444)).unwrap();
    inbound.associate_stream(remote, test_addr(50000)).unwrap();

    (outbound, inbound)
}

/// A remote node we drive by hand, message by message. Used to misbehave in ways a [Peer]
/// never would.
pub struct TestPeer {
    reader: ReadTransport<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteTransport<WriteHalf<DuplexStream>>,
}

impl TestPeer {
    /// Returns the remote and the stream our peer should be associated with
    pub fn new() -> (Self, DuplexStream) {
        Self::with_buffer(1024 * 1024)
    }

    /// Same as [TestPeer::new], but each direction of the pipe only holds `size` bytes
    pub fn with_buffer(size: usize) -> (Self, DuplexStream) {
        let (local, remote) = duplex(size);
        let (reader, writer) = split(remote, Network::Regtest);

        (TestPeer { reader, writer }, local)
    }

    pub fn version(protocol_version: u32) -> VersionMessage {
        let addr = Address::new(&test_addr(0), ServiceFlags::NONE);
        let mut version = VersionMessage::new(
            ServiceFlags::NETWORK,
            0,
            addr.clone(),
            addr,
            rand::random(),
            "/test-peer:0.0.1/".to_string(),
            10,
        );
        version.version = protocol_version;

        version
    }

    pub async fn send(&mut self, message: NetworkMessage) {
        self.writer.write_message(message).await.unwrap();
    }

    /// Like [TestPeer::send], for when the peer may hang up on us halfway
    pub async fn try_send(&mut self, message: NetworkMessage) -> Result<(), TransportError> {
        self.writer.write_message(message).await
    }

    pub async fn recv(&mut self) -> NetworkMessage {
        tokio::time::timeout(WAIT, self.reader.read_message())
            .await
            .expect("peer never answered")
            .expect("couldn't read from peer")
    }

    /// Reads until the connection is closed, returning everything we got before that
    pub async fn recv_until_closed(&mut self) -> Vec<NetworkMessage> {
        let mut messages = Vec::new();
        while let Ok(Ok(message)) = tokio::time::timeout(WAIT, self.reader.read_message()).await {
            messages.push(message);
        }

        messages
    }

    /// Handshake against an outbound peer, that speaks first
    pub async fn accept_handshake(&mut self) {
        assert!(matches!(self.recv().await, NetworkMessage::Version(_)));
        self.send(NetworkMessage::Version(Self::version(PROTOCOL_VERSION)))
            .await;
        self.send(NetworkMessage::Verack).await;
        assert_eq!(self.recv().await, NetworkMessage::Verack);
    }

    /// Handshake against an inbound peer, that waits for us
    pub async fn start_handshake(&mut self) {
        self.send(NetworkMessage::Version(Self::version(PROTOCOL_VERSION)))
            .await;
        assert!(matches!(self.recv().await, NetworkMessage::Version(_)));
        assert_eq!(self.recv().await, NetworkMessage::Verack);
        self.send(NetworkMessage::Verack).await;
    }
}

/// Polls until the handshake is done
pub async fn wait_ready(peer: &Peer) {
    tokio::time::timeout(WAIT, async {
        while !peer.is_ready() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("peer never got ready");
}
