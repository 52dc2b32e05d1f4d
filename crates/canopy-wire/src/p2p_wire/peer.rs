//! A [Peer] owns one connection to a remote node.
//!
//! Once a connection is associated with it, a peer runs a few tasks:
//!  - a reader, decoding one message at a time and handing it to the handshake state machine
//!    or, once ready, to the configured [MessageListener];
//!  - a writer, the only one touching the write half of the connection, fed by a bounded
//!    channel so frames never interleave. A peer that lets that channel fill up isn't reading
//!    what we send and gets disconnected;
//!  - after the handshake, a trickle timer flushing queued inventory and a ping timer;
//!  - a supervisor that waits for the shutdown signal, joins everything else and fires
//!    `on_disconnect`.
//!
//! Whatever goes wrong inside those tasks (I/O errors, protocol violations, timeouts) ends
//! up in [Peer::disconnect_with]. The first call wins, later ones are no-ops.
//!
//! [MessageListener]: super::listener::MessageListener

use std::collections::HashSet;
use std::fmt::Debug;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::OnceLock;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bitcoin::hashes::sha256d;
use bitcoin::hashes::Hash;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_filter::CFilter;
use bitcoin::p2p::message_filter::GetCFilters;
use bitcoin::p2p::message_network::Reject;
use bitcoin::p2p::message_network::RejectReason;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::ServiceFlags;
use canopy_common::FractionAvg;
use log::debug;
use log::info;
use log::warn;
use lru::LruCache;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::net::TcpListener;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval_at;
use tokio::time::sleep_until;
use tokio::time::timeout;
use tokio::time::timeout_at;
use tokio::time::Instant;
use tokio::time::MissedTickBehavior;

use super::error::DisconnectReason;
use super::error::PeerError;
use super::error::TimeoutKind;
use super::message::BASIC_FILTER_TYPE;
use super::message::MAX_GETCFILTERS_SIZE;
use super::message::MAX_INV_PER_MSG;
use super::message::MIN_PROTOCOL_VERSION;
use super::transport;
use super::transport::ReadTransport;
use super::transport::WriteTransport;
use super::PeerConfig;

/// How many inventory items we remember per peer, to avoid announcing them twice
const MAX_KNOWN_INVENTORY: NonZeroUsize = match NonZeroUsize::new(1000) {
    Some(n) => n,
    None => panic!("capacity must not be zero"),
};

/// How many of our own version nonces we remember to detect connections to ourselves
const MAX_SENT_NONCES: NonZeroUsize = match NonZeroUsize::new(50) {
    Some(n) => n,
    None => panic!("capacity must not be zero"),
};

/// How many messages may wait for the writer. Enough for a full `getcfilters` answer plus
/// whatever else is going on.
pub(crate) const MAX_QUEUED_MESSAGES: usize = 4 * MAX_GETCFILTERS_SIZE;

/// Timers refuse a zero period
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

static NEXT_PEER_ID: AtomicU32 = AtomicU32::new(1);

type Result<T> = std::result::Result<T, PeerError>;

/// Nonces of every version message we sent, from any peer. If someone sends one of them back
/// we are talking to ourselves.
fn sent_nonces() -> MutexGuard<'static, LruCache<u64, ()>> {
    static SENT_NONCES: OnceLock<Mutex<LruCache<u64, ()>>> = OnceLock::new();

    SENT_NONCES
        .get_or_init(|| Mutex::new(LruCache::new(MAX_SENT_NONCES)))
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandshakeState {
    /// Nothing was exchanged yet
    Fresh,
    /// We are outbound and sent our version
    VersionSent,
    /// We are inbound and got the remote's version
    VersionReceived,
    /// Both versions are exchanged, waiting for the remote's verack
    Negotiating,
    Ready,
    Disconnected,
}

#[derive(Debug, Clone, Copy)]
struct PendingPing {
    nonce: u64,
    sent_at: Instant,
}

/// Something for the writer. If `done` is set, it fires once the message is on the wire.
struct Outbound {
    message: NetworkMessage,
    done: Option<oneshot::Sender<()>>,
}

struct PeerState {
    address: Option<SocketAddr>,
    handshake: HandshakeState,
    associated: bool,
    handshake_deadline: Option<Instant>,
    /// What we negotiated, zero until the remote version is accepted
    protocol_version: u32,
    services: ServiceFlags,
    user_agent: String,
    start_height: i32,
    relay: bool,
    time_connected: Option<Instant>,
    last_recv: Option<Instant>,
    last_send: Option<Instant>,
    ping: Option<PendingPing>,
    last_rtt: Option<Duration>,
    /// Average ping round trip, in milliseconds
    rtt: FractionAvg,
    /// Inventory waiting for the next trickle, in the order it was queued
    pending_inv: Vec<Inventory>,
    queued_inv: HashSet<Inventory>,
    known_inv: LruCache<Inventory, ()>,
    writer: Option<mpsc::Sender<Outbound>>,
    tasks: Vec<JoinHandle<()>>,
    disconnect_reason: Option<DisconnectReason>,
}

impl PeerState {
    fn new(address: Option<SocketAddr>) -> Self {
        PeerState {
            address,
            handshake: HandshakeState::Fresh,
            associated: false,
            handshake_deadline: None,
            protocol_version: 0,
            services: ServiceFlags::NONE,
            user_agent: String::new(),
            start_height: 0,
            relay: false,
            time_connected: None,
            last_recv: None,
            last_send: None,
            ping: None,
            last_rtt: None,
            rtt: FractionAvg::default(),
            pending_inv: Vec::new(),
            queued_inv: HashSet::new(),
            known_inv: LruCache::new(MAX_KNOWN_INVENTORY),
            writer: None,
            tasks: Vec::new(),
            disconnect_reason: None,
        }
    }
}

struct PeerInner {
    id: u32,
    inbound: bool,
    config: PeerConfig,
    local_nonce: u64,
    state: Mutex<PeerState>,
    /// Flipped to true once, by the first disconnect
    shutdown: watch::Sender<bool>,
    /// Flipped to true once teardown is over
    finished: watch::Sender<bool>,
}

/// A handle to a peer. Cloning it is cheap, every clone talks to the same connection.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

impl Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("address", &self.address())
            .field("inbound", &self.inner.inbound)
            .field("state", &self.handshake_state())
            .finish()
    }
}

/// Resolves once the flag is set. Also returns if the sender is gone, since nobody can set
/// it anymore.
async fn wait_for_flag(flag: &mut watch::Receiver<bool>) {
    loop {
        if *flag.borrow_and_update() {
            return;
        }

        if flag.changed().await.is_err() {
            return;
        }
    }
}

impl Peer {
    fn new(config: PeerConfig, inbound: bool, address: Option<SocketAddr>) -> Peer {
        let (shutdown, _) = watch::channel(false);
        let (finished, _) = watch::channel(false);

        Peer {
            inner: Arc::new(PeerInner {
                id: NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed),
                inbound,
                config,
                local_nonce: rand::random(),
                state: Mutex::new(PeerState::new(address)),
                shutdown,
                finished,
            }),
        }
    }

    /// A peer that will wait for the remote to speak first
    pub fn new_inbound(config: PeerConfig) -> Peer {
        Peer::new(config, true, None)
    }

    /// A peer that sends its version as soon as a connection is associated
    pub fn new_outbound(config: PeerConfig, address: SocketAddr) -> Peer {
        Peer::new(config, false, Some(address))
    }

    /// Connects to `address` and starts the handshake
    pub async fn dial(config: PeerConfig, address: SocketAddr) -> Result<Peer> {
        let stream = transport::connect(address, config.handshake_timeout).await?;
        let peer = Peer::new_outbound(config, address);
        peer.associate_stream(stream, address)?;

        Ok(peer)
    }

    /// Waits for the next connection on `listener` and starts serving it
    pub async fn accept(config: PeerConfig, listener: &TcpListener) -> Result<Peer> {
        let (stream, address) = listener.accept().await?;
        stream.set_nodelay(true)?;

        let peer = Peer::new_inbound(config);
        peer.associate_stream(stream, address)?;

        Ok(peer)
    }

    pub fn associate_connection(&self, stream: TcpStream) -> Result<()> {
        let address = stream.peer_addr()?;
        stream.set_nodelay(true)?;
        self.associate_stream(stream, address)
    }

    /// Hands a connection to this peer and spawns its tasks. Must be called from within a
    /// tokio runtime. A peer takes exactly one connection in its lifetime.
    pub fn associate_stream<S>(&self, stream: S, address: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = transport::split(stream, self.inner.config.network);
        let (tx, rx) = mpsc::channel(MAX_QUEUED_MESSAGES);

        {
            let mut state = self.state();
            if state.handshake == HandshakeState::Disconnected {
                return Err(PeerError::Disconnected);
            }

            if state.associated {
                return Err(PeerError::AlreadyConnected);
            }

            let now = Instant::now();
            state.associated = true;
            state.address = Some(address);
            state.time_connected = Some(now);
            state.handshake_deadline = Some(now + self.inner.config.handshake_timeout);
            state.writer = Some(tx);

            if !self.inner.inbound {
                self.push_version(&state)?;
                state.handshake = HandshakeState::VersionSent;
            }

            let reader_task = tokio::spawn(self.clone().read_loop(reader));
            let writer_task = tokio::spawn(self.clone().write_loop(writer, rx));
            state.tasks.push(reader_task);
            state.tasks.push(writer_task);
        }

        debug!(
            "peer {} associated with {address} ({})",
            self.inner.id,
            if self.inner.inbound { "inbound" } else { "outbound" }
        );
        tokio::spawn(self.clone().teardown());

        Ok(())
    }

    /// Sends a message to this peer. It's queued, so this returns before the message is
    /// actually written.
    pub fn send_message(&self, message: NetworkMessage) -> Result<()> {
        let result = Self::enqueue(&self.state(), message, None);
        if let Err(PeerError::SendQueueFull) = result {
            self.disconnect_with(DisconnectReason::SlowPeer);
        }

        result
    }

    /// Queues an inventory item for the next trickle. Items the peer already knows about or
    /// that are already queued are dropped.
    pub fn queue_inventory(&self, inventory: Inventory) -> Result<()> {
        let mut state = self.state();
        if state.handshake == HandshakeState::Disconnected {
            return Err(PeerError::Disconnected);
        }

        if state.known_inv.contains(&inventory) || !state.queued_inv.insert(inventory) {
            return Ok(());
        }

        state.pending_inv.push(inventory);
        Ok(())
    }

    pub fn disconnect(&self) {
        self.disconnect_with(DisconnectReason::Requested);
    }

    /// Marks this peer as disconnected and tells every task to stop. Only the first call
    /// does anything.
    pub fn disconnect_with(&self, reason: DisconnectReason) {
        let associated = {
            let mut state = self.state();
            if state.handshake == HandshakeState::Disconnected {
                return;
            }

            state.handshake = HandshakeState::Disconnected;
            state.disconnect_reason = Some(reason.clone());
            state.writer = None;
            state.ping = None;
            state.pending_inv.clear();
            state.queued_inv.clear();
            state.associated
        };

        info!(
            "peer {} ({}) disconnected: {reason}",
            self.inner.id,
            self.address_string()
        );
        self.inner.shutdown.send_replace(true);

        // there's no supervisor to do this for us
        if !associated {
            self.inner.config.listener.on_disconnect(self, &reason);
            self.inner.finished.send_replace(true);
        }
    }

    /// Returns once the peer is disconnected and all of its tasks are gone
    pub async fn wait_for_disconnect(&self) {
        let mut finished = self.inner.finished.subscribe();
        wait_for_flag(&mut finished).await;
    }

    pub fn id(&self) -> u32 {
        self.inner.id
    }

    pub fn is_inbound(&self) -> bool {
        self.inner.inbound
    }

    pub fn config(&self) -> &PeerConfig {
        &self.inner.config
    }

    pub fn address(&self) -> Option<SocketAddr> {
        self.state().address
    }

    pub fn handshake_state(&self) -> HandshakeState {
        self.state().handshake
    }

    pub fn is_ready(&self) -> bool {
        self.handshake_state() == HandshakeState::Ready
    }

    pub fn is_disconnected(&self) -> bool {
        self.handshake_state() == HandshakeState::Disconnected
    }

    pub fn protocol_version(&self) -> u32 {
        self.state().protocol_version
    }

    pub fn services(&self) -> ServiceFlags {
        self.state().services
    }

    pub fn user_agent(&self) -> String {
        self.state().user_agent.clone()
    }

    pub fn start_height(&self) -> i32 {
        self.state().start_height
    }

    /// Whether the remote wants transactions relayed to it
    pub fn relays_transactions(&self) -> bool {
        self.state().relay
    }

    pub fn time_connected(&self) -> Option<Instant> {
        self.state().time_connected
    }

    pub fn last_recv(&self) -> Option<Instant> {
        self.state().last_recv
    }

    pub fn last_send(&self) -> Option<Instant> {
        self.state().last_send
    }

    pub fn last_rtt(&self) -> Option<Duration> {
        self.state().last_rtt
    }

    pub fn average_rtt(&self) -> Option<Duration> {
        let state = self.state();
        if state.rtt.samples() == 0 {
            return None;
        }

        Some(Duration::from_secs_f64(state.rtt.value() / 1000.0))
    }

    pub fn pending_inventory(&self) -> usize {
        self.state().pending_inv.len()
    }

    pub fn disconnect_reason(&self) -> Option<DisconnectReason> {
        self.state().disconnect_reason.clone()
    }

    // Nothing panics while holding this lock, and listeners are never called with it held.
    fn state(&self) -> MutexGuard<'_, PeerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn address_string(&self) -> String {
        self.address()
            .map(|address| address.to_string())
            .unwrap_or_else(|| "unassociated".to_string())
    }

    fn enqueue(
        state: &PeerState,
        message: NetworkMessage,
        done: Option<oneshot::Sender<()>>,
    ) -> Result<()> {
        let writer = state.writer.as_ref().ok_or(match state.handshake {
            HandshakeState::Disconnected => PeerError::Disconnected,
            _ => PeerError::NotConnected,
        })?;

        writer
            .try_send(Outbound { message, done })
            .map_err(|e| match e {
                TrySendError::Full(_) => PeerError::SendQueueFull,
                TrySendError::Closed(_) => PeerError::Disconnected,
            })
    }

    /// Queues a message and waits until it's written, or until the writer gives up on it.
    /// Used for rejects, that should reach the peer before we hang up.
    async fn send_and_flush(&self, message: NetworkMessage) -> Result<()> {
        let (done, flushed) = oneshot::channel();
        Self::enqueue(&self.state(), message, Some(done))?;

        // the writer has its own deadline, this one is just a backstop
        let _ = timeout(self.inner.config.stall_timeout, flushed).await;
        Ok(())
    }

    fn version_message(&self, state: &PeerState) -> VersionMessage {
        let config = &self.inner.config;
        let unspecified = SocketAddr::from(([0, 0, 0, 0], 0));

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_secs() as i64)
            .unwrap_or_default();

        let receiver = Address::new(&state.address.unwrap_or(unspecified), ServiceFlags::NONE);
        let sender = Address::new(&unspecified, config.services);

        let mut version = VersionMessage::new(
            config.services,
            timestamp,
            receiver,
            sender,
            self.inner.local_nonce,
            config.user_agent(),
            config.start_height,
        );
        version.version = config.protocol_version;
        version.relay = !config.disable_relay_tx;

        version
    }

    fn push_version(&self, state: &PeerState) -> Result<()> {
        let version = self.version_message(state);
        sent_nonces().put(self.inner.local_nonce, ());

        Self::enqueue(state, NetworkMessage::Version(version), None)
    }

    async fn reject(&self, message: &NetworkMessage, ccode: RejectReason, reason: &str) {
        let reject = Reject {
            message: message.command().to_string().into(),
            ccode,
            reason: reason.to_string().into(),
            hash: sha256d::Hash::all_zeros(),
        };

        if let Err(e) = self.send_and_flush(NetworkMessage::Reject(reject)).await {
            debug!("couldn't send reject to peer {}: {e}", self.inner.id);
        }
    }

    fn fail(&self, error: PeerError) {
        debug!("peer {} failed: {error}", self.inner.id);
        self.disconnect_with(DisconnectReason::from(&error));
    }

    /// Before the handshake completes we have a fixed deadline, afterwards we only need to
    /// hear something from the peer every `stall_timeout`
    fn read_deadline(&self) -> (Instant, TimeoutKind) {
        let state = self.state();
        match (state.handshake, state.handshake_deadline) {
            (HandshakeState::Ready, _) | (_, None) => (
                Instant::now() + self.inner.config.stall_timeout,
                TimeoutKind::Stall,
            ),
            (_, Some(deadline)) => (deadline, TimeoutKind::Handshake),
        }
    }

    async fn read_loop<R>(self, mut transport: ReadTransport<R>)
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut shutdown = self.inner.shutdown.subscribe();

        loop {
            let (deadline, kind) = self.read_deadline();
            let read = tokio::select! {
                _ = wait_for_flag(&mut shutdown) => break,
                read = timeout_at(deadline, transport.read_message()) => read,
            };

            let result = match read {
                Ok(Ok(message)) => self.handle_message(message).await,
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(PeerError::Timeout(kind)),
            };

            if let Err(e) = result {
                self.fail(e);
                break;
            }
        }
    }

    async fn write_loop<W>(
        self,
        mut transport: WriteTransport<W>,
        mut outbound: mpsc::Receiver<Outbound>,
    ) where
        W: AsyncWrite + Unpin + Send,
    {
        let mut shutdown = self.inner.shutdown.subscribe();
        let stall_timeout = self.inner.config.stall_timeout;

        loop {
            let Outbound { message, done } = tokio::select! {
                biased;
                _ = wait_for_flag(&mut shutdown) => break,
                next = outbound.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
            };

            let write = tokio::select! {
                biased;
                _ = wait_for_flag(&mut shutdown) => break,
                write = timeout(stall_timeout, transport.write_message(message.clone())) => write,
            };

            match write {
                Ok(Ok(())) => {
                    debug!("sent {} to peer {}", message.cmd(), self.inner.id);
                    self.state().last_send = Some(Instant::now());
                    self.inner.config.listener.on_write(&self, &message);

                    if let Some(done) = done {
                        let _ = done.send(());
                    }
                }
                Ok(Err(e)) => {
                    self.fail(e.into());
                    break;
                }
                Err(_) => {
                    self.fail(PeerError::Timeout(TimeoutKind::Write));
                    break;
                }
            }
        }

        let _ = timeout(stall_timeout, transport.shutdown()).await;
    }

    async fn teardown(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        wait_for_flag(&mut shutdown).await;

        let tasks = std::mem::take(&mut self.state().tasks);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("a task of peer {} died: {e}", self.inner.id);
            }
        }

        let reason = self
            .disconnect_reason()
            .unwrap_or(DisconnectReason::Requested);
        self.inner.config.listener.on_disconnect(&self, &reason);
        self.inner.finished.send_replace(true);
    }

    async fn handle_message(&self, message: NetworkMessage) -> Result<()> {
        let listener = &self.inner.config.listener;
        debug!("received {} from peer {}", message.cmd(), self.inner.id);

        self.state().last_recv = Some(Instant::now());
        listener.on_read(self, &message);

        let handshake = self.handshake_state();
        if handshake != HandshakeState::Ready {
            return self.handle_handshake_message(handshake, message).await;
        }

        match &message {
            NetworkMessage::Ping(nonce) => {
                self.send_message(NetworkMessage::Pong(*nonce))?;
                listener.on_ping(self, *nonce);
            }
            NetworkMessage::Pong(nonce) => {
                self.handle_pong(*nonce);
                listener.on_pong(self, *nonce);
            }
            NetworkMessage::Inv(inventory) => {
                self.check_inventory_size(inventory)?;
                self.add_known_inventory(inventory);
                listener.on_inv(self, inventory);
            }
            NetworkMessage::GetData(inventory) => {
                self.check_inventory_size(inventory)?;
                listener.on_get_data(self, inventory);
            }
            NetworkMessage::NotFound(inventory) => {
                self.check_inventory_size(inventory)?;
                listener.on_not_found(self, inventory);
            }
            NetworkMessage::GetCFilters(request) => {
                listener.on_get_cfilters(self, request);
                self.serve_cfilters(request)?;
            }
            NetworkMessage::CFilter(filter) => listener.on_cfilter(self, filter),
            NetworkMessage::Reject(reject) => {
                warn!(
                    "peer {} rejected our {} ({:?}): {}",
                    self.inner.id, reject.message, reject.ccode, reject.reason
                );
                listener.on_reject(self, reject);
            }
            NetworkMessage::Version(_) | NetworkMessage::Verack => {
                return Err(PeerError::UnexpectedMessage {
                    command: message.command().to_string(),
                    state: handshake,
                });
            }
            other => debug!("ignoring {} from peer {}", other.cmd(), self.inner.id),
        }

        Ok(())
    }

    async fn handle_handshake_message(
        &self,
        handshake: HandshakeState,
        message: NetworkMessage,
    ) -> Result<()> {
        match (&message, handshake) {
            (NetworkMessage::Version(version), HandshakeState::Fresh) if self.inner.inbound => {
                self.handle_version(&message, version).await?;

                let mut state = self.state();
                self.push_version(&state)?;
                Self::enqueue(&state, NetworkMessage::Verack, None)?;
                state.handshake = HandshakeState::Negotiating;
            }
            (NetworkMessage::Version(version), HandshakeState::VersionSent) => {
                self.handle_version(&message, version).await?;

                let mut state = self.state();
                Self::enqueue(&state, NetworkMessage::Verack, None)?;
                state.handshake = HandshakeState::Negotiating;
            }
            (
                NetworkMessage::Verack,
                HandshakeState::Negotiating | HandshakeState::VersionReceived,
            ) => self.complete_handshake()?,
            // feature negotiation (BIP155, BIP339) happens between version and verack
            (
                NetworkMessage::SendAddrV2 | NetworkMessage::WtxidRelay,
                HandshakeState::Negotiating,
            ) => {
                debug!("ignoring {} from peer {}", message.cmd(), self.inner.id);
            }
            (NetworkMessage::Unknown { command, .. }, _) => {
                debug!("ignoring unknown {command} from peer {}", self.inner.id);
            }
            _ => {
                return Err(PeerError::UnexpectedMessage {
                    command: message.command().to_string(),
                    state: handshake,
                });
            }
        }

        Ok(())
    }

    async fn handle_version(&self, message: &NetworkMessage, version: &VersionMessage) -> Result<()> {
        let config = &self.inner.config;

        if version.version < MIN_PROTOCOL_VERSION {
            let reason = format!("protocol version must be {MIN_PROTOCOL_VERSION} or greater");
            self.reject(message, RejectReason::Obsolete, &reason).await;

            return Err(PeerError::HandshakeRejected(format!(
                "obsolete protocol version {}",
                version.version
            )));
        }

        if !config.allow_self_connections && sent_nonces().contains(&version.nonce) {
            return Err(PeerError::HandshakeRejected(
                "connected to ourselves".to_string(),
            ));
        }

        {
            let mut state = self.state();
            if state.handshake == HandshakeState::Disconnected {
                return Err(PeerError::Disconnected);
            }

            state.protocol_version = version.version.min(config.protocol_version);
            state.services = version.services;
            state.user_agent = version.user_agent.clone();
            state.start_height = version.start_height;
            state.relay = version.relay;

            if self.inner.inbound {
                state.handshake = HandshakeState::VersionReceived;
            }
        }

        if let Some(reject) = config.listener.on_version(self, version) {
            let reason = reject.reason.to_string();
            self.send_and_flush(NetworkMessage::Reject(reject)).await?;

            return Err(PeerError::HandshakeRejected(reason));
        }

        Ok(())
    }

    fn complete_handshake(&self) -> Result<()> {
        {
            let mut state = self.state();
            if state.handshake == HandshakeState::Disconnected {
                return Err(PeerError::Disconnected);
            }

            state.handshake = HandshakeState::Ready;
            let ping = tokio::spawn(self.clone().ping_loop());
            let trickle = tokio::spawn(self.clone().trickle_loop());
            state.tasks.push(ping);
            state.tasks.push(trickle);
        }

        info!(
            "handshake with peer {} ({}) complete, version {} user agent {}",
            self.inner.id,
            self.address_string(),
            self.protocol_version(),
            self.user_agent()
        );
        self.inner.config.listener.on_verack(self);

        Ok(())
    }

    fn handle_pong(&self, nonce: u64) {
        let mut state = self.state();
        let pending = state.ping;
        match pending {
            Some(PendingPing {
                nonce: expected,
                sent_at,
            }) if expected == nonce => {
                let rtt = sent_at.elapsed();
                state.ping = None;
                state.last_rtt = Some(rtt);
                state.rtt.add(rtt.as_millis() as u64);
                debug!("peer {} ping {}ms", self.inner.id, rtt.as_millis());
            }
            _ => debug!("unexpected pong {nonce} from peer {}", self.inner.id),
        }
    }

    fn check_inventory_size(&self, inventory: &[Inventory]) -> Result<()> {
        if inventory.len() > MAX_INV_PER_MSG {
            return Err(PeerError::TooManyInventory(inventory.len()));
        }

        Ok(())
    }

    fn add_known_inventory(&self, inventory: &[Inventory]) {
        let mut state = self.state();
        for item in inventory {
            state.known_inv.put(*item, ());
        }
    }

    /// Sends everything queued so far, as few `inv`s as possible. Returns how many items
    /// were sent.
    fn flush_inventory(&self) -> Result<usize> {
        let mut state = self.state();
        if state.pending_inv.is_empty() {
            return Ok(0);
        }

        let pending = std::mem::take(&mut state.pending_inv);
        state.queued_inv.clear();

        for chunk in pending.chunks(MAX_INV_PER_MSG) {
            Self::enqueue(&state, NetworkMessage::Inv(chunk.to_vec()), None)?;
        }

        for item in &pending {
            state.known_inv.put(*item, ());
        }

        debug!(
            "trickled {} inventory items to peer {}",
            pending.len(),
            self.inner.id
        );
        Ok(pending.len())
    }

    /// Answers a `getcfilters` from our own filters, if we have any. Filters are sent in
    /// chain order, stopping at the first block we have no filter for.
    fn serve_cfilters(&self, request: &GetCFilters) -> Result<()> {
        let Some(filters) = &self.inner.config.filters else {
            return Ok(());
        };

        if request.filter_type != BASIC_FILTER_TYPE {
            debug!(
                "peer {} asked for filters of unknown type {}",
                self.inner.id, request.filter_type
            );
            return Ok(());
        }

        let stop_height = match filters.block_height(&request.stop_hash) {
            Ok(Some(height)) => height,
            Ok(None) => {
                debug!("peer {} asked for filters up to an unknown block", self.inner.id);
                return Ok(());
            }
            Err(e) => {
                warn!("couldn't look up blocks for a getcfilters: {e}");
                return Ok(());
            }
        };

        let Some(count) = stop_height.checked_sub(request.start_height) else {
            return Ok(());
        };
        let count = count as usize + 1;
        if count > MAX_GETCFILTERS_SIZE {
            return Err(PeerError::TooManyFilters(count));
        }

        let block_hashes = match filters.block_hashes(request.start_height, &request.stop_hash) {
            Ok(block_hashes) => block_hashes,
            Err(e) => {
                warn!("couldn't look up blocks for a getcfilters: {e}");
                return Ok(());
            }
        };

        for block_hash in block_hashes {
            let filter = match filters.get_filter(&block_hash) {
                Ok(Some(filter)) => filter,
                Ok(None) => {
                    debug!("we have no filter for block {block_hash}");
                    break;
                }
                Err(e) => {
                    warn!("couldn't load filter for block {block_hash}: {e}");
                    break;
                }
            };

            self.send_message(NetworkMessage::CFilter(CFilter {
                filter_type: BASIC_FILTER_TYPE,
                block_hash,
                filter: filter.content.clone(),
            }))?;
        }

        Ok(())
    }

    fn send_ping(&self) -> Result<()> {
        let mut state = self.state();
        if state.ping.is_some() {
            return Ok(());
        }

        let nonce = rand::random();
        Self::enqueue(&state, NetworkMessage::Ping(nonce), None)?;
        state.ping = Some(PendingPing {
            nonce,
            sent_at: Instant::now(),
        });

        Ok(())
    }

    fn ping_deadline(&self) -> Option<Instant> {
        self.state()
            .ping
            .map(|ping| ping.sent_at + self.inner.config.ping_timeout)
    }

    fn ping_overdue(&self) -> bool {
        self.ping_deadline()
            .is_some_and(|deadline| Instant::now() >= deadline)
    }

    async fn ping_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let period = self.inner.config.ping_interval.max(MIN_TIMER_PERIOD);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let deadline = self.ping_deadline();
            tokio::select! {
                _ = wait_for_flag(&mut shutdown) => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.send_ping() {
                        self.fail(e);
                        break;
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    if self.ping_overdue() {
                        self.disconnect_with(DisconnectReason::Timeout(TimeoutKind::Ping));
                        break;
                    }
                }
            }
        }
    }

    async fn trickle_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let period = self.inner.config.trickle_interval.max(MIN_TIMER_PERIOD);
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = wait_for_flag(&mut shutdown) => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush_inventory() {
                        self.fail(e);
                        break;
                    }
                }
            }
        }
    }
}
