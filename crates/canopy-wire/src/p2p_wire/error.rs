use std::fmt::Display;
use std::fmt::Formatter;
use std::io;

use thiserror::Error;

use super::peer::HandshakeState;
use super::transport::TransportError;

/// Which of our deadlines a peer missed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeoutKind {
    /// Version and verack weren't exchanged in time
    Handshake,
    /// We sent a ping and no pong came back
    Ping,
    /// Nothing at all was received for too long
    Stall,
    /// Writing a single message took too long
    Write,
}

impl Display for TimeoutKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutKind::Handshake => write!(f, "handshake"),
            TimeoutKind::Ping => write!(f, "ping"),
            TimeoutKind::Stall => write!(f, "stall"),
            TimeoutKind::Write => write!(f, "write"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Peer sent us a {command} message while in state {state:?}")]
    UnexpectedMessage {
        command: String,
        state: HandshakeState,
    },
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("Peer timed out ({0})")]
    Timeout(TimeoutKind),
    #[error("Peer asked for {0} filters at once")]
    TooManyFilters(usize),
    #[error("Peer sent {0} inventory items in a single message")]
    TooManyInventory(usize),
    #[error("Peer has no connection associated yet")]
    NotConnected,
    #[error("Peer already has a connection associated")]
    AlreadyConnected,
    #[error("Peer is disconnected")]
    Disconnected,
    #[error("Too many messages are waiting to be sent to this peer")]
    SendQueueFull,
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Why a peer went away. Set once by whoever disconnects the peer first and kept around
/// after teardown.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Someone called `disconnect`
    Requested,
    /// The remote closed the connection
    RemoteClosed,
    /// The remote broke the protocol
    ProtocolViolation(String),
    /// The version exchange was refused, either by us or by a listener
    HandshakeRejected(String),
    Timeout(TimeoutKind),
    /// The peer doesn't read what we send, and our queue for it filled up
    SlowPeer,
    Io(String),
}

impl Display for DisconnectReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::Requested => write!(f, "disconnect requested"),
            DisconnectReason::RemoteClosed => write!(f, "connection closed by remote"),
            DisconnectReason::ProtocolViolation(what) => write!(f, "protocol violation: {what}"),
            DisconnectReason::HandshakeRejected(why) => write!(f, "handshake rejected: {why}"),
            DisconnectReason::Timeout(kind) => write!(f, "{kind} timeout"),
            DisconnectReason::SlowPeer => write!(f, "peer isn't reading what we send"),
            DisconnectReason::Io(err) => write!(f, "IO error: {err}"),
        }
    }
}

impl DisconnectReason {
    pub fn is_timeout(&self) -> bool {
        matches!(self, DisconnectReason::Timeout(_))
    }
}

fn io_reason(err: &io::Error) -> DisconnectReason {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::BrokenPipe => DisconnectReason::RemoteClosed,
        _ => DisconnectReason::Io(err.to_string()),
    }
}

impl From<&PeerError> for DisconnectReason {
    fn from(err: &PeerError) -> Self {
        match err {
            PeerError::Transport(TransportError::Io(err)) | PeerError::Io(err) => io_reason(err),
            PeerError::Transport(other) => DisconnectReason::ProtocolViolation(other.to_string()),
            PeerError::UnexpectedMessage { .. }
            | PeerError::TooManyFilters(_)
            | PeerError::TooManyInventory(_) => {
                DisconnectReason::ProtocolViolation(err.to_string())
            }
            PeerError::HandshakeRejected(why) => DisconnectReason::HandshakeRejected(why.clone()),
            PeerError::Timeout(kind) => DisconnectReason::Timeout(*kind),
            PeerError::SendQueueFull => DisconnectReason::SlowPeer,
            PeerError::NotConnected | PeerError::AlreadyConnected | PeerError::Disconnected => {
                DisconnectReason::Requested
            }
        }
    }
}
