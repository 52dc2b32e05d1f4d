//! Callbacks for messages coming from a peer.
//!
//! Every method has an empty default, so implementors only override what they care about.
//! All of them are called from the peer's read loop, one at a time and in the order messages
//! arrived. A slow callback delays the next message of that peer, and nothing else. Calling
//! [Peer::wait_for_disconnect] from inside a callback never returns, since teardown waits for
//! the read loop.
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_filter::CFilter;
use bitcoin::p2p::message_filter::GetCFilters;
use bitcoin::p2p::message_network::Reject;
use bitcoin::p2p::message_network::VersionMessage;

use super::error::DisconnectReason;
use super::peer::Peer;

pub trait MessageListener: Send + Sync {
    /// Called for every message read, before anything else happens with it
    fn on_read(&self, _peer: &Peer, _message: &NetworkMessage) {}

    /// Called for every message after it's fully written to the connection
    fn on_write(&self, _peer: &Peer, _message: &NetworkMessage) {}

    /// The remote's version passed our own checks. Returning a reject refuses the
    /// connection, the reject is sent to the peer and we disconnect.
    fn on_version(&self, _peer: &Peer, _version: &VersionMessage) -> Option<Reject> {
        None
    }

    /// Handshake is complete, the peer is ready
    fn on_verack(&self, _peer: &Peer) {}

    fn on_ping(&self, _peer: &Peer, _nonce: u64) {}

    fn on_pong(&self, _peer: &Peer, _nonce: u64) {}

    fn on_inv(&self, _peer: &Peer, _inventory: &[Inventory]) {}

    fn on_get_data(&self, _peer: &Peer, _inventory: &[Inventory]) {}

    fn on_not_found(&self, _peer: &Peer, _inventory: &[Inventory]) {}

    /// Called before we answer the request from our own filters, if we have any
    fn on_get_cfilters(&self, _peer: &Peer, _request: &GetCFilters) {}

    fn on_cfilter(&self, _peer: &Peer, _filter: &CFilter) {}

    fn on_reject(&self, _peer: &Peer, _reject: &Reject) {}

    /// The peer is gone and all of its tasks are done. Called exactly once.
    fn on_disconnect(&self, _peer: &Peer, _reason: &DisconnectReason) {}
}

/// A listener that doesn't care about anything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl MessageListener for NoopListener {}
