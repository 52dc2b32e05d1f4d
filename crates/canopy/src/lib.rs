// SPDX-License-Identifier: MIT

//! Canopy is the p2p layer of a node: [wire] holds the peer engine, that owns one
//! connection and speaks the protocol on it, and [compact_filters] holds the filter cache
//! peers serve `getcfilters` from.

/// Useful macros and data structures used by the other crates.
pub use canopy_common as common;
/// Compact block filters: a byte-budgeted cache and a read-through layer over a store.
pub use canopy_compact_filters as compact_filters;
/// Message framing and the peer engine.
pub use canopy_wire as wire;
