// SPDX-License-Identifier: MIT

//! # canopy-cli - A command line interface for a canopy node
//!
//! A canopy node exposes a json-rpc interface over HTTP(S). This crate provides a small
//! blocking client for it, usable from the bundled `canopy-cli` binary or from your own
//! application. The client can go through a SOCKS5 proxy and trust a custom TLS root
//! certificate.

pub mod error;
pub mod rpc_client;

pub use error::Error;
pub use rpc_client::RpcClient;
pub use rpc_client::RpcConfig;
