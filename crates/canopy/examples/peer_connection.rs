// SPDX-License-Identifier: MIT

//! Two peers talking to each other over localhost. One side serves compact filters from an
//! in-memory store, the other one announces a few transactions and asks for filters.
//!
//! Run with `cargo run --example peer-connection -- --debug` to see every message, and pass
//! `--config <file>` to load the `[peer]` and `[filters]` settings from a TOML file instead
//! of the built-in ones.

use std::fmt::Arguments;
use std::sync::Arc;

use bitcoin::bip158::BlockFilter;
use bitcoin::hashes::Hash;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_filter::CFilter;
use bitcoin::p2p::message_filter::GetCFilters;
use bitcoin::BlockHash;
use bitcoin::Txid;
use canopy::compact_filters::FilterCache;
use canopy::compact_filters::MemoryFilterStore;
use canopy::compact_filters::NetworkFilters;
use canopy::wire::config_file::ConfigFile;
use canopy::wire::DisconnectReason;
use canopy::wire::MessageListener;
use canopy::wire::Peer;
use canopy::wire::PeerConfig;
use fern::colors::Color;
use fern::colors::ColoredLevelConfig;
use fern::FormatCallback;
use log::info;
use log::Record;
use tokio::net::TcpListener;
use tokio::sync::mpsc::unbounded_channel;
use tokio::sync::mpsc::UnboundedSender;

const BLOCKS: usize = 5;

const DEFAULT_CONFIG: &str = r#"
[peer]
network = "regtest"
trickle_interval = 1000

[filters]
cache_size = 1048576
"#;

enum Event {
    Ready,
    Inv(usize),
    CFilter,
}

/// Logs whatever the peer tells us and forwards the interesting bits to `main`
struct DemoListener {
    name: &'static str,
    events: UnboundedSender<Event>,
}

impl MessageListener for DemoListener {
    fn on_verack(&self, peer: &Peer) {
        info!(
            "[{}] peer {} is ready, speaking version {}",
            self.name,
            peer.id(),
            peer.protocol_version()
        );
        let _ = self.events.send(Event::Ready);
    }

    fn on_inv(&self, peer: &Peer, inventory: &[Inventory]) {
        info!(
            "[{}] peer {} announced {} items",
            self.name,
            peer.id(),
            inventory.len()
        );
        let _ = self.events.send(Event::Inv(inventory.len()));
    }

    fn on_cfilter(&self, _peer: &Peer, filter: &CFilter) {
        info!(
            "[{}] got a {} byte filter for block {}",
            self.name,
            filter.filter.len(),
            filter.block_hash
        );
        let _ = self.events.send(Event::CFilter);
    }

    fn on_disconnect(&self, peer: &Peer, reason: &DisconnectReason) {
        info!("[{}] peer {} is gone: {reason}", self.name, peer.id());
    }
}

fn setup_logger(debug: bool) -> Result<(), fern::InitError> {
    let colors = ColoredLevelConfig::new()
        .error(Color::Red)
        .warn(Color::Yellow)
        .info(Color::Green)
        .debug(Color::Blue)
        .trace(Color::BrightBlack);

    fern::Dispatch::new()
        .format(move |out: FormatCallback, message: &Arguments, record: &Record| {
            out.finish(format_args!(
                "[{} {}] {}",
                colors.color(record.level()),
                record.target(),
                message
            ))
        })
        .level(if debug {
            log::LevelFilter::Debug
        } else {
            log::LevelFilter::Info
        })
        .chain(std::io::stdout())
        .apply()?;

    Ok(())
}

fn block_hash(height: usize) -> BlockHash {
    BlockHash::from_byte_array([height as u8 + 1; 32])
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = std::env::args().collect();
    let debug = args.iter().any(|arg| arg == "--debug");
    setup_logger(debug).expect("failed to set up the logger");

    let config_path = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1));
    let file = match config_path {
        Some(path) => ConfigFile::from_file(path),
        None => ConfigFile::from_str_config(DEFAULT_CONFIG),
    }
    .expect("couldn't load the config");

    // A tiny chain, with one filter per block. A real node would use its block database.
    let store = Arc::new(MemoryFilterStore::new());
    for height in 0..BLOCKS {
        store
            .push_block(block_hash(height), BlockFilter::new(&[height as u8; 16]))
            .expect("memory store never fails");
    }
    let filters = Arc::new(NetworkFilters::new(
        store,
        Arc::new(FilterCache::new(file.filter_cache_size())),
    ));

    let (server_events, mut server_rx) = unbounded_channel();
    let (client_events, mut client_rx) = unbounded_channel();

    // Both peers live in this process, so they'd see each other's nonces
    let base = file.apply(PeerConfig {
        allow_self_connections: true,
        ..Default::default()
    });
    info!("running on {}", base.network);
    let server_config = PeerConfig {
        user_agent_name: "server".into(),
        listener: Arc::new(DemoListener {
            name: "server",
            events: server_events,
        }),
        filters: Some(filters),
        ..base.clone()
    };
    let client_config = PeerConfig {
        user_agent_name: "client".into(),
        listener: Arc::new(DemoListener {
            name: "client",
            events: client_events,
        }),
        ..base
    };

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("couldn't bind a local port");
    let address = listener.local_addr().expect("bound listener has an address");
    info!("listening on {address}");

    let accept = tokio::spawn(async move { Peer::accept(server_config, &listener).await });
    let client = Peer::dial(client_config, address)
        .await
        .expect("couldn't connect");
    let server = accept
        .await
        .expect("accept task panicked")
        .expect("couldn't accept");

    for events in [&mut server_rx, &mut client_rx] {
        while let Some(event) = events.recv().await {
            if let Event::Ready = event {
                break;
            }
        }
    }

    // Queued twice, announced once
    for n in [1u8, 2, 1, 3] {
        let txid = Txid::from_byte_array([n; 32]);
        client
            .queue_inventory(Inventory::Transaction(txid))
            .expect("client is connected");
    }

    while let Some(event) = server_rx.recv().await {
        if let Event::Inv(count) = event {
            info!("server got {count} announcements in one inv");
            break;
        }
    }

    client
        .send_message(NetworkMessage::GetCFilters(GetCFilters {
            filter_type: 0,
            start_height: 0,
            stop_hash: block_hash(BLOCKS - 1),
        }))
        .expect("client is connected");

    let mut received = 0;
    while let Some(event) = client_rx.recv().await {
        if let Event::CFilter = event {
            received += 1;
        }

        if received == BLOCKS {
            break;
        }
    }

    info!(
        "client round trip is {:?}, closing",
        client.average_rtt().or(client.last_rtt())
    );
    client.disconnect();
    client.wait_for_disconnect().await;
    server.wait_for_disconnect().await;
}
