//! agora-collab server.
//!
//! Usage: `agora-collab [config.json] [bind_addr] [data_dir]`

use std::sync::Arc;

use agora_collab::{
    CollabConfig, CollabServer, Collaboration, LogNotifier, RocksDocumentStore, ServerConfig,
    StoreConfig, SystemClock,
};
use log::info;

#[tokio::main]
async fn main() -> Result<(), agora_collab::server::BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => {
            info!("Loading configuration from {path}");
            CollabConfig::load(&path).map_err(|e| format!("{path}: {e}"))?
        }
        None => CollabConfig::default(),
    };
    let server_config = ServerConfig {
        bind_addr: args.next().unwrap_or_else(|| ServerConfig::default().bind_addr),
        ..ServerConfig::default()
    };
    let store_config = match args.next() {
        Some(path) => StoreConfig {
            path: path.into(),
            ..StoreConfig::default()
        },
        None => StoreConfig::default(),
    };

    let store = RocksDocumentStore::open(store_config)?;
    info!("Document store open at {}", store.path().display());

    let core = Arc::new(Collaboration::new(
        config,
        Arc::new(SystemClock),
        Arc::new(store),
        Arc::new(LogNotifier),
    ));
    let _sweeper = core.spawn_sweeper();

    let server = CollabServer::new(server_config, core);
    server.run().await
}
