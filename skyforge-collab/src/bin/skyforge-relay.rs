//! Standalone relay for Skyforge collaboration rooms.
//!
//! `SKYFORGE_RELAY_ADDR` and `SKYFORGE_RELAY_PATH` override the bind address
//! and the room path prefix; `RUST_LOG` controls logging.

use std::sync::Arc;

use log::info;
use skyforge_collab::relay::{RelayConfig, RelayServer};

#[tokio::main]
async fn main() -> Result<(), skyforge_collab::CollabError> {
    env_logger::init();

    let config = RelayConfig::from_env();
    info!("Starting Skyforge relay on {}...", config.bind_addr);

    let server = Arc::new(RelayServer::new(config));
    let signal = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal.shutdown();
        }
    });

    server.run().await
}
