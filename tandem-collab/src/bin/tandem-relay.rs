//! Relay server binary.
//!
//! Configuration comes from the environment:
//! `TANDEM_BIND` (default `127.0.0.1:9090`), `TANDEM_MAX_PEERS`,
//! `TANDEM_HEARTBEAT_SECS`. Log level via `RUST_LOG`.

use log::{error, info};

use tandem_collab::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting tandem relay on {} (max {} peers per room)",
        config.bind_addr, config.max_peers_per_room
    );

    let server = SyncServer::new(config);
    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Relay stopped: {e}");
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} rooms open",
                stats.total_connections, stats.active_rooms
            );
        }
    }
}
