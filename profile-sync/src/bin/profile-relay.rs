//! Relay node binary.
//!
//! ```text
//! RUST_LOG=info profile-relay [bind_addr]
//! ```

use profile_sync::{RelayServer, ServerConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let mut config = ServerConfig::from_env();
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr;
    }
    log::info!(
        "Starting relay (max {} peers per room, broadcast capacity {})",
        config.max_peers_per_room,
        config.broadcast_capacity
    );

    RelayServer::new(config).run().await
}
