//! Standalone room relay.
//!
//! Usage: `tandem-relay [BIND_ADDR]`. Falls back to `TANDEM_RELAY_ADDR`, then
//! to the default `127.0.0.1:9090`. Log level comes from `RUST_LOG`.

use tandem_collab::relay::{RelayConfig, RoomRelay};

#[tokio::main]
async fn main() {
    env_logger::init();

    let mut config = RelayConfig::default();
    if let Some(addr) = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("TANDEM_RELAY_ADDR").ok())
    {
        config.bind_addr = addr;
    }

    log::info!("Starting tandem relay on {}...", config.bind_addr);
    let relay = RoomRelay::new(config);
    if let Err(e) = relay.run().await {
        log::error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
