//! Standalone relay server binary.
//!
//! Configuration comes from the environment:
//!
//! - `PAIRPAD_BIND` — listen address (default `0.0.0.0:1234`)
//! - `PAIRPAD_ALLOWED_ORIGINS` — comma-separated origin allowlist; empty
//!   admits any origin
//! - `PAIRPAD_REQUIRE_ORIGIN` — set to `1`/`true` to fail closed on
//!   connections without an `Origin` header
//! - `RUST_LOG` — standard env_logger filter

use std::env;
use std::sync::Arc;

use pairpad_collab::{
    MissingOriginPolicy, OriginConfig, RelayServer, RoomRegistry, ServerConfig,
};

fn origins_from_env() -> Vec<String> {
    env::var("PAIRPAD_ALLOWED_ORIGINS")
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let missing_origin = match env::var("PAIRPAD_REQUIRE_ORIGIN").as_deref() {
        Ok("1") | Ok("true") => MissingOriginPolicy::Reject,
        _ => MissingOriginPolicy::Allow,
    };

    let config = ServerConfig {
        bind_addr: env::var("PAIRPAD_BIND").unwrap_or_else(|_| "0.0.0.0:1234".to_string()),
        origin: OriginConfig {
            allowed_origins: origins_from_env(),
            missing_origin,
        },
        ..ServerConfig::default()
    };

    log::info!(
        "starting relay on {} (allowed origins: {:?}, missing origin: {:?})",
        config.bind_addr,
        config.origin.allowed_origins,
        config.origin.missing_origin
    );

    let registry = Arc::new(RoomRegistry::new(config.broadcast_capacity));
    let server = RelayServer::new(config, registry);
    if let Err(e) = server.run().await {
        log::error!("relay exited: {e}");
        std::process::exit(1);
    }
}
