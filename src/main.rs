//! backend-core server.
//!
//! # Architecture Overview
//!
//! ```text
//!                   ┌──────────────────────────────────────────────────────┐
//!                   │                    BACKEND CORE                      │
//!                   │                                                      │
//!   TCP clients ────┼─▶ net::listener ─▶ net::server ─▶ handlers           │
//!                   │                                    │ EVENT           │
//!                   │                                    ▼                 │
//!   Admin API ──────┼─▶ admin ──────────────────▶ events::manager          │
//!                   │     │                        │ flush / cleanup       │
//!                   │     │ http-retry             ▼                       │
//!                   │     ▼                  events::store                 │
//!                   │  resilience::retries ──▶ circuit_breaker ──▶ HTTP ───┼──▶ Dependencies
//!                   │                                                      │
//!                   │  lifecycle: scheduler · shutdown · signals · startup │
//!                   │  observability: logging · metrics · guard            │
//!                   └──────────────────────────────────────────────────────┘
//! ```

use clap::Parser;
use std::path::PathBuf;

use backend_core::config::loader::load_or_default;
use backend_core::lifecycle::signals::spawn_signal_handler;
use backend_core::observability::{logging, metrics};
use backend_core::App;

#[derive(Parser)]
#[command(name = "backend-core", version, about = "Backend core services")]
struct Args {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_or_default(args.config.as_deref())?;

    logging::init(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "backend-core starting");

    tracing::info!(
        tcp_address = %config.tcp.bind_address,
        max_connections = config.tcp.max_connections,
        admin_enabled = config.admin.enabled,
        event_store = config.events.store_path.as_deref().unwrap_or("memory"),
        "Configuration loaded"
    );

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => metrics::init_metrics(addr),
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let app = App::build(config).await?;
    spawn_signal_handler(app.shutdown_handle());
    app.run().await?;
    Ok(())
}
