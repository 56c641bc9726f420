//! veza-comms-probe
//!
//! Connects the communication layer with the configured settings, prints
//! its status and health as JSON, then shuts down. Exits non-zero when any
//! component is unhealthy.
//!
//! ## Usage
//! ```text
//! veza-comms-probe [config.yaml]
//! ```
//!
//! ## Environment Variables
//! - `VEZA_CONFIG`: path to a YAML config file
//! - `VEZA__<SECTION>__<KEY>`: override a single setting
//! - `VEZA_LOG`: log filter (default `info`)

use tracing::{error, info};

use veza_comms::comms::Comms;
use veza_comms::config::Config;
use veza_comms::utils::bootstrap::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let path = std::env::args().nth(1);
    let config = Config::load(path.as_deref()).map_err(|e| {
        error!("Failed to load configuration: {}", e);
        e
    })?;

    info!(
        nats = %config.event_bus.url,
        chat = %config.chat.address,
        stream = %config.stream.address,
        "Probing communication layer"
    );

    let comms = Comms::from_config(&config);
    comms.start().await?;

    let health = comms.health().await;
    let status = comms.status().await;

    println!("{}", serde_json::to_string_pretty(&status)?);
    println!("{}", serde_json::to_string_pretty(&health)?);

    comms.shutdown().await;

    if !health.healthy {
        std::process::exit(1);
    }
    Ok(())
}
