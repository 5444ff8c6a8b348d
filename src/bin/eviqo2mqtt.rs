//! eviqo2mqtt - Bridge Eviqo EV chargers to MQTT with Home Assistant
//! discovery.
//!
//! 1. Connects to the local MQTT broker (with a Last Will on the bridge
//!    availability topic)
//! 2. Logs in to the vendor dashboard WebSocket and enumerates chargers
//! 3. Publishes discovery documents and retained state snapshots
//! 4. Fans charger telemetry into MQTT and MQTT commands into the charger
//!
//! Exit code 0 on a clean stop, 1 on configuration or fatal startup errors
//! (including rejected credentials).

use anyhow::Result;
use clap::Parser;
use eviqo2mqtt::{Bridge, BridgeConfig, MqttRuntime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

const BRIDGE_NAME: &str = "eviqo2mqtt";

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Bridge Eviqo EV chargers to MQTT with Home Assistant discovery"
)]
struct Args {
    /// Force debug logging regardless of EVIQO_LOG_LEVEL.
    #[arg(long)]
    debug: bool,

    /// Publish empty retained payloads to every discovery topic and exit.
    #[arg(long)]
    remove_discovery: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = BridgeConfig::from_env()?;

    let default_filter = if args.debug {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            log::info!("shutdown requested");
            shutdown.store(true, Ordering::SeqCst);
        })?;
    }

    let (command_tx, command_rx) = mpsc::channel();
    let topics = eviqo2mqtt::TopicScheme::new(&config.discovery_prefix, &config.topic_prefix);
    let runtime = MqttRuntime::connect(
        &config.mqtt_url,
        BRIDGE_NAME,
        &topics.bridge_availability(),
        command_tx,
    )?;
    let publisher = Arc::new(runtime.publisher());

    let mut bridge = Bridge::new(config, publisher, command_rx, shutdown);

    let outcome = if args.remove_discovery {
        bridge.remove_discovery()
    } else {
        bridge.run()
    };

    if let Err(e) = runtime.disconnect() {
        log::warn!("mqtt disconnect: {:#}", e);
    }
    outcome
}
