//! Command-line monitor for the bridge.
//!
//! Connects to the configured broker, subscribes to the sensor topic,
//! fires a demo control command and prints the connection status plus the
//! most recent messages once per second until interrupted.

use std::path::PathBuf;
use std::time::Duration;

use color_eyre::Result;
use mqtt_bridge::{BridgeConfig, MqttBridge, QosLevel};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const SENSOR_TOPIC: &str = "home/sensors";
const CONTROL_TOPIC: &str = "home/controls";

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = match std::env::args().nth(1) {
        Some(path) => BridgeConfig::from_file(&PathBuf::from(path))?,
        None => BridgeConfig::load(),
    };
    info!(broker = %config.broker_address(), "starting bridge monitor");

    let bridge = MqttBridge::new(config);
    bridge.connect().await?;
    bridge.subscribe(SENSOR_TOPIC, QosLevel::AtLeastOnce).await?;

    let mut handle = bridge.publish_default(CONTROL_TOPIC, b"Turn ON Light".to_vec())?;
    tokio::spawn(async move {
        let state = handle.wait().await;
        info!(command = handle.id(), ?state, "control command settled");
    });

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let status = bridge.status();
                match &status.last_error {
                    Some(error) => {
                        warn!(state = %status.state, retries = status.retry_count, "{error}")
                    }
                    None => info!(state = %status.state, "broker link"),
                }
                for message in bridge.recent_messages(10) {
                    println!("{message}");
                }
            }
        }
    }

    info!("shutting down");
    bridge.shutdown().await;
    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();
    Ok(())
}
