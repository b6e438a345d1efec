//! # mqtt-bridge
//!
//! A reliable MQTT bridge core for IoT dashboards and automation layers:
//! it keeps a durable broker connection, multiplexes publish/subscribe
//! traffic, buffers inbound messages for polling consumers, and recovers
//! from network failures without losing subscriptions or silently dropping
//! control commands.
//!
//! ## Architecture
//!
//! ```text
//! bridge.rs     - MqttBridge facade (connect, subscribe, publish, status)
//!    |
//!    +-- transport.rs - connection state machine, reconnect with backoff
//!    +-- session.rs   - desired subscription set, replay on reconnect
//!    +-- dispatch.rs  - outbound queue, ack tracking, retry budget
//!    +-- buffer.rs    - bounded ring of the most recent inbound messages
//! ```
//!
//! Two background workers do all the blocking: the transport worker owns
//! the network event loop and the reconnect logic, the dispatch worker
//! drains the outbound queue. Every public entry point returns without
//! touching the network.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use mqtt_bridge::{BridgeConfig, MqttBridge, QosLevel};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let bridge = MqttBridge::new(BridgeConfig::default());
//! bridge.connect().await?;
//! bridge.subscribe("home/sensors", QosLevel::AtLeastOnce).await?;
//!
//! let mut handle =
//!     bridge.publish("home/controls", b"Turn ON Light".to_vec(), QosLevel::AtLeastOnce)?;
//! println!("delivery: {:?}", handle.wait().await);
//!
//! for message in bridge.recent_messages(10) {
//!     println!("{message}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod buffer;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod session;
pub mod transport;

pub use bridge::MqttBridge;
pub use buffer::InboundBuffer;
pub use config::BridgeConfig;
pub use error::{BridgeError, ConfigError, ConnectError, PublishError};
pub use message::{CommandHandle, DeliveryState, InboundMessage, QosLevel};
pub use session::SessionManager;
pub use transport::{ConnectionState, ConnectionStatus};
