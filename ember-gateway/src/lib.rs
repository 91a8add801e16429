//! Ember Gateway - sharded Discord Gateway WebSocket client.
#![deny(unsafe_code)]
//!
//! Each [`Shard`] owns one persistent, heartbeated gateway connection; the
//! [`GatewayEngine`] spawns the shards, throttles IDENTIFYs to the
//! concurrency the API declares, and fans received frames out to registered
//! listeners.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use ember_gateway::{GatewayEngine, Intents};
//! use ember_http::RestClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let rest = Arc::new(RestClient::new("your-token")?);
//!
//!     let engine = GatewayEngine::new(rest, Intents::GUILDS);
//!     engine.add_listener("MESSAGE_CREATE", |shard, frame| async move {
//!         println!("shard {}: {frame}", shard.id());
//!     });
//!
//!     engine.start().await?;
//!     Ok(())
//! }
//! ```

use std::time::Duration;

mod engine;
mod error;
mod heartbeat;
mod intents;
mod opcode;
mod payload;
mod ratelimit;
mod shard;

pub use engine::GatewayEngine;
pub use error::{CloseCode, GatewayError};
pub use intents::Intents;
pub use opcode::OpCode;
pub use payload::{
    heartbeat_frame, ConnectionProperties, GatewayPayload, HelloPayload, IdentifyPayload,
    ResumePayload,
};
pub use ratelimit::LeakyGate;
pub use shard::{open_websocket, Shard, ShardState, WsStream};

/// Gateway protocol version, matching the REST API pin.
pub const GATEWAY_VERSION: u8 = 9;

/// Frames a shard may send per [`SEND_WINDOW`], just below Discord's
/// documented 120/60 s cap.
pub(crate) const SEND_RATE: usize = 120;
pub(crate) const SEND_WINDOW: Duration = Duration::from_secs(60);

/// IDENTIFY slots refill this long after each grant.
pub(crate) const IDENTIFY_WINDOW: Duration = Duration::from_secs(5);
