//! Wire payloads sent to and received from the gateway.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::intents::Intents;
use crate::opcode::OpCode;

/// Envelope for an outbound payload.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayPayload<D> {
    /// Opcode for the payload.
    pub op: OpCode,

    /// Payload data.
    pub d: D,
}

impl<D: Serialize> GatewayPayload<D> {
    pub fn new(op: OpCode, data: D) -> Self {
        Self { op, d: data }
    }
}

/// Data for op 10 HELLO, received immediately after connecting.
#[derive(Debug, Clone, Deserialize)]
pub struct HelloPayload {
    /// Interval between heartbeats, in milliseconds.
    pub heartbeat_interval: u64,
}

/// Data for op 2 IDENTIFY.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyPayload {
    /// Authentication token.
    pub token: String,

    /// Connection properties.
    pub properties: ConnectionProperties,

    /// Gateway intents.
    pub intents: Intents,

    /// `[shard_id, shard_count]`.
    pub shard: [u16; 2],
}

/// Connection properties reported when identifying.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties {
    #[serde(rename = "$os")]
    pub os: String,

    #[serde(rename = "$browser")]
    pub browser: String,

    #[serde(rename = "$device")]
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "Ember".to_string(),
            device: "Ember".to_string(),
        }
    }
}

/// Data for op 6 RESUME.
#[derive(Debug, Clone, Serialize)]
pub struct ResumePayload {
    /// Authentication token.
    pub token: String,

    /// Session ID from the previous READY.
    pub session_id: String,

    /// Last sequence number received.
    pub seq: Option<u64>,
}

/// Build a heartbeat frame carrying the current sequence, or null.
pub fn heartbeat_frame(seq: Option<u64>) -> Value {
    json!({ "op": OpCode::Heartbeat, "d": seq })
}
