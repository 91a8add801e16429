//! Response models for the gateway discovery endpoints.

use serde::Deserialize;

/// Response from `GET /gateway`.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayInfo {
    /// Gateway WebSocket URL.
    pub url: String,
}

/// Response from `GET /gateway/bot`.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayBot {
    /// Gateway WebSocket URL.
    pub url: String,

    /// Recommended number of shards.
    pub shards: u16,

    /// Session start limit information.
    pub session_start_limit: SessionStartLimit,
}

/// Session start limit from `/gateway/bot`.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionStartLimit {
    /// Total number of session starts allowed.
    pub total: u32,

    /// Remaining session starts.
    pub remaining: u32,

    /// Milliseconds until the limit resets.
    pub reset_after: u64,

    /// Maximum number of IDENTIFYs per 5-second window.
    pub max_concurrency: u32,
}
