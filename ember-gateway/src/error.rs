//! Gateway errors and close-code policy.

use thiserror::Error;

/// Errors that can occur during gateway operations.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// REST failure, e.g. while discovering the gateway URL.
    #[error("http error: {0}")]
    Http(#[from] ember_http::HttpError),

    /// WebSocket connection or protocol error.
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Failed to decode a gateway frame.
    #[error("json decode error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("url parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// The websocket open timeout elapsed.
    #[error("timed out opening websocket")]
    ConnectTimeout,

    /// The connection closed; `code` is the close code when one was sent.
    #[error("connection closed: code={code:?}, reason={reason}")]
    Closed {
        code: Option<u16>,
        reason: String,
    },

    /// A heartbeat went a full interval without acknowledgement.
    #[error("heartbeat acknowledgement missed")]
    MissedAck,

    /// The server requested a reconnect (op 7).
    #[error("server requested reconnect")]
    Reconnect,

    /// The session was invalidated (op 9).
    #[error("session invalidated")]
    InvalidSession,

    /// An internal channel or gate shut down underneath the shard.
    #[error("shard channel closed")]
    ChannelClosed,
}

/// Discord gateway close codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum CloseCode {
    /// Unknown error.
    UnknownError = 4000,
    /// Invalid opcode sent.
    UnknownOpcode = 4001,
    /// Invalid payload sent.
    DecodeError = 4002,
    /// Payload sent before identifying.
    NotAuthenticated = 4003,
    /// Invalid token.
    AuthenticationFailed = 4004,
    /// Already identified.
    AlreadyAuthenticated = 4005,
    /// Invalid sequence number on resume.
    InvalidSeq = 4007,
    /// Payloads sent too quickly.
    RateLimited = 4008,
    /// Session timed out.
    SessionTimedOut = 4009,
    /// Invalid shard configuration.
    InvalidShard = 4010,
    /// Sharding is required for this bot.
    ShardingRequired = 4011,
    /// Invalid API version.
    InvalidApiVersion = 4012,
    /// Invalid intents bitfield.
    InvalidIntents = 4013,
    /// Privileged intent not enabled for this bot.
    DisallowedIntents = 4014,
}

impl CloseCode {
    /// Convert a raw close code, if known.
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            4000 => Some(Self::UnknownError),
            4001 => Some(Self::UnknownOpcode),
            4002 => Some(Self::DecodeError),
            4003 => Some(Self::NotAuthenticated),
            4004 => Some(Self::AuthenticationFailed),
            4005 => Some(Self::AlreadyAuthenticated),
            4007 => Some(Self::InvalidSeq),
            4008 => Some(Self::RateLimited),
            4009 => Some(Self::SessionTimedOut),
            4010 => Some(Self::InvalidShard),
            4011 => Some(Self::ShardingRequired),
            4012 => Some(Self::InvalidApiVersion),
            4013 => Some(Self::InvalidIntents),
            4014 => Some(Self::DisallowedIntents),
            _ => None,
        }
    }

    /// Codes that terminate the process instead of reconnecting.
    pub const fn is_fatal(self) -> bool {
        matches!(
            self,
            Self::NotAuthenticated
                | Self::AuthenticationFailed
                | Self::InvalidApiVersion
                | Self::InvalidIntents
                | Self::DisallowedIntents
        )
    }

    /// Codes after which the session and sequence must be discarded before
    /// reconnecting.
    pub const fn clears_session(self) -> bool {
        matches!(
            self,
            Self::InvalidSeq | Self::RateLimited | Self::SessionTimedOut
        )
    }
}
