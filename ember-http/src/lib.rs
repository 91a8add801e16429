//! Ember HTTP - rate-limit-aware Discord REST API client.
#![deny(unsafe_code)]
//!
//! This crate implements the REST half of the Ember runtime: a single shared
//! HTTP client that executes Discord API calls under per-route bucket rate
//! limits and the global rate limit, retries transient failures, and maps
//! error statuses onto a typed error enum.
//!
//! Requests are addressed by [`Route`], which pairs the request URL with the
//! rate-limit bucket key Discord derives from the route template and its
//! major parameters.
//!
//! # Example
//!
//! ```ignore
//! use ember_http::{Method, RequestOptions, RestClient, Route};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ember_http::HttpError> {
//!     let client = RestClient::new("your-token")?;
//!
//!     let route = Route::new("/channels/{channel_id}/messages", &[("channel_id", &1234u64)]);
//!     let options = RequestOptions::new().json(serde_json::json!({ "content": "hello" }));
//!     client.post(&route, options).await?;
//!
//!     Ok(())
//! }
//! ```

mod client;
mod error;
mod file;
mod ratelimit;
mod route;
mod types;

pub use client::{RequestOptions, ResponseBody, ResponseFormat, RestClient};
pub use error::{ErrorResponse, HttpError};
pub use file::File;
pub use ratelimit::{BucketGuard, BucketLock, RateLimitManager};
pub use route::Route;
pub use types::{GatewayBot, GatewayInfo, SessionStartLimit};

pub use reqwest::Method;

/// Discord API base URL.
pub const API_BASE: &str = "https://discord.com/api/v9";
