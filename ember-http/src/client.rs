//! Discord REST client implementation.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, USER_AGENT};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::HttpError;
use crate::file::File;
use crate::ratelimit::RateLimitManager;
use crate::route::Route;
use crate::types::{GatewayBot, GatewayInfo};
use crate::API_BASE;

/// User agent for requests.
const USER_AGENT_VALUE: &str = concat!(
    "DiscordBot (https://github.com/emberbot/ember-rs, ",
    env!("CARGO_PKG_VERSION"),
    ")"
);

/// Total attempts per request; covers 429 and 5xx retries.
const MAX_ATTEMPTS: u32 = 3;

/// How to decode a response body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    Bytes,
    Text,
    #[default]
    Json,
    /// Discard the body.
    None,
}

/// A response body decoded per [`ResponseFormat`].
#[derive(Debug, Clone)]
pub enum ResponseBody {
    Bytes(Vec<u8>),
    Text(String),
    Json(Value),
    None,
}

impl ResponseBody {
    /// The decoded JSON document, when the request asked for one.
    ///
    /// Empty 2xx bodies (204-style responses) decode as `Value::Null`.
    pub fn into_json(self) -> Option<Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }
}

/// Options for a single request.
#[derive(Debug, Default)]
pub struct RequestOptions {
    files: Vec<File>,
    json: Option<Value>,
    query: Vec<(String, String)>,
    reason: Option<String>,
}

impl RequestOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// JSON body. Sent as `application/json`, or as the `payload_json`
    /// multipart field when files are attached.
    pub fn json(mut self, body: Value) -> Self {
        self.json = Some(body);
        self
    }

    /// Attach a file; forces multipart encoding.
    pub fn file(mut self, file: File) -> Self {
        self.files.push(file);
        self
    }

    /// Add a query-string parameter.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Audit log reason, sent as `X-Audit-Log-Reason`.
    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Body of a 429 response.
#[derive(Debug, serde::Deserialize)]
struct RateLimited {
    #[serde(default)]
    global: bool,
    /// Seconds until the limit resets.
    retry_after: f64,
}

/// Discord REST API client.
///
/// One instance is shared by every caller in the process: the underlying
/// HTTP connection pool, the bot token, and all rate-limit state live here.
pub struct RestClient {
    /// Inner HTTP client.
    http: Client,
    /// Bot token.
    token: String,
    /// API base used by the client's own discovery endpoints.
    api_base: String,
    /// Rate limiter.
    limiter: RateLimitManager,
}

impl RestClient {
    /// Create a new REST client with the given bot token.
    pub fn new(token: impl Into<String>) -> Result<Self, HttpError> {
        let token = token.into();

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bot {token}"))?);
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        headers.insert("X-RateLimit-Precision", HeaderValue::from_static("millisecond"));

        let http = Client::builder().default_headers(headers).build()?;

        Ok(Self {
            http,
            token,
            api_base: API_BASE.to_string(),
            limiter: RateLimitManager::new(),
        })
    }

    /// Point the client's own endpoints at a custom API base. Testing.
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    /// The bot token.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The API base this client's discovery endpoints resolve against.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }

    // =========================================================================
    // Gateway Endpoints
    // =========================================================================

    /// Get the gateway WebSocket URL.
    pub async fn get_gateway(&self) -> Result<GatewayInfo, HttpError> {
        let route = Route::with_api_base(&self.api_base, "/gateway", &[]);
        self.fetch(Method::GET, &route, RequestOptions::new()).await
    }

    /// Get gateway bot information: the WebSocket URL, the recommended shard
    /// count, and the session start limits.
    pub async fn get_gateway_bot(&self) -> Result<GatewayBot, HttpError> {
        let route = Route::with_api_base(&self.api_base, "/gateway/bot", &[]);
        self.fetch(Method::GET, &route, RequestOptions::new()).await
    }

    // =========================================================================
    // Request Methods
    // =========================================================================

    /// `GET` a route, decoding the response as JSON.
    pub async fn get(&self, route: &Route, options: RequestOptions) -> Result<ResponseBody, HttpError> {
        self.request(Method::GET, route, options, ResponseFormat::Json).await
    }

    /// `POST` to a route, decoding the response as JSON.
    pub async fn post(&self, route: &Route, options: RequestOptions) -> Result<ResponseBody, HttpError> {
        self.request(Method::POST, route, options, ResponseFormat::Json).await
    }

    /// `PATCH` a route, decoding the response as JSON.
    pub async fn patch(&self, route: &Route, options: RequestOptions) -> Result<ResponseBody, HttpError> {
        self.request(Method::PATCH, route, options, ResponseFormat::Json).await
    }

    /// `PUT` to a route, decoding the response as JSON.
    pub async fn put(&self, route: &Route, options: RequestOptions) -> Result<ResponseBody, HttpError> {
        self.request(Method::PUT, route, options, ResponseFormat::Json).await
    }

    /// `DELETE` a route, discarding the response body.
    pub async fn delete(&self, route: &Route, options: RequestOptions) -> Result<ResponseBody, HttpError> {
        self.request(Method::DELETE, route, options, ResponseFormat::None).await
    }

    /// Execute a request and deserialize its JSON body into `T`.
    pub async fn fetch<T: DeserializeOwned>(
        &self,
        method: Method,
        route: &Route,
        options: RequestOptions,
    ) -> Result<T, HttpError> {
        match self.request(method, route, options, ResponseFormat::Json).await? {
            ResponseBody::Json(value) => Ok(serde_json::from_value(value)?),
            _ => Err(HttpError::Internal("expected a json response".into())),
        }
    }

    /// Make a request to the Discord API, following rate limits.
    ///
    /// Up to three attempts: 429s adjust rate-limit state and retry under
    /// the new gates, 5xx responses retry after a 1 s / 3 s backoff, and
    /// every other failure status maps straight to its [`HttpError`] kind.
    pub async fn request(
        &self,
        method: Method,
        route: &Route,
        options: RequestOptions,
        format: ResponseFormat,
    ) -> Result<ResponseBody, HttpError> {
        for attempt in 0..MAX_ATTEMPTS {
            // Global gate first, then the route's bucket. The guard spans
            // the round-trip and any backoff, so bucket peers stay queued.
            let mut guard = self.limiter.acquire(route.bucket()).await?;

            let mut request = self.http.request(method.clone(), route.url());

            if !options.query.is_empty() {
                request = request.query(&options.query);
            }
            if let Some(reason) = &options.reason {
                request = request.header("X-Audit-Log-Reason", reason);
            }

            if !options.files.is_empty() {
                // Multipart parts are rebuilt from owned bytes on every
                // attempt, so a retried upload starts from the origin.
                let mut form = Form::new();
                for file in &options.files {
                    form = form.part(file.field_name(), file.to_part());
                }
                if let Some(json) = &options.json {
                    form = form.part(
                        "payload_json",
                        Part::text(serde_json::to_string(json)?).mime_str("application/json")?,
                    );
                }
                request = request.multipart(form);
            } else if let Some(json) = &options.json {
                request = request.json(json);
            }

            debug!(method = %method, url = %route.url(), bucket = %route.bucket(), attempt, "sending request");

            let response = request.send().await?;
            let status = response.status();

            let reset_after = header_f64(&response, "X-RateLimit-Reset-After").unwrap_or(0.0);
            let remaining = header_i64(&response, "X-RateLimit-Remaining").unwrap_or(1);

            if status.is_success() {
                if remaining == 0 {
                    // The next request in this bucket would be a guaranteed
                    // 429; hold the bucket until the window resets.
                    guard.defer(seconds(reset_after));
                }
                return decode(response, format).await;
            }

            let body = response.bytes().await?.to_vec();
            let mut backoff = Duration::ZERO;

            if status == StatusCode::TOO_MANY_REQUESTS {
                match serde_json::from_slice::<RateLimited>(&body) {
                    Ok(limited) => {
                        let retry_after = seconds(limited.retry_after);
                        if limited.global {
                            self.limiter.close_global(retry_after);
                        } else {
                            guard.defer(retry_after);
                        }
                    }
                    Err(error) => warn!(%error, "unparseable 429 body"),
                }
            } else if status.is_server_error() {
                backoff = Duration::from_secs(u64::from(1 + attempt * 2));
            } else {
                return Err(HttpError::from_response(status.as_u16(), body));
            }

            if attempt == MAX_ATTEMPTS - 1 {
                return Err(HttpError::from_response(status.as_u16(), body));
            }

            warn!(
                status = status.as_u16(),
                backoff_ms = backoff.as_millis() as u64,
                attempt,
                "retrying request"
            );
            sleep(backoff).await;
        }

        Err(HttpError::Internal("retry budget exhausted".into()))
    }
}

/// Decode a successful response per the requested format.
async fn decode(response: Response, format: ResponseFormat) -> Result<ResponseBody, HttpError> {
    match format {
        ResponseFormat::Bytes => Ok(ResponseBody::Bytes(response.bytes().await?.to_vec())),
        ResponseFormat::Text => Ok(ResponseBody::Text(response.text().await?)),
        ResponseFormat::Json => {
            let bytes = response.bytes().await?;
            if bytes.is_empty() {
                // 204-style responses carry no document.
                Ok(ResponseBody::Json(Value::Null))
            } else {
                Ok(ResponseBody::Json(serde_json::from_slice(&bytes)?))
            }
        }
        ResponseFormat::None => Ok(ResponseBody::None),
    }
}

/// A fractional-seconds duration from a header or body value.
///
/// Negative or non-finite inputs clamp to zero rather than panicking.
fn seconds(value: f64) -> Duration {
    Duration::try_from_secs_f64(value).unwrap_or_default()
}

fn header_f64(response: &Response, name: &str) -> Option<f64> {
    response.headers().get(name)?.to_str().ok()?.parse().ok()
}

fn header_i64(response: &Response, name: &str) -> Option<i64> {
    response.headers().get(name)?.to_str().ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = RestClient::new("test_token");
        assert!(client.is_ok());
    }

    #[test]
    fn test_api_base_override() {
        let client = RestClient::new("t").unwrap().with_api_base("http://127.0.0.1:1");
        assert_eq!(client.api_base(), "http://127.0.0.1:1");
    }

    #[test]
    fn test_seconds_clamps_bad_input() {
        assert_eq!(seconds(-1.0), Duration::ZERO);
        assert_eq!(seconds(f64::NAN), Duration::ZERO);
        assert_eq!(seconds(0.25), Duration::from_millis(250));
    }
}
