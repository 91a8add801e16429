//! Request routing and rate-limit bucket keys.

use std::fmt::Display;

use crate::API_BASE;

/// Placeholder used in bucket keys for absent major parameters.
const ABSENT: &str = "none";

/// A resolved API route: the request URL plus its rate-limit bucket key.
///
/// The bucket key is the *unformatted* path template joined with the three
/// major parameters (`channel_id`, `guild_id`, `webhook_id`). Routes that
/// differ only in non-major parameters share a bucket; routes that differ in
/// a major parameter do not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    url: String,
    bucket: String,
}

impl Route {
    /// Resolve a path template against the default API base.
    ///
    /// `params` maps placeholder names to values; each `{name}` in the
    /// template is substituted with the matching value's display form.
    pub fn new(path: &str, params: &[(&str, &dyn Display)]) -> Self {
        Self::with_api_base(API_BASE, path, params)
    }

    /// Resolve a path template against a custom API base.
    ///
    /// Intended for tests pointed at a local server.
    pub fn with_api_base(api_base: &str, path: &str, params: &[(&str, &dyn Display)]) -> Self {
        let mut url = String::with_capacity(api_base.len() + path.len());
        url.push_str(api_base);
        url.push_str(&expand(path, params));

        let major = |name: &str| {
            params
                .iter()
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value.to_string())
                .unwrap_or_else(|| ABSENT.to_string())
        };

        let bucket = format!(
            "{}:{}/{}/{}",
            path,
            major("channel_id"),
            major("guild_id"),
            major("webhook_id"),
        );

        Self { url, bucket }
    }

    /// The fully substituted request URL.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The rate-limit bucket key.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// Substitute `{name}` placeholders. Placeholders with no matching parameter
/// pass through untouched.
fn expand(path: &str, params: &[(&str, &dyn Display)]) -> String {
    let mut out = String::with_capacity(path.len());
    let mut rest = path;

    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        rest = &rest[open..];

        match rest.find('}') {
            Some(close) => {
                let name = &rest[1..close];
                match params.iter().find(|(key, _)| *key == name) {
                    Some((_, value)) => out.push_str(&value.to_string()),
                    None => out.push_str(&rest[..=close]),
                }
                rest = &rest[close + 1..];
            }
            None => break,
        }
    }

    out.push_str(rest);
    out
}
