//! Per-request defaults.
//!
//! # Design
//! A `RequestConfig` is copied into each `Request` at construction. Values
//! can come from code, from a JSON document, or from `XHR_*` environment
//! variables; absent keys fall back to `Default`.

use std::time::Duration;

use serde::Deserialize;

use crate::error::RequestError;

pub const ENV_USER_AGENT: &str = "XHR_USER_AGENT";
pub const ENV_TIMEOUT_MS: &str = "XHR_TIMEOUT_MS";
pub const ENV_CHARSET: &str = "XHR_CHARSET";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Installed as the `User-Agent` header of every new request.
    pub user_agent: String,
    /// Used when `Request::set_timeout` is never called. `None` or `0`
    /// disables the timeout.
    pub timeout_ms: Option<u64>,
    /// Charset label written into text parts.
    pub charset: String,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("xhr-core/{}", env!("CARGO_PKG_VERSION")),
            timeout_ms: None,
            charset: "UTF-8".to_string(),
        }
    }
}

impl RequestConfig {
    pub fn from_json(raw: &str) -> Result<Self, RequestError> {
        serde_json::from_str(raw)
            .map_err(|e| RequestError::InvalidArgument(format!("invalid config: {e}")))
    }

    /// Defaults overridden by whichever `XHR_*` variables are set.
    pub fn from_env() -> Result<Self, RequestError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RequestError> {
        let mut config = Self::default();
        if let Some(agent) = lookup(ENV_USER_AGENT) {
            config.user_agent = agent;
        }
        if let Some(raw) = lookup(ENV_TIMEOUT_MS) {
            let ms = raw.trim().parse::<u64>().map_err(|_| {
                RequestError::InvalidArgument(format!("{ENV_TIMEOUT_MS} is not a number: {raw}"))
            })?;
            config.timeout_ms = Some(ms);
        }
        if let Some(charset) = lookup(ENV_CHARSET) {
            config.charset = charset;
        }
        Ok(config)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}
