//! Shared REST client for the upstream API.

use crate::error::{fetch_error, Error, Result};
use common::{FetchError, FetchResult};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_LOGGED_BODY: usize = 2048;

/// Thin wrapper over `reqwest::Client` bound to one base URL.
#[derive(Debug, Clone)]
pub struct RestClient {
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
}

impl RestClient {
    /// Create a client; a zero timeout falls back to five seconds.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let trimmed = base_url.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidConfig("missing REST base URL".to_string()));
        }
        let base_url = Url::parse(trimmed)?;
        let timeout = if timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            timeout
        };
        let http = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url,
            timeout,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve `path` (slash separated) plus extra raw segments against the
    /// base URL. Extra segments are percent-encoded as single path segments.
    pub fn endpoint(&self, path: &str, extra: &[&str]) -> FetchResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| FetchError::Transport("base URL cannot carry a path".to_string()))?;
            segments.pop_if_empty();
            for segment in path.split('/').filter(|s| !s.trim().is_empty()) {
                segments.push(segment.trim());
            }
            for segment in extra {
                segments.push(segment);
            }
        }
        Ok(url)
    }

    /// GET `url` and decode the JSON body.
    ///
    /// 401/403 map to `Forbidden`, 404 to `NotFound`, other non-2xx to `Status`.
    pub async fn get_json(
        &self,
        token: &str,
        url: Url,
        query: &[(String, String)],
    ) -> FetchResult<Value> {
        let mut request = self
            .http
            .get(url.clone())
            .header(ACCEPT, "application/json");
        let token = token.trim();
        if !token.is_empty() {
            request = request.bearer_auth(token);
        }
        if !query.is_empty() {
            request = request.query(query);
        }

        debug!(url = %url, "REST request");
        let response = request.send().await.map_err(|e| {
            error!(url = %url, error = %e, "REST request error");
            fetch_error(e)
        })?;

        let status = response.status();
        debug!(url = %url, status = status.as_u16(), "REST response");
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => return Err(FetchError::Forbidden),
            StatusCode::NOT_FOUND => return Err(FetchError::NotFound),
            s if !s.is_success() => {
                let body = response.text().await.unwrap_or_default();
                let body: String = body.trim().chars().take(MAX_LOGGED_BODY).collect();
                error!(url = %url, status = s.as_u16(), body = %body, "unexpected REST status");
                return Err(FetchError::Status(s.as_u16()));
            }
            _ => {}
        }

        let bytes = response.bytes().await.map_err(fetch_error)?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Decode(e.to_string()))
    }
}

/// Objects are kept as-is, arrays become `{items: [...]}`, scalars `{value: x}`.
pub fn normalize_payload(payload: Value) -> Value {
    match payload {
        Value::Object(_) => payload,
        Value::Array(items) => json!({ "items": items }),
        other => json!({ "value": other }),
    }
}
