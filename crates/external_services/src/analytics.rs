//! Analytics endpoint fetcher.

use crate::error::Result;
use crate::rest::{normalize_payload, RestClient};
use async_trait::async_trait;
use common::{AnalyticsFetcher, AnalyticsSnapshot, FetchError, FetchResult};
use std::collections::BTreeMap;
use std::time::Duration;

/// `AnalyticsFetcher` over HTTP. Paths come pre-resolved from the
/// gateway's endpoint registry.
#[derive(Debug, Clone)]
pub struct AnalyticsHttpClient {
    rest: RestClient,
}

impl AnalyticsHttpClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        Ok(Self {
            rest: RestClient::new(base_url, timeout)?,
        })
    }

    pub fn from_rest(rest: RestClient) -> Self {
        Self { rest }
    }
}

#[async_trait]
impl AnalyticsFetcher for AnalyticsHttpClient {
    async fn fetch(
        &self,
        token: &str,
        path: &str,
        query: &BTreeMap<String, String>,
    ) -> FetchResult<AnalyticsSnapshot> {
        if path.trim().is_empty() {
            return Err(FetchError::Unsupported);
        }

        let url = self.rest.endpoint(path, &[])?;
        let pairs: Vec<(String, String)> = query
            .iter()
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .filter(|(k, v)| !k.is_empty() && !v.is_empty())
            .collect();

        let payload = self.rest.get_json(token, url, &pairs).await?;
        Ok(AnalyticsSnapshot {
            payload: normalize_payload(payload),
            ..Default::default()
        })
    }
}
