//! HTTP client for resource-site catalog APIs.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::adapter::{MacCmsAdapter, QueryParams, SourceAdapter};
use crate::{CanonicalRecord, CatalogFetch, ListItem, SourceRef, SpiderError};
use vodsync_core::types::ErrorClass;

/// List/detail requests get the longer budget; liveness and play-URL
/// probes the shorter one.
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Transient failures get exactly one immediate retry. Pages are cheap and
/// many sources are tried, so the pipeline favors fail-fast over backoff.
const RETRIES: u32 = 1;

pub struct SpiderClient {
    http: reqwest::Client,
    adapter: Arc<dyn SourceAdapter>,
}

impl Default for SpiderClient {
    fn default() -> Self {
        Self::new(Arc::new(MacCmsAdapter))
    }
}

impl SpiderClient {
    pub fn new(adapter: Arc<dyn SourceAdapter>) -> Self {
        Self {
            http: reqwest::Client::new(),
            adapter,
        }
    }

    async fn get_json(
        &self,
        base_url: &str,
        params: &QueryParams,
    ) -> Result<serde_json::Value, SpiderError> {
        let mut last_err = None;
        for attempt in 0..=RETRIES {
            match self.try_get_json(base_url, params).await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempt < RETRIES {
                        debug!(url = %base_url, error = %e, "fetch failed, retrying once");
                    }
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| SpiderError::Network("unreachable".into())))
    }

    async fn try_get_json(
        &self,
        base_url: &str,
        params: &QueryParams,
    ) -> Result<serde_json::Value, SpiderError> {
        let resp = self
            .http
            .get(base_url)
            .query(params)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| SpiderError::Network(e.to_string()))?;

        if !resp.status().is_success() {
            return Err(SpiderError::Upstream(format!(
                "source returned {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| SpiderError::Upstream(format!("parse JSON: {e}")))
    }

    /// Cheap liveness check against the source's base endpoint only.
    /// Never errors; failure is a result, not an exception.
    pub async fn probe(&self, source: &SourceRef) -> ProbeResult {
        let start = std::time::Instant::now();
        let outcome = self
            .http
            .get(&source.base_url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        let latency_ms = start.elapsed().as_millis() as i64;

        match outcome {
            Ok(resp) if resp.status().is_success() => ProbeResult {
                healthy: true,
                latency_ms,
                error: None,
            },
            Ok(resp) => ProbeResult {
                healthy: false,
                latency_ms,
                error: Some(format!("status {}", resp.status())),
            },
            Err(e) => ProbeResult {
                healthy: false,
                latency_ms,
                error: Some(if e.is_timeout() {
                    "timeout".to_string()
                } else {
                    e.to_string()
                }),
            },
        }
    }

    /// Existence probe for a stored play URL. HEAD-equivalent: the body is
    /// never read. One immediate retry, same as page fetches.
    pub async fn probe_play_url(&self, url: &str) -> Result<(), ErrorClass> {
        let mut last = ErrorClass::Timeout;
        for _ in 0..=RETRIES {
            match self.http.head(url).timeout(PROBE_TIMEOUT).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(()),
                Ok(resp) => {
                    warn!(url = %url, status = %resp.status(), "play URL probe rejected");
                    last = ErrorClass::Http;
                }
                Err(e) if e.is_timeout() => last = ErrorClass::Timeout,
                Err(_) => last = ErrorClass::Http,
            }
        }
        Err(last)
    }
}

#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub healthy: bool,
    pub latency_ms: i64,
    pub error: Option<String>,
}

#[async_trait::async_trait]
impl CatalogFetch for SpiderClient {
    async fn fetch_page(
        &self,
        source: &SourceRef,
        page: u32,
        category: Option<&str>,
    ) -> Result<Vec<ListItem>, SpiderError> {
        let params = self.adapter.list_params(page, category);
        debug!(source = %source.id, page, "fetching list page");
        let body = self.get_json(&source.base_url, &params).await?;
        Ok(self.adapter.parse_list(&body))
    }

    async fn fetch_detail(
        &self,
        source: &SourceRef,
        ids: &[String],
    ) -> Result<Vec<CanonicalRecord>, SpiderError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let params = self.adapter.detail_params(ids);
        debug!(source = %source.id, ids = ids.len(), "fetching detail batch");
        let body = self.get_json(&source.base_url, &params).await?;
        Ok(self.adapter.parse_detail(&source.id, &body))
    }

    async fn search(
        &self,
        source: &SourceRef,
        keyword: &str,
    ) -> Result<Vec<ListItem>, SpiderError> {
        let params = self.adapter.search_params(keyword);
        debug!(source = %source.id, keyword = %keyword, "searching source");
        let body = self.get_json(&source.base_url, &params).await?;
        Ok(self.adapter.parse_list(&body))
    }
}
