pub mod adapter;
pub mod client;
pub mod play;

use thiserror::Error;

use vodsync_core::play::PlayIndex;

#[derive(Error, Debug)]
pub enum SpiderError {
    #[error("network error: {0}")]
    Network(String),
    #[error("upstream error: {0}")]
    Upstream(String),
}

/// Minimal view of a source the spider needs to talk to it.
#[derive(Debug, Clone)]
pub struct SourceRef {
    pub id: String,
    pub base_url: String,
}

/// One row of a source's paginated list endpoint: just enough to decide
/// whether a detail fetch is needed.
#[derive(Debug, Clone)]
pub struct ListItem {
    pub source_item_id: String,
    pub title: String,
    pub category: String,
}

/// The spider's sole output type: one title as a single source reports it,
/// normalized into a source-agnostic shape. Nothing upstream-specific
/// (field names, play-blob delimiters) survives past this point.
#[derive(Debug, Clone, Default)]
pub struct CanonicalRecord {
    pub source_id: String,
    pub title: String,
    pub category: String,
    pub year: Option<i64>,
    pub region: Option<String>,
    pub genres: Vec<String>,
    pub cast: Vec<String>,
    pub synopsis: Option<String>,
    pub remark: Option<String>,
    pub rating: f64,
    pub play_index: PlayIndex,
}

/// Fetching seam between the spider and the orchestrator. The production
/// implementation is [`client::SpiderClient`]; tests substitute in-memory
/// fakes.
#[async_trait::async_trait]
pub trait CatalogFetch: Send + Sync {
    /// One page of the source's list endpoint. An empty vec means the
    /// source is exhausted.
    async fn fetch_page(
        &self,
        source: &SourceRef,
        page: u32,
        category: Option<&str>,
    ) -> Result<Vec<ListItem>, SpiderError>;

    /// Full canonical records for the given source-assigned ids.
    async fn fetch_detail(
        &self,
        source: &SourceRef,
        ids: &[String],
    ) -> Result<Vec<CanonicalRecord>, SpiderError>;

    /// Keyword search against the source's list endpoint. Used by the
    /// repair pass to rediscover a title whose stored URLs went dead.
    async fn search(
        &self,
        source: &SourceRef,
        keyword: &str,
    ) -> Result<Vec<ListItem>, SpiderError>;
}
