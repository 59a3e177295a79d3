//! Collection orchestrator: drives full/incremental/category/source runs
//! across active sources with checkpointing, batching and per-task
//! progress counters.

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::health::{circuit_state, CircuitState};
use crate::reconcile::{self, BatchStats};
use crate::CollectError;
use vodsync_core::types::{TaskMode, TaskStatus};
use vodsync_db::repo::{health, logs, sources, tasks};
use vodsync_spider::{CanonicalRecord, CatalogFetch, SourceRef};

/// Records accumulated before a reconciler flush and checkpoint write.
pub const BATCH_SIZE: usize = 5;

/// Concurrency bound for detail fetches within one page. Source iteration
/// itself is sequential so the single checkpoint stays exact.
pub const DETAIL_FANOUT: usize = 3;

/// A source is abandoned for this run after this many page fetches fail
/// in a row. Individual failed pages are skipped, not fatal.
const MAX_CONSECUTIVE_PAGE_ERRORS: u32 = 3;

/// Page ceiling for incremental runs when the operator sets none.
const DEFAULT_INCREMENTAL_PAGES: u32 = 3;

/// Operator-supplied scope for a collection task, stored as JSON in
/// `collect_task.config`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskConfig {
    pub source_id: Option<String>,
    pub category: Option<String>,
    pub max_pages: Option<u32>,
    pub max_items: Option<i64>,
}

/// Resumable cursor persisted with the task. `page` is the next page to
/// fetch for the source at `source_index`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Checkpoint {
    pub source_index: usize,
    pub page: u32,
    pub last_item_id: Option<String>,
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self {
            source_index: 0,
            page: 1,
            last_item_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// The run observed a cancel or pause signal and stopped promptly.
    /// The task status was already set by the operator; the checkpoint is
    /// left intact for a later resume.
    Stopped,
}

#[derive(Debug, Default, Clone)]
struct Progress {
    processed: i64,
    new_items: i64,
    updated: i64,
    skipped: i64,
    errors: i64,
}

impl Progress {
    fn from_task(t: &tasks::TaskRow) -> Self {
        Self {
            processed: t.processed,
            new_items: t.new_items,
            updated: t.updated_items,
            skipped: t.skipped,
            errors: t.errors,
        }
    }

    fn absorb(&mut self, stats: BatchStats) {
        self.new_items += stats.new_items;
        self.updated += stats.updated;
        self.skipped += stats.skipped;
    }
}

enum SourceOutcome {
    Done,
    Stop,
    ItemCapReached,
}

/// Execute one collection task to a terminal state (or a prompt stop on
/// cancel/pause). Store failures are the only fatal errors; the caller is
/// expected to flip the task to `failed` when this returns `Err`.
pub async fn run_task(
    pool: &SqlitePool,
    fetch: &dyn CatalogFetch,
    task_id: &str,
) -> Result<RunOutcome, CollectError> {
    let Some(task) = tasks::get(pool, task_id).await? else {
        warn!(task = task_id, "collection task not found");
        return Ok(RunOutcome::Stopped);
    };
    if TaskStatus::parse(&task.status).is_some_and(TaskStatus::is_terminal) {
        return Ok(RunOutcome::Stopped);
    }
    tasks::set_status(pool, task_id, "running", None).await?;

    let config: TaskConfig = serde_json::from_str(&task.config).unwrap_or_default();
    let mode = TaskMode::parse(&task.mode).unwrap_or(TaskMode::Incremental);
    let mut checkpoint: Checkpoint = task
        .checkpoint
        .as_deref()
        .and_then(|c| serde_json::from_str(c).ok())
        .unwrap_or_default();
    let mut progress = Progress::from_task(&task);

    let mut scope = sources::list_active(pool).await?;
    if let Some(sid) = &config.source_id {
        scope.retain(|s| &s.id == sid);
    }
    if scope.is_empty() {
        warn!(task = task_id, "no active sources in scope, nothing to collect");
        logs::append(
            pool,
            Some(task_id),
            "warn",
            None,
            "collect",
            "no active sources in scope",
            None,
        )
        .await?;
        tasks::set_status(pool, task_id, "completed", None).await?;
        return Ok(RunOutcome::Completed);
    }

    let max_pages = config.max_pages.or(match mode {
        TaskMode::Incremental => Some(DEFAULT_INCREMENTAL_PAGES),
        _ => None,
    });
    info!(task = task_id, mode = %mode, sources = scope.len(), "collection run starting");

    for (idx, source) in scope.iter().enumerate() {
        if idx < checkpoint.source_index {
            continue;
        }

        let health_row = health::get(pool, &source.id).await?;
        match circuit_state(&health_row) {
            CircuitState::Open => {
                health::mark_cycle_skipped(pool, &source.id).await?;
                logs::append(
                    pool,
                    Some(task_id),
                    "warn",
                    Some(&source.id),
                    "collect",
                    "source skipped, circuit open",
                    None,
                )
                .await?;
                continue;
            }
            CircuitState::HalfOpen => {
                info!(source = %source.id, "half-open source, trial collection");
            }
            CircuitState::Closed => {}
        }

        let source_ref = SourceRef {
            id: source.id.clone(),
            base_url: source.base_url.clone(),
        };
        let start_page = if idx == checkpoint.source_index {
            checkpoint.page.max(1)
        } else {
            1
        };

        let outcome = collect_source(
            pool,
            fetch,
            task_id,
            idx,
            &source_ref,
            source.weight,
            config.category.as_deref(),
            start_page,
            max_pages,
            config.max_items,
            &mut progress,
            &mut checkpoint,
        )
        .await?;

        match outcome {
            SourceOutcome::Stop => return Ok(RunOutcome::Stopped),
            SourceOutcome::ItemCapReached => break,
            SourceOutcome::Done => {}
        }

        checkpoint = Checkpoint {
            source_index: idx + 1,
            page: 1,
            last_item_id: None,
        };
        persist_progress(pool, task_id, &progress, &checkpoint).await?;
    }

    tasks::set_status(pool, task_id, "completed", None).await?;
    logs::append(
        pool,
        Some(task_id),
        "info",
        None,
        "collect",
        &format!(
            "task completed: {} processed, {} new, {} updated, {} skipped, {} errors",
            progress.processed,
            progress.new_items,
            progress.updated,
            progress.skipped,
            progress.errors
        ),
        None,
    )
    .await?;
    info!(task = task_id, processed = progress.processed, "collection run completed");
    Ok(RunOutcome::Completed)
}

#[allow(clippy::too_many_arguments)]
async fn collect_source(
    pool: &SqlitePool,
    fetch: &dyn CatalogFetch,
    task_id: &str,
    source_index: usize,
    source: &SourceRef,
    priority: i64,
    category: Option<&str>,
    start_page: u32,
    max_pages: Option<u32>,
    max_items: Option<i64>,
    progress: &mut Progress,
    checkpoint: &mut Checkpoint,
) -> Result<SourceOutcome, CollectError> {
    let mut page = start_page;
    let mut consecutive_errors = 0u32;
    let mut buffer: Vec<CanonicalRecord> = Vec::new();

    loop {
        // Operator signals are observed between pages, never mid-fetch.
        // Every completed page has been flushed by this point, so stopping
        // here loses nothing.
        match tasks::status(pool, task_id).await?.as_deref() {
            Some("cancelled") | Some("paused") => return Ok(SourceOutcome::Stop),
            _ => {}
        }

        if max_pages.is_some_and(|mp| page > mp) {
            break;
        }
        if max_items.is_some_and(|cap| progress.processed >= cap) {
            return Ok(SourceOutcome::ItemCapReached);
        }

        let items = match fetch.fetch_page(source, page, category).await {
            Ok(items) => {
                consecutive_errors = 0;
                items
            }
            Err(e) => {
                progress.errors += 1;
                consecutive_errors += 1;
                logs::append(
                    pool,
                    Some(task_id),
                    "warn",
                    Some(&source.id),
                    "fetch_page",
                    &format!("page {page}: {e}"),
                    None,
                )
                .await?;
                if consecutive_errors >= MAX_CONSECUTIVE_PAGE_ERRORS {
                    warn!(
                        source = %source.id,
                        "abandoning source after repeated page errors"
                    );
                    break;
                }
                page += 1;
                continue;
            }
        };

        if items.is_empty() {
            break;
        }

        let last_item_id = items.last().map(|i| i.source_item_id.clone());

        // Detail fetches are the latency hot spot; fan out, bounded.
        let id_chunks: Vec<Vec<String>> = items
            .chunks(BATCH_SIZE)
            .map(|c| c.iter().map(|i| i.source_item_id.clone()).collect())
            .collect();
        let mut details = stream::iter(
            id_chunks
                .into_iter()
                .map(|ids| async move { fetch.fetch_detail(source, &ids).await }),
        )
        .buffer_unordered(DETAIL_FANOUT);

        while let Some(result) = details.next().await {
            match result {
                Ok(records) => buffer.extend(records),
                Err(e) => {
                    progress.errors += 1;
                    logs::append(
                        pool,
                        Some(task_id),
                        "warn",
                        Some(&source.id),
                        "fetch_detail",
                        &e.to_string(),
                        None,
                    )
                    .await?;
                }
            }
        }
        drop(details);

        progress.processed += items.len() as i64;

        while buffer.len() >= BATCH_SIZE {
            let batch: Vec<CanonicalRecord> = buffer.drain(..BATCH_SIZE).collect();
            let stats = reconcile::flush_batch(pool, &batch, priority).await?;
            progress.absorb(stats);
            *checkpoint = Checkpoint {
                source_index,
                page,
                last_item_id: last_item_id.clone(),
            };
            persist_progress(pool, task_id, progress, checkpoint).await?;
        }

        // Page done; flush the remainder before the checkpoint moves past
        // it, then mark the next page as the resume point.
        if !buffer.is_empty() {
            let batch: Vec<CanonicalRecord> = buffer.drain(..).collect();
            let stats = reconcile::flush_batch(pool, &batch, priority).await?;
            progress.absorb(stats);
        }
        page += 1;
        *checkpoint = Checkpoint {
            source_index,
            page,
            last_item_id,
        };
        persist_progress(pool, task_id, progress, checkpoint).await?;
    }

    Ok(SourceOutcome::Done)
}

async fn persist_progress(
    pool: &SqlitePool,
    task_id: &str,
    progress: &Progress,
    checkpoint: &Checkpoint,
) -> Result<(), CollectError> {
    let checkpoint_json = serde_json::to_string(checkpoint).ok();
    tasks::update_progress(
        pool,
        task_id,
        progress.processed,
        progress.new_items,
        progress.updated,
        progress.skipped,
        progress.errors,
        checkpoint_json.as_deref(),
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use vodsync_core::play::{Episode, PlayGroup, PlayIndex};
    use vodsync_db::repo::catalog;
    use vodsync_spider::{ListItem, SpiderError};

    /// In-memory stand-in for the spider. Pages keyed by (source id,
    /// page); details keyed by source item id.
    struct FakeFetch {
        pages: HashMap<(String, u32), Vec<ListItem>>,
        details: HashMap<String, CanonicalRecord>,
        fail_pages: HashSet<(String, u32)>,
        fetched: Mutex<Vec<(String, u32)>>,
        /// Flip the task to this status after serving N pages.
        interrupt: Option<(SqlitePool, String, String, usize)>,
    }

    impl FakeFetch {
        fn new() -> Self {
            Self {
                pages: HashMap::new(),
                details: HashMap::new(),
                fail_pages: HashSet::new(),
                fetched: Mutex::new(Vec::new()),
                interrupt: None,
            }
        }

        fn with_titles(mut self, source: &str, page: u32, titles: &[&str]) -> Self {
            let mut items = Vec::new();
            for title in titles {
                let item_id = format!("{source}-{title}");
                items.push(ListItem {
                    source_item_id: item_id.clone(),
                    title: title.to_string(),
                    category: "movie".to_string(),
                });
                self.details.insert(
                    item_id.clone(),
                    CanonicalRecord {
                        source_id: source.to_string(),
                        title: title.to_string(),
                        category: "movie".to_string(),
                        year: Some(2023),
                        synopsis: Some(format!("synopsis of {title}")),
                        play_index: PlayIndex {
                            groups: vec![PlayGroup {
                                label: format!("{source}-m3u8"),
                                episodes: vec![Episode {
                                    label: "1".into(),
                                    url: format!("https://{source}/{title}.m3u8"),
                                }],
                            }],
                        },
                        ..Default::default()
                    },
                );
            }
            self.pages.insert((source.to_string(), page), items);
            self
        }

        fn fetched_pages(&self) -> Vec<(String, u32)> {
            self.fetched.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl CatalogFetch for FakeFetch {
        async fn fetch_page(
            &self,
            source: &SourceRef,
            page: u32,
            _category: Option<&str>,
        ) -> Result<Vec<ListItem>, SpiderError> {
            let served = {
                let mut log = self.fetched.lock().unwrap();
                log.push((source.id.clone(), page));
                log.len()
            };
            if let Some((pool, task_id, status, after)) = &self.interrupt {
                if served == *after {
                    if status.as_str() == "paused" {
                        tasks::request_pause(pool, task_id).await.unwrap();
                    } else {
                        tasks::request_cancel(pool, task_id).await.unwrap();
                    }
                }
            }
            let key = (source.id.clone(), page);
            if self.fail_pages.contains(&key) {
                return Err(SpiderError::Network("connection reset".into()));
            }
            Ok(self.pages.get(&key).cloned().unwrap_or_default())
        }

        async fn fetch_detail(
            &self,
            _source: &SourceRef,
            ids: &[String],
        ) -> Result<Vec<CanonicalRecord>, SpiderError> {
            Ok(ids
                .iter()
                .filter_map(|id| self.details.get(id).cloned())
                .collect())
        }

        async fn search(
            &self,
            _source: &SourceRef,
            _keyword: &str,
        ) -> Result<Vec<ListItem>, SpiderError> {
            Ok(Vec::new())
        }
    }

    async fn pool() -> SqlitePool {
        let pool = vodsync_db::connect(":memory:").await.unwrap();
        vodsync_db::migrate::run(&pool).await.unwrap();
        pool
    }

    #[tokio::test]
    async fn full_run_ingests_all_pages() {
        let pool = pool().await;
        sources::create(&pool, "siteA", "http://a.example", 50)
            .await
            .unwrap();
        let src = sources::list_active(&pool).await.unwrap().remove(0);

        let fake = FakeFetch::new()
            .with_titles(&src.id, 1, &["F1", "F2", "F3", "F4", "F5", "F6"])
            .with_titles(&src.id, 2, &["F7", "F8"]);

        let task = tasks::create(&pool, "full", "{}").await.unwrap();
        let outcome = run_task(&pool, &fake, &task.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        assert_eq!(catalog::count(&pool).await.unwrap(), 8);
        let t = tasks::get(&pool, &task.id).await.unwrap().unwrap();
        assert_eq!(t.status, "completed");
        assert_eq!(t.processed, 8);
        assert_eq!(t.new_items, 8);
        assert_eq!(t.errors, 0);
    }

    #[tokio::test]
    async fn incremental_mode_bounds_pages() {
        let pool = pool().await;
        sources::create(&pool, "siteA", "http://a.example", 50)
            .await
            .unwrap();
        let src = sources::list_active(&pool).await.unwrap().remove(0);

        let mut fake = FakeFetch::new();
        for page in 1..=10 {
            fake = fake.with_titles(&src.id, page, &[&format!("P{page}")]);
        }

        let task = tasks::create(&pool, "incremental", "{}").await.unwrap();
        run_task(&pool, &fake, &task.id).await.unwrap();

        // Default incremental ceiling is 3 pages.
        assert_eq!(catalog::count(&pool).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn page_error_is_counted_and_skipped() {
        let pool = pool().await;
        sources::create(&pool, "siteA", "http://a.example", 50)
            .await
            .unwrap();
        let src = sources::list_active(&pool).await.unwrap().remove(0);

        let mut fake = FakeFetch::new()
            .with_titles(&src.id, 1, &["F1"])
            .with_titles(&src.id, 3, &["F3"]);
        fake.fail_pages.insert((src.id.clone(), 2));

        let task = tasks::create(&pool, "full", "{}").await.unwrap();
        let outcome = run_task(&pool, &fake, &task.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        assert_eq!(catalog::count(&pool).await.unwrap(), 2);
        let t = tasks::get(&pool, &task.id).await.unwrap().unwrap();
        assert_eq!(t.errors, 1);
        assert_eq!(t.status, "completed");
    }

    #[tokio::test]
    async fn circuit_open_source_is_excluded() {
        let pool = pool().await;
        sources::create(&pool, "dead", "http://dead.example", 90)
            .await
            .unwrap();
        sources::create(&pool, "live", "http://live.example", 50)
            .await
            .unwrap();
        let all = sources::list_active(&pool).await.unwrap();
        let (dead, live) = (&all[0], &all[1]);
        assert_eq!(dead.name, "dead");

        let mut h = health::HealthRow::unknown(&dead.id);
        h.consecutive_failures = 3;
        h.status = "timeout".to_string();
        health::upsert(&pool, &h).await.unwrap();

        let fake = FakeFetch::new().with_titles(&live.id, 1, &["OnlyLive"]);
        let task = tasks::create(&pool, "full", "{}").await.unwrap();
        run_task(&pool, &fake, &task.id).await.unwrap();

        // Dead source never fetched; its skipped cycle was recorded.
        assert!(fake.fetched_pages().iter().all(|(id, _)| id != &dead.id));
        assert_eq!(catalog::count(&pool).await.unwrap(), 1);
        let h = health::get(&pool, &dead.id).await.unwrap();
        assert_eq!(h.skipped_cycles, 1);
        assert_eq!(circuit_state(&h), CircuitState::HalfOpen);
    }

    #[tokio::test]
    async fn pause_then_resume_never_refetches_finished_pages() {
        let pool = pool().await;
        sources::create(&pool, "siteA", "http://a.example", 50)
            .await
            .unwrap();
        let src = sources::list_active(&pool).await.unwrap().remove(0);

        let task = tasks::create(&pool, "full", "{}").await.unwrap();

        let mut fake = FakeFetch::new()
            .with_titles(&src.id, 1, &["F1", "F2"])
            .with_titles(&src.id, 2, &["F3", "F4"]);
        // Pause lands after page 1 is fully processed.
        fake.interrupt = Some((pool.clone(), task.id.clone(), "paused".into(), 1));

        let outcome = run_task(&pool, &fake, &task.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Stopped);
        let t = tasks::get(&pool, &task.id).await.unwrap().unwrap();
        assert_eq!(t.status, "paused");
        let cp: Checkpoint = serde_json::from_str(t.checkpoint.as_deref().unwrap()).unwrap();
        assert_eq!(cp.page, 2);

        // Resume and finish.
        tasks::request_resume(&pool, &task.id).await.unwrap();
        let fake2 = FakeFetch::new()
            .with_titles(&src.id, 1, &["F1", "F2"])
            .with_titles(&src.id, 2, &["F3", "F4"]);
        let outcome = run_task(&pool, &fake2, &task.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);

        // The resumed run starts at the checkpoint, not page 1.
        assert_eq!(fake2.fetched_pages()[0], (src.id.clone(), 2));
        assert!(fake2.fetched_pages().iter().all(|(_, p)| *p >= 2));

        // Final state matches an uninterrupted run.
        assert_eq!(catalog::count(&pool).await.unwrap(), 4);
        let t = tasks::get(&pool, &task.id).await.unwrap().unwrap();
        assert_eq!(t.status, "completed");
        assert_eq!(t.processed, 4);
    }

    #[tokio::test]
    async fn cancel_stops_promptly_and_keeps_checkpoint() {
        let pool = pool().await;
        sources::create(&pool, "siteA", "http://a.example", 50)
            .await
            .unwrap();
        let src = sources::list_active(&pool).await.unwrap().remove(0);

        let task = tasks::create(&pool, "full", "{}").await.unwrap();
        let mut fake = FakeFetch::new()
            .with_titles(&src.id, 1, &["F1"])
            .with_titles(&src.id, 2, &["F2"])
            .with_titles(&src.id, 3, &["F3"]);
        fake.interrupt = Some((pool.clone(), task.id.clone(), "cancelled".into(), 2));

        run_task(&pool, &fake, &task.id).await.unwrap();

        let t = tasks::get(&pool, &task.id).await.unwrap().unwrap();
        assert_eq!(t.status, "cancelled");
        assert!(t.checkpoint.is_some());
        // Page 3 was never fetched.
        assert!(fake.fetched_pages().iter().all(|(_, p)| *p <= 2));
    }

    #[tokio::test]
    async fn no_active_sources_is_a_noop() {
        let pool = pool().await;
        let fake = FakeFetch::new();
        let task = tasks::create(&pool, "full", "{}").await.unwrap();
        let outcome = run_task(&pool, &fake, &task.id).await.unwrap();
        assert_eq!(outcome, RunOutcome::Completed);
        assert_eq!(catalog::count(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn max_items_caps_the_run() {
        let pool = pool().await;
        sources::create(&pool, "siteA", "http://a.example", 50)
            .await
            .unwrap();
        let src = sources::list_active(&pool).await.unwrap().remove(0);

        let mut fake = FakeFetch::new();
        for page in 1..=5 {
            fake = fake.with_titles(
                &src.id,
                page,
                &[&format!("A{page}"), &format!("B{page}")],
            );
        }

        let config = serde_json::to_string(&TaskConfig {
            max_items: Some(4),
            max_pages: Some(100),
            ..Default::default()
        })
        .unwrap();
        let task = tasks::create(&pool, "incremental", &config).await.unwrap();
        run_task(&pool, &fake, &task.id).await.unwrap();

        let t = tasks::get(&pool, &task.id).await.unwrap().unwrap();
        assert_eq!(t.status, "completed");
        assert!(t.processed >= 4 && t.processed <= 6);
    }
}
