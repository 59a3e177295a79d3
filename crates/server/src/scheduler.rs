//! Cron-driven maintenance jobs. The `schedule` table is the source of
//! truth; rows are seeded with the built-in defaults at startup and edited
//! through the API.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context};
use sqlx::SqlitePool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};
use uuid::Uuid;

use vodsync_collector::orchestrator::TaskConfig;
use vodsync_collector::{dedup, health, validator};
use vodsync_core::types::TaskStatus;
use vodsync_db::repo::{cache, catalog, logs, reports, schedules, sources, tasks};
use vodsync_spider::client::SpiderClient;

/// Built-in jobs and their default cadences (seconds-resolution cron).
pub const DEFAULT_JOBS: &[(&str, &str)] = &[
    ("cache_warmup", "0 */30 * * * *"),
    ("incremental_collect", "0 0 * * * *"),
    ("full_collect", "0 0 3 * * *"),
    ("category_collect", "0 30 4 * * *"),
    ("url_validation", "0 15 * * * *"),
    ("health_sweep", "0 */10 * * * *"),
    ("cleanup", "0 0 5 * * *"),
    ("duplicate_merge", "0 45 2 * * *"),
    ("search_index_rebuild", "0 0 4 * * 1"),
    ("health_check", "0 */15 * * * *"),
];

const VALIDATE_BATCH: i64 = 100;
const REPAIR_BATCH: i64 = 20;
const RETENTION_DAYS: i64 = 30;

pub fn default_cadence(name: &str) -> Option<&'static str> {
    DEFAULT_JOBS
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, c)| *c)
}

/// Cadences are validated by handing them to the cron runner itself.
pub fn is_valid_cadence(expr: &str) -> bool {
    Job::new_async(expr, |_uuid, _l| Box::pin(async {})).is_ok()
}

pub struct Scheduler {
    pool: SqlitePool,
    spider: Arc<SpiderClient>,
    inner: JobScheduler,
    handles: tokio::sync::Mutex<HashMap<String, Uuid>>,
}

impl Scheduler {
    pub async fn new(pool: SqlitePool, spider: Arc<SpiderClient>) -> anyhow::Result<Arc<Self>> {
        let inner = JobScheduler::new()
            .await
            .context("creating cron scheduler")?;
        Ok(Arc::new(Self {
            pool,
            spider,
            inner,
            handles: tokio::sync::Mutex::new(HashMap::new()),
        }))
    }

    /// Seed the schedule table, register every enabled job and start the
    /// cron loop.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        schedules::insert_defaults(&self.pool, DEFAULT_JOBS)
            .await
            .context("seeding schedule defaults")?;

        for row in schedules::list(&self.pool).await? {
            if !row.enabled {
                continue;
            }
            if let Err(e) = self.register(&row.name, &row.cadence).await {
                // A row edited into an invalid cadence must not block the rest.
                warn!(job = %row.name, error = %e, "could not register job");
            }
        }

        self.inner.start().await.context("starting cron scheduler")?;
        info!("scheduler started");
        Ok(())
    }

    async fn register(self: &Arc<Self>, name: &str, cadence: &str) -> anyhow::Result<()> {
        let this = Arc::clone(self);
        let job_name = name.to_string();
        let job = Job::new_async(cadence, move |_uuid, _l| {
            let this = Arc::clone(&this);
            let name = job_name.clone();
            Box::pin(async move {
                this.run_and_record(&name).await;
            })
        })
        .with_context(|| format!("creating cron job for {name}"))?;

        let id = self.inner.add(job).await.context("adding cron job")?;
        if let Some(old) = self.handles.lock().await.insert(name.to_string(), id) {
            let _ = self.inner.remove(&old).await;
        }
        Ok(())
    }

    async fn unregister(&self, name: &str) -> anyhow::Result<()> {
        if let Some(id) = self.handles.lock().await.remove(name) {
            self.inner.remove(&id).await.context("removing cron job")?;
        }
        Ok(())
    }

    /// Re-read a schedule row and bring the cron registration in line
    /// with it. Called after any edit through the API.
    pub async fn reload(self: &Arc<Self>, name: &str) -> anyhow::Result<()> {
        self.unregister(name).await?;
        if let Some(row) = schedules::get(&self.pool, name).await? {
            if row.enabled {
                self.register(&row.name, &row.cadence).await?;
            }
        }
        Ok(())
    }

    /// Manual trigger. Runs out of band; overlap with a cron firing is
    /// harmless since every job is idempotent.
    pub fn trigger(self: &Arc<Self>, name: &str) {
        let this = Arc::clone(self);
        let name = name.to_string();
        tokio::spawn(async move {
            this.run_and_record(&name).await;
        });
    }

    /// Execute one job and record the run whatever the outcome.
    pub async fn run_and_record(&self, name: &str) {
        let started = std::time::Instant::now();
        let result = self.run_job(name).await;
        let duration_ms = started.elapsed().as_millis() as i64;

        let record = match &result {
            Ok(message) => {
                info!(job = name, duration_ms, message = %message, "job completed");
                schedules::record_run(&self.pool, name, "completed", duration_ms, Some(message))
                    .await
            }
            Err(e) => {
                error!(job = name, duration_ms, error = %e, "job failed");
                schedules::record_run(
                    &self.pool,
                    name,
                    "failed",
                    duration_ms,
                    Some(&e.to_string()),
                )
                .await
            }
        };
        if let Err(e) = record {
            error!(job = name, error = %e, "could not record job run");
        }
    }

    async fn run_job(&self, name: &str) -> anyhow::Result<String> {
        match name {
            "cache_warmup" => self.cache_warmup().await,
            "incremental_collect" => self.collect("incremental").await,
            "full_collect" => self.collect("full").await,
            "category_collect" => self.category_collect().await,
            "url_validation" => self.url_validation().await,
            "health_sweep" => {
                let summary = health::sweep(&self.pool, &self.spider).await?;
                Ok(format!(
                    "{} probed, {} healthy",
                    summary.probed, summary.healthy
                ))
            }
            "cleanup" => self.cleanup().await,
            "duplicate_merge" => {
                let summary = dedup::merge_duplicates(&self.pool).await?;
                Ok(format!(
                    "{} keys scanned, {} merged",
                    summary.keys_scanned, summary.merged
                ))
            }
            "search_index_rebuild" => {
                let rows = catalog::rebuild_fts(&self.pool).await?;
                Ok(format!("{rows} rows indexed"))
            }
            "health_check" => self.health_check().await,
            other => bail!("unknown job: {other}"),
        }
    }

    async fn collect(&self, mode: &str) -> anyhow::Result<String> {
        if sources::list_active(&self.pool).await?.is_empty() {
            return Ok("no active sources, skipped".to_string());
        }
        let task = tasks::create(&self.pool, mode, "{}").await?;
        let outcome = crate::runner::run_collect(&self.pool, self.spider.as_ref(), &task.id).await?;
        Ok(format!("task {} {:?}", task.id, outcome))
    }

    async fn category_collect(&self) -> anyhow::Result<String> {
        if sources::list_active(&self.pool).await?.is_empty() {
            return Ok("no active sources, skipped".to_string());
        }
        let categories = catalog::distinct_categories(&self.pool).await?;
        if categories.is_empty() {
            return Ok("no categories yet, skipped".to_string());
        }
        let mut ran = 0usize;
        for category in &categories {
            let config = TaskConfig {
                category: Some(category.clone()),
                max_pages: Some(3),
                ..Default::default()
            };
            let config_json = serde_json::to_string(&config)?;
            let task = tasks::create(&self.pool, "category", &config_json).await?;
            crate::runner::run_collect(&self.pool, self.spider.as_ref(), &task.id).await?;
            ran += 1;
        }
        Ok(format!("{ran} category tasks ran"))
    }

    async fn url_validation(&self) -> anyhow::Result<String> {
        let checked =
            validator::validate_batch(&self.pool, self.spider.as_ref(), VALIDATE_BATCH).await?;
        let repaired = validator::repair_invalid(
            &self.pool,
            self.spider.as_ref(),
            self.spider.as_ref(),
            REPAIR_BATCH,
        )
        .await?;
        Ok(format!(
            "{} checked, {} invalidated, {} repaired",
            checked.checked, checked.invalidated, repaired.repaired
        ))
    }

    async fn cleanup(&self) -> anyhow::Result<String> {
        let cutoff = chrono::Utc::now().timestamp() - RETENTION_DAYS * 86_400;
        let logs_dropped = logs::cleanup_before(&self.pool, cutoff).await?;
        let runs_dropped = schedules::cleanup_runs_before(&self.pool, cutoff).await?;
        let reports_dropped = reports::cleanup_resolved_before(&self.pool, cutoff).await?;
        let cache_dropped = cache::purge_expired(&self.pool).await?;
        Ok(format!(
            "{logs_dropped} logs, {runs_dropped} runs, {reports_dropped} reports, \
             {cache_dropped} cache entries dropped"
        ))
    }

    async fn cache_warmup(&self) -> anyhow::Result<String> {
        cache::purge_expired(&self.pool).await?;

        let mut warmed = 0usize;
        let mut scopes: Vec<Option<String>> = vec![None];
        scopes.extend(
            catalog::distinct_categories(&self.pool)
                .await?
                .into_iter()
                .take(5)
                .map(Some),
        );
        for scope in &scopes {
            let rows =
                catalog::list(&self.pool, scope.as_deref(), None, None, 1, 20).await?;
            if rows.is_empty() {
                continue;
            }
            let key = crate::routes::list_cache_key(scope.as_deref(), None, None, 1);
            let payload = crate::routes::vod_list_payload(&rows);
            cache::put(&self.pool, &key, &payload.to_string(), 1800).await?;
            warmed += 1;
        }
        Ok(format!("{warmed} list pages warmed"))
    }

    async fn health_check(&self) -> anyhow::Result<String> {
        let health_rows = vodsync_db::repo::health::list(&self.pool).await?;
        let healthy = health_rows
            .iter()
            .filter(|h| h.status == "healthy")
            .count();
        let backlog = tasks::list(&self.pool, 1, 200)
            .await?
            .iter()
            .filter(|t| {
                TaskStatus::parse(&t.status).is_none_or(|s| !s.is_terminal())
            })
            .count();
        let message = format!(
            "{healthy}/{} sources healthy, {backlog} tasks in flight",
            health_rows.len()
        );
        logs::append(&self.pool, None, "info", None, "health_check", &message, None).await?;
        Ok(message)
    }
}
