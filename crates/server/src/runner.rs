//! Background execution of collection tasks.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;

use vodsync_collector::orchestrator::{self, RunOutcome};
use vodsync_collector::CollectError;
use vodsync_db::repo::tasks;
use vodsync_spider::client::SpiderClient;
use vodsync_spider::CatalogFetch;

/// Drive one collection task to a terminal state. The orchestrator handles
/// its own status transitions; this wrapper covers the failure path where
/// the run itself errored out, so the task row never stays `running`.
pub async fn run_collect(
    pool: &SqlitePool,
    fetch: &dyn CatalogFetch,
    task_id: &str,
) -> Result<RunOutcome, CollectError> {
    match orchestrator::run_task(pool, fetch, task_id).await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            tracing::error!(task_id = %task_id, error = %e, "collection task failed");
            if let Err(update_err) =
                set_status_with_retry(pool, task_id, "failed", Some(&e.to_string())).await
            {
                tracing::error!(
                    task_id = %task_id,
                    error = %update_err,
                    "failed to set task status to failed"
                );
            }
            Err(e)
        }
    }
}

/// Run a collection task in the background.
pub fn spawn_collect(pool: SqlitePool, spider: Arc<SpiderClient>, task_id: String) {
    tokio::spawn(async move {
        let _ = run_collect(&pool, spider.as_ref(), &task_id).await;
    });
}

async fn set_status_with_retry(
    pool: &SqlitePool,
    task_id: &str,
    status: &str,
    error: Option<&str>,
) -> Result<(), sqlx::Error> {
    let mut last_err: Option<sqlx::Error> = None;
    for _ in 0..5 {
        match tasks::set_status(pool, task_id, status, error).await {
            Ok(_) => return Ok(()),
            Err(e) => {
                last_err = Some(e);
                tokio::time::sleep(Duration::from_millis(120)).await;
            }
        }
    }
    match last_err {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use vodsync_db::repo::sources;
    use vodsync_spider::{CanonicalRecord, ListItem, SourceRef, SpiderError};

    struct OneItemFetch;

    #[async_trait]
    impl CatalogFetch for OneItemFetch {
        async fn fetch_page(
            &self,
            _source: &SourceRef,
            page: u32,
            _category: Option<&str>,
        ) -> Result<Vec<ListItem>, SpiderError> {
            if page > 1 {
                return Ok(Vec::new());
            }
            Ok(vec![ListItem {
                source_item_id: "1".into(),
                title: "Film".into(),
                category: "movie".into(),
            }])
        }

        async fn fetch_detail(
            &self,
            source: &SourceRef,
            _ids: &[String],
        ) -> Result<Vec<CanonicalRecord>, SpiderError> {
            Ok(vec![CanonicalRecord {
                source_id: source.id.clone(),
                title: "Film".into(),
                category: "movie".into(),
                ..Default::default()
            }])
        }

        async fn search(
            &self,
            _source: &SourceRef,
            _keyword: &str,
        ) -> Result<Vec<ListItem>, SpiderError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn store_error_lands_the_task_in_failed() {
        let pool = vodsync_db::connect(":memory:").await.unwrap();
        vodsync_db::migrate::run(&pool).await.unwrap();
        sources::create(&pool, "siteA", "http://a.example", 50)
            .await
            .unwrap();
        let task = tasks::create(&pool, "full", "{}").await.unwrap();

        // Break the store underneath the run; the task row must still end
        // up in a terminal state rather than running forever.
        sqlx::query("DROP TABLE vod").execute(&pool).await.unwrap();

        let result = run_collect(&pool, &OneItemFetch, &task.id).await;
        assert!(result.is_err());
        assert_eq!(
            tasks::status(&pool, &task.id).await.unwrap().as_deref(),
            Some("failed")
        );
    }
}
