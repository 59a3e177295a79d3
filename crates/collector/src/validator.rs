//! Play-URL validity tracking: periodic probing of stale entries, report
//! intake, and a decoupled repair pass that re-sources dead entries.

use async_trait::async_trait;
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::reconcile;
use crate::CollectError;
use vodsync_core::key::normalize_title;
use vodsync_core::types::{ErrorClass, LogLevel, Reporter};
use vodsync_db::repo::{catalog, logs, reports, sources};
use vodsync_spider::client::SpiderClient;
use vodsync_spider::{CatalogFetch, SourceRef};

/// Seam for probing play URLs so the validation logic is testable without
/// a network.
#[async_trait]
pub trait UrlProbe: Send + Sync {
    async fn probe(&self, url: &str) -> Result<(), ErrorClass>;
}

#[async_trait]
impl UrlProbe for SpiderClient {
    async fn probe(&self, url: &str) -> Result<(), ErrorClass> {
        self.probe_play_url(url).await
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ValidationSummary {
    pub checked: usize,
    pub invalidated: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RepairSummary {
    pub examined: usize,
    pub repaired: usize,
}

/// Probe the least-recently-checked valid entries. One representative URL
/// per play group; the entry stays valid while any group answers. Only
/// `is_valid` and `last_checked_ts` are touched.
pub async fn validate_batch(
    pool: &SqlitePool,
    probe: &dyn UrlProbe,
    limit: i64,
) -> Result<ValidationSummary, CollectError> {
    let rows = catalog::stale_valid(pool, limit).await?;
    let mut summary = ValidationSummary::default();

    for row in rows {
        summary.checked += 1;
        let now = chrono::Utc::now().timestamp();
        let play = row.play_index();
        let urls = play.first_urls();

        if urls.is_empty() {
            invalidate(pool, &row.id, "", ErrorClass::Parse, now).await?;
            summary.invalidated += 1;
            continue;
        }

        let mut last_error = ErrorClass::Http;
        let mut last_url = String::new();
        let mut alive = false;
        for url in &urls {
            match probe.probe(url).await {
                Ok(()) => {
                    alive = true;
                    break;
                }
                Err(class) => {
                    last_error = class;
                    last_url = url.to_string();
                }
            }
        }

        if alive {
            catalog::touch_checked(pool, &row.id, now).await?;
        } else {
            invalidate(pool, &row.id, &last_url, last_error, now).await?;
            summary.invalidated += 1;
        }
    }

    if summary.invalidated > 0 {
        info!(
            checked = summary.checked,
            invalidated = summary.invalidated,
            "url validation pass finished"
        );
    }
    Ok(summary)
}

async fn invalidate(
    pool: &SqlitePool,
    vod_id: &str,
    url: &str,
    class: ErrorClass,
    now: i64,
) -> Result<(), CollectError> {
    catalog::set_validity(pool, vod_id, false, now).await?;
    reports::create(pool, vod_id, url, class.as_str(), Reporter::System.as_str()).await?;
    logs::append(
        pool,
        None,
        LogLevel::Warn.as_str(),
        None,
        "url_validation",
        &format!("entry marked invalid: {class}"),
        Some(vod_id),
    )
    .await?;
    Ok(())
}

/// Record an invalid-URL report. The entry is flipped invalid right away
/// so the repair pass picks it up; the caller is responsible for checking
/// that the vod exists.
pub async fn report_invalid_url(
    pool: &SqlitePool,
    vod_id: &str,
    url: &str,
    class: ErrorClass,
    reporter: Reporter,
) -> Result<(), CollectError> {
    let now = chrono::Utc::now().timestamp();
    catalog::set_validity(pool, vod_id, false, now).await?;
    reports::create(pool, vod_id, url, class.as_str(), reporter.as_str()).await?;
    Ok(())
}

/// Try to bring invalid entries back by re-sourcing them: keyword search
/// across active sources in priority order, re-fetch the detail, and merge
/// it in when its play index probes alive. Open reports resolve on
/// success.
pub async fn repair_invalid(
    pool: &SqlitePool,
    fetch: &dyn CatalogFetch,
    probe: &dyn UrlProbe,
    limit: i64,
) -> Result<RepairSummary, CollectError> {
    let rows = catalog::invalid_entries(pool, limit).await?;
    let scope = sources::list_active(pool).await?;
    let mut summary = RepairSummary::default();

    'entries: for row in rows {
        summary.examined += 1;
        let wanted = normalize_title(&row.title);

        for source in &scope {
            let source_ref = SourceRef {
                id: source.id.clone(),
                base_url: source.base_url.clone(),
            };
            let hits = match fetch.search(&source_ref, &row.title).await {
                Ok(hits) => hits,
                Err(e) => {
                    debug!(source = %source.id, "repair search failed: {e}");
                    continue;
                }
            };
            let ids: Vec<String> = hits
                .iter()
                .filter(|h| normalize_title(&h.title) == wanted)
                .map(|h| h.source_item_id.clone())
                .collect();
            if ids.is_empty() {
                continue;
            }

            let records = match fetch.fetch_detail(&source_ref, &ids).await {
                Ok(records) => records,
                Err(e) => {
                    debug!(source = %source.id, "repair detail fetch failed: {e}");
                    continue;
                }
            };

            for record in records {
                // Same rule as validation: one representative URL per play
                // group, and any live group makes the record usable.
                let urls = record.play_index.first_urls();
                let mut alive = false;
                for url in &urls {
                    if probe.probe(url).await.is_ok() {
                        alive = true;
                        break;
                    }
                }
                if !alive {
                    continue;
                }

                reconcile::upsert_record(pool, &record, source.weight).await?;
                let now = chrono::Utc::now().timestamp();
                catalog::set_validity(pool, &row.id, true, now).await?;
                reports::resolve_for_vod(pool, &row.id).await?;
                logs::append(
                    pool,
                    None,
                    "info",
                    Some(&source.id),
                    "repair",
                    "invalid entry repaired from live source",
                    Some(&row.id),
                )
                .await?;
                summary.repaired += 1;
                continue 'entries;
            }
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use vodsync_core::key::content_key;
    use vodsync_core::play::{Episode, PlayGroup, PlayIndex};
    use vodsync_spider::{CanonicalRecord, ListItem, SpiderError};

    struct FakeProbe {
        dead: HashSet<String>,
    }

    impl FakeProbe {
        fn dead(urls: &[&str]) -> Self {
            Self {
                dead: urls.iter().map(|u| u.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl UrlProbe for FakeProbe {
        async fn probe(&self, url: &str) -> Result<(), ErrorClass> {
            if self.dead.contains(url) {
                Err(ErrorClass::Http)
            } else {
                Ok(())
            }
        }
    }

    async fn pool() -> SqlitePool {
        let pool = vodsync_db::connect(":memory:").await.unwrap();
        vodsync_db::migrate::run(&pool).await.unwrap();
        pool
    }

    fn record(title: &str, source: &str, url: &str) -> CanonicalRecord {
        CanonicalRecord {
            source_id: source.to_string(),
            title: title.to_string(),
            category: "movie".to_string(),
            year: Some(2022),
            play_index: PlayIndex {
                groups: vec![PlayGroup {
                    label: format!("{source}-m3u8"),
                    episodes: vec![Episode {
                        label: "1".into(),
                        url: url.to_string(),
                    }],
                }],
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn dead_urls_flip_validity_and_open_a_report() {
        let pool = pool().await;
        reconcile::upsert_record(&pool, &record("DeadMovie", "s1", "https://s1/dead.m3u8"), 50)
            .await
            .unwrap();
        reconcile::upsert_record(&pool, &record("LiveMovie", "s1", "https://s1/live.m3u8"), 50)
            .await
            .unwrap();

        let probe = FakeProbe::dead(&["https://s1/dead.m3u8"]);
        let summary = validate_batch(&pool, &probe, 10).await.unwrap();
        assert_eq!(summary.checked, 2);
        assert_eq!(summary.invalidated, 1);

        let invalid = catalog::invalid_entries(&pool, 10).await.unwrap();
        assert_eq!(invalid.len(), 1);
        assert_eq!(invalid[0].title, "DeadMovie");
        assert!(invalid[0].last_checked_ts.is_some());

        let open = reports::list_open(&pool, 10).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].reporter, "system");
        assert_eq!(open[0].error_class, "http");
        assert_eq!(open[0].url, "https://s1/dead.m3u8");
    }

    #[tokio::test]
    async fn one_live_group_keeps_the_entry_valid() {
        let pool = pool().await;
        let mut rec = record("Mixed", "s1", "https://s1/dead.m3u8");
        rec.play_index.groups.push(PlayGroup {
            label: "s1-mp4".into(),
            episodes: vec![Episode {
                label: "1".into(),
                url: "https://s1/alive.mp4".into(),
            }],
        });
        reconcile::upsert_record(&pool, &rec, 50).await.unwrap();

        let probe = FakeProbe::dead(&["https://s1/dead.m3u8"]);
        let summary = validate_batch(&pool, &probe, 10).await.unwrap();
        assert_eq!(summary.invalidated, 0);
        assert!(catalog::invalid_entries(&pool, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn user_report_marks_entry_invalid() {
        let pool = pool().await;
        reconcile::upsert_record(&pool, &record("Reported", "s1", "https://s1/gone.m3u8"), 50)
            .await
            .unwrap();
        let id = content_key(&normalize_title("Reported"), Some(2022), "movie");

        report_invalid_url(&pool, &id, "https://s1/gone.m3u8", ErrorClass::Timeout, Reporter::User)
            .await
            .unwrap();

        let invalid = catalog::invalid_entries(&pool, 10).await.unwrap();
        assert_eq!(invalid.len(), 1);
        let open = reports::open_for_vod(&pool, &id).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].reporter, "user");
    }

    struct RepairFetch {
        title: String,
        fresh_urls: Vec<String>,
    }

    impl RepairFetch {
        fn new(title: &str, urls: &[&str]) -> Self {
            Self {
                title: title.to_string(),
                fresh_urls: urls.iter().map(|u| u.to_string()).collect(),
            }
        }
    }

    #[async_trait]
    impl CatalogFetch for RepairFetch {
        async fn fetch_page(
            &self,
            _source: &SourceRef,
            _page: u32,
            _category: Option<&str>,
        ) -> Result<Vec<ListItem>, SpiderError> {
            Ok(Vec::new())
        }

        async fn fetch_detail(
            &self,
            source: &SourceRef,
            ids: &[String],
        ) -> Result<Vec<CanonicalRecord>, SpiderError> {
            let play_index = PlayIndex {
                groups: self
                    .fresh_urls
                    .iter()
                    .enumerate()
                    .map(|(i, url)| PlayGroup {
                        label: format!("fresh-g{}", i + 1),
                        episodes: vec![Episode {
                            label: "1".into(),
                            url: url.clone(),
                        }],
                    })
                    .collect(),
            };
            Ok(ids
                .iter()
                .map(|_| CanonicalRecord {
                    source_id: source.id.clone(),
                    title: self.title.clone(),
                    category: "movie".to_string(),
                    year: Some(2022),
                    play_index: play_index.clone(),
                    ..Default::default()
                })
                .collect())
        }

        async fn search(
            &self,
            _source: &SourceRef,
            keyword: &str,
        ) -> Result<Vec<ListItem>, SpiderError> {
            Ok(vec![ListItem {
                source_item_id: "42".into(),
                title: keyword.to_string(),
                category: "movie".into(),
            }])
        }
    }

    #[tokio::test]
    async fn repair_resurrects_entry_and_resolves_reports() {
        let pool = pool().await;
        sources::create(&pool, "siteB", "http://b.example", 60)
            .await
            .unwrap();

        reconcile::upsert_record(&pool, &record("Broken Film", "s1", "https://s1/rotten.m3u8"), 50)
            .await
            .unwrap();
        let id = content_key(&normalize_title("Broken Film"), Some(2022), "movie");
        report_invalid_url(&pool, &id, "https://s1/rotten.m3u8", ErrorClass::Http, Reporter::User)
            .await
            .unwrap();

        let fetch = RepairFetch::new("Broken Film", &["https://b.example/fresh.m3u8"]);
        let probe = FakeProbe::dead(&["https://s1/rotten.m3u8"]);
        let summary = repair_invalid(&pool, &fetch, &probe, 10).await.unwrap();
        assert_eq!(summary, RepairSummary { examined: 1, repaired: 1 });

        let row = catalog::get(&pool, &id).await.unwrap().unwrap();
        assert_eq!(row.is_valid, 1);
        // The fresh play group was merged alongside the old one.
        assert!(row.play_index.contains("fresh.m3u8"));
        assert!(reports::open_for_vod(&pool, &id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn repair_skips_sources_with_still_dead_urls() {
        let pool = pool().await;
        sources::create(&pool, "siteB", "http://b.example", 60)
            .await
            .unwrap();

        reconcile::upsert_record(&pool, &record("Still Broken", "s1", "https://s1/rotten.m3u8"), 50)
            .await
            .unwrap();
        let id = content_key(&normalize_title("Still Broken"), Some(2022), "movie");
        let now = chrono::Utc::now().timestamp();
        catalog::set_validity(&pool, &id, false, now).await.unwrap();

        let fetch = RepairFetch::new("Still Broken", &["https://b.example/also-dead.m3u8"]);
        let probe = FakeProbe::dead(&["https://b.example/also-dead.m3u8"]);
        let summary = repair_invalid(&pool, &fetch, &probe, 10).await.unwrap();
        assert_eq!(summary, RepairSummary { examined: 1, repaired: 0 });

        let row = catalog::get(&pool, &id).await.unwrap().unwrap();
        assert_eq!(row.is_valid, 0);
    }

    #[tokio::test]
    async fn repair_accepts_record_whose_later_group_is_live() {
        let pool = pool().await;
        sources::create(&pool, "siteB", "http://b.example", 60)
            .await
            .unwrap();

        reconcile::upsert_record(&pool, &record("Half Dead", "s1", "https://s1/rotten.m3u8"), 50)
            .await
            .unwrap();
        let id = content_key(&normalize_title("Half Dead"), Some(2022), "movie");
        let now = chrono::Utc::now().timestamp();
        catalog::set_validity(&pool, &id, false, now).await.unwrap();

        // First rediscovered group is dead, second answers.
        let fetch = RepairFetch::new(
            "Half Dead",
            &["https://b.example/dead.m3u8", "https://b.example/live.m3u8"],
        );
        let probe = FakeProbe::dead(&["https://b.example/dead.m3u8", "https://s1/rotten.m3u8"]);
        let summary = repair_invalid(&pool, &fetch, &probe, 10).await.unwrap();
        assert_eq!(summary, RepairSummary { examined: 1, repaired: 1 });

        let row = catalog::get(&pool, &id).await.unwrap().unwrap();
        assert_eq!(row.is_valid, 1);
        assert!(row.play_index.contains("live.m3u8"));
    }
}
