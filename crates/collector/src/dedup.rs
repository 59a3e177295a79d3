//! Duplicate-merge maintenance job.
//!
//! The per-write check in the reconciler keeps one row per dedup key, but
//! a race between two ingestion passes can still land two rows with
//! different ids for the same logical title. This job finds and merges
//! them; running it twice in a row is a no-op the second time.

use sqlx::SqlitePool;
use tracing::info;

use crate::reconcile::{merge_rows, quality_score};
use vodsync_db::repo::{catalog, logs};

#[derive(Debug, Default, Clone, Copy)]
pub struct DedupSummary {
    pub keys_scanned: i64,
    pub merged: i64,
}

pub async fn merge_duplicates(pool: &SqlitePool) -> Result<DedupSummary, sqlx::Error> {
    let keys = catalog::duplicate_keys(pool).await?;
    let mut summary = DedupSummary {
        keys_scanned: keys.len() as i64,
        merged: 0,
    };

    for (title_norm, year, category) in keys {
        let rows = catalog::get_by_key(pool, &title_norm, year, &category).await?;
        if rows.len() < 2 {
            continue;
        }

        // Winner: strongest provenance, then most complete, then oldest.
        let mut rows = rows;
        rows.sort_by(|a, b| {
            b.source_priority
                .cmp(&a.source_priority)
                .then(b.quality_score.cmp(&a.quality_score))
                .then(a.created_ts.cmp(&b.created_ts))
        });

        let mut winner = rows.remove(0);
        for loser in rows {
            merge_rows(&mut winner, &loser);
            catalog::delete(pool, &loser.id).await?;
            logs::append(
                pool,
                None,
                "info",
                None,
                "duplicate_merge",
                &format!("merged duplicate '{}' into {}", loser.title, winner.id),
                Some(&winner.id),
            )
            .await?;
            summary.merged += 1;
        }

        winner.quality_score = quality_score(&winner);
        winner.updated_ts = chrono::Utc::now().timestamp();
        catalog::update(pool, &winner).await?;
    }

    if summary.merged > 0 {
        info!(
            merged = summary.merged,
            keys = summary.keys_scanned,
            "duplicate merge pass finished"
        );
    }
    Ok(summary)
}
