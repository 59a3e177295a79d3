//! Reconciliation engine: dedup matching, quality scoring, and the
//! field-merge policy.
//!
//! Merge rules:
//! 1. Scalars follow source priority: the incoming value wins when its
//!    priority is at least the existing one's, or the existing field is
//!    empty.
//! 2. The play index is a union keyed by source label, never a
//!    replacement.
//! 3. Same-key merges are commutative across sources and idempotent for
//!    repeated payloads.

use sqlx::SqlitePool;
use tracing::debug;

use vodsync_core::key::{content_key, normalize_title};
use vodsync_db::repo::catalog::{self, VodRow};
use vodsync_spider::CanonicalRecord;

/// How one field resolves when two same-key records disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    PreferHigherPriority,
    Union,
    PreferNonEmpty,
}

/// The explicit policy table. Keeping it a function of the field name
/// makes the policy testable apart from the merge loop.
pub fn policy_for(field: &str) -> MergePolicy {
    match field {
        "play_index" => MergePolicy::Union,
        "title" => MergePolicy::PreferNonEmpty,
        _ => MergePolicy::PreferHigherPriority,
    }
}

/// Weighted completeness heuristic, 0–100.
pub fn quality_score(row: &VodRow) -> i64 {
    let mut score = 0;

    if row.synopsis.as_deref().is_some_and(|s| s.chars().count() >= 10) {
        score += 25;
    }
    if !row.cast_vec().is_empty() {
        score += 20;
    }
    if row.rating > 0.0 {
        score += 15;
    }

    let play = row.play_index();
    if play.episode_count() > 1 {
        score += 20;
    }
    if play
        .first_urls()
        .first()
        .is_some_and(|u| u.starts_with("http://") || u.starts_with("https://"))
    {
        score += 20;
    }

    score
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Build the catalog row a canonical record would create on its own.
pub fn row_from_record(rec: &CanonicalRecord, priority: i64, now: i64) -> VodRow {
    let title_norm = normalize_title(&rec.title);
    let id = content_key(&title_norm, rec.year, &rec.category);
    let play_json = rec.play_index.to_json();
    let mut row = VodRow {
        id,
        title: rec.title.clone(),
        title_norm,
        category: rec.category.clone(),
        year: rec.year,
        region: rec.region.clone(),
        genres: serde_json::to_string(&rec.genres).unwrap_or_else(|_| "[]".into()),
        cast_list: serde_json::to_string(&rec.cast).unwrap_or_else(|_| "[]".into()),
        synopsis: rec.synopsis.clone(),
        remark: rec.remark.clone(),
        play_index: play_json,
        rating: rec.rating,
        quality_score: 0,
        source_priority: priority,
        is_valid: (!rec.play_index.is_empty()) as i64,
        last_checked_ts: None,
        created_ts: now,
        updated_ts: now,
    };
    row.quality_score = quality_score(&row);
    row
}

fn str_empty(v: &Option<String>) -> bool {
    v.as_deref().map_or(true, |s| s.trim().is_empty())
}

fn json_list_empty(v: &str) -> bool {
    serde_json::from_str::<Vec<String>>(v)
        .map(|l| l.is_empty())
        .unwrap_or(true)
}

/// Whether the incoming value replaces the existing one for a field under
/// the given policy. `wins` is the priority comparison; the emptiness
/// flags are per-field so every scalar type can feed the same rule.
fn incoming_wins(
    policy: MergePolicy,
    wins: bool,
    existing_empty: bool,
    incoming_empty: bool,
) -> bool {
    if incoming_empty {
        return false;
    }
    match policy {
        MergePolicy::PreferNonEmpty => existing_empty,
        MergePolicy::PreferHigherPriority => wins || existing_empty,
        // Union fields are merged structurally, never replaced wholesale.
        MergePolicy::Union => false,
    }
}

/// Merge `incoming` into `existing`, each field resolved through
/// [`policy_for`]. Does not touch `updated_ts` or `quality_score`;
/// callers recompute those after deciding whether anything changed.
pub fn merge_rows(existing: &mut VodRow, incoming: &VodRow) {
    let wins = incoming.source_priority >= existing.source_priority;
    let take = |field: &str, existing_empty: bool, incoming_empty: bool| {
        incoming_wins(policy_for(field), wins, existing_empty, incoming_empty)
    };

    if take(
        "title",
        existing.title.trim().is_empty(),
        incoming.title.trim().is_empty(),
    ) {
        existing.title = incoming.title.clone();
    }
    if take("synopsis", str_empty(&existing.synopsis), str_empty(&incoming.synopsis)) {
        existing.synopsis = incoming.synopsis.clone();
    }
    if take("region", str_empty(&existing.region), str_empty(&incoming.region)) {
        existing.region = incoming.region.clone();
    }
    if take("remark", str_empty(&existing.remark), str_empty(&incoming.remark)) {
        existing.remark = incoming.remark.clone();
    }
    if take("year", existing.year.is_none(), incoming.year.is_none()) {
        existing.year = incoming.year;
    }
    if take("rating", existing.rating <= 0.0, incoming.rating <= 0.0) {
        existing.rating = incoming.rating;
    }
    if take(
        "genres",
        json_list_empty(&existing.genres),
        json_list_empty(&incoming.genres),
    ) {
        existing.genres = incoming.genres.clone();
    }
    if take(
        "cast",
        json_list_empty(&existing.cast_list),
        json_list_empty(&incoming.cast_list),
    ) {
        existing.cast_list = incoming.cast_list.clone();
    }

    // play_index is the Union field: merged keyed by source label.
    if policy_for("play_index") == MergePolicy::Union {
        let mut play = existing.play_index();
        let incoming_play = incoming.play_index();
        let before = play.clone();
        play.union(&incoming_play);
        if play != before {
            existing.play_index = play.to_json();
            // Fresh URLs arrived; the entry is playable again until the
            // validator says otherwise.
            existing.is_valid = 1;
        }
    }

    existing.source_priority = existing.source_priority.max(incoming.source_priority);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    New,
    Updated,
    Unchanged,
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db) if db.is_unique_violation())
}

/// Read-before-write upsert on the content key. This is what keeps
/// row-level last-writer-wins semantically correct.
///
/// Overlapping runs may both read an absent key and race on the insert;
/// the loser's unique violation is benign and routes into the merge path
/// instead of failing the task.
pub async fn upsert_record(
    pool: &SqlitePool,
    rec: &CanonicalRecord,
    priority: i64,
) -> Result<UpsertOutcome, sqlx::Error> {
    let now = now_ts();
    let incoming = row_from_record(rec, priority, now);

    if catalog::get(pool, &incoming.id).await?.is_none() {
        match catalog::insert(pool, &incoming).await {
            Ok(()) => {
                debug!(id = %incoming.id, title = %incoming.title, "catalog entry created");
                return Ok(UpsertOutcome::New);
            }
            // Lost the insert race with an overlapping run; the row
            // exists now, so merge into it.
            Err(e) if is_unique_violation(&e) => {}
            Err(e) => return Err(e),
        }
    }

    let mut existing = catalog::get(pool, &incoming.id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)?;
    let before = existing.clone();
    merge_rows(&mut existing, &incoming);
    existing.quality_score = quality_score(&existing);
    if existing == before {
        return Ok(UpsertOutcome::Unchanged);
    }
    existing.updated_ts = now;
    catalog::update(pool, &existing).await?;
    debug!(id = %existing.id, title = %existing.title, "catalog entry merged");
    Ok(UpsertOutcome::Updated)
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BatchStats {
    pub new_items: i64,
    pub updated: i64,
    pub skipped: i64,
}

/// Flush a batch of canonical records from one source in a single pass.
/// Batching bounds store round-trips; it carries no ordering guarantee.
pub async fn flush_batch(
    pool: &SqlitePool,
    records: &[CanonicalRecord],
    priority: i64,
) -> Result<BatchStats, sqlx::Error> {
    let mut stats = BatchStats::default();
    for rec in records {
        if rec.title.trim().is_empty() {
            stats.skipped += 1;
            continue;
        }
        match upsert_record(pool, rec, priority).await? {
            UpsertOutcome::New => stats.new_items += 1,
            UpsertOutcome::Updated => stats.updated += 1,
            UpsertOutcome::Unchanged => stats.skipped += 1,
        }
    }
    Ok(stats)
}
