use sqlx::SqlitePool;

use vodsync_core::play::PlayIndex;

/// A catalog entry row. Wide enough that we lean on `FromRow` instead of
/// the tuple decoding used for the narrower tables.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct VodRow {
    pub id: String,
    pub title: String,
    pub title_norm: String,
    pub category: String,
    pub year: Option<i64>,
    pub region: Option<String>,
    pub genres: String,
    pub cast_list: String,
    pub synopsis: Option<String>,
    pub remark: Option<String>,
    pub play_index: String,
    pub rating: f64,
    pub quality_score: i64,
    pub source_priority: i64,
    pub is_valid: i64,
    pub last_checked_ts: Option<i64>,
    pub created_ts: i64,
    pub updated_ts: i64,
}

impl VodRow {
    pub fn play_index(&self) -> PlayIndex {
        PlayIndex::from_json(&self.play_index)
    }

    pub fn genres_vec(&self) -> Vec<String> {
        serde_json::from_str(&self.genres).unwrap_or_default()
    }

    pub fn cast_vec(&self) -> Vec<String> {
        serde_json::from_str(&self.cast_list).unwrap_or_default()
    }
}

const VOD_COLUMNS: &str = "id, title, title_norm, category, year, region, genres, cast_list, \
     synopsis, remark, play_index, rating, quality_score, source_priority, \
     is_valid, last_checked_ts, created_ts, updated_ts";

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<VodRow>, sqlx::Error> {
    sqlx::query_as::<_, VodRow>(&format!("SELECT {VOD_COLUMNS} FROM vod WHERE id = ?"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

/// All rows sharing one dedup key, newest first.
pub async fn get_by_key(
    pool: &SqlitePool,
    title_norm: &str,
    year: Option<i64>,
    category: &str,
) -> Result<Vec<VodRow>, sqlx::Error> {
    sqlx::query_as::<_, VodRow>(&format!(
        "SELECT {VOD_COLUMNS} FROM vod \
         WHERE title_norm = ? AND year IS ? AND category = ? ORDER BY updated_ts DESC"
    ))
    .bind(title_norm)
    .bind(year)
    .bind(category)
    .fetch_all(pool)
    .await
}

pub async fn insert(pool: &SqlitePool, row: &VodRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO vod (id, title, title_norm, category, year, region, genres, cast_list, \
         synopsis, remark, play_index, rating, quality_score, source_priority, \
         is_valid, last_checked_ts, created_ts, updated_ts) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&row.id)
    .bind(&row.title)
    .bind(&row.title_norm)
    .bind(&row.category)
    .bind(row.year)
    .bind(&row.region)
    .bind(&row.genres)
    .bind(&row.cast_list)
    .bind(&row.synopsis)
    .bind(&row.remark)
    .bind(&row.play_index)
    .bind(row.rating)
    .bind(row.quality_score)
    .bind(row.source_priority)
    .bind(row.is_valid)
    .bind(row.last_checked_ts)
    .bind(row.created_ts)
    .bind(row.updated_ts)
    .execute(pool)
    .await?;

    sync_fts(pool, row).await
}

/// Update every merged field. `created_ts` is immutable.
pub async fn update(pool: &SqlitePool, row: &VodRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE vod SET title = ?, title_norm = ?, category = ?, year = ?, region = ?, \
         genres = ?, cast_list = ?, synopsis = ?, remark = ?, play_index = ?, rating = ?, \
         quality_score = ?, source_priority = ?, is_valid = ?, last_checked_ts = ?, \
         updated_ts = ? WHERE id = ?",
    )
    .bind(&row.title)
    .bind(&row.title_norm)
    .bind(&row.category)
    .bind(row.year)
    .bind(&row.region)
    .bind(&row.genres)
    .bind(&row.cast_list)
    .bind(&row.synopsis)
    .bind(&row.remark)
    .bind(&row.play_index)
    .bind(row.rating)
    .bind(row.quality_score)
    .bind(row.source_priority)
    .bind(row.is_valid)
    .bind(row.last_checked_ts)
    .bind(row.updated_ts)
    .bind(&row.id)
    .execute(pool)
    .await?;

    sync_fts(pool, row).await
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    sqlx::query("DELETE FROM vod_fts WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    let result = sqlx::query("DELETE FROM vod WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Keep the full-text projection in step with the catalog row.
async fn sync_fts(pool: &SqlitePool, row: &VodRow) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM vod_fts WHERE id = ?")
        .bind(&row.id)
        .execute(pool)
        .await?;
    sqlx::query("INSERT INTO vod_fts (id, title, cast_list, synopsis) VALUES (?, ?, ?, ?)")
        .bind(&row.id)
        .bind(&row.title)
        .bind(&row.cast_list)
        .bind(&row.synopsis)
        .execute(pool)
        .await?;
    Ok(())
}

/// Repopulate the full-text projection from scratch.
pub async fn rebuild_fts(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    sqlx::query("DELETE FROM vod_fts").execute(pool).await?;
    let result = sqlx::query(
        "INSERT INTO vod_fts (id, title, cast_list, synopsis) \
         SELECT id, title, cast_list, synopsis FROM vod",
    )
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Catalog listing with optional filters, newest first.
pub async fn list(
    pool: &SqlitePool,
    category: Option<&str>,
    year: Option<i64>,
    region: Option<&str>,
    page: i64,
    per_page: i64,
) -> Result<Vec<VodRow>, sqlx::Error> {
    let offset = (page.max(1) - 1) * per_page;
    sqlx::query_as::<_, VodRow>(&format!(
        "SELECT {VOD_COLUMNS} FROM vod \
         WHERE (?1 IS NULL OR category = ?1) \
           AND (?2 IS NULL OR year = ?2) \
           AND (?3 IS NULL OR region = ?3) \
         ORDER BY updated_ts DESC LIMIT ?4 OFFSET ?5"
    ))
    .bind(category)
    .bind(year)
    .bind(region)
    .bind(per_page)
    .bind(offset)
    .fetch_all(pool)
    .await
}

/// Full-text search over title/cast/synopsis, with a LIKE fallback for
/// terms the FTS tokenizer cannot split (CJK substrings in particular).
pub async fn search(
    pool: &SqlitePool,
    query: &str,
    page: i64,
    per_page: i64,
) -> Result<Vec<VodRow>, sqlx::Error> {
    let offset = (page.max(1) - 1) * per_page;
    // Quote so user input is a term, never FTS syntax.
    let fts_query = format!("\"{}\"", query.replace('"', ""));

    let rows = sqlx::query_as::<_, VodRow>(&format!(
        "SELECT {VOD_COLUMNS} FROM vod WHERE id IN \
         (SELECT id FROM vod_fts WHERE vod_fts MATCH ?) \
         ORDER BY updated_ts DESC LIMIT ? OFFSET ?"
    ))
    .bind(&fts_query)
    .bind(per_page)
    .bind(offset)
    .fetch_all(pool)
    .await?;

    if !rows.is_empty() {
        return Ok(rows);
    }

    let like = format!("%{query}%");
    sqlx::query_as::<_, VodRow>(&format!(
        "SELECT {VOD_COLUMNS} FROM vod \
         WHERE title LIKE ?1 OR cast_list LIKE ?1 OR synopsis LIKE ?1 \
         ORDER BY updated_ts DESC LIMIT ?2 OFFSET ?3"
    ))
    .bind(&like)
    .bind(per_page)
    .bind(offset)
    .fetch_all(pool)
    .await
}

/// Least-recently-checked valid entries, for the URL validator.
pub async fn stale_valid(pool: &SqlitePool, limit: i64) -> Result<Vec<VodRow>, sqlx::Error> {
    sqlx::query_as::<_, VodRow>(&format!(
        "SELECT {VOD_COLUMNS} FROM vod WHERE is_valid = 1 \
         ORDER BY last_checked_ts ASC NULLS FIRST LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Entries already flagged invalid, for the repair pass.
pub async fn invalid_entries(pool: &SqlitePool, limit: i64) -> Result<Vec<VodRow>, sqlx::Error> {
    sqlx::query_as::<_, VodRow>(&format!(
        "SELECT {VOD_COLUMNS} FROM vod WHERE is_valid = 0 \
         ORDER BY last_checked_ts ASC NULLS FIRST LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await
}

pub async fn set_validity(
    pool: &SqlitePool,
    id: &str,
    valid: bool,
    checked_ts: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE vod SET is_valid = ?, last_checked_ts = ? WHERE id = ?")
        .bind(valid as i64)
        .bind(checked_ts)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn touch_checked(pool: &SqlitePool, id: &str, checked_ts: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE vod SET last_checked_ts = ? WHERE id = ?")
        .bind(checked_ts)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Dedup keys that currently map to more than one row. A race between two
/// ingestion passes can create these before the per-write check catches it.
pub async fn duplicate_keys(
    pool: &SqlitePool,
) -> Result<Vec<(String, Option<i64>, String)>, sqlx::Error> {
    sqlx::query_as(
        "SELECT title_norm, year, category FROM vod \
         GROUP BY title_norm, year, category HAVING COUNT(*) > 1",
    )
    .fetch_all(pool)
    .await
}

/// Categories currently present in the catalog, busiest first.
pub async fn distinct_categories(pool: &SqlitePool) -> Result<Vec<String>, sqlx::Error> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT category FROM vod WHERE category != '' \
         GROUP BY category ORDER BY COUNT(*) DESC",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(|(c,)| c).collect())
}

pub async fn count(pool: &SqlitePool) -> Result<i64, sqlx::Error> {
    let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM vod")
        .fetch_one(pool)
        .await?;
    Ok(row.0)
}
