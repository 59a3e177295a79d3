use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct ReportRow {
    pub id: String,
    pub vod_id: String,
    pub url: String,
    pub error_class: String,
    pub reporter: String,
    pub resolved: bool,
    pub created_ts: i64,
}

type ReportTuple = (String, String, String, String, String, i64, i64);

fn row_to_report(r: ReportTuple) -> ReportRow {
    ReportRow {
        id: r.0,
        vod_id: r.1,
        url: r.2,
        error_class: r.3,
        reporter: r.4,
        resolved: r.5 != 0,
        created_ts: r.6,
    }
}

const COLS: &str = "id, vod_id, url, error_class, reporter, resolved, created_ts";

pub async fn create(
    pool: &SqlitePool,
    vod_id: &str,
    url: &str,
    error_class: &str,
    reporter: &str,
) -> Result<ReportRow, sqlx::Error> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO invalid_report (id, vod_id, url, error_class, reporter, resolved, created_ts) \
         VALUES (?, ?, ?, ?, ?, 0, ?)",
    )
    .bind(&id)
    .bind(vod_id)
    .bind(url)
    .bind(error_class)
    .bind(reporter)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(ReportRow {
        id,
        vod_id: vod_id.to_string(),
        url: url.to_string(),
        error_class: error_class.to_string(),
        reporter: reporter.to_string(),
        resolved: false,
        created_ts: now,
    })
}

pub async fn list_open(pool: &SqlitePool, limit: i64) -> Result<Vec<ReportRow>, sqlx::Error> {
    let rows: Vec<ReportTuple> = sqlx::query_as(&format!(
        "SELECT {COLS} FROM invalid_report WHERE resolved = 0 ORDER BY created_ts ASC LIMIT ?"
    ))
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_report).collect())
}

pub async fn open_for_vod(pool: &SqlitePool, vod_id: &str) -> Result<Vec<ReportRow>, sqlx::Error> {
    let rows: Vec<ReportTuple> = sqlx::query_as(&format!(
        "SELECT {COLS} FROM invalid_report WHERE vod_id = ? AND resolved = 0"
    ))
    .bind(vod_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_report).collect())
}

/// Close all open reports for an entry once a repair succeeds.
pub async fn resolve_for_vod(pool: &SqlitePool, vod_id: &str) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE invalid_report SET resolved = 1 WHERE vod_id = ?")
        .bind(vod_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// Drop resolved reports older than the cutoff. Used by the cleanup job.
pub async fn cleanup_resolved_before(pool: &SqlitePool, cutoff_ts: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM invalid_report WHERE resolved = 1 AND created_ts < ?")
        .bind(cutoff_ts)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
