use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct LogRow {
    pub id: i64,
    pub task_id: Option<String>,
    pub level: String,
    pub source_id: Option<String>,
    pub action: String,
    pub message: String,
    pub vod_id: Option<String>,
    pub created_ts: i64,
}

type LogTuple = (
    i64,
    Option<String>,
    String,
    Option<String>,
    String,
    String,
    Option<String>,
    i64,
);

fn row_to_log(r: LogTuple) -> LogRow {
    LogRow {
        id: r.0,
        task_id: r.1,
        level: r.2,
        source_id: r.3,
        action: r.4,
        message: r.5,
        vod_id: r.6,
        created_ts: r.7,
    }
}

/// Append-only audit entry. The pipeline only ever writes these.
pub async fn append(
    pool: &SqlitePool,
    task_id: Option<&str>,
    level: &str,
    source_id: Option<&str>,
    action: &str,
    message: &str,
    vod_id: Option<&str>,
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "INSERT INTO collect_log (task_id, level, source_id, action, message, vod_id, created_ts) \
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(task_id)
    .bind(level)
    .bind(source_id)
    .bind(action)
    .bind(message)
    .bind(vod_id)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn list_for_task(
    pool: &SqlitePool,
    task_id: &str,
    limit: i64,
) -> Result<Vec<LogRow>, sqlx::Error> {
    let rows: Vec<LogTuple> = sqlx::query_as(
        "SELECT id, task_id, level, source_id, action, message, vod_id, created_ts \
         FROM collect_log WHERE task_id = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(task_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_log).collect())
}

/// Drop audit rows older than the cutoff. Used by the cleanup job.
pub async fn cleanup_before(pool: &SqlitePool, cutoff_ts: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM collect_log WHERE created_ts < ?")
        .bind(cutoff_ts)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
