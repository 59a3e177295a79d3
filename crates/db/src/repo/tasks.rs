use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: String,
    pub mode: String,
    pub status: String,
    pub config: String,
    pub processed: i64,
    pub new_items: i64,
    pub updated_items: i64,
    pub skipped: i64,
    pub errors: i64,
    pub checkpoint: Option<String>,
    pub error: Option<String>,
    pub created_ts: i64,
    pub updated_ts: i64,
    pub started_ts: Option<i64>,
    pub finished_ts: Option<i64>,
}

type TaskTuple = (
    String,
    String,
    String,
    String,
    i64,
    i64,
    i64,
    i64,
    i64,
    Option<String>,
    Option<String>,
    i64,
    i64,
    Option<i64>,
    Option<i64>,
);

fn row_to_task(r: TaskTuple) -> TaskRow {
    TaskRow {
        id: r.0,
        mode: r.1,
        status: r.2,
        config: r.3,
        processed: r.4,
        new_items: r.5,
        updated_items: r.6,
        skipped: r.7,
        errors: r.8,
        checkpoint: r.9,
        error: r.10,
        created_ts: r.11,
        updated_ts: r.12,
        started_ts: r.13,
        finished_ts: r.14,
    }
}

const COLS: &str = "id, mode, status, config, processed, new_items, updated_items, skipped, \
     errors, checkpoint, error, created_ts, updated_ts, started_ts, finished_ts";

pub async fn create(
    pool: &SqlitePool,
    mode: &str,
    config_json: &str,
) -> Result<TaskRow, sqlx::Error> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO collect_task (id, mode, status, config, created_ts, updated_ts) \
         VALUES (?, ?, 'pending', ?, ?, ?)",
    )
    .bind(&id)
    .bind(mode)
    .bind(config_json)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(TaskRow {
        id,
        mode: mode.to_string(),
        status: "pending".to_string(),
        config: config_json.to_string(),
        processed: 0,
        new_items: 0,
        updated_items: 0,
        skipped: 0,
        errors: 0,
        checkpoint: None,
        error: None,
        created_ts: now,
        updated_ts: now,
        started_ts: None,
        finished_ts: None,
    })
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<TaskRow>, sqlx::Error> {
    let row: Option<TaskTuple> =
        sqlx::query_as(&format!("SELECT {COLS} FROM collect_task WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(row_to_task))
}

pub async fn list(pool: &SqlitePool, page: i64, per_page: i64) -> Result<Vec<TaskRow>, sqlx::Error> {
    let offset = (page.max(1) - 1) * per_page;
    let rows: Vec<TaskTuple> = sqlx::query_as(&format!(
        "SELECT {COLS} FROM collect_task ORDER BY created_ts DESC LIMIT ? OFFSET ?"
    ))
    .bind(per_page)
    .bind(offset)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_task).collect())
}

/// Cheap status read used between page fetches for cancel/pause checks.
pub async fn status(pool: &SqlitePool, id: &str) -> Result<Option<String>, sqlx::Error> {
    let row: Option<(String,)> = sqlx::query_as("SELECT status FROM collect_task WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(s,)| s))
}

pub async fn set_status(
    pool: &SqlitePool,
    id: &str,
    status: &str,
    error: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE collect_task SET status = ?, error = COALESCE(?, error), updated_ts = ?, \
         started_ts = CASE WHEN ? = 'running' AND started_ts IS NULL THEN ? ELSE started_ts END, \
         finished_ts = CASE WHEN ? IN ('completed', 'failed', 'cancelled') THEN ? ELSE finished_ts END \
         WHERE id = ?",
    )
    .bind(status)
    .bind(error)
    .bind(now)
    .bind(status)
    .bind(now)
    .bind(status)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Persist progress counters and the resume checkpoint in one write.
pub async fn update_progress(
    pool: &SqlitePool,
    id: &str,
    processed: i64,
    new_items: i64,
    updated_items: i64,
    skipped: i64,
    errors: i64,
    checkpoint_json: Option<&str>,
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "UPDATE collect_task SET processed = ?, new_items = ?, updated_items = ?, \
         skipped = ?, errors = ?, checkpoint = COALESCE(?, checkpoint), updated_ts = ? \
         WHERE id = ?",
    )
    .bind(processed)
    .bind(new_items)
    .bind(updated_items)
    .bind(skipped)
    .bind(errors)
    .bind(checkpoint_json)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Mark a task cancelled. Only non-terminal tasks can be cancelled; the
/// checkpoint is left intact for a later resume.
pub async fn request_cancel(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE collect_task SET status = 'cancelled', updated_ts = ?, finished_ts = ? \
         WHERE id = ? AND status IN ('pending', 'running', 'paused')",
    )
    .bind(now)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Pause a running task. The orchestrator observes this between pages.
pub async fn request_pause(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE collect_task SET status = 'paused', updated_ts = ? \
         WHERE id = ? AND status IN ('pending', 'running')",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Move a paused task back to pending so a runner can pick it up at its
/// checkpoint.
pub async fn request_resume(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE collect_task SET status = 'pending', updated_ts = ? \
         WHERE id = ? AND status = 'paused'",
    )
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lifecycle_timestamps() {
        let pool = crate::connect(":memory:").await.unwrap();
        crate::migrate::run(&pool).await.unwrap();

        let task = create(&pool, "incremental", "{}").await.unwrap();
        assert_eq!(task.status, "pending");

        set_status(&pool, &task.id, "running", None).await.unwrap();
        let t = get(&pool, &task.id).await.unwrap().unwrap();
        assert!(t.started_ts.is_some());
        assert!(t.finished_ts.is_none());

        set_status(&pool, &task.id, "completed", None).await.unwrap();
        let t = get(&pool, &task.id).await.unwrap().unwrap();
        assert!(t.finished_ts.is_some());
    }

    #[tokio::test]
    async fn cancel_only_non_terminal() {
        let pool = crate::connect(":memory:").await.unwrap();
        crate::migrate::run(&pool).await.unwrap();

        let task = create(&pool, "full", "{}").await.unwrap();
        assert!(request_cancel(&pool, &task.id).await.unwrap());
        // Second cancel is a no-op.
        assert!(!request_cancel(&pool, &task.id).await.unwrap());
    }

    #[tokio::test]
    async fn pause_and_resume() {
        let pool = crate::connect(":memory:").await.unwrap();
        crate::migrate::run(&pool).await.unwrap();

        let task = create(&pool, "full", "{}").await.unwrap();
        set_status(&pool, &task.id, "running", None).await.unwrap();
        assert!(request_pause(&pool, &task.id).await.unwrap());
        assert_eq!(status(&pool, &task.id).await.unwrap().unwrap(), "paused");
        assert!(request_resume(&pool, &task.id).await.unwrap());
        assert_eq!(status(&pool, &task.id).await.unwrap().unwrap(), "pending");
        // Resume on a non-paused task is rejected.
        assert!(!request_resume(&pool, &task.id).await.unwrap());
    }
}
