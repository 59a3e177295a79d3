use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct ScheduleRow {
    pub name: String,
    pub cadence: String,
    pub builtin: bool,
    pub enabled: bool,
    pub updated_ts: i64,
}

type ScheduleTuple = (String, String, i64, i64, i64);

fn row_to_schedule(r: ScheduleTuple) -> ScheduleRow {
    ScheduleRow {
        name: r.0,
        cadence: r.1,
        builtin: r.2 != 0,
        enabled: r.3 != 0,
        updated_ts: r.4,
    }
}

const COLS: &str = "name, cadence, builtin, enabled, updated_ts";

/// Seed built-in jobs. Existing rows keep their operator-edited cadence.
pub async fn insert_defaults(
    pool: &SqlitePool,
    defaults: &[(&str, &str)],
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    for (name, cadence) in defaults {
        sqlx::query(
            "INSERT OR IGNORE INTO schedule (name, cadence, builtin, enabled, updated_ts) \
             VALUES (?, ?, 1, 1, ?)",
        )
        .bind(name)
        .bind(cadence)
        .bind(now)
        .execute(pool)
        .await?;
    }
    Ok(())
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<ScheduleRow>, sqlx::Error> {
    let rows: Vec<ScheduleTuple> =
        sqlx::query_as(&format!("SELECT {COLS} FROM schedule ORDER BY name"))
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(row_to_schedule).collect())
}

pub async fn get(pool: &SqlitePool, name: &str) -> Result<Option<ScheduleRow>, sqlx::Error> {
    let row: Option<ScheduleTuple> =
        sqlx::query_as(&format!("SELECT {COLS} FROM schedule WHERE name = ?"))
            .bind(name)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(row_to_schedule))
}

pub async fn set_cadence(pool: &SqlitePool, name: &str, cadence: &str) -> Result<bool, sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query("UPDATE schedule SET cadence = ?, updated_ts = ? WHERE name = ?")
        .bind(cadence)
        .bind(now)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn set_enabled(pool: &SqlitePool, name: &str, enabled: bool) -> Result<bool, sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query("UPDATE schedule SET enabled = ?, updated_ts = ? WHERE name = ?")
        .bind(enabled as i64)
        .bind(now)
        .bind(name)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Every execution is recorded, success or not.
pub async fn record_run(
    pool: &SqlitePool,
    job: &str,
    status: &str,
    duration_ms: i64,
    message: Option<&str>,
) -> Result<(), sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    sqlx::query(
        "INSERT INTO schedule_run (job, status, duration_ms, message, started_ts) \
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(job)
    .bind(status)
    .bind(duration_ms)
    .bind(message)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct RunRow {
    pub id: i64,
    pub job: String,
    pub status: String,
    pub duration_ms: i64,
    pub message: Option<String>,
    pub started_ts: i64,
}

pub async fn recent_runs(
    pool: &SqlitePool,
    job: &str,
    limit: i64,
) -> Result<Vec<RunRow>, sqlx::Error> {
    let rows: Vec<(i64, String, String, i64, Option<String>, i64)> = sqlx::query_as(
        "SELECT id, job, status, duration_ms, message, started_ts \
         FROM schedule_run WHERE job = ? ORDER BY id DESC LIMIT ?",
    )
    .bind(job)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows
        .into_iter()
        .map(|r| RunRow {
            id: r.0,
            job: r.1,
            status: r.2,
            duration_ms: r.3,
            message: r.4,
            started_ts: r.5,
        })
        .collect())
}

/// Drop run history older than the cutoff. Used by the cleanup job.
pub async fn cleanup_runs_before(pool: &SqlitePool, cutoff_ts: i64) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("DELETE FROM schedule_run WHERE started_ts < ?")
        .bind(cutoff_ts)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_do_not_clobber_edits() {
        let pool = crate::connect(":memory:").await.unwrap();
        crate::migrate::run(&pool).await.unwrap();

        insert_defaults(&pool, &[("incremental_collect", "0 0 * * * *")])
            .await
            .unwrap();
        set_cadence(&pool, "incremental_collect", "0 30 * * * *")
            .await
            .unwrap();
        insert_defaults(&pool, &[("incremental_collect", "0 0 * * * *")])
            .await
            .unwrap();

        let row = get(&pool, "incremental_collect").await.unwrap().unwrap();
        assert_eq!(row.cadence, "0 30 * * * *");
        assert!(row.builtin);
    }

    #[tokio::test]
    async fn run_history_recorded_and_pruned() {
        let pool = crate::connect(":memory:").await.unwrap();
        crate::migrate::run(&pool).await.unwrap();

        record_run(&pool, "health_sweep", "completed", 12, None)
            .await
            .unwrap();
        record_run(&pool, "health_sweep", "failed", 5, Some("boom"))
            .await
            .unwrap();

        let runs = recent_runs(&pool, "health_sweep", 10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].status, "failed");

        let dropped = cleanup_runs_before(&pool, chrono::Utc::now().timestamp() + 1)
            .await
            .unwrap();
        assert_eq!(dropped, 2);
    }
}
