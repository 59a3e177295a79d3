use sqlx::SqlitePool;

/// One health row per source. Mutated only by the health monitor; the
/// orchestrator reads it to decide eligibility.
#[derive(Debug, Clone)]
pub struct HealthRow {
    pub source_id: String,
    pub status: String,
    pub latency_ms: Option<i64>,
    pub success_rate: f64,
    pub consecutive_failures: i64,
    pub skipped_cycles: i64,
    pub last_error: Option<String>,
    pub probed_ts: Option<i64>,
}

impl HealthRow {
    /// Fresh row for a source that has never been probed.
    pub fn unknown(source_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            status: "unknown".to_string(),
            latency_ms: None,
            success_rate: 1.0,
            consecutive_failures: 0,
            skipped_cycles: 0,
            last_error: None,
            probed_ts: None,
        }
    }
}

type HealthTuple = (
    String,
    String,
    Option<i64>,
    f64,
    i64,
    i64,
    Option<String>,
    Option<i64>,
);

fn row_to_health(r: HealthTuple) -> HealthRow {
    HealthRow {
        source_id: r.0,
        status: r.1,
        latency_ms: r.2,
        success_rate: r.3,
        consecutive_failures: r.4,
        skipped_cycles: r.5,
        last_error: r.6,
        probed_ts: r.7,
    }
}

const COLS: &str = "source_id, status, latency_ms, success_rate, consecutive_failures, \
     skipped_cycles, last_error, probed_ts";

/// Health for one source; sources never probed read as `unknown`.
pub async fn get(pool: &SqlitePool, source_id: &str) -> Result<HealthRow, sqlx::Error> {
    let row: Option<HealthTuple> =
        sqlx::query_as(&format!("SELECT {COLS} FROM source_health WHERE source_id = ?"))
            .bind(source_id)
            .fetch_optional(pool)
            .await?;
    Ok(row
        .map(row_to_health)
        .unwrap_or_else(|| HealthRow::unknown(source_id)))
}

pub async fn list(pool: &SqlitePool) -> Result<Vec<HealthRow>, sqlx::Error> {
    let rows: Vec<HealthTuple> =
        sqlx::query_as(&format!("SELECT {COLS} FROM source_health ORDER BY source_id"))
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(row_to_health).collect())
}

pub async fn upsert(pool: &SqlitePool, row: &HealthRow) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO source_health (source_id, status, latency_ms, success_rate, \
         consecutive_failures, skipped_cycles, last_error, probed_ts) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(source_id) DO UPDATE SET \
         status = excluded.status, latency_ms = excluded.latency_ms, \
         success_rate = excluded.success_rate, \
         consecutive_failures = excluded.consecutive_failures, \
         skipped_cycles = excluded.skipped_cycles, \
         last_error = excluded.last_error, probed_ts = excluded.probed_ts",
    )
    .bind(&row.source_id)
    .bind(&row.status)
    .bind(row.latency_ms)
    .bind(row.success_rate)
    .bind(row.consecutive_failures)
    .bind(row.skipped_cycles)
    .bind(&row.last_error)
    .bind(row.probed_ts)
    .execute(pool)
    .await?;
    Ok(())
}

/// Bump the skipped-cycle counter for a circuit-open source at the end of
/// an orchestrator pass.
pub async fn mark_cycle_skipped(pool: &SqlitePool, source_id: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE source_health SET skipped_cycles = skipped_cycles + 1 WHERE source_id = ?",
    )
    .bind(source_id)
    .execute(pool)
    .await?;
    Ok(())
}
