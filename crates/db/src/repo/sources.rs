use sqlx::SqlitePool;

#[derive(Debug, Clone)]
pub struct SourceRow {
    pub id: String,
    pub name: String,
    pub base_url: String,
    pub weight: i64,
    pub active: bool,
    pub created_ts: i64,
    pub updated_ts: i64,
}

type SourceTuple = (String, String, String, i64, i64, i64, i64);

fn row_to_source(r: SourceTuple) -> SourceRow {
    SourceRow {
        id: r.0,
        name: r.1,
        base_url: r.2,
        weight: r.3,
        active: r.4 != 0,
        created_ts: r.5,
        updated_ts: r.6,
    }
}

const COLS: &str = "id, name, base_url, weight, active, created_ts, updated_ts";

/// Active sources in weight order, strongest first. The pipeline reads
/// sources only through this.
pub async fn list_active(pool: &SqlitePool) -> Result<Vec<SourceRow>, sqlx::Error> {
    let rows: Vec<SourceTuple> = sqlx::query_as(&format!(
        "SELECT {COLS} FROM source WHERE active = 1 ORDER BY weight DESC, id"
    ))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(row_to_source).collect())
}

pub async fn list_all(pool: &SqlitePool) -> Result<Vec<SourceRow>, sqlx::Error> {
    let rows: Vec<SourceTuple> =
        sqlx::query_as(&format!("SELECT {COLS} FROM source ORDER BY weight DESC, id"))
            .fetch_all(pool)
            .await?;
    Ok(rows.into_iter().map(row_to_source).collect())
}

pub async fn get(pool: &SqlitePool, id: &str) -> Result<Option<SourceRow>, sqlx::Error> {
    let row: Option<SourceTuple> =
        sqlx::query_as(&format!("SELECT {COLS} FROM source WHERE id = ?"))
            .bind(id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(row_to_source))
}

pub async fn create(
    pool: &SqlitePool,
    name: &str,
    base_url: &str,
    weight: i64,
) -> Result<SourceRow, sqlx::Error> {
    let id = uuid::Uuid::new_v4().to_string();
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO source (id, name, base_url, weight, active, created_ts, updated_ts) \
         VALUES (?, ?, ?, ?, 1, ?, ?)",
    )
    .bind(&id)
    .bind(name)
    .bind(base_url)
    .bind(weight)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    Ok(SourceRow {
        id,
        name: name.to_string(),
        base_url: base_url.to_string(),
        weight,
        active: true,
        created_ts: now,
        updated_ts: now,
    })
}

pub async fn update(
    pool: &SqlitePool,
    id: &str,
    name: Option<&str>,
    base_url: Option<&str>,
    weight: Option<i64>,
    active: Option<bool>,
) -> Result<bool, sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query(
        "UPDATE source SET \
         name = COALESCE(?, name), \
         base_url = COALESCE(?, base_url), \
         weight = COALESCE(?, weight), \
         active = COALESCE(?, active), \
         updated_ts = ? \
         WHERE id = ?",
    )
    .bind(name)
    .bind(base_url)
    .bind(weight)
    .bind(active.map(|a| a as i64))
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete(pool: &SqlitePool, id: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM source WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}
