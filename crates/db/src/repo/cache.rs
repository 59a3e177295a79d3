//! Opaque TTL key-value cache.
//!
//! Used only to short-circuit read-heavy downstream consumers; the
//! pipeline never depends on it for correctness. Expired rows read as
//! absent and are purged lazily.

use sqlx::SqlitePool;

pub async fn put(
    pool: &SqlitePool,
    key: &str,
    value: &str,
    ttl_secs: i64,
) -> Result<(), sqlx::Error> {
    let expires = chrono::Utc::now().timestamp() + ttl_secs;
    sqlx::query(
        "INSERT INTO cache (key, value, expires_ts) VALUES (?, ?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, expires_ts = excluded.expires_ts",
    )
    .bind(key)
    .bind(value)
    .bind(expires)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &SqlitePool, key: &str) -> Result<Option<String>, sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    let row: Option<(String,)> =
        sqlx::query_as("SELECT value FROM cache WHERE key = ? AND expires_ts > ?")
            .bind(key)
            .bind(now)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(v,)| v))
}

pub async fn delete(pool: &SqlitePool, key: &str) -> Result<bool, sqlx::Error> {
    let result = sqlx::query("DELETE FROM cache WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn purge_expired(pool: &SqlitePool) -> Result<u64, sqlx::Error> {
    let now = chrono::Utc::now().timestamp();
    let result = sqlx::query("DELETE FROM cache WHERE expires_ts <= ?")
        .bind(now)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn expired_keys_read_as_absent() {
        let pool = crate::connect(":memory:").await.unwrap();
        crate::migrate::run(&pool).await.unwrap();

        put(&pool, "hot", "list", 60).await.unwrap();
        put(&pool, "cold", "stale", -1).await.unwrap();

        assert_eq!(get(&pool, "hot").await.unwrap().as_deref(), Some("list"));
        assert_eq!(get(&pool, "cold").await.unwrap(), None);

        assert_eq!(purge_expired(&pool).await.unwrap(), 1);
    }
}
