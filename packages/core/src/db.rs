//! SQLite pool construction.
//!
//! Migrations under `migrations/` are embedded at compile time and applied
//! on every start. In-memory databases live only as long as their
//! connection, so they get a single connection that is never recycled.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

pub async fn create_pool(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = if database_url.contains(":memory:") {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?
    } else {
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?
    };

    sqlx::migrate!("./migrations").run(&pool).await?;
    tracing::debug!("Database ready at {}", database_url);

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::Row;

    #[tokio::test]
    async fn memory_pool_has_schema() {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        let row = sqlx::query(
            "SELECT COUNT(*) AS cnt FROM sqlite_master
             WHERE type = 'table' AND name IN ('users', 'devices', 'consumption')",
        )
        .fetch_one(&pool)
        .await
        .unwrap();

        let count: i64 = row.try_get("cnt").unwrap();
        assert_eq!(count, 3);
    }
}
