use log::{debug, info};
use sqlx::SqlitePool;

use crate::errors::{DbError, DbResult};

// Embed all migration SQL files at compile time
const MIGRATION_MUTATIONS: &str = include_str!("../migrations/20250601000000_mutations.sql");

// List of migrations with their names and SQL content, applied in order
const MIGRATIONS: &[(&str, &str)] = &[("20250601000000_mutations.sql", MIGRATION_MUTATIONS)];

/// Bring the local store's schema up to date. Applied migrations are tracked
/// in `_migrations` and skipped on subsequent runs.
pub async fn run(pool: &SqlitePool) -> DbResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS _migrations (
            name TEXT PRIMARY KEY NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    for (name, sql) in MIGRATIONS {
        let applied: Option<String> =
            sqlx::query_scalar("SELECT name FROM _migrations WHERE name = ?")
                .bind(name)
                .fetch_optional(pool)
                .await?;

        if applied.is_some() {
            debug!("Migration {} already applied", name);
            continue;
        }

        sqlx::raw_sql(sql)
            .execute(pool)
            .await
            .map_err(|e| DbError::Migration(format!("{}: {}", name, e)))?;

        sqlx::query("INSERT INTO _migrations (name, applied_at) VALUES (?, ?)")
            .bind(name)
            .bind(chrono::Utc::now().to_rfc3339())
            .execute(pool)
            .await?;

        info!("Applied migration {}", name);
    }

    Ok(())
}
