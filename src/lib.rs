//! Offline mutation synchronization engine for field survey data.
//!
//! Edits made in the field are queued as durable mutations in a local SQLite
//! store and delivered to the remote store in two phases: structured data
//! first, then any photo attachments. Two single-flight background workers
//! drain the queue; a recovery hook re-fires them on app start so work
//! survives process death and lost connectivity.

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

// Public modules
pub mod domains;
pub mod errors;

// Private modules
mod db_migration;

#[cfg(test)]
pub(crate) mod test_support;

/// Open the durable local store and bring its schema up to date. Call once
/// at startup; the returned pool backs the mutation repository.
pub async fn initialize(db_url: &str) -> errors::DbResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new().connect_with(options).await?;
    db_migration::run(&pool).await?;
    Ok(pool)
}
