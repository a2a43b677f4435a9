//! Persistence. One `PgPool`, shared by the three stores, bootstrapped with
//! an idempotent inline migration — the same `CREATE TABLE IF NOT EXISTS`
//! plus best-effort `ALTER TABLE` pattern the teacher's `storage::migrate`
//! uses, just against Postgres rather than SQLite.

pub mod lease_store;
pub mod receipt_ledger;
pub mod task_store;

use std::time::Duration;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Default timeout for individual store queries. Mirrors the teacher's
/// `storage::with_timeout` — a hung query must not wedge a request forever.
const QUERY_TIMEOUT: Duration = Duration::from_secs(30);

pub(crate) async fn with_timeout<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(QUERY_TIMEOUT, fut).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!(
            "database query timed out after {}s",
            QUERY_TIMEOUT.as_secs()
        )),
    }
}

const MIGRATIONS: &[&str] = &[
    include_str!("migrations/001_tasks.sql"),
    include_str!("migrations/002_leases.sql"),
    include_str!("migrations/003_receipts.sql"),
];

pub async fn connect(database_url: &str) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await?;
    migrate(&pool).await?;
    Ok(pool)
}

async fn migrate(pool: &PgPool) -> Result<()> {
    for sql in MIGRATIONS {
        for stmt in sql.split(';') {
            let stmt = stmt.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await?;
            }
        }
    }
    Ok(())
}
