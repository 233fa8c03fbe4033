//! Database access for clinannot
//!
//! SQLite via sqlx; the diagnoses table is created idempotently at
//! startup.

pub mod diagnoses;

use sqlx::SqlitePool;
use std::path::Path;

use crate::error::Result;

/// Initialize database connection pool
///
/// Opens (or creates) the SQLite database at `db_path` and ensures the
/// schema exists.
pub async fn init_database_pool(db_path: &Path) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Use proper SQLite URI with mode=rwc (read, write, create)
    let db_url = format!("sqlite://{}?mode=rwc", db_path.display());
    tracing::debug!("Connecting to database: {}", db_url);

    let pool = SqlitePool::connect(&db_url).await?;

    init_tables(&pool).await?;

    Ok(pool)
}

/// Create the diagnoses table if it does not exist.
///
/// One row per diagnosis record: a fingerprinted image with a primary
/// opinion slot and a nullable secondary slot. Slot columns are nullable
/// as a group so a retracted slot can be blanked while the row survives.
pub async fn init_tables(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS diagnoses (
            id TEXT PRIMARY KEY,
            fingerprint TEXT NOT NULL,
            original_path TEXT NOT NULL,
            class_path TEXT NOT NULL,
            primary_reviewer_id INTEGER,
            primary_reviewer_name TEXT,
            primary_disease_name TEXT,
            primary_disease_type TEXT,
            primary_diagnosed_at TEXT,
            secondary_reviewer_id INTEGER,
            secondary_reviewer_name TEXT,
            secondary_disease_name TEXT,
            secondary_disease_type TEXT,
            secondary_diagnosed_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_diagnoses_fingerprint ON diagnoses(fingerprint)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database tables initialized (diagnoses)");

    Ok(())
}
