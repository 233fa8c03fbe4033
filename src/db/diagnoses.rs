//! Diagnosis record persistence
//!
//! CRUD over diagnosis rows keyed by record id and fingerprint, plus the
//! reference-count query used by the image cleanup path.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::models::{DiagnosisRecord, OpinionSlot, SlotPosition};

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Internal(format!("invalid timestamp in database: {}", e)))
}

/// Read one slot column group (`primary_*` or `secondary_*`) from a row.
///
/// A slot exists iff its reviewer id column is non-null.
fn slot_from_row(row: &SqliteRow, prefix: &str) -> Result<Option<OpinionSlot>> {
    let reviewer_id: Option<i64> = row.get(format!("{}_reviewer_id", prefix).as_str());
    let Some(reviewer_id) = reviewer_id else {
        return Ok(None);
    };

    let diagnosed_at: String = row.get(format!("{}_diagnosed_at", prefix).as_str());
    Ok(Some(OpinionSlot {
        reviewer_id,
        reviewer_name: row.get(format!("{}_reviewer_name", prefix).as_str()),
        disease_name: row.get(format!("{}_disease_name", prefix).as_str()),
        disease_type: row.get(format!("{}_disease_type", prefix).as_str()),
        diagnosed_at: parse_timestamp(&diagnosed_at)?,
    }))
}

fn record_from_row(row: &SqliteRow) -> Result<DiagnosisRecord> {
    let id_str: String = row.get("id");
    let id = Uuid::parse_str(&id_str)
        .map_err(|e| Error::Internal(format!("invalid UUID in database: {}", e)))?;

    let fingerprint_str: String = row.get("fingerprint");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(DiagnosisRecord {
        id,
        fingerprint: Fingerprint::parse(&fingerprint_str)?,
        original_path: row.get("original_path"),
        class_path: row.get("class_path"),
        primary: slot_from_row(row, "primary")?,
        secondary: slot_from_row(row, "secondary")?,
        created_at: parse_timestamp(&created_at)?,
        updated_at: parse_timestamp(&updated_at)?,
    })
}

/// Insert a new diagnosis record.
pub async fn save_record(pool: &SqlitePool, record: &DiagnosisRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO diagnoses (
            id, fingerprint, original_path, class_path,
            primary_reviewer_id, primary_reviewer_name,
            primary_disease_name, primary_disease_type, primary_diagnosed_at,
            secondary_reviewer_id, secondary_reviewer_name,
            secondary_disease_name, secondary_disease_type, secondary_diagnosed_at,
            created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(record.id.to_string())
    .bind(record.fingerprint.as_str())
    .bind(&record.original_path)
    .bind(&record.class_path)
    .bind(record.primary.as_ref().map(|s| s.reviewer_id))
    .bind(record.primary.as_ref().map(|s| s.reviewer_name.as_str()))
    .bind(record.primary.as_ref().map(|s| s.disease_name.as_str()))
    .bind(record.primary.as_ref().map(|s| s.disease_type.as_str()))
    .bind(record.primary.as_ref().map(|s| s.diagnosed_at.to_rfc3339()))
    .bind(record.secondary.as_ref().map(|s| s.reviewer_id))
    .bind(record.secondary.as_ref().map(|s| s.reviewer_name.as_str()))
    .bind(record.secondary.as_ref().map(|s| s.disease_name.as_str()))
    .bind(record.secondary.as_ref().map(|s| s.disease_type.as_str()))
    .bind(record.secondary.as_ref().map(|s| s.diagnosed_at.to_rfc3339()))
    .bind(record.created_at.to_rfc3339())
    .bind(record.updated_at.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

/// Load a record by id.
pub async fn load_record(pool: &SqlitePool, id: Uuid) -> Result<Option<DiagnosisRecord>> {
    let row = sqlx::query("SELECT * FROM diagnoses WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(record_from_row).transpose()
}

/// Load all records referencing a fingerprint, oldest first.
pub async fn load_by_fingerprint(
    pool: &SqlitePool,
    fingerprint: &Fingerprint,
) -> Result<Vec<DiagnosisRecord>> {
    let rows = sqlx::query(
        "SELECT * FROM diagnoses WHERE fingerprint = ? ORDER BY created_at ASC",
    )
    .bind(fingerprint.as_str())
    .fetch_all(pool)
    .await?;

    rows.iter().map(record_from_row).collect()
}

/// Load all records, newest first.
pub async fn load_all(pool: &SqlitePool) -> Result<Vec<DiagnosisRecord>> {
    let rows = sqlx::query("SELECT * FROM diagnoses ORDER BY created_at DESC")
        .fetch_all(pool)
        .await?;

    rows.iter().map(record_from_row).collect()
}

/// Load records where the reviewer holds either slot, newest first.
pub async fn load_by_reviewer(pool: &SqlitePool, reviewer_id: i64) -> Result<Vec<DiagnosisRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM diagnoses
        WHERE primary_reviewer_id = ? OR secondary_reviewer_id = ?
        ORDER BY created_at DESC
        "#,
    )
    .bind(reviewer_id)
    .bind(reviewer_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(record_from_row).collect()
}

/// Overwrite one slot of a record in place.
pub async fn update_slot(
    pool: &SqlitePool,
    id: Uuid,
    position: SlotPosition,
    slot: &OpinionSlot,
) -> Result<()> {
    let sql = match position {
        SlotPosition::Primary => {
            r#"
            UPDATE diagnoses SET
                primary_reviewer_id = ?, primary_reviewer_name = ?,
                primary_disease_name = ?, primary_disease_type = ?,
                primary_diagnosed_at = ?, updated_at = ?
            WHERE id = ?
            "#
        }
        SlotPosition::Secondary => {
            r#"
            UPDATE diagnoses SET
                secondary_reviewer_id = ?, secondary_reviewer_name = ?,
                secondary_disease_name = ?, secondary_disease_type = ?,
                secondary_diagnosed_at = ?, updated_at = ?
            WHERE id = ?
            "#
        }
    };

    let result = sqlx::query(sql)
        .bind(slot.reviewer_id)
        .bind(&slot.reviewer_name)
        .bind(&slot.disease_name)
        .bind(&slot.disease_type)
        .bind(slot.diagnosed_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("diagnosis record not found: {}", id)));
    }

    Ok(())
}

/// Blank one slot of a record, keeping the row.
pub async fn clear_slot(pool: &SqlitePool, id: Uuid, position: SlotPosition) -> Result<()> {
    let sql = match position {
        SlotPosition::Primary => {
            r#"
            UPDATE diagnoses SET
                primary_reviewer_id = NULL, primary_reviewer_name = NULL,
                primary_disease_name = NULL, primary_disease_type = NULL,
                primary_diagnosed_at = NULL, updated_at = ?
            WHERE id = ?
            "#
        }
        SlotPosition::Secondary => {
            r#"
            UPDATE diagnoses SET
                secondary_reviewer_id = NULL, secondary_reviewer_name = NULL,
                secondary_disease_name = NULL, secondary_disease_type = NULL,
                secondary_diagnosed_at = NULL, updated_at = ?
            WHERE id = ?
            "#
        }
    };

    let result = sqlx::query(sql)
        .bind(Utc::now().to_rfc3339())
        .bind(id.to_string())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("diagnosis record not found: {}", id)));
    }

    Ok(())
}

/// Delete a record row.
pub async fn delete_record(pool: &SqlitePool, id: Uuid) -> Result<()> {
    let result = sqlx::query("DELETE FROM diagnoses WHERE id = ?")
        .bind(id.to_string())
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::NotFound(format!("diagnosis record not found: {}", id)));
    }

    Ok(())
}

/// Count records referencing a fingerprint.
///
/// The engine deletes physical blobs exactly when this reaches zero after
/// a record delete.
pub async fn count_by_fingerprint(pool: &SqlitePool, fingerprint: &Fingerprint) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM diagnoses WHERE fingerprint = ?")
        .bind(fingerprint.as_str())
        .fetch_one(pool)
        .await?;
    Ok(count)
}
