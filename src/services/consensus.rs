//! Multi-reviewer consensus engine
//!
//! Decides, per fingerprint, whether an incoming opinion is accepted as
//! the first opinion (triggering the only physical write), merged into an
//! open slot, applied as an in-place update by the same reviewer, or
//! rejected. Retraction runs the inverse path, including image cleanup
//! when the last referencing record disappears.
//!
//! Every read-check-write sequence for one fingerprint runs under a
//! per-fingerprint async lock; submissions for distinct fingerprints
//! proceed in parallel.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::db::diagnoses;
use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::models::{DiagnosisRecord, OpinionSlot, SlotPosition};
use crate::sanitize::{normalize_disease_type, normalize_label};
use crate::services::image_store::{ImageStore, StoredPaths};

/// Policy for a third opinion when two opinions already exist.
///
/// The boundary is deliberately configurable: historic behavior varied
/// between rejecting any third opinion and permitting one only when the
/// existing pair disagrees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThirdOpinionPolicy {
    /// Permit a third opinion only when the existing two disagree.
    #[default]
    AllowOnDisagreement,
    /// Never accept more than two opinions per fingerprint.
    RejectAlways,
}

/// Submitting reviewer identity.
#[derive(Debug, Clone)]
pub struct Reviewer {
    pub id: i64,
    pub name: String,
}

/// Image content of a submission: fresh bytes, or a fingerprint of an
/// already-stored image (attach an opinion without re-uploading).
#[derive(Debug, Clone)]
pub enum SubmissionContent {
    Upload { bytes: Vec<u8>, filename: String },
    Existing(Fingerprint),
}

/// One incoming opinion submission.
#[derive(Debug, Clone)]
pub struct Submission {
    pub content: SubmissionContent,
    pub disease_name: String,
    pub disease_type: String,
    pub reviewer: Reviewer,
}

/// How a submission was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    /// First opinion for a fresh fingerprint; image blobs were written.
    Created,
    /// Opinion attached to an already-stored image.
    Attached,
    /// Same reviewer overwrote their own opinion in place.
    Updated,
}

/// Result of an accepted submission.
#[derive(Debug, Clone)]
pub struct SubmissionOutcome {
    pub record_id: Uuid,
    pub fingerprint: Fingerprint,
    /// Canonical storage path of the image
    pub class_path: String,
    /// Total opinions now attached to the fingerprint
    pub opinions: usize,
    pub disposition: Disposition,
}

/// Consensus engine over the diagnosis repository and image store.
pub struct ConsensusEngine {
    db: SqlitePool,
    store: Arc<ImageStore>,
    policy: ThirdOpinionPolicy,
    locks: Mutex<HashMap<Fingerprint, Arc<Mutex<()>>>>,
}

impl ConsensusEngine {
    pub fn new(db: SqlitePool, store: Arc<ImageStore>, policy: ThirdOpinionPolicy) -> Self {
        Self {
            db,
            store,
            policy,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Serialization boundary for one fingerprint.
    ///
    /// Idle entries (held only by the map itself) are swept on each
    /// acquisition so the map does not grow with every fingerprint ever
    /// seen.
    async fn fingerprint_lock(&self, fingerprint: &Fingerprint) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(fingerprint.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Apply one opinion submission.
    pub async fn submit(&self, submission: Submission) -> Result<SubmissionOutcome> {
        let disease_name = normalize_label(&submission.disease_name);
        if disease_name.is_empty() {
            return Err(Error::Validation("disease name is required".to_string()));
        }
        let disease_type = normalize_disease_type(&submission.disease_type);

        let reviewer_name = normalize_label(&submission.reviewer.name);
        if reviewer_name.is_empty() {
            return Err(Error::Validation("reviewer name is required".to_string()));
        }

        let fingerprint = match &submission.content {
            SubmissionContent::Upload { bytes, .. } => {
                if bytes.is_empty() {
                    return Err(Error::Validation("uploaded image is empty".to_string()));
                }
                Fingerprint::of(bytes)
            }
            SubmissionContent::Existing(fp) => fp.clone(),
        };

        let slot = OpinionSlot {
            reviewer_id: submission.reviewer.id,
            reviewer_name,
            disease_name,
            disease_type,
            diagnosed_at: Utc::now(),
        };

        let lock = self.fingerprint_lock(&fingerprint).await;
        let _guard = lock.lock().await;

        let records = diagnoses::load_by_fingerprint(&self.db, &fingerprint).await?;

        if records.is_empty() {
            return self.accept_first(&fingerprint, &submission.content, slot).await;
        }

        // Re-submission by a reviewer who already holds a slot updates in
        // place, whatever the consensus state.
        if let Some((record, position)) = records
            .iter()
            .find_map(|r| r.position_of(slot.reviewer_id).map(|p| (r, p)))
        {
            diagnoses::update_slot(&self.db, record.id, position, &slot).await?;

            tracing::info!(
                fingerprint = %fingerprint,
                record_id = %record.id,
                reviewer_id = slot.reviewer_id,
                "Opinion updated in place"
            );

            return Ok(SubmissionOutcome {
                record_id: record.id,
                fingerprint,
                class_path: record.class_path.clone(),
                opinions: total_opinions(&records),
                disposition: Disposition::Updated,
            });
        }

        match total_opinions(&records) {
            0 | 1 => self.attach_second(&fingerprint, &records, slot).await,
            2 => self.attach_third(&fingerprint, &records, slot).await,
            _ => Err(Error::Consensus(
                "maximum opinions reached for this image".to_string(),
            )),
        }
    }

    /// Absent → Single: the only transition with a physical write.
    async fn accept_first(
        &self,
        fingerprint: &Fingerprint,
        content: &SubmissionContent,
        slot: OpinionSlot,
    ) -> Result<SubmissionOutcome> {
        let SubmissionContent::Upload { bytes, filename } = content else {
            return Err(Error::NotFound(format!(
                "unknown fingerprint: {}",
                fingerprint
            )));
        };

        // Blob first, row second. A failed row insert leaves an orphaned
        // blob which is tolerated (reconciliation is out of scope).
        let paths = self.store.store(
            fingerprint,
            bytes,
            filename,
            &slot.disease_name,
            &slot.disease_type,
            slot.reviewer_id,
        )?;

        let record = DiagnosisRecord::new(
            fingerprint.clone(),
            paths.original.clone(),
            paths.class.clone(),
            slot,
        );

        if let Err(e) = diagnoses::save_record(&self.db, &record).await {
            tracing::warn!(
                fingerprint = %fingerprint,
                error = %e,
                "Record insert failed after blob write; orphaned blobs left for reconciliation"
            );
            return Err(e);
        }

        tracing::info!(
            fingerprint = %fingerprint,
            record_id = %record.id,
            class = %paths.class,
            "First opinion recorded for new image"
        );

        Ok(SubmissionOutcome {
            record_id: record.id,
            fingerprint: fingerprint.clone(),
            class_path: paths.class,
            opinions: 1,
            disposition: Disposition::Created,
        })
    }

    /// Single → Paired: fill the open slot of the record holding the
    /// lone opinion. No physical write.
    async fn attach_second(
        &self,
        fingerprint: &Fingerprint,
        records: &[DiagnosisRecord],
        slot: OpinionSlot,
    ) -> Result<SubmissionOutcome> {
        let (record, position) = records
            .iter()
            .find_map(|r| r.open_position().map(|p| (r, p)))
            .ok_or_else(|| Error::Internal("no open opinion slot".to_string()))?;

        diagnoses::update_slot(&self.db, record.id, position, &slot).await?;

        tracing::info!(
            fingerprint = %fingerprint,
            record_id = %record.id,
            reviewer_id = slot.reviewer_id,
            "Second opinion attached"
        );

        Ok(SubmissionOutcome {
            record_id: record.id,
            fingerprint: fingerprint.clone(),
            class_path: record.class_path.clone(),
            opinions: total_opinions(records) + 1,
            disposition: Disposition::Attached,
        })
    }

    /// Paired → third opinion: rejected when the existing pair agrees (or
    /// always, under the strict policy); otherwise recorded as a new row
    /// referencing the same stored image.
    async fn attach_third(
        &self,
        fingerprint: &Fingerprint,
        records: &[DiagnosisRecord],
        slot: OpinionSlot,
    ) -> Result<SubmissionOutcome> {
        let keys: Vec<String> = records
            .iter()
            .flat_map(|r| r.opinions().map(|(_, s)| s.key()))
            .collect();

        if keys.len() == 2 && keys[0] == keys[1] {
            return Err(Error::Consensus(
                "two concordant opinions already recorded for this image".to_string(),
            ));
        }

        if self.policy == ThirdOpinionPolicy::RejectAlways {
            return Err(Error::Consensus(
                "maximum of two opinions per image".to_string(),
            ));
        }

        let first = &records[0];
        let record = DiagnosisRecord::new(
            fingerprint.clone(),
            first.original_path.clone(),
            first.class_path.clone(),
            slot,
        );
        diagnoses::save_record(&self.db, &record).await?;

        tracing::info!(
            fingerprint = %fingerprint,
            record_id = %record.id,
            "Third opinion recorded on disagreeing pair"
        );

        Ok(SubmissionOutcome {
            record_id: record.id,
            fingerprint: fingerprint.clone(),
            class_path: record.class_path.clone(),
            opinions: total_opinions(records) + 1,
            disposition: Disposition::Attached,
        })
    }

    /// Partial-field update of one opinion slot by its owning reviewer.
    pub async fn update(
        &self,
        record_id: Uuid,
        position: SlotPosition,
        reviewer_id: i64,
        disease_name: Option<String>,
        disease_type: Option<String>,
    ) -> Result<DiagnosisRecord> {
        let fingerprint = self.record_fingerprint(record_id).await?;
        let lock = self.fingerprint_lock(&fingerprint).await;
        let _guard = lock.lock().await;

        let record = self.load_existing(record_id).await?;
        let current = record.slot(position).ok_or_else(|| {
            Error::NotFound(format!("no opinion in {:?} slot of record {}", position, record_id))
        })?;
        if current.reviewer_id != reviewer_id {
            return Err(Error::Forbidden(
                "opinion slot belongs to another reviewer".to_string(),
            ));
        }

        let disease_name = match disease_name {
            Some(name) => {
                let name = normalize_label(&name);
                if name.is_empty() {
                    return Err(Error::Validation("disease name must not be blank".to_string()));
                }
                name
            }
            None => current.disease_name.clone(),
        };
        let disease_type = match disease_type {
            Some(ty) => normalize_disease_type(&ty),
            None => current.disease_type.clone(),
        };

        let updated = OpinionSlot {
            reviewer_id,
            reviewer_name: current.reviewer_name.clone(),
            disease_name,
            disease_type,
            diagnosed_at: Utc::now(),
        };
        diagnoses::update_slot(&self.db, record_id, position, &updated).await?;

        tracing::info!(record_id = %record_id, reviewer_id, "Opinion slot updated");

        self.load_existing(record_id).await
    }

    /// Reviewer retracts their own opinion.
    ///
    /// While the other slot is occupied the retracted slot is blanked and
    /// the row survives, keeping the remaining opinion and the physical
    /// image intact. Retracting the sole opinion deletes the row and, when
    /// no other record references the fingerprint, the stored blobs.
    pub async fn retract(
        &self,
        record_id: Uuid,
        position: SlotPosition,
        reviewer_id: i64,
    ) -> Result<()> {
        let fingerprint = self.record_fingerprint(record_id).await?;
        let lock = self.fingerprint_lock(&fingerprint).await;
        let _guard = lock.lock().await;

        let record = self.load_existing(record_id).await?;
        let slot = record.slot(position).ok_or_else(|| {
            Error::NotFound(format!("no opinion in {:?} slot of record {}", position, record_id))
        })?;
        if slot.reviewer_id != reviewer_id {
            return Err(Error::Forbidden(
                "opinion slot belongs to another reviewer".to_string(),
            ));
        }

        if record.opinion_count() > 1 {
            diagnoses::clear_slot(&self.db, record_id, position).await?;
            tracing::info!(
                record_id = %record_id,
                reviewer_id,
                slot = ?position,
                "Opinion retracted; record kept for remaining reviewer"
            );
            return Ok(());
        }

        diagnoses::delete_record(&self.db, record_id).await?;

        let remaining = diagnoses::count_by_fingerprint(&self.db, &record.fingerprint).await?;
        if remaining == 0 {
            self.store.delete(&StoredPaths {
                original: record.original_path.clone(),
                class: record.class_path.clone(),
            })?;
        }

        tracing::info!(
            record_id = %record_id,
            fingerprint = %record.fingerprint,
            remaining_records = remaining,
            "Sole opinion retracted; record deleted"
        );

        Ok(())
    }

    async fn record_fingerprint(&self, record_id: Uuid) -> Result<Fingerprint> {
        Ok(self.load_existing(record_id).await?.fingerprint)
    }

    async fn load_existing(&self, record_id: Uuid) -> Result<DiagnosisRecord> {
        diagnoses::load_record(&self.db, record_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("diagnosis record not found: {}", record_id)))
    }
}

fn total_opinions(records: &[DiagnosisRecord]) -> usize {
    records.iter().map(|r| r.opinion_count()).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::SqlitePool;
    use std::io::Cursor;
    use tempfile::TempDir;

    fn tiny_png(seed: u8) -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            2,
            2,
            image::Rgb([seed, seed, seed]),
        ));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    async fn setup(policy: ThirdOpinionPolicy) -> (ConsensusEngine, SqlitePool, TempDir) {
        let pool = SqlitePool::connect(":memory:").await.unwrap();
        crate::db::init_tables(&pool).await.unwrap();
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ImageStore::open(dir.path()).unwrap());
        let engine = ConsensusEngine::new(pool.clone(), store, policy);
        (engine, pool, dir)
    }

    fn upload(bytes: &[u8], reviewer_id: i64, name: &str, ty: &str) -> Submission {
        Submission {
            content: SubmissionContent::Upload {
                bytes: bytes.to_vec(),
                filename: "scan.png".to_string(),
            },
            disease_name: name.to_string(),
            disease_type: ty.to_string(),
            reviewer: Reviewer {
                id: reviewer_id,
                name: format!("Dr {}", reviewer_id),
            },
        }
    }

    fn attach(fp: &Fingerprint, reviewer_id: i64, name: &str, ty: &str) -> Submission {
        Submission {
            content: SubmissionContent::Existing(fp.clone()),
            disease_name: name.to_string(),
            disease_type: ty.to_string(),
            reviewer: Reviewer {
                id: reviewer_id,
                name: format!("Dr {}", reviewer_id),
            },
        }
    }

    fn originals_count(dir: &TempDir) -> usize {
        std::fs::read_dir(dir.path().join("originals")).unwrap().count()
    }

    #[tokio::test]
    async fn first_submission_creates_record_and_blobs() {
        let (engine, _pool, dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(1);

        let outcome = engine.submit(upload(&bytes, 1, "OMA", "")).await.unwrap();

        assert_eq!(outcome.disposition, Disposition::Created);
        assert_eq!(outcome.opinions, 1);
        assert_eq!(outcome.fingerprint, Fingerprint::of(&bytes));
        assert_eq!(originals_count(&dir), 1);
        assert!(dir.path().join(&outcome.class_path).exists());
    }

    #[tokio::test]
    async fn same_reviewer_resubmission_updates_in_place() {
        let (engine, pool, dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(2);

        let first = engine.submit(upload(&bytes, 1, "OMA", "Standard")).await.unwrap();
        let second = engine.submit(upload(&bytes, 1, "OMA", "Chronique")).await.unwrap();

        assert_eq!(second.disposition, Disposition::Updated);
        assert_eq!(second.opinions, 1);
        assert_eq!(second.record_id, first.record_id);

        // No second physical write for the same fingerprint
        assert_eq!(originals_count(&dir), 1);

        let record = diagnoses::load_record(&pool, first.record_id).await.unwrap().unwrap();
        assert_eq!(record.primary.as_ref().unwrap().disease_type, "Chronique");
    }

    #[tokio::test]
    async fn duplicate_upload_by_second_reviewer_merges_into_pair() {
        let (engine, pool, dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(3);

        let first = engine.submit(upload(&bytes, 1, "OMA", "Standard")).await.unwrap();
        let second = engine.submit(upload(&bytes, 2, "Perfo", "Standard")).await.unwrap();

        assert_eq!(second.disposition, Disposition::Attached);
        assert_eq!(second.opinions, 2);
        assert_eq!(second.record_id, first.record_id);

        // One stored image, two opinions referencing it
        assert_eq!(originals_count(&dir), 1);
        let record = diagnoses::load_record(&pool, first.record_id).await.unwrap().unwrap();
        assert_eq!(record.opinion_count(), 2);
        assert_eq!(record.secondary.as_ref().unwrap().reviewer_id, 2);
    }

    #[tokio::test]
    async fn attach_by_fingerprint_requires_known_image() {
        let (engine, _pool, _dir) = setup(ThirdOpinionPolicy::default()).await;
        let fp = Fingerprint::of(b"never uploaded");

        let err = engine.submit(attach(&fp, 1, "OMA", "")).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn attach_by_fingerprint_without_reupload() {
        let (engine, _pool, dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(4);

        let first = engine.submit(upload(&bytes, 1, "OMA", "Standard")).await.unwrap();
        let second = engine
            .submit(attach(&first.fingerprint, 2, "Perfo", "Standard"))
            .await
            .unwrap();

        assert_eq!(second.opinions, 2);
        assert_eq!(originals_count(&dir), 1);
    }

    #[tokio::test]
    async fn third_opinion_rejected_when_pair_agrees() {
        let (engine, _pool, _dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(5);

        engine.submit(upload(&bytes, 1, "OMA", "Standard")).await.unwrap();
        // Agreement keys fold case and whitespace
        engine.submit(upload(&bytes, 2, " oma ", "standard")).await.unwrap();

        let err = engine.submit(upload(&bytes, 3, "Perfo", "Standard")).await.unwrap_err();
        assert!(matches!(err, Error::Consensus(_)));
    }

    #[tokio::test]
    async fn third_opinion_accepted_when_pair_disagrees() {
        let (engine, pool, _dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(6);

        engine.submit(upload(&bytes, 1, "OMA", "Chronique")).await.unwrap();
        engine.submit(upload(&bytes, 2, "Perfo", "Standard")).await.unwrap();

        let third = engine.submit(upload(&bytes, 3, "Perfo", "Standard")).await.unwrap();
        assert_eq!(third.disposition, Disposition::Attached);
        assert_eq!(third.opinions, 3);

        let records = diagnoses::load_by_fingerprint(&pool, &third.fingerprint)
            .await
            .unwrap();
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn strict_policy_rejects_any_third_opinion() {
        let (engine, _pool, _dir) = setup(ThirdOpinionPolicy::RejectAlways).await;
        let bytes = tiny_png(7);

        engine.submit(upload(&bytes, 1, "OMA", "Chronique")).await.unwrap();
        engine.submit(upload(&bytes, 2, "Perfo", "Standard")).await.unwrap();

        let err = engine.submit(upload(&bytes, 3, "OMA", "Chronique")).await.unwrap_err();
        assert!(matches!(err, Error::Consensus(_)));
    }

    #[tokio::test]
    async fn fourth_opinion_always_rejected() {
        let (engine, _pool, _dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(8);

        engine.submit(upload(&bytes, 1, "OMA", "Chronique")).await.unwrap();
        engine.submit(upload(&bytes, 2, "Perfo", "Standard")).await.unwrap();
        engine.submit(upload(&bytes, 3, "Perfo", "Standard")).await.unwrap();

        let err = engine.submit(upload(&bytes, 4, "OMA", "Standard")).await.unwrap_err();
        match err {
            Error::Consensus(msg) => assert!(msg.contains("maximum opinions")),
            other => panic!("expected consensus error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn blank_disease_name_is_rejected() {
        let (engine, _pool, _dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(9);

        let err = engine.submit(upload(&bytes, 1, "   ", "Standard")).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn retracting_sole_opinion_deletes_record_and_blobs() {
        let (engine, pool, dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(10);

        let outcome = engine.submit(upload(&bytes, 1, "OMA", "Standard")).await.unwrap();
        engine
            .retract(outcome.record_id, SlotPosition::Primary, 1)
            .await
            .unwrap();

        assert!(diagnoses::load_record(&pool, outcome.record_id).await.unwrap().is_none());
        assert_eq!(originals_count(&dir), 0);
        assert!(!dir.path().join(&outcome.class_path).exists());
    }

    #[tokio::test]
    async fn retracting_secondary_keeps_record_and_image() {
        let (engine, pool, dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(11);

        let outcome = engine.submit(upload(&bytes, 1, "OMA", "Standard")).await.unwrap();
        engine.submit(upload(&bytes, 2, "Perfo", "Standard")).await.unwrap();

        engine
            .retract(outcome.record_id, SlotPosition::Secondary, 2)
            .await
            .unwrap();

        let record = diagnoses::load_record(&pool, outcome.record_id).await.unwrap().unwrap();
        assert_eq!(record.opinion_count(), 1);
        assert_eq!(record.primary.as_ref().unwrap().reviewer_id, 1);
        assert_eq!(originals_count(&dir), 1);
    }

    #[tokio::test]
    async fn retracting_primary_of_pair_blanks_slot_but_keeps_row() {
        let (engine, pool, dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(12);

        let outcome = engine.submit(upload(&bytes, 1, "OMA", "Standard")).await.unwrap();
        engine.submit(upload(&bytes, 2, "Perfo", "Standard")).await.unwrap();

        engine
            .retract(outcome.record_id, SlotPosition::Primary, 1)
            .await
            .unwrap();

        let record = diagnoses::load_record(&pool, outcome.record_id).await.unwrap().unwrap();
        assert!(record.primary.is_none());
        assert_eq!(record.secondary.as_ref().unwrap().reviewer_id, 2);
        assert_eq!(originals_count(&dir), 1);
    }

    #[tokio::test]
    async fn retraction_by_non_owner_is_forbidden() {
        let (engine, _pool, _dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(13);

        let outcome = engine.submit(upload(&bytes, 1, "OMA", "Standard")).await.unwrap();

        let err = engine
            .retract(outcome.record_id, SlotPosition::Primary, 2)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn retracting_one_of_three_keeps_image_for_other_record() {
        let (engine, pool, dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(14);

        engine.submit(upload(&bytes, 1, "OMA", "Chronique")).await.unwrap();
        engine.submit(upload(&bytes, 2, "Perfo", "Standard")).await.unwrap();
        let third = engine.submit(upload(&bytes, 3, "Perfo", "Standard")).await.unwrap();

        // Third opinion lives on its own record; retracting it must not
        // delete the shared blobs while the first record still exists.
        engine.retract(third.record_id, SlotPosition::Primary, 3).await.unwrap();

        assert_eq!(originals_count(&dir), 1);
        let records = diagnoses::load_by_fingerprint(&pool, &third.fingerprint)
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].opinion_count(), 2);
    }

    #[tokio::test]
    async fn partial_update_changes_only_given_fields() {
        let (engine, _pool, _dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(15);

        let outcome = engine.submit(upload(&bytes, 1, "OMA", "Chronique")).await.unwrap();

        let record = engine
            .update(outcome.record_id, SlotPosition::Primary, 1, Some("Perfo".to_string()), None)
            .await
            .unwrap();

        let slot = record.primary.as_ref().unwrap();
        assert_eq!(slot.disease_name, "Perfo");
        assert_eq!(slot.disease_type, "Chronique");
    }

    #[tokio::test]
    async fn update_by_non_owner_is_forbidden() {
        let (engine, _pool, _dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(16);

        let outcome = engine.submit(upload(&bytes, 1, "OMA", "Standard")).await.unwrap();

        let err = engine
            .update(outcome.record_id, SlotPosition::Primary, 9, Some("Perfo".to_string()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
    }

    #[tokio::test]
    async fn update_of_empty_slot_is_not_found() {
        let (engine, _pool, _dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(17);

        let outcome = engine.submit(upload(&bytes, 1, "OMA", "Standard")).await.unwrap();

        let err = engine
            .update(outcome.record_id, SlotPosition::Secondary, 1, Some("Perfo".to_string()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    /// End-to-end walk of the reference scenario.
    #[tokio::test]
    async fn reference_scenario() {
        let (engine, _pool, _dir) = setup(ThirdOpinionPolicy::default()).await;
        let bytes = tiny_png(18);

        // A uploads X labeled (OMA, Standard)
        let a1 = engine.submit(upload(&bytes, 1, "OMA", "Standard")).await.unwrap();
        assert_eq!(a1.disposition, Disposition::Created);
        assert_eq!(a1.opinions, 1);

        // A re-uploads X labeled (OMA, Chronique): in-place update
        let a2 = engine.submit(upload(&bytes, 1, "OMA", "Chronique")).await.unwrap();
        assert_eq!(a2.disposition, Disposition::Updated);
        assert_eq!(a2.opinions, 1);

        // B uploads X labeled (Perfo, Standard)
        let b = engine.submit(upload(&bytes, 2, "Perfo", "Standard")).await.unwrap();
        assert_eq!(b.opinions, 2);

        // C agrees with B; existing pair disagrees, so accepted
        let c = engine.submit(upload(&bytes, 3, "Perfo", "Standard")).await.unwrap();
        assert_eq!(c.opinions, 3);

        // D is one too many
        let err = engine.submit(upload(&bytes, 4, "OMA", "Standard")).await.unwrap_err();
        assert!(matches!(err, Error::Consensus(_)));
    }

    /// Simultaneous submissions for one fingerprint must serialize:
    /// exactly one performs the physical write, the rest observe the
    /// record it created.
    #[tokio::test]
    async fn concurrent_submissions_for_one_fingerprint_serialize() {
        let dir = TempDir::new().unwrap();
        let pool = crate::db::init_database_pool(&dir.path().join("consensus.db"))
            .await
            .unwrap();
        let store = Arc::new(ImageStore::open(dir.path()).unwrap());
        let engine = Arc::new(ConsensusEngine::new(
            pool.clone(),
            store,
            ThirdOpinionPolicy::default(),
        ));
        let bytes = tiny_png(20);

        // Pairwise-disagreeing labels so every submission is accepted
        // whatever order the tasks land in.
        let tasks: Vec<_> = [(1, "OMA"), (2, "Perfo"), (3, "Bouchon")]
            .into_iter()
            .map(|(reviewer_id, name)| {
                let engine = engine.clone();
                let bytes = bytes.clone();
                tokio::spawn(async move {
                    engine
                        .submit(upload(&bytes, reviewer_id, name, "Standard"))
                        .await
                })
            })
            .collect();

        let mut outcomes = Vec::new();
        for task in tasks {
            outcomes.push(task.await.unwrap().unwrap());
        }

        // Exactly one submission took the Absent -> Single transition
        let created = outcomes
            .iter()
            .filter(|o| o.disposition == Disposition::Created)
            .count();
        assert_eq!(created, 1);

        // One physical write, three opinions on the one fingerprint
        assert_eq!(originals_count(&dir), 1);
        let records = diagnoses::load_by_fingerprint(&pool, &Fingerprint::of(&bytes))
            .await
            .unwrap();
        assert_eq!(total_opinions(&records), 3);
    }

    #[tokio::test]
    async fn idle_fingerprint_locks_are_pruned() {
        let (engine, _pool, _dir) = setup(ThirdOpinionPolicy::default()).await;

        engine.submit(upload(&tiny_png(21), 1, "OMA", "Standard")).await.unwrap();
        engine.submit(upload(&tiny_png(22), 1, "Perfo", "Standard")).await.unwrap();

        // The first fingerprint's idle entry was swept when the second
        // submission acquired its lock.
        let locks = engine.locks.lock().await;
        assert_eq!(locks.len(), 1);
    }
}
