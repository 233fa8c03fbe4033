//! Gallery projection
//!
//! Read-only grouping of diagnosis records by fingerprint for the shared
//! gallery view. Recomputed on demand from the repository; nothing is
//! cached.

use serde::Serialize;
use uuid::Uuid;

use crate::fingerprint::Fingerprint;
use crate::models::{DiagnosisRecord, SlotPosition};

/// One reviewer opinion as shown in the gallery.
#[derive(Debug, Clone, Serialize)]
pub struct OpinionSummary {
    pub record_id: Uuid,
    pub slot: SlotPosition,
    pub reviewer_id: i64,
    pub reviewer_name: String,
    pub disease_name: String,
    pub disease_type: String,
    pub diagnosed_at: chrono::DateTime<chrono::Utc>,
}

/// All opinions attached to one physical image.
#[derive(Debug, Clone, Serialize)]
pub struct GalleryGroup {
    pub fingerprint: Fingerprint,
    /// Canonical storage path shared by every opinion in the group
    pub image_path: String,
    pub opinions: Vec<OpinionSummary>,
}

/// Group records by fingerprint, preserving the input record order for
/// both groups and opinions within a group.
pub fn project(records: &[DiagnosisRecord]) -> Vec<GalleryGroup> {
    let mut groups: Vec<GalleryGroup> = Vec::new();

    for record in records {
        let summaries = record.opinions().map(|(slot, opinion)| OpinionSummary {
            record_id: record.id,
            slot,
            reviewer_id: opinion.reviewer_id,
            reviewer_name: opinion.reviewer_name.clone(),
            disease_name: opinion.disease_name.clone(),
            disease_type: opinion.disease_type.clone(),
            diagnosed_at: opinion.diagnosed_at,
        });

        match groups
            .iter_mut()
            .find(|g| g.fingerprint == record.fingerprint)
        {
            Some(group) => group.opinions.extend(summaries),
            None => groups.push(GalleryGroup {
                fingerprint: record.fingerprint.clone(),
                image_path: record.class_path.clone(),
                opinions: summaries.collect(),
            }),
        }
    }

    groups
}
