//! Diagnosis record model
//!
//! One record row carries up to two reviewer opinions ("slots") on the
//! same fingerprinted image. A slot may be blanked by retraction while
//! the row survives to protect the other reviewer's opinion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::fingerprint::Fingerprint;
use crate::sanitize::opinion_key;

/// Which slot of a record an operation addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SlotPosition {
    Primary,
    Secondary,
}

/// One reviewer's assessment of one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpinionSlot {
    pub reviewer_id: i64,
    pub reviewer_name: String,
    /// Normalized free-text disease name
    pub disease_name: String,
    /// Normalized free-text disease type ("Standard" when left blank)
    pub disease_type: String,
    pub diagnosed_at: DateTime<Utc>,
}

impl OpinionSlot {
    /// Key used for agreement comparison between opinions.
    pub fn key(&self) -> String {
        opinion_key(&self.disease_name, &self.disease_type)
    }
}

/// Persistent diagnosis record: a fingerprinted image plus up to two
/// opinion slots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisRecord {
    pub id: Uuid,
    pub fingerprint: Fingerprint,
    /// Original blob path, relative to the store root
    pub original_path: String,
    /// Canonical re-encoded blob path, relative to the store root
    pub class_path: String,
    pub primary: Option<OpinionSlot>,
    pub secondary: Option<OpinionSlot>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DiagnosisRecord {
    /// Create a fresh record holding a single primary opinion.
    pub fn new(
        fingerprint: Fingerprint,
        original_path: String,
        class_path: String,
        primary: OpinionSlot,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            fingerprint,
            original_path,
            class_path,
            primary: Some(primary),
            secondary: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Occupied slots in primary-then-secondary order.
    pub fn opinions(&self) -> impl Iterator<Item = (SlotPosition, &OpinionSlot)> {
        self.primary
            .iter()
            .map(|s| (SlotPosition::Primary, s))
            .chain(self.secondary.iter().map(|s| (SlotPosition::Secondary, s)))
    }

    pub fn opinion_count(&self) -> usize {
        self.opinions().count()
    }

    pub fn slot(&self, position: SlotPosition) -> Option<&OpinionSlot> {
        match position {
            SlotPosition::Primary => self.primary.as_ref(),
            SlotPosition::Secondary => self.secondary.as_ref(),
        }
    }

    /// Position held by a reviewer on this record, if any.
    pub fn position_of(&self, reviewer_id: i64) -> Option<SlotPosition> {
        self.opinions()
            .find(|(_, slot)| slot.reviewer_id == reviewer_id)
            .map(|(pos, _)| pos)
    }

    /// First unoccupied slot, if the record has room.
    pub fn open_position(&self) -> Option<SlotPosition> {
        if self.primary.is_none() {
            Some(SlotPosition::Primary)
        } else if self.secondary.is_none() {
            Some(SlotPosition::Secondary)
        } else {
            None
        }
    }
}
