//! Domain model types

pub mod diagnosis;

pub use diagnosis::{DiagnosisRecord, OpinionSlot, SlotPosition};
