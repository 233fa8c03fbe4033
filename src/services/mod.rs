//! Core services: image storage, consensus, gallery projection

pub mod consensus;
pub mod gallery;
pub mod image_store;
