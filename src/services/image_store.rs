//! Physical image storage
//!
//! Owns the blobs for each fingerprint: the original upload under
//! `originals/` and a canonical JPEG re-encode under `classes/`. Blobs are
//! written once per fingerprint (the consensus engine enforces that) and
//! deleted only when the last referencing diagnosis record is removed.
//!
//! Writes go to a `.tmp` sibling followed by an atomic rename so a failed
//! request never leaves a partial blob observable.

use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{Error, Result};
use crate::fingerprint::Fingerprint;
use crate::sanitize::sanitize;

/// JPEG quality for the canonical re-encode.
const CLASS_JPEG_QUALITY: u8 = 85;

/// Paths of the two stored blobs, relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredPaths {
    pub original: String,
    pub class: String,
}

/// Filesystem-backed image store.
///
/// The class filename sequence is scoped to the whole store, monotonic
/// within one instance, and resumed from the highest sequence found on
/// disk at open time.
pub struct ImageStore {
    root: PathBuf,
    sequence: AtomicU64,
}

impl ImageStore {
    /// Open a store rooted at `data_dir`, creating the blob areas if
    /// missing and resuming the class sequence counter.
    pub fn open(data_dir: &Path) -> Result<Self> {
        let root = data_dir.to_path_buf();
        fs::create_dir_all(root.join("originals"))?;
        fs::create_dir_all(root.join("classes"))?;

        let sequence = AtomicU64::new(highest_class_sequence(&root.join("classes"))?);

        Ok(Self { root, sequence })
    }

    /// Persist the original bytes and the canonical JPEG re-encode.
    ///
    /// Decode happens before any write so unsupported image data fails
    /// cleanly. If the class write fails after the original landed, the
    /// original is removed again.
    pub fn store(
        &self,
        fingerprint: &Fingerprint,
        raw_bytes: &[u8],
        original_filename: &str,
        disease_name: &str,
        disease_type: &str,
        reviewer_id: i64,
    ) -> Result<StoredPaths> {
        let decoded = image::load_from_memory(raw_bytes)
            .map_err(|e| Error::Validation(format!("unsupported image data: {}", e)))?;

        // JPEG carries no alpha channel
        let mut class_bytes = Vec::new();
        image::DynamicImage::ImageRgb8(decoded.to_rgb8())
            .write_to(
                &mut Cursor::new(&mut class_bytes),
                image::ImageOutputFormat::Jpeg(CLASS_JPEG_QUALITY),
            )
            .map_err(|e| Error::Internal(format!("image re-encode failed: {}", e)))?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;

        let original_name = original_blob_name(fingerprint, original_filename);
        let class_name = format!(
            "{}_{}_{}_{}.jpg",
            sanitize(disease_name, "unclassified"),
            sanitize(disease_type, "standard"),
            reviewer_id,
            sequence
        );

        let paths = StoredPaths {
            original: format!("originals/{}", original_name),
            class: format!("classes/{}", class_name),
        };

        let original_abs = self.root.join(&paths.original);
        let class_abs = self.root.join(&paths.class);

        write_atomic(&original_abs, raw_bytes)?;
        if let Err(e) = write_atomic(&class_abs, &class_bytes) {
            let _ = fs::remove_file(&original_abs);
            return Err(e.into());
        }

        tracing::info!(
            fingerprint = %fingerprint,
            original = %paths.original,
            class = %paths.class,
            "Stored image blobs"
        );

        Ok(paths)
    }

    /// Remove both blobs for a record's stored paths.
    ///
    /// A no-op when the blobs are already absent. Callers must only
    /// invoke this once no diagnosis record references the fingerprint.
    pub fn delete(&self, paths: &StoredPaths) -> Result<()> {
        for relative in [&paths.original, &paths.class] {
            match fs::remove_file(self.root.join(relative)) {
                Ok(()) => {
                    tracing::info!(path = %relative, "Deleted image blob");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Store root (for serving or inspection).
    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Original blob name: fingerprint prefix plus the sanitized upload
/// filename, so identical client filenames never collide across distinct
/// fingerprints.
fn original_blob_name(fingerprint: &Fingerprint, original_filename: &str) -> String {
    let path = Path::new(original_filename);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
    let extension = path
        .extension()
        .and_then(|s| s.to_str())
        .map(|s| sanitize(s, "img"))
        .unwrap_or_else(|| "img".to_string());

    format!(
        "{}_{}.{}",
        fingerprint.short(),
        sanitize(stem, "upload"),
        extension
    )
}

fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("blob");
    let tmp = path.with_file_name(format!("{}.tmp", file_name));

    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Highest trailing `_<n>` sequence among existing class filenames.
fn highest_class_sequence(classes_dir: &Path) -> Result<u64> {
    let mut highest = 0u64;
    for entry in fs::read_dir(classes_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(stem) = Path::new(&name).file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if let Some(seq) = stem.rsplit('_').next().and_then(|s| s.parse::<u64>().ok()) {
            highest = highest.max(seq);
        }
    }
    Ok(highest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tiny_png() -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            2,
            2,
            image::Rgb([120, 40, 40]),
        ));
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageOutputFormat::Png)
            .unwrap();
        buf
    }

    fn open_store(dir: &TempDir) -> ImageStore {
        ImageStore::open(dir.path()).unwrap()
    }

    #[test]
    fn store_writes_original_and_class_blobs() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let bytes = tiny_png();
        let fp = Fingerprint::of(&bytes);

        let paths = store
            .store(&fp, &bytes, "Tympan Gauche.png", "OMA chronique", "", 4)
            .unwrap();

        assert_eq!(
            paths.original,
            format!("originals/{}_tympan_gauche.png", fp.short())
        );
        assert_eq!(paths.class, "classes/oma_chronique_standard_4_1.jpg");

        assert_eq!(fs::read(dir.path().join(&paths.original)).unwrap(), bytes);

        // Class blob is a decodable JPEG
        let class_bytes = fs::read(dir.path().join(&paths.class)).unwrap();
        let reloaded = image::load_from_memory(&class_bytes).unwrap();
        assert_eq!(reloaded.width(), 2);
    }

    #[test]
    fn sequence_increments_and_resumes_from_disk() {
        let dir = TempDir::new().unwrap();
        let bytes = tiny_png();

        {
            let store = open_store(&dir);
            let p1 = store
                .store(&Fingerprint::of(b"a"), &bytes, "a.png", "OMA", "Standard", 1)
                .unwrap();
            let p2 = store
                .store(&Fingerprint::of(b"b"), &bytes, "b.png", "Perfo", "Standard", 1)
                .unwrap();
            assert!(p1.class.ends_with("_1.jpg"));
            assert!(p2.class.ends_with("_2.jpg"));
        }

        // Reopening resumes past the highest sequence on disk
        let store = open_store(&dir);
        let p3 = store
            .store(&Fingerprint::of(b"c"), &bytes, "c.png", "OMA", "Standard", 2)
            .unwrap();
        assert!(p3.class.ends_with("_3.jpg"));
    }

    #[test]
    fn delete_removes_blobs_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let bytes = tiny_png();
        let fp = Fingerprint::of(&bytes);

        let paths = store
            .store(&fp, &bytes, "scan.png", "OMA", "Standard", 1)
            .unwrap();

        store.delete(&paths).unwrap();
        assert!(!dir.path().join(&paths.original).exists());
        assert!(!dir.path().join(&paths.class).exists());

        // Already absent: still a no-op, not an error
        store.delete(&paths).unwrap();
    }

    #[test]
    fn invalid_image_data_is_rejected_before_any_write() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let fp = Fingerprint::of(b"not an image");

        let err = store
            .store(&fp, b"not an image", "x.png", "OMA", "Standard", 1)
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        assert_eq!(fs::read_dir(dir.path().join("originals")).unwrap().count(), 0);
        assert_eq!(fs::read_dir(dir.path().join("classes")).unwrap().count(), 0);
    }

    #[test]
    fn no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let store = open_store(&dir);
        let bytes = tiny_png();

        store
            .store(&Fingerprint::of(&bytes), &bytes, "scan.png", "OMA", "Standard", 1)
            .unwrap();

        for area in ["originals", "classes"] {
            for entry in fs::read_dir(dir.path().join(area)).unwrap() {
                let name = entry.unwrap().file_name();
                assert!(!name.to_string_lossy().ends_with(".tmp"));
            }
        }
    }
}
