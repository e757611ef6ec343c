//! Filesystem storage for content-addressed image blobs.

use core_types::BlobReference;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// This call wrote the blob.
    Created,
    /// A blob with that reference was already stored; nothing was written.
    AlreadyPresent,
}

/// Byte storage keyed by [`BlobReference`].
pub trait BlobStore: Send + Sync {
    fn exists(&self, blob_reference: &BlobReference) -> io::Result<bool>;

    /// Stores `bytes` unless the reference is already present. Existing blobs are never overwritten.
    fn put(&self, blob_reference: &BlobReference, bytes: &[u8]) -> io::Result<PutOutcome>;

    fn read(&self, blob_reference: &BlobReference) -> io::Result<Vec<u8>>;

    /// Removes the blob. Fails with `NotFound` when it is not stored.
    fn delete(&self, blob_reference: &BlobReference) -> io::Result<()>;

    fn path_for(&self, blob_reference: &BlobReference) -> PathBuf;
}

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Creates the root directory when missing.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let store = Self::new(root);
        fs::create_dir_all(&store.root)?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn temp_path_for(&self, blob_reference: &BlobReference) -> PathBuf {
        let seq = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.root.join(format!(
            ".{blob_reference}.{}.{seq}.tmp",
            std::process::id()
        ))
    }
}

impl BlobStore for FsBlobStore {
    fn exists(&self, blob_reference: &BlobReference) -> io::Result<bool> {
        self.path_for(blob_reference).try_exists()
    }

    fn put(&self, blob_reference: &BlobReference, bytes: &[u8]) -> io::Result<PutOutcome> {
        let final_path = self.path_for(blob_reference);
        let temp_path = self.temp_path_for(blob_reference);

        if let Err(err) = write_synced(&temp_path, bytes) {
            warn!(temp_path = %temp_path.display(), error = %err, "blob temp write failed");
            let _ = fs::remove_file(&temp_path);
            return Err(err);
        }

        // Linking publishes the complete file under its final name and refuses to replace one.
        let linked = fs::hard_link(&temp_path, &final_path);
        let _ = fs::remove_file(&temp_path);
        match linked {
            Ok(()) => {
                debug!(blob_reference = %blob_reference, size = bytes.len(), "blob stored");
                Ok(PutOutcome::Created)
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                debug!(blob_reference = %blob_reference, "blob already present");
                Ok(PutOutcome::AlreadyPresent)
            }
            Err(err) => {
                warn!(path = %final_path.display(), error = %err, "blob publish failed");
                Err(err)
            }
        }
    }

    fn read(&self, blob_reference: &BlobReference) -> io::Result<Vec<u8>> {
        fs::read(self.path_for(blob_reference))
    }

    fn delete(&self, blob_reference: &BlobReference) -> io::Result<()> {
        fs::remove_file(self.path_for(blob_reference))?;
        debug!(blob_reference = %blob_reference, "blob removed");
        Ok(())
    }

    fn path_for(&self, blob_reference: &BlobReference) -> PathBuf {
        self.root.join(blob_reference.as_str())
    }
}

fn write_synced(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_types::ServableFormat;

    fn reference(hex: &str) -> BlobReference {
        BlobReference::new(hex, ServableFormat::Png).unwrap()
    }

    fn entries(root: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(root)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn put_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path().join("media")).unwrap();
        let r = reference("aa");

        assert!(!store.exists(&r).unwrap());
        assert_eq!(store.put(&r, b"payload").unwrap(), PutOutcome::Created);
        assert!(store.exists(&r).unwrap());
        assert_eq!(store.read(&r).unwrap(), b"payload");
        assert_eq!(entries(store.root()), vec!["aa.png"]);
    }

    #[test]
    fn put_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        let r = reference("bb");

        store.put(&r, b"first").unwrap();
        assert_eq!(store.put(&r, b"second").unwrap(), PutOutcome::AlreadyPresent);
        assert_eq!(store.read(&r).unwrap(), b"first");
        assert_eq!(entries(store.root()), vec!["bb.png"]);
    }

    #[test]
    fn delete_missing_blob_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::open(dir.path()).unwrap();
        let r = reference("cc");

        store.put(&r, b"x").unwrap();
        store.delete(&r).unwrap();
        assert!(!store.exists(&r).unwrap());
        let err = store.delete(&r).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn put_into_missing_root_fails_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path().join("absent"));
        assert!(store.put(&reference("dd"), b"x").is_err());
        assert!(!dir.path().join("absent").exists());
    }
}
