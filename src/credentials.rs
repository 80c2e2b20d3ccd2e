use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::DownloadError;

/// Single-slot holder for the uploaded cookie file.
///
/// The blob is never parsed here; a bad file only surfaces when the engine
/// rejects it.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replaces the stored blob and returns its SHA-256 fingerprint.
    pub async fn store(&self, blob: &[u8]) -> Result<String, DownloadError> {
        if let Some(parent) = self.path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.path, blob).await?;

        let fingerprint = format!("{:x}", Sha256::digest(blob));
        info!(
            "Stored credential file {:?} ({} bytes, sha256 {})",
            self.path,
            blob.len(),
            fingerprint
        );
        Ok(fingerprint)
    }

    pub async fn exists(&self) -> bool {
        tokio::fs::metadata(&self.path)
            .await
            .map(|metadata| metadata.is_file())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn absent_until_first_upload() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cookies.txt"));
        assert!(!store.exists().await);

        store.store(b"# Netscape HTTP Cookie File\n").await.unwrap();
        assert!(store.exists().await);
    }

    #[tokio::test]
    async fn repeated_upload_of_same_blob_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cookies.txt"));
        let blob = b".youtube.com\tTRUE\t/\tTRUE\t0\tSID\tabc\n";

        let first = store.store(blob).await.unwrap();
        let second = store.store(blob).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(std::fs::read(store.path()).unwrap(), blob);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn upload_overwrites_previous_blob() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cookies.txt"));

        let old = store.store(b"a much longer first cookie blob").await.unwrap();
        let new = store.store(b"short").await.unwrap();

        assert_ne!(old, new);
        assert_eq!(std::fs::read(store.path()).unwrap(), b"short");
    }

    #[tokio::test]
    async fn missing_parent_directories_are_created() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("state").join("cookies.txt"));
        store.store(b"blob").await.unwrap();
        assert!(store.exists().await);
    }

    #[tokio::test]
    async fn unwritable_slot_reports_storage_error() {
        let dir = tempdir().unwrap();
        let store = CredentialStore::new(dir.path());

        let error = store.store(b"blob").await.unwrap_err();
        assert!(matches!(error, DownloadError::Storage(_)));
        assert!(!store.exists().await);
    }
}
