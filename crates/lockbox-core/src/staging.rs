//! Staged transaction manager.
//!
//! All content transforms happen off to the side in a disposable staging
//! area and are committed over the real blob with a rename, so a failed or
//! interrupted transform never leaves a document partially transformed. The
//! blob and staging directories are owned exclusively by [`TxnManager`]; no
//! other component touches them.
//!
//! A write is split into two steps so the caller can journal an intent
//! record between the encrypt and the commit rename: [`TxnManager::stage_write`]
//! produces a [`StagedWrite`], [`TxnManager::commit_write`] publishes it.
//! Reads decrypt a copy of the blob and never rewrite the original.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::OwnedMutexGuard;
use tracing::warn;
use uuid::Uuid;

use crate::cipher::{CipherEngine, CipherOp};
use crate::error::{Result, StoreError};

const STAGING_SUFFIX: &str = ".staging";

/// An encrypted artifact sitting in the staging area, not yet published.
/// Consume it with [`TxnManager::commit_write`] or [`TxnManager::discard_write`].
#[derive(Debug)]
pub struct StagedWrite {
    path: PathBuf,
    pub size: u64,
    pub sha256: String,
}

pub struct TxnManager {
    blobs_root: PathBuf,
    staging_root: PathBuf,
    engine: Arc<dyn CipherEngine>,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl TxnManager {
    /// Create the blob and staging directories and sweep any staging
    /// artifacts orphaned by a previous crash.
    pub fn new(root: impl AsRef<Path>, engine: Arc<dyn CipherEngine>) -> Result<Self> {
        let root = root.as_ref();
        let blobs_root = root.join("blobs");
        let staging_root = root.join("staging");
        fs::create_dir_all(&blobs_root)?;
        fs::create_dir_all(&staging_root)?;
        Self::sweep_staging(&staging_root);
        Ok(Self {
            blobs_root,
            staging_root,
            engine,
            locks: Mutex::new(HashMap::new()),
        })
    }

    /// Per-document-name mutual exclusion. Callers hold the guard for the
    /// full span of a public operation; two transactions on the same name
    /// must never overlap staging lifetimes or the commit rename.
    pub async fn lock(&self, name: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut locks = self.locks.lock();
            locks
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        slot.lock_owned().await
    }

    // ── Write transform ─────────────────────────────────────────────────────

    /// Materialize `plaintext` into a fresh staging artifact and encrypt it
    /// in place. The existing blob (if any) is untouched; on any failure the
    /// artifact is deleted before the error is returned.
    pub async fn stage_write(&self, plaintext: &[u8], password: &str) -> Result<StagedWrite> {
        let path = self.staging_path();
        let result = self.encrypt_into(&path, plaintext, password).await;
        if result.is_err() {
            self.remove_staging(&path).await;
        }
        result
    }

    async fn encrypt_into(
        &self,
        path: &Path,
        plaintext: &[u8],
        password: &str,
    ) -> Result<StagedWrite> {
        {
            let mut file = tokio::fs::File::create(path).await?;
            file.write_all(plaintext).await?;
            file.sync_all().await?;
        }
        self.engine
            .transform(path, CipherOp::Encrypt, password)
            .await?;
        let ciphertext = tokio::fs::read(path).await?;
        Ok(StagedWrite {
            path: path.to_path_buf(),
            size: ciphertext.len() as u64,
            sha256: sha256_hex(&ciphertext),
        })
    }

    /// Publish a staged artifact as the blob for `name`, replacing any
    /// previous content in one rename. Consumes the artifact either way.
    pub async fn commit_write(&self, staged: &StagedWrite, name: &str) -> Result<()> {
        let dest = self.blob_path(name);
        if let Err(e) = tokio::fs::rename(&staged.path, &dest).await {
            self.remove_staging(&staged.path).await;
            return Err(e.into());
        }
        fsync_dir(&self.blobs_root)?;
        Ok(())
    }

    /// Drop a staged artifact without publishing it.
    pub async fn discard_write(&self, staged: &StagedWrite) {
        self.remove_staging(&staged.path).await;
    }

    // ── Read transform ──────────────────────────────────────────────────────

    /// Decrypt the blob for `name` via a staging copy and return the
    /// plaintext. The committed blob is never rewritten by a read, so a
    /// failed decrypt provably leaves it byte-identical.
    pub async fn read_transform(&self, name: &str, password: &str) -> Result<Vec<u8>> {
        let blob = self.blob_path(name);
        if !blob.exists() {
            return Err(StoreError::NotFound(name.to_string()));
        }
        let staging = self.staging_path();
        let result = self.decrypt_copy(&blob, &staging, password).await;
        self.remove_staging(&staging).await;
        result
    }

    async fn decrypt_copy(&self, blob: &Path, staging: &Path, password: &str) -> Result<Vec<u8>> {
        tokio::fs::copy(blob, staging).await?;
        self.engine
            .transform(staging, CipherOp::Decrypt, password)
            .await?;
        Ok(tokio::fs::read(staging).await?)
    }

    // ── Blob accessors ──────────────────────────────────────────────────────

    pub fn blob_exists(&self, name: &str) -> bool {
        self.blob_path(name).exists()
    }

    pub fn blob_size(&self, name: &str) -> Result<u64> {
        let meta = fs::metadata(self.blob_path(name))
            .map_err(|_| StoreError::NotFound(name.to_string()))?;
        Ok(meta.len())
    }

    /// Hex SHA-256 of the committed blob, or `None` if there is none.
    /// Used by intent-journal replay to decide whether a commit rename
    /// actually happened.
    pub fn blob_digest(&self, name: &str) -> Result<Option<String>> {
        let path = self.blob_path(name);
        if !path.exists() {
            return Ok(None);
        }
        let data = fs::read(path)?;
        Ok(Some(sha256_hex(&data)))
    }

    pub fn remove_blob(&self, name: &str) -> Result<()> {
        fs::remove_file(self.blob_path(name))
            .map_err(|_| StoreError::NotFound(name.to_string()))
    }

    // ── Private helpers ─────────────────────────────────────────────────────

    fn blob_path(&self, name: &str) -> PathBuf {
        self.blobs_root.join(name)
    }

    fn staging_path(&self) -> PathBuf {
        // Unique per transaction, not per document name, so two in-flight
        // transactions can never collide on an artifact.
        self.staging_root
            .join(format!("{}{}", Uuid::new_v4(), STAGING_SUFFIX))
    }

    /// Cleanup failures are logged and never mask the primary error.
    async fn remove_staging(&self, path: &Path) {
        if let Err(e) = tokio::fs::remove_file(path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), "cannot remove staging artifact: {e}");
            }
        }
    }

    fn sweep_staging(staging_root: &Path) {
        if let Ok(entries) = fs::read_dir(staging_root) {
            for entry in entries.flatten() {
                if entry.file_name().to_string_lossy().ends_with(STAGING_SUFFIX) {
                    warn!(path = %entry.path().display(), "removing orphaned staging artifact");
                    let _ = fs::remove_file(entry.path());
                }
            }
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn fsync_dir(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let dir = OpenOptions::new().read(true).open(path)?;
        dir.sync_all()?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::{CipherError, XChaChaCipher};
    use async_trait::async_trait;
    use tempfile::tempdir;

    struct FailingEngine;

    #[async_trait]
    impl CipherEngine for FailingEngine {
        async fn transform(
            &self,
            _blob: &Path,
            _op: CipherOp,
            _password: &str,
        ) -> std::result::Result<(), CipherError> {
            Err(CipherError::Tool("injected failure".to_string()))
        }
    }

    fn staging_entries(root: &Path) -> usize {
        fs::read_dir(root.join("staging")).unwrap().count()
    }

    #[tokio::test]
    async fn stage_commit_read_roundtrip() {
        let dir = tempdir().unwrap();
        let txn = TxnManager::new(dir.path(), Arc::new(XChaChaCipher::new())).unwrap();

        let staged = txn.stage_write(b"hello", "pw").await.unwrap();
        assert!(staged.size > 0);
        txn.commit_write(&staged, "notes.txt").await.unwrap();

        assert_eq!(txn.blob_size("notes.txt").unwrap(), staged.size);
        let plain = txn.read_transform("notes.txt", "pw").await.unwrap();
        assert_eq!(plain, b"hello");
        assert_eq!(staging_entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn failed_encrypt_leaves_no_artifact_and_old_blob_intact() {
        let dir = tempdir().unwrap();
        let txn = TxnManager::new(dir.path(), Arc::new(XChaChaCipher::new())).unwrap();
        let staged = txn.stage_write(b"v1", "").await.unwrap();
        txn.commit_write(&staged, "doc").await.unwrap();
        let before = fs::read(dir.path().join("blobs").join("doc")).unwrap();

        let failing = TxnManager::new(dir.path(), Arc::new(FailingEngine)).unwrap();
        let err = failing.stage_write(b"v2", "").await.unwrap_err();
        assert!(matches!(err, StoreError::Tool(_)));

        let after = fs::read(dir.path().join("blobs").join("doc")).unwrap();
        assert_eq!(before, after);
        assert_eq!(staging_entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn failed_decrypt_cleans_staging_and_preserves_blob() {
        let dir = tempdir().unwrap();
        let txn = TxnManager::new(dir.path(), Arc::new(XChaChaCipher::new())).unwrap();
        let staged = txn.stage_write(b"secret", "right").await.unwrap();
        txn.commit_write(&staged, "doc").await.unwrap();
        let before = fs::read(dir.path().join("blobs").join("doc")).unwrap();

        let err = txn.read_transform("doc", "wrong").await.unwrap_err();
        assert!(matches!(err, StoreError::WrongPassword));
        assert_eq!(fs::read(dir.path().join("blobs").join("doc")).unwrap(), before);
        assert_eq!(staging_entries(dir.path()), 0);
    }

    #[tokio::test]
    async fn orphaned_staging_artifacts_are_swept_on_open() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("staging")).unwrap();
        let orphan = dir
            .path()
            .join("staging")
            .join(format!("{}.staging", Uuid::new_v4()));
        fs::write(&orphan, b"leftover").unwrap();

        let _txn = TxnManager::new(dir.path(), Arc::new(XChaChaCipher::new())).unwrap();
        assert!(!orphan.exists());
    }

    #[tokio::test]
    async fn read_of_missing_blob_is_not_found() {
        let dir = tempdir().unwrap();
        let txn = TxnManager::new(dir.path(), Arc::new(XChaChaCipher::new())).unwrap();
        let err = txn.read_transform("ghost", "").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
