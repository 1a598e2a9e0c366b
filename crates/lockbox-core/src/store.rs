//! Public document store API.
//!
//! Composes the ownership index, metadata store and staged transaction
//! manager into Create, Read, Update, Protect, Delete and List. Every call
//! takes the caller identity explicitly; there is no ambient current user.
//!
//! Mutating operations journal an intent record immediately before the
//! commit rename and clear it after the index commit. [`DocumentStore::open`]
//! replays leftover intents, so a crash between the blob replace and the
//! index write is detectable and repaired instead of leaving the index
//! disagreeing with stored content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::cipher::CipherEngine;
use crate::error::{Result, StoreError};
use crate::metadata::{DocumentRecord, MetadataStore};
use crate::ownership::OwnershipIndex;
use crate::staging::TxnManager;

const METADATA_FILE: &str = "metadata.json";
const OWNERS_FILE: &str = "owners.json";
const INTENTS_DIR: &str = "intents";
const INTENT_SUFFIX: &str = ".intent";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
enum IntentOp {
    Create,
    Update,
    Protect,
    Delete,
}

/// Write-ahead intent record, persisted before the commit rename of a
/// mutating operation. `blob_sha256` identifies the staged ciphertext so
/// replay can tell whether the rename actually happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Intent {
    name: String,
    owner: String,
    op: IntentOp,
    protected: bool,
    size: u64,
    blob_sha256: Option<String>,
    started_at: DateTime<Utc>,
}

pub struct DocumentStore {
    meta: MetadataStore,
    owners: OwnershipIndex,
    txn: TxnManager,
    intents_root: PathBuf,
}

impl DocumentStore {
    /// Open (or initialize) a store rooted at `root`: load both indexes,
    /// sweep orphaned staging artifacts and replay the intent journal.
    pub fn open(root: impl AsRef<Path>, engine: Arc<dyn CipherEngine>) -> Result<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root)?;
        let intents_root = root.join(INTENTS_DIR);
        fs::create_dir_all(&intents_root)?;

        let store = Self {
            meta: MetadataStore::load_or_create(root.join(METADATA_FILE))?,
            owners: OwnershipIndex::load_or_create(root.join(OWNERS_FILE))?,
            txn: TxnManager::new(root, engine)?,
            intents_root,
        };
        store.replay_intents()?;
        Ok(store)
    }

    // ── Operations ──────────────────────────────────────────────────────────

    pub async fn create(&self, owner: &str, name: &str, plaintext: &[u8]) -> Result<()> {
        validate_name(name)?;
        if self.meta.get(name).is_some() {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }
        let _guard = self.txn.lock(name).await;
        // Re-check under the lock: another create may have won the race.
        if self.meta.get(name).is_some() {
            return Err(StoreError::AlreadyExists(name.to_string()));
        }

        let staged = self.txn.stage_write(plaintext, "").await?;
        let now = Utc::now();
        let intent = Intent {
            name: name.to_string(),
            owner: owner.to_string(),
            op: IntentOp::Create,
            protected: false,
            size: staged.size,
            blob_sha256: Some(staged.sha256.clone()),
            started_at: now,
        };
        if let Err(e) = self.write_intent(&intent) {
            self.txn.discard_write(&staged).await;
            return Err(e);
        }
        if let Err(e) = self.txn.commit_write(&staged, name).await {
            // The rename never happened; the intent has nothing to redo.
            self.clear_intent(name);
            return Err(e);
        }

        self.meta.upsert(DocumentRecord {
            name: name.to_string(),
            owner: owner.to_string(),
            protected: false,
            size: staged.size,
            created_at: now,
            last_modified: now,
        })?;
        self.owners.assign(owner, name)?;
        self.clear_intent(name);
        Ok(())
    }

    pub async fn read(&self, owner: &str, name: &str, password: Option<&str>) -> Result<Vec<u8>> {
        let _guard = self.txn.lock(name).await;
        let record = self.gate(owner, name)?;
        let password = if record.protected {
            password.ok_or_else(|| StoreError::PasswordRequired(name.to_string()))?
        } else {
            ""
        };
        self.txn.read_transform(name, password).await
    }

    pub async fn update(
        &self,
        owner: &str,
        name: &str,
        plaintext: &[u8],
        password: Option<&str>,
    ) -> Result<()> {
        let _guard = self.txn.lock(name).await;
        let record = self.gate(owner, name)?;

        let password = if record.protected {
            let password = password.ok_or_else(|| StoreError::PasswordRequired(name.to_string()))?;
            // Prove the password against the current blob before re-keying;
            // a wrong password must fail, never silently re-encrypt.
            let _current = Zeroizing::new(self.txn.read_transform(name, password).await?);
            password
        } else {
            ""
        };

        let staged = self.txn.stage_write(plaintext, password).await?;
        let intent = Intent {
            name: name.to_string(),
            owner: owner.to_string(),
            op: IntentOp::Update,
            protected: record.protected,
            size: staged.size,
            blob_sha256: Some(staged.sha256.clone()),
            started_at: Utc::now(),
        };
        if let Err(e) = self.write_intent(&intent) {
            self.txn.discard_write(&staged).await;
            return Err(e);
        }
        if let Err(e) = self.txn.commit_write(&staged, name).await {
            // The rename never happened; the intent has nothing to redo.
            self.clear_intent(name);
            return Err(e);
        }

        self.meta.upsert(DocumentRecord {
            size: staged.size,
            last_modified: intent.started_at,
            ..record
        })?;
        self.clear_intent(name);
        Ok(())
    }

    pub async fn protect(&self, owner: &str, name: &str, password: &str) -> Result<()> {
        if password.is_empty() {
            return Err(StoreError::Validation(
                "protection password must not be empty".to_string(),
            ));
        }
        let _guard = self.txn.lock(name).await;
        let record = self.gate(owner, name)?;
        if record.protected {
            return Err(StoreError::AlreadyProtected(name.to_string()));
        }

        let plaintext = Zeroizing::new(self.txn.read_transform(name, "").await?);
        let staged = self.txn.stage_write(&plaintext, password).await?;
        let intent = Intent {
            name: name.to_string(),
            owner: owner.to_string(),
            op: IntentOp::Protect,
            protected: true,
            size: staged.size,
            blob_sha256: Some(staged.sha256.clone()),
            started_at: Utc::now(),
        };
        if let Err(e) = self.write_intent(&intent) {
            self.txn.discard_write(&staged).await;
            return Err(e);
        }
        if let Err(e) = self.txn.commit_write(&staged, name).await {
            // The rename never happened; the intent has nothing to redo.
            self.clear_intent(name);
            return Err(e);
        }

        self.meta.upsert(DocumentRecord {
            protected: true,
            size: staged.size,
            last_modified: intent.started_at,
            ..record
        })?;
        self.clear_intent(name);
        Ok(())
    }

    /// Remove blob, metadata record and ownership entry as one logical
    /// unit. If a step fails the intent stays journaled, the error is
    /// reported, and the next `open` completes the removal.
    pub async fn delete(&self, owner: &str, name: &str) -> Result<()> {
        let _guard = self.txn.lock(name).await;
        let record = self.gate(owner, name)?;

        let intent = Intent {
            name: name.to_string(),
            owner: record.owner.clone(),
            op: IntentOp::Delete,
            protected: record.protected,
            size: record.size,
            blob_sha256: None,
            started_at: Utc::now(),
        };
        self.write_intent(&intent)?;

        self.txn.remove_blob(name)?;
        self.meta.remove(name)?;
        self.owners.revoke(owner, name)?;
        self.clear_intent(name);
        Ok(())
    }

    pub fn list(&self, owner: &str) -> Vec<DocumentRecord> {
        self.owners
            .list_for(owner)
            .iter()
            .filter_map(|name| self.meta.get(name))
            .collect()
    }

    // ── Ownership gate ──────────────────────────────────────────────────────

    /// Checked first, unconditionally, for every per-document operation.
    fn gate(&self, caller: &str, name: &str) -> Result<DocumentRecord> {
        match self.owners.owner_of(name) {
            None => Err(StoreError::NotFound(name.to_string())),
            Some(owner) if owner != caller => Err(StoreError::AccessDenied(name.to_string())),
            Some(_) => self
                .meta
                .get(name)
                .ok_or_else(|| StoreError::NotFound(name.to_string())),
        }
    }

    // ── Intent journal ──────────────────────────────────────────────────────

    fn intent_path(&self, name: &str) -> PathBuf {
        self.intents_root.join(format!("{name}{INTENT_SUFFIX}"))
    }

    fn write_intent(&self, intent: &Intent) -> Result<()> {
        let json = serde_json::to_string(intent)?;
        fs::write(self.intent_path(&intent.name), json)?;
        Ok(())
    }

    fn clear_intent(&self, name: &str) {
        if let Err(e) = fs::remove_file(self.intent_path(name)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(name, "cannot clear intent record: {e}");
            }
        }
    }

    fn replay_intents(&self) -> Result<()> {
        let entries = match fs::read_dir(&self.intents_root) {
            Ok(entries) => entries,
            Err(_) => return Ok(()),
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.to_string_lossy().ends_with(INTENT_SUFFIX) {
                continue;
            }
            let intent: Intent = match fs::read_to_string(&path)
                .map_err(StoreError::from)
                .and_then(|json| Ok(serde_json::from_str(&json)?))
            {
                Ok(intent) => intent,
                Err(e) => {
                    warn!(path = %path.display(), "dropping unreadable intent record: {e}");
                    let _ = fs::remove_file(&path);
                    continue;
                }
            };
            self.replay_one(&intent)?;
            let _ = fs::remove_file(&path);
        }
        Ok(())
    }

    fn replay_one(&self, intent: &Intent) -> Result<()> {
        info!(name = %intent.name, op = ?intent.op, "replaying interrupted operation");
        match intent.op {
            IntentOp::Delete => {
                // Complete the removal; every step is idempotent.
                if self.txn.blob_exists(&intent.name) {
                    self.txn.remove_blob(&intent.name)?;
                }
                self.meta.remove(&intent.name)?;
                self.owners.revoke(&intent.owner, &intent.name)?;
            }
            IntentOp::Create => {
                if self.blob_matches(intent) {
                    // Commit rename happened; make the indexes agree.
                    if self.meta.get(&intent.name).is_none() {
                        self.meta.upsert(DocumentRecord {
                            name: intent.name.clone(),
                            owner: intent.owner.clone(),
                            protected: false,
                            size: intent.size,
                            created_at: intent.started_at,
                            last_modified: intent.started_at,
                        })?;
                    }
                    self.owners.assign(&intent.owner, &intent.name)?;
                } else if self.txn.blob_exists(&intent.name) {
                    warn!(name = %intent.name, "create intent does not match stored blob; leaving blob in place");
                }
            }
            IntentOp::Update | IntentOp::Protect => {
                if self.blob_matches(intent) {
                    if let Some(record) = self.meta.get(&intent.name) {
                        self.meta.upsert(DocumentRecord {
                            protected: intent.protected,
                            size: intent.size,
                            last_modified: intent.started_at,
                            ..record
                        })?;
                    } else {
                        warn!(name = %intent.name, "intent references unknown document");
                    }
                }
                // No blob match: the rename never happened and the old
                // content is still authoritative; nothing to repair.
            }
        }
        Ok(())
    }

    fn blob_matches(&self, intent: &Intent) -> bool {
        match (&intent.blob_sha256, self.txn.blob_digest(&intent.name)) {
            (Some(expected), Ok(Some(actual))) => *expected == actual,
            _ => false,
        }
    }
}

/// Document names address blob files directly, so they must be plain
/// single-component names.
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(StoreError::Validation(
            "document name must be 1-255 characters".to_string(),
        ));
    }
    if name == "." || name == ".." {
        return Err(StoreError::Validation(
            "document name must not be a directory reference".to_string(),
        ));
    }
    if name.contains('/') || name.contains('\\') || name.contains('\0') {
        return Err(StoreError::Validation(
            "document name must not contain path separators".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_validation() {
        assert!(validate_name("notes.txt").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name(".").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name(&"x".repeat(300)).is_err());
    }
}
