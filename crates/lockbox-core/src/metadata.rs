//! Durable projection of a document's non-content attributes.
//!
//! The whole map is rewritten as JSON on every mutation, which is fine at
//! the document counts this store targets; swapping in an incremental
//! backend only has to keep the get/upsert/remove contract.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub name: String,
    pub owner: String,
    pub protected: bool,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

pub struct MetadataStore {
    path: PathBuf,
    records: RwLock<HashMap<String, DocumentRecord>>,
}

impl MetadataStore {
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            records: RwLock::new(records),
        })
    }

    pub fn get(&self, name: &str) -> Option<DocumentRecord> {
        self.records.read().get(name).cloned()
    }

    pub fn upsert(&self, record: DocumentRecord) -> Result<()> {
        self.records.write().insert(record.name.clone(), record);
        self.persist()
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        self.records.write().remove(name);
        self.persist()
    }

    fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&*self.records.read())?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}
