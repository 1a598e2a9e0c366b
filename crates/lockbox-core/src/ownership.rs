//! Ownership index: user → owned document names.
//!
//! Document names are unique system-wide, so a name appears under exactly
//! one user. Same whole-file JSON persistence as the metadata store.

use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::Result;

pub struct OwnershipIndex {
    path: PathBuf,
    owners: RwLock<HashMap<String, BTreeSet<String>>>,
}

impl OwnershipIndex {
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let owners = if path.exists() {
            serde_json::from_str(&fs::read_to_string(&path)?)?
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            owners: RwLock::new(owners),
        })
    }

    pub fn assign(&self, user: &str, name: &str) -> Result<()> {
        self.owners
            .write()
            .entry(user.to_string())
            .or_default()
            .insert(name.to_string());
        self.persist()
    }

    pub fn revoke(&self, user: &str, name: &str) -> Result<()> {
        let mut owners = self.owners.write();
        if let Some(names) = owners.get_mut(user) {
            names.remove(name);
            if names.is_empty() {
                owners.remove(user);
            }
        }
        drop(owners);
        self.persist()
    }

    pub fn list_for(&self, user: &str) -> Vec<String> {
        self.owners
            .read()
            .get(user)
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn owner_of(&self, name: &str) -> Option<String> {
        self.owners
            .read()
            .iter()
            .find(|(_, names)| names.contains(name))
            .map(|(user, _)| user.clone())
    }

    fn persist(&self) -> Result<()> {
        let json = serde_json::to_string_pretty(&*self.owners.read())?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}
