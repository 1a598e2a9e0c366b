use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::cipher::{CipherEngine, ToolCipher, XChaChaCipher, TOOL_TIMEOUT};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CipherBackend {
    /// In-process engine (the default).
    InProcess,
    /// External transform tool, driven over a subprocess boundary.
    External { program: PathBuf },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store root; `None` means the platform data directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default = "default_cipher")]
    pub cipher: CipherBackend,
    #[serde(default = "default_tool_timeout_secs")]
    pub tool_timeout_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            cipher: default_cipher(),
            tool_timeout_secs: default_tool_timeout_secs(),
        }
    }
}

impl StoreConfig {
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn engine(&self) -> Arc<dyn CipherEngine> {
        match &self.cipher {
            CipherBackend::InProcess => Arc::new(XChaChaCipher::new()),
            CipherBackend::External { program } => Arc::new(
                ToolCipher::new(program)
                    .with_timeout(Duration::from_secs(self.tool_timeout_secs)),
            ),
        }
    }
}

fn default_cipher() -> CipherBackend {
    CipherBackend::InProcess
}

fn default_tool_timeout_secs() -> u64 {
    TOOL_TIMEOUT.as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempdir().unwrap();
        let config = StoreConfig::load_or_default(dir.path().join("config.json")).unwrap();
        assert!(matches!(config.cipher, CipherBackend::InProcess));
        assert_eq!(config.tool_timeout_secs, 30);
    }

    #[test]
    fn external_backend_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{ "cipher": { "kind": "external", "program": "/usr/bin/cryption" }, "tool_timeout_secs": 5 }"#,
        )
        .unwrap();
        let config = StoreConfig::load_or_default(&path).unwrap();
        match &config.cipher {
            CipherBackend::External { program } => {
                assert_eq!(program, &PathBuf::from("/usr/bin/cryption"));
            }
            other => panic!("unexpected backend: {other:?}"),
        }
        assert_eq!(config.tool_timeout_secs, 5);
    }
}
