//! Cipher engine capability.
//!
//! Every document blob is run through a [`CipherEngine`] on its way to or
//! from disk, including "unprotected" documents, which use an empty
//! password. The engine mutates the referenced blob in place; callers hand
//! it a staging artifact, never the committed blob.
//!
//! Two implementations: [`XChaChaCipher`] (in-process, the default) and
//! [`ToolCipher`] (drives an external transform binary over a subprocess
//! boundary with a bounded timeout).

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use argon2::{Argon2, Params};
use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use zeroize::Zeroizing;

pub const KDF_TIME_COST: u32 = 3;
pub const KDF_MEMORY_COST: u32 = 65536; // 64MB
pub const KDF_PARALLELISM: u32 = 4;
pub const DERIVED_KEY_LEN: usize = 32;

pub const BLOB_MAGIC: &[u8] = b"LBOX01\0\0";
pub const BLOB_HEADER_SIZE: usize = 64;

/// Default subprocess timeout. A hung tool is reported as `Tool`, never
/// left pending.
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// Exit status the external tool uses to reject a decryption password.
/// Any other nonzero status is a tool malfunction.
pub const TOOL_EXIT_WRONG_PASSWORD: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherOp {
    Encrypt,
    Decrypt,
}

#[derive(Debug, thiserror::Error)]
pub enum CipherError {
    #[error("wrong password")]
    WrongPassword,
    #[error("{0}")]
    Tool(String),
}

/// Opaque transform capability over a byte blob.
#[async_trait]
pub trait CipherEngine: Send + Sync {
    /// Transform the file at `blob` in place. An empty `password` means
    /// "no passphrase" and is still a full transform.
    async fn transform(&self, blob: &Path, op: CipherOp, password: &str)
        -> Result<(), CipherError>;
}

// ── In-process engine ───────────────────────────────────────────────────────

/// Argon2id + XChaCha20-Poly1305 over the whole blob. Layout on disk:
/// magic (8) | salt (32) | nonce (24) | ciphertext. Fresh salt and nonce
/// on every encrypt.
#[derive(Debug, Default, Clone, Copy)]
pub struct XChaChaCipher;

impl XChaChaCipher {
    pub fn new() -> Self {
        Self
    }

    fn encrypt_bytes(plaintext: &[u8], password: &str) -> Result<Vec<u8>, CipherError> {
        let salt = generate_salt();
        let nonce = generate_nonce();
        let key = derive_key(password, &salt)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), plaintext)
            .map_err(|e| CipherError::Tool(format!("encrypt: {e}")))?;
        let mut out = vec![0u8; BLOB_HEADER_SIZE];
        out[..BLOB_MAGIC.len()].copy_from_slice(BLOB_MAGIC);
        out[8..40].copy_from_slice(&salt);
        out[40..64].copy_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt_bytes(blob: &[u8], password: &str) -> Result<Vec<u8>, CipherError> {
        if blob.len() < BLOB_HEADER_SIZE || &blob[..BLOB_MAGIC.len()] != BLOB_MAGIC {
            return Err(CipherError::Tool("not a lockbox blob".to_string()));
        }
        let salt: [u8; 32] = blob[8..40].try_into().expect("salt slice");
        let nonce: [u8; 24] = blob[40..64].try_into().expect("nonce slice");
        let key = derive_key(password, &salt)?;
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        // AEAD failure on a well-formed blob means the key is wrong.
        cipher
            .decrypt(XNonce::from_slice(&nonce), &blob[BLOB_HEADER_SIZE..])
            .map_err(|_| CipherError::WrongPassword)
    }
}

#[async_trait]
impl CipherEngine for XChaChaCipher {
    async fn transform(
        &self,
        blob: &Path,
        op: CipherOp,
        password: &str,
    ) -> Result<(), CipherError> {
        let data = tokio::fs::read(blob)
            .await
            .map_err(|e| CipherError::Tool(format!("read blob: {e}")))?;
        let out = match op {
            CipherOp::Encrypt => Self::encrypt_bytes(&data, password)?,
            CipherOp::Decrypt => Self::decrypt_bytes(&data, password)?,
        };
        tokio::fs::write(blob, &out)
            .await
            .map_err(|e| CipherError::Tool(format!("write blob: {e}")))?;
        Ok(())
    }
}

pub fn derive_key(password: &str, salt: &[u8]) -> Result<Zeroizing<Vec<u8>>, CipherError> {
    let params = Params::new(
        KDF_MEMORY_COST,
        KDF_TIME_COST,
        KDF_PARALLELISM,
        Some(DERIVED_KEY_LEN),
    )
    .map_err(|e| CipherError::Tool(format!("argon2 params: {e}")))?;
    let argon = Argon2::from(params);
    let mut key = Zeroizing::new(vec![0u8; DERIVED_KEY_LEN]);
    argon
        .hash_password_into(password.as_bytes(), salt, &mut key)
        .map_err(|e| CipherError::Tool(format!("argon2 derive: {e}")))?;
    Ok(key)
}

pub fn generate_nonce() -> [u8; 24] {
    let mut nonce = [0u8; 24];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn generate_salt() -> [u8; 32] {
    let mut salt = [0u8; 32];
    OsRng.fill_bytes(&mut salt);
    salt
}

// ── Subprocess engine ───────────────────────────────────────────────────────

/// Adapter for an external transform tool, invoked as
/// `tool <path> <encrypt|decrypt> [password]`, operating on the file in
/// place. Exit 0 is success, [`TOOL_EXIT_WRONG_PASSWORD`] is a rejected
/// password, anything else is a malfunction.
#[derive(Debug, Clone)]
pub struct ToolCipher {
    program: PathBuf,
    timeout: Duration,
}

impl ToolCipher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: TOOL_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl CipherEngine for ToolCipher {
    async fn transform(
        &self,
        blob: &Path,
        op: CipherOp,
        password: &str,
    ) -> Result<(), CipherError> {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.arg(blob).arg(match op {
            CipherOp::Encrypt => "encrypt",
            CipherOp::Decrypt => "decrypt",
        });
        if !password.is_empty() {
            cmd.arg(password);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| CipherError::Tool(format!("spawn {}: {e}", self.program.display())))?;

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(CipherError::Tool(format!("wait on tool: {e}"))),
            Err(_) => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Err(CipherError::Tool(format!(
                    "tool timed out after {:?}",
                    self.timeout
                )));
            }
        };

        match status.code() {
            Some(0) => Ok(()),
            Some(TOOL_EXIT_WRONG_PASSWORD) if op == CipherOp::Decrypt => {
                Err(CipherError::WrongPassword)
            }
            Some(code) => Err(CipherError::Tool(format!("tool exit status {code}"))),
            None => Err(CipherError::Tool("tool terminated by signal".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn roundtrip_with_password() {
        let dir = tempdir().unwrap();
        let blob = dir.path().join("doc.blob");
        tokio::fs::write(&blob, b"attack at dawn").await.unwrap();

        let engine = XChaChaCipher::new();
        engine
            .transform(&blob, CipherOp::Encrypt, "Secr3t!")
            .await
            .unwrap();
        let stored = tokio::fs::read(&blob).await.unwrap();
        assert_eq!(&stored[..BLOB_MAGIC.len()], BLOB_MAGIC);
        assert_ne!(stored, b"attack at dawn");

        engine
            .transform(&blob, CipherOp::Decrypt, "Secr3t!")
            .await
            .unwrap();
        assert_eq!(tokio::fs::read(&blob).await.unwrap(), b"attack at dawn");
    }

    #[tokio::test]
    async fn empty_password_still_transforms() {
        let dir = tempdir().unwrap();
        let blob = dir.path().join("doc.blob");
        tokio::fs::write(&blob, b"plain").await.unwrap();

        let engine = XChaChaCipher::new();
        engine.transform(&blob, CipherOp::Encrypt, "").await.unwrap();
        assert_ne!(tokio::fs::read(&blob).await.unwrap(), b"plain");
        engine.transform(&blob, CipherOp::Decrypt, "").await.unwrap();
        assert_eq!(tokio::fs::read(&blob).await.unwrap(), b"plain");
    }

    #[tokio::test]
    async fn wrong_password_is_classified() {
        let dir = tempdir().unwrap();
        let blob = dir.path().join("doc.blob");
        tokio::fs::write(&blob, b"secret").await.unwrap();

        let engine = XChaChaCipher::new();
        engine
            .transform(&blob, CipherOp::Encrypt, "right")
            .await
            .unwrap();
        let err = engine
            .transform(&blob, CipherOp::Decrypt, "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::WrongPassword));
    }

    #[tokio::test]
    async fn malformed_blob_is_tool_error() {
        let dir = tempdir().unwrap();
        let blob = dir.path().join("doc.blob");
        tokio::fs::write(&blob, b"too short").await.unwrap();

        let err = XChaChaCipher::new()
            .transform(&blob, CipherOp::Decrypt, "")
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::Tool(_)));
    }

    #[cfg(unix)]
    fn write_stub_tool(dir: &Path, name: &str, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{script}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tool_exit_codes_map_to_failure_classes() {
        let dir = tempdir().unwrap();
        let blob = dir.path().join("doc.blob");
        std::fs::write(&blob, b"x").unwrap();

        let ok = write_stub_tool(dir.path(), "ok.sh", "exit 0");
        ToolCipher::new(&ok)
            .transform(&blob, CipherOp::Encrypt, "pw")
            .await
            .unwrap();

        let reject = write_stub_tool(dir.path(), "reject.sh", "exit 3");
        let err = ToolCipher::new(&reject)
            .transform(&blob, CipherOp::Decrypt, "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::WrongPassword));

        // Exit 3 on encrypt is not a password rejection.
        let err = ToolCipher::new(&reject)
            .transform(&blob, CipherOp::Encrypt, "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::Tool(_)));

        let broken = write_stub_tool(dir.path(), "broken.sh", "exit 1");
        let err = ToolCipher::new(&broken)
            .transform(&blob, CipherOp::Decrypt, "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::Tool(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn tool_timeout_is_bounded() {
        let dir = tempdir().unwrap();
        let blob = dir.path().join("doc.blob");
        std::fs::write(&blob, b"x").unwrap();

        let hang = write_stub_tool(dir.path(), "hang.sh", "sleep 30");
        let err = ToolCipher::new(&hang)
            .with_timeout(Duration::from_millis(100))
            .transform(&blob, CipherOp::Encrypt, "")
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::Tool(msg) if msg.contains("timed out")));
    }
}
