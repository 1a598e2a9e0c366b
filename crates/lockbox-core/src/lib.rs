//! Lockbox: a per-user encrypted document store.
//!
//! Documents are kept ciphertext-at-rest (unprotected documents are
//! transformed with an empty password) and may be individually password
//! protected. All content transforms run through a disposable staging
//! area so a crash or tool failure never leaves a document partially
//! transformed, and a write-ahead intent journal keeps the metadata and
//! ownership indexes agreeing with stored content across crashes.

pub mod cipher;
pub mod config;
pub mod error;
pub mod metadata;
pub mod ownership;
pub mod paths;
pub mod staging;
pub mod store;

pub use cipher::{CipherEngine, CipherError, CipherOp, ToolCipher, XChaChaCipher};
pub use config::{CipherBackend, StoreConfig};
pub use error::{Result, StoreError};
pub use metadata::DocumentRecord;
pub use store::DocumentStore;
