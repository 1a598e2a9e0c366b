use crate::cipher::CipherError;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Failure taxonomy for every public store operation.
///
/// Expected failures are values, never panics. `Io` and `Index` cover the
/// durable-state plumbing underneath the operation that raised them.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("access denied: not the owner of {0}")]
    AccessDenied(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("document already exists: {0}")]
    AlreadyExists(String),
    #[error("document already protected: {0}")]
    AlreadyProtected(String),
    #[error("document is password protected: {0}")]
    PasswordRequired(String),
    #[error("wrong password")]
    WrongPassword,
    #[error("cipher tool failure: {0}")]
    Tool(String),
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("index corrupt: {0}")]
    Index(#[from] serde_json::Error),
}

impl From<CipherError> for StoreError {
    fn from(err: CipherError) -> Self {
        match err {
            CipherError::WrongPassword => StoreError::WrongPassword,
            CipherError::Tool(msg) => StoreError::Tool(msg),
        }
    }
}
