use thiserror::Error;

/// The closed error taxonomy surfaced by every public operation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no such view: {0}")]
    UnknownViewname(String),

    #[error("incompatible type for '{name}': existing type '{existing}', new type '{new}'")]
    IncompatibleType {
        name: String,
        existing: String,
        new: String,
    },

    #[error("invalid STIX pattern: {0}")]
    InvalidPattern(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("invalid object path attribute: {0}")]
    InvalidAttr(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::StorageError(e.to_string())
    }
}

impl From<postgres::Error> for StoreError {
    fn from(e: postgres::Error) -> Self {
        StoreError::StorageError(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::InvalidAttr(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
