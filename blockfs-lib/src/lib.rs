//! Core vocabulary for the blockfs client stack.
//!
//! This crate defines what every store backend and every client layer must
//! agree on: the error type, the path key, file status snapshots, block
//! addressing arithmetic, and the asynchronous `RemoteStoreClient` trait.

mod block;
mod client;
mod mem_store;
mod path;
mod status;

pub use block::*;
pub use client::*;
pub use mem_store::*;
pub use path::*;
pub use status::*;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BfsError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("not a file: {0}")]
    NotFile(String),
    #[error("not a directory: {0}")]
    NotDirectory(String),
    #[error("I/O error: {0}")]
    IoError(String),
    #[error("remote store error: {0}")]
    RemoteError(String),
    #[error("invalid data: {0}")]
    InvalidData(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl BfsError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BfsError::NotFound(_))
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, BfsError::PermissionDenied(_))
    }
}

pub type BfsResult<T> = std::result::Result<T, BfsError>;

impl From<std::io::Error> for BfsError {
    fn from(err: std::io::Error) -> Self {
        BfsError::IoError(err.to_string())
    }
}

/// Block size handed to newly created files when the caller does not pick one.
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_predicates_and_io_mapping() {
        assert!(BfsError::NotFound("x".to_string()).is_not_found());
        assert!(!BfsError::InvalidParam("x".to_string()).is_not_found());
        assert!(BfsError::PermissionDenied("x".to_string()).is_permission_denied());

        let err: BfsError = std::io::Error::new(std::io::ErrorKind::Other, "boom").into();
        assert!(matches!(err, BfsError::IoError(_)));
    }
}
