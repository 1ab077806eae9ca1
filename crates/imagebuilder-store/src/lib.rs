//! Content store and storage layouts for ImageBuilder.
//!
//! This crate provides the storage layer: the `ImageStore` collaborator trait
//! with a directory-backed `FileImageStore` (atomic temp-file + rename
//! publication), key builders for the build, store, and digest layouts,
//! blake3 content checksums, `TypeRegistry` provisioning records with embedded
//! checksums, a `WriteAheadLog` that rolls back partial uploads, and
//! `verify_store_integrity`.

pub mod checksum;
pub mod deadline;
pub mod image_store;
pub mod integrity;
pub mod layout;
pub mod registry;
pub mod wal;

pub use checksum::{checksum_path, ChecksumError};
pub use deadline::Deadline;
pub use image_store::{validate_key, CopyMode, FileImageStore, ImageStore};
pub use integrity::{verify_store_integrity, IntegrityFailure, IntegrityReport};
pub use layout::{
    checksum_key, BuildLayout, DigestLayout, StoreLayout, CHECKSUM_SUFFIX, STORE_ROOT,
};
pub use registry::{
    validate_path_segment, validate_type_name, ApplicationTypeRecord, ProvisionedPackage,
    ProvisionedService, TypeRegistry,
};
pub use wal::{RollbackStep, WalOpKind, WriteAheadLog};

use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Fsync a directory to ensure that a preceding `rename()` is durable.
///
/// POSIX does not guarantee rename durability without it.
pub(crate) fn fsync_dir(dir: &Path) -> Result<(), std::io::Error> {
    let f = std::fs::File::open(dir)?;
    f.sync_all()
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store operation '{op}' on '{key}' timed out after {timeout:?}")]
    Timeout {
        op: &'static str,
        key: String,
        timeout: Duration,
    },
    #[error("store key not found: {0}")]
    NotFound(String),
    #[error("store key already exists: {0}")]
    AlreadyExists(String),
    #[error("invalid store key '{key}': {reason}")]
    InvalidKey { key: String, reason: String },
    #[error("integrity check failed for '{key}': expected {expected}, got {actual}")]
    IntegrityFailure {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("checksum error: {0}")]
    Checksum(#[from] ChecksumError),
    #[error("invalid name: {0}")]
    InvalidName(String),
    #[error("rollback of '{op_id}' left {failed} step(s) undone; journal entry kept")]
    RollbackIncomplete { op_id: String, failed: usize },
}
