//! Core build engine for ImageBuilder.
//!
//! This crate ties together manifest parsing, parameter resolution, validation,
//! composition, and store provisioning into the `ImageBuilder` engine: the
//! central API for building application types, building and upgrading
//! application instances, and inspecting what has been provisioned. It also
//! provides per-key build locking and the provisioning state machine.

pub mod concurrency;
pub mod config;
pub mod digest;
pub mod engine;
pub mod lifecycle;
pub mod params;
pub mod provision;
pub mod validate;

#[cfg(test)]
pub(crate) mod testutil;

pub use concurrency::{KeyLock, StoreLock};
pub use config::EngineConfig;
pub use digest::{Composer, ServiceSource};
pub use engine::{
    ApplicationBuildResult, ApplicationTypeInfo, ImageBuilder, TypeBuildResult,
};
pub use lifecycle::{validate_transition, ProvisionState, Provisioning};
pub use params::{Parameterize, ParameterTable, Resolver, DEBUG_PARAMETER};
pub use provision::{Conflict, ConflictErrors, ConflictRule, ProvisionPlan, StoreSnapshot};
pub use validate::{Rule, ValidationErrors, Violation, Violations};

use thiserror::Error;

/// Coarse classification of a [`CoreError`], used for exit codes and reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    Timeout,
    NotFound,
    Schema,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Validation => write!(f, "validation"),
            ErrorKind::Conflict => write!(f, "conflict"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::NotFound => write!(f, "not-found"),
            ErrorKind::Schema => write!(f, "schema"),
            ErrorKind::Internal => write!(f, "internal"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("manifest error: {0}")]
    Manifest(#[from] imagebuilder_schema::ManifestError),
    #[error("store error: {0}")]
    Store(#[from] imagebuilder_store::StoreError),
    #[error(transparent)]
    Validation(#[from] ValidationErrors),
    #[error(transparent)]
    Conflict(#[from] ConflictErrors),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn kind(&self) -> ErrorKind {
        use imagebuilder_store::StoreError;
        match self {
            CoreError::Validation(_) => ErrorKind::Validation,
            CoreError::Conflict(_) => ErrorKind::Conflict,
            CoreError::Manifest(_) => ErrorKind::Schema,
            CoreError::NotFound(_) | CoreError::Store(StoreError::NotFound(_)) => {
                ErrorKind::NotFound
            }
            CoreError::Store(StoreError::Timeout { .. }) => ErrorKind::Timeout,
            CoreError::Store(_)
            | CoreError::InvalidTransition { .. }
            | CoreError::InvalidArgument(_)
            | CoreError::Config(_)
            | CoreError::Io(_)
            | CoreError::Serialization(_) => ErrorKind::Internal,
        }
    }
}
