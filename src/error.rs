//! Error handling module for the archive target runtime
//!
//! Each component owns a typed error (`ConfigError`, `TemplateError`,
//! `ProbeError`, `TransferError`). `ArchiveError` wraps them so callers that
//! drive a whole probe-then-transfer cycle can use a single `Result`.

use thiserror::Error;

use crate::disk_space::ProbeError;
use crate::env_schema::ConfigError;
use crate::template::TemplateError;
use crate::transfer::TransferError;

/// Main error type for the archive target runtime
#[derive(Error, Debug)]
pub enum ArchiveError {
    /// Target definition or environment resolution errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Placeholder substitution errors
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),

    /// Disk space probe failures
    #[error("Probe error: {0}")]
    Probe(#[from] ProbeError),

    /// Transfer failures
    #[error("Transfer error: {0}")]
    Transfer(#[from] TransferError),

    /// IO errors (definition files, process table)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors (definitions, operator configuration)
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type alias for archive target operations
pub type Result<T> = std::result::Result<T, ArchiveError>;

impl ArchiveError {
    /// Whether the error was raised before any process was spawned.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ArchiveError::Config(_) | ArchiveError::Template(_) | ArchiveError::Yaml(_)
        )
    }
}
