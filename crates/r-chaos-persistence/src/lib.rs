//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Persistence abstractions and storage bindings."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Storage for terminal experiment records.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing record files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Reported when a stored record fails integrity verification.
    #[error("record hash mismatch for {0}")]
    HashMismatch(String),
    /// Identifier cannot be mapped onto a file name.
    #[error("invalid record identifier '{0}'")]
    InvalidId(String),
    /// No record stored under the identifier.
    #[error("record '{0}' not found")]
    NotFound(String),
}

pub mod store;

pub use store::{ExperimentStore, FileExperimentStore, MemoryExperimentStore, RECORD_VERSION};
