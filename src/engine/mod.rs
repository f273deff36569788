// src/engine/mod.rs

//! Native package engine capability
//!
//! The database, dependency resolver and downloader live in the native
//! library (libalpm). This module only describes what the transaction
//! manager needs from it:
//!
//! - handle construction from a root directory and database path
//! - ordered sync database enumeration with package and group lookup
//! - a single transaction slot (`trans_init` .. `trans_release`)
//! - hook invocation during `update_db`, `trans_prepare` and `trans_commit`
//!
//! Hooks are not stored on the handle. Every call that can fire them takes
//! the hook sink as `&mut dyn EngineHooks`, which keeps the mutable progress
//! and dedup state owned by the caller.

pub mod memory;

pub use memory::MemoryEngine;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

use crate::bridge::EngineHooks;

/// A package as seen in a sync database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
    /// Name of the sync database the package was found in
    pub repository: String,
}

impl Package {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        repository: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            repository: repository.into(),
        }
    }
}

/// Errors reported by the native engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("failed to initialize handle: {0}")]
    Handle(String),

    #[error("failed to register database '{name}': {reason}")]
    Register { name: String, reason: String },

    #[error("failed to update database '{name}': {reason}")]
    DbUpdate { name: String, reason: String },

    #[error("failed to init transaction: {0}")]
    TransInit(String),

    #[error("no transaction initialized")]
    NoTransaction,

    #[error("failed to add target '{name}': {reason}")]
    AddTarget { name: String, reason: String },

    #[error("failed to prepare transaction: {0}")]
    Prepare(String),

    #[error("failed to commit transaction: {0}")]
    Commit(String),

    #[error("failed to release transaction: {0}")]
    Release(String),
}

bitflags! {
    /// Transaction flags, using libalpm bit positions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TransFlags: u32 {
        const NO_DEPS = 1;
        const FORCE = 1 << 1;
        const NO_SAVE = 1 << 2;
        const CASCADE = 1 << 4;
        const RECURSE = 1 << 5;
        const DB_ONLY = 1 << 6;
        const ALL_DEPS = 1 << 8;
        const DOWNLOAD_ONLY = 1 << 9;
        const NEEDED = 1 << 13;
        const ALL_EXPLICIT = 1 << 14;
        const UNNEEDED = 1 << 15;
        const RECURSE_ALL = 1 << 16;
    }
}

/// A sync database
pub trait SyncDb {
    /// Database (repository) name
    fn name(&self) -> &str;

    /// Exact package lookup
    fn package(&self, name: &str) -> Option<Package>;

    /// Member packages of a group, or `None` if this database has no such group
    fn group(&self, name: &str) -> Option<Vec<Package>>;
}

/// Operations the transaction manager drives on the native engine
///
/// At most one transaction may be initialized at a time. Implementations
/// report a second `trans_init` before `trans_release` as
/// [`EngineError::TransInit`].
pub trait PackageEngine {
    /// Create a handle for the given root directory and database path
    fn open(root: &Path, db_path: &Path) -> Result<Self, EngineError>
    where
        Self: Sized;

    /// Register a sync database with its mirror list
    fn register_syncdb(&mut self, name: &str, servers: &[String]) -> Result<(), EngineError>;

    /// Registered sync databases, in configuration order
    fn sync_dbs(&self) -> Vec<&dyn SyncDb>;

    /// Update one sync database from its mirrors
    ///
    /// Returns `true` if the database was downloaded, `false` if it was
    /// already current.
    fn update_db(
        &mut self,
        name: &str,
        force: bool,
        hooks: &mut dyn EngineHooks,
    ) -> Result<bool, EngineError>;

    fn trans_init(&mut self, flags: TransFlags) -> Result<(), EngineError>;

    fn trans_add_pkg(&mut self, package: &Package) -> Result<(), EngineError>;

    fn trans_prepare(&mut self, hooks: &mut dyn EngineHooks) -> Result<(), EngineError>;

    fn trans_commit(&mut self, hooks: &mut dyn EngineHooks) -> Result<(), EngineError>;

    fn trans_release(&mut self) -> Result<(), EngineError>;
}
