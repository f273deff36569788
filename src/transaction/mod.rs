// src/transaction/mod.rs

//! Engine transactions
//!
//! A transaction wraps the single transaction slot of the native engine.
//! It holds a mutable borrow of the engine for its whole life, so a second
//! transaction cannot be opened while one is in flight.
//!
//! # Transaction Lifecycle
//!
//! ```text
//! CREATED -> PREPARED -> COMMITTED -> RELEASED
//!    |           |
//!    +-----------+-> FAILED ---------> RELEASED
//! ```
//!
//! Release happens exactly once: explicitly through [`Transaction::release`],
//! or on drop for every other exit path (early return, `?`, panic).

pub mod targets;

pub use targets::{TargetSet, find_sync_package, get_group_pkgs, resolve_targets};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::bridge::EngineHooks;
use crate::engine::{EngineError, Package, PackageEngine, TransFlags};
use crate::error::{Error, Result};

/// Transaction state machine phases
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionState {
    /// Initialized in the engine, targets may be added
    Created,
    /// Dependencies resolved, conflicts checked
    Prepared,
    /// Changes applied
    Committed,
    /// Prepare or commit failed
    Failed,
    /// Engine resources and lock freed
    Released,
}

impl TransactionState {
    /// Returns true once nothing else may be done with the transaction
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Released)
    }

    /// Returns true if the engine still holds resources for this transaction
    pub fn needs_release(&self) -> bool {
        !self.is_terminal()
    }
}

/// How far removal recurses into dependencies
///
/// Each level includes the previous one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recursion {
    #[default]
    None,
    /// Remove dependencies not required by other packages
    Recurse,
    /// Also remove dependencies that were explicitly installed
    RecurseAll,
}

impl Recursion {
    fn flags(self) -> TransFlags {
        match self {
            Self::None => TransFlags::empty(),
            Self::Recurse => TransFlags::RECURSE,
            Self::RecurseAll => TransFlags::RECURSE | TransFlags::RECURSE_ALL,
        }
    }
}

/// Install reason to force on the transaction's packages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallReason {
    /// Mark every package as a dependency
    Depend,
    /// Mark every package as explicitly installed
    Explicit,
}

/// Options frozen into a transaction at creation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionOptions {
    pub cascade: bool,
    pub no_deps: bool,
    pub force: bool,
    pub db_only: bool,
    pub download_only: bool,
    pub needed: bool,
    pub no_save: bool,
    pub unneeded: bool,
    pub recursion: Recursion,
    /// A single selector, so all-deps and all-explicit can never both be set
    pub reason: Option<InstallReason>,
}

impl TransactionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_needed(mut self, needed: bool) -> Self {
        self.needed = needed;
        self
    }

    pub fn with_download_only(mut self, download_only: bool) -> Self {
        self.download_only = download_only;
        self
    }

    pub fn with_recursion(mut self, recursion: Recursion) -> Self {
        self.recursion = recursion;
        self
    }

    pub fn with_reason(mut self, reason: InstallReason) -> Self {
        self.reason = Some(reason);
        self
    }

    /// Engine flag set for these options
    pub fn flags(&self) -> TransFlags {
        let mut flags = self.recursion.flags();
        flags.set(TransFlags::CASCADE, self.cascade);
        flags.set(TransFlags::NO_DEPS, self.no_deps);
        flags.set(TransFlags::FORCE, self.force);
        flags.set(TransFlags::DB_ONLY, self.db_only);
        flags.set(TransFlags::DOWNLOAD_ONLY, self.download_only);
        flags.set(TransFlags::NEEDED, self.needed);
        flags.set(TransFlags::NO_SAVE, self.no_save);
        flags.set(TransFlags::UNNEEDED, self.unneeded);
        match self.reason {
            Some(InstallReason::Depend) => flags |= TransFlags::ALL_DEPS,
            Some(InstallReason::Explicit) => flags |= TransFlags::ALL_EXPLICIT,
            None => {}
        }
        flags
    }
}

/// Represents an active engine transaction
pub struct Transaction<'e, E: PackageEngine> {
    engine: &'e mut E,
    state: TransactionState,
    flags: TransFlags,
}

impl<'e, E: PackageEngine> Transaction<'e, E> {
    /// Initialize a transaction in the engine
    pub fn begin(engine: &'e mut E, options: &TransactionOptions) -> Result<Self> {
        let flags = options.flags();
        engine.trans_init(flags)?;
        debug!("Transaction initialized with flags {:?}", flags);

        Ok(Self {
            engine,
            state: TransactionState::Created,
            flags,
        })
    }

    /// Get the current state
    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn flags(&self) -> TransFlags {
        self.flags
    }

    /// Look a package up in the sync databases, in configuration order
    pub fn sync_package(&self, name: &str) -> Option<Package> {
        find_sync_package(name, &self.engine.sync_dbs())
    }

    /// Add a target package
    pub fn add_pkg(&mut self, package: &Package) -> Result<()> {
        self.expect_state(TransactionState::Created)?;
        debug!("Adding package '{}' to transaction", package.name);
        self.engine.trans_add_pkg(package)?;
        Ok(())
    }

    /// Update one sync database while this transaction holds the engine
    pub fn update_db(
        &mut self,
        name: &str,
        force: bool,
        hooks: &mut dyn EngineHooks,
    ) -> Result<bool> {
        self.expect_state(TransactionState::Created)?;
        Ok(self.engine.update_db(name, force, hooks)?)
    }

    /// Resolve dependencies and check conflicts
    pub fn prepare(&mut self, hooks: &mut dyn EngineHooks) -> Result<()> {
        self.expect_state(TransactionState::Created)?;
        match self.engine.trans_prepare(hooks) {
            Ok(()) => {
                self.state = TransactionState::Prepared;
                Ok(())
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                Err(e.into())
            }
        }
    }

    /// Apply the prepared transaction
    pub fn commit(&mut self, hooks: &mut dyn EngineHooks) -> Result<()> {
        self.expect_state(TransactionState::Prepared)?;
        match self.engine.trans_commit(hooks) {
            Ok(()) => {
                self.state = TransactionState::Committed;
                Ok(())
            }
            Err(e) => {
                self.state = TransactionState::Failed;
                Err(e.into())
            }
        }
    }

    /// Release the transaction in the engine
    pub fn release(mut self) -> Result<()> {
        self.release_inner().map_err(Error::from)
    }

    fn release_inner(&mut self) -> std::result::Result<(), EngineError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.state = TransactionState::Released;
        self.engine.trans_release()
    }

    fn expect_state(&self, expected: TransactionState) -> Result<()> {
        if self.state != expected {
            return Err(Error::InvalidState {
                expected,
                actual: self.state,
            });
        }
        Ok(())
    }
}

impl<E: PackageEngine> Drop for Transaction<'_, E> {
    fn drop(&mut self) {
        if self.state.needs_release()
            && let Err(e) = self.release_inner()
        {
            warn!("Failed to release transaction on drop: {}", e);
        }
    }
}

/// Prepare and commit, releasing the transaction on every path
///
/// Engine failures are logged and reported as `false`; they never
/// propagate past this point.
pub fn finalize_transaction<E: PackageEngine>(
    mut transaction: Transaction<'_, E>,
    hooks: &mut dyn EngineHooks,
) -> bool {
    let outcome = transaction
        .prepare(hooks)
        .and_then(|()| transaction.commit(hooks));

    let all_ok = match outcome {
        Ok(()) => true,
        Err(e) => {
            error!("Can't finalize transaction: {}", e);
            false
        }
    };

    if let Err(e) = transaction.release() {
        warn!("Can't release transaction: {}", e);
    }

    all_ok
}
