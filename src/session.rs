// src/session.rs

//! Package session: the transaction manager
//!
//! A session owns the single engine handle of the process together with the
//! event emitter and download tracker that the callback bridge feeds. Every
//! operation runs one transaction at a time against that handle and reports
//! engine failures as results instead of errors.
//!
//! # Example
//!
//! ```ignore
//! use pactrans::config::PacmanConfig;
//! use pactrans::engine::MemoryEngine;
//! use pactrans::events::{EventEmitter, event_queue};
//! use pactrans::session::PacmanSession;
//! use pactrans::transaction::TransactionOptions;
//!
//! let config = PacmanConfig::load("/etc/pacman.conf".as_ref())?;
//! let (sender, receiver) = event_queue(256);
//! let mut session: PacmanSession<MemoryEngine> =
//!     PacmanSession::new(&config, EventEmitter::new(sender))?;
//!
//! session.refresh()?;
//! let report = session.install(&["base", "connman"], &["netctl"], &TransactionOptions::new())?;
//! ```

use serde::Serialize;
use std::path::Path;
use tracing::{debug, error, info, warn};

use crate::bridge::CallbackBridge;
use crate::config::PacmanConfig;
use crate::engine::PackageEngine;
use crate::error::{Error, Result};
use crate::events::EventEmitter;
use crate::progress::DownloadProgress;
use crate::transaction::{Transaction, TransactionOptions, finalize_transaction, resolve_targets};

/// Outcome of refreshing every sync database
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RefreshReport {
    /// Databases that were downloaded again
    pub updated: Vec<String>,
    /// Databases the engine reported as already current
    pub up_to_date: Vec<String>,
    /// Databases whose update failed
    pub failed: Vec<String>,
}

impl RefreshReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of an install request
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InstallReport {
    /// Resolved targets, in the order they were added
    pub targets: Vec<String>,
    /// True if the transaction was prepared and committed
    pub committed: bool,
}

/// Owner of the engine handle and the state its callbacks update
pub struct PacmanSession<E: PackageEngine> {
    handle: Option<E>,
    emitter: EventEmitter,
    progress: DownloadProgress,
}

impl<E: PackageEngine> PacmanSession<E> {
    /// Open the engine described by `config` and register its databases
    pub fn new(config: &PacmanConfig, emitter: EventEmitter) -> Result<Self> {
        let mut session = Self {
            handle: None,
            emitter,
            progress: DownloadProgress::new(),
        };
        session.initialize(config)?;
        Ok(session)
    }

    /// Open a session from a pacman.conf file
    pub fn from_conf_file(path: &Path, emitter: EventEmitter) -> Result<Self> {
        let config = PacmanConfig::load(path)?;
        Self::new(&config, emitter)
    }

    /// Wrap an engine that is already open and configured
    pub fn with_engine(engine: E, emitter: EventEmitter) -> Self {
        Self {
            handle: Some(engine),
            emitter,
            progress: DownloadProgress::new(),
        }
    }

    /// (Re)create the engine handle, releasing any previous one first
    pub fn initialize(&mut self, config: &PacmanConfig) -> Result<()> {
        self.release();

        let mut engine = E::open(&config.root_dir, &config.db_path)?;
        config.apply(&mut engine)?;
        info!(
            "Package engine ready (root {}, {} sync databases)",
            config.root_dir.display(),
            config.repos.len()
        );

        self.handle = Some(engine);
        Ok(())
    }

    /// Drop the engine handle; operations fail until the next `initialize`
    pub fn release(&mut self) {
        if self.handle.take().is_some() {
            debug!("Package engine handle released");
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.handle.is_some()
    }

    pub fn engine(&self) -> Option<&E> {
        self.handle.as_ref()
    }

    pub fn engine_mut(&mut self) -> Option<&mut E> {
        self.handle.as_mut()
    }

    pub fn emitter_mut(&mut self) -> &mut EventEmitter {
        &mut self.emitter
    }

    pub fn progress(&self) -> &DownloadProgress {
        &self.progress
    }

    /// Force-update every sync database, like `pacman -Syy`
    ///
    /// Each database gets its own zero-option transaction. A failed update
    /// is logged and recorded; the remaining databases are still updated.
    pub fn refresh(&mut self) -> Result<RefreshReport> {
        let Self {
            handle,
            emitter,
            progress,
        } = self;
        let engine = handle.as_mut().ok_or(Error::EngineNotInitialized)?;

        let names: Vec<String> = engine
            .sync_dbs()
            .iter()
            .map(|db| db.name().to_string())
            .collect();

        // Database downloads are labelled as such while no package size is known
        progress.set_total_download_size(0);

        let mut report = RefreshReport::default();
        for name in names {
            let mut hooks = CallbackBridge::new(emitter, progress);
            let outcome = Transaction::begin(engine, &TransactionOptions::new()).and_then(
                |mut transaction| {
                    let updated = transaction.update_db(&name, true, &mut hooks)?;
                    transaction.release()?;
                    Ok(updated)
                },
            );

            match outcome {
                Ok(true) => report.updated.push(name),
                Ok(false) => report.up_to_date.push(name),
                Err(e) => {
                    warn!("Can't update database '{}': {}", name, e);
                    report.failed.push(name);
                }
            }
        }

        info!(
            "Refreshed sync databases: {} updated, {} current, {} failed",
            report.updated.len(),
            report.up_to_date.len(),
            report.failed.len()
        );
        Ok(report)
    }

    /// Install packages and groups, like `pacman -S`
    ///
    /// Names are resolved as packages first, then as groups; anything in
    /// `conflicts` is left out. An empty request does nothing. A request
    /// that resolves to nothing fails with [`Error::NoTargets`]. Engine
    /// failures are logged and reported through
    /// [`InstallReport::committed`].
    pub fn install<N: AsRef<str>, C: AsRef<str>>(
        &mut self,
        names: &[N],
        conflicts: &[C],
        options: &TransactionOptions,
    ) -> Result<InstallReport> {
        let Self {
            handle,
            emitter,
            progress,
        } = self;
        let engine = handle.as_mut().ok_or(Error::EngineNotInitialized)?;

        debug!("Installing a list of packages like pacman -S");
        if names.is_empty() {
            return Ok(InstallReport::default());
        }

        let targets = resolve_targets(names, conflicts, &engine.sync_dbs());
        if targets.is_empty() {
            error!("No targets found");
            return Err(Error::NoTargets);
        }
        let targets = targets.into_names();

        progress.begin_batch(targets.len());

        let mut transaction = match Transaction::begin(engine, options) {
            Ok(transaction) => transaction,
            Err(e) => {
                error!("Can't initialize transaction: {}", e);
                return Ok(InstallReport {
                    targets,
                    committed: false,
                });
            }
        };

        for name in &targets {
            let Some(package) = transaction.sync_package(name) else {
                warn!("Package '{}' is no longer in the sync databases", name);
                continue;
            };
            if let Err(e) = transaction.add_pkg(&package) {
                error!("Can't add package '{}' to transaction: {}", name, e);
                return Ok(InstallReport {
                    targets,
                    committed: false,
                });
            }
        }

        debug!("Running and finalizing transaction");
        let mut hooks = CallbackBridge::new(emitter, progress);
        let committed = finalize_transaction(transaction, &mut hooks);

        Ok(InstallReport { targets, committed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::memory::{EngineCall, MemoryEngine};
    use crate::events::{Event, event_queue};

    const SCENARIO: &str = r#"
        [[repos]]
        name = "core"
        packages = [
            { name = "bash", version = "5.2-1", size = 2048 },
            { name = "netctl", version = "1.29-1", size = 1024 },
        ]
        groups = { base = ["bash", "netctl"] }

        [[repos]]
        name = "extra"
        packages = [
            { name = "connman", version = "1.42-1", size = 4096 },
        ]
    "#;

    fn session() -> PacmanSession<MemoryEngine> {
        let engine = MemoryEngine::from_toml(SCENARIO).unwrap();
        PacmanSession::with_engine(engine, EventEmitter::detached())
    }

    fn engine_of(session: &PacmanSession<MemoryEngine>) -> &MemoryEngine {
        session.engine().unwrap()
    }

    const NONE: &[&str] = &[];

    #[test]
    fn test_empty_request_is_a_no_op() {
        let mut session = session();
        let report = session.install(NONE, &["bash"], &TransactionOptions::new()).unwrap();

        assert_eq!(report, InstallReport::default());
        assert_eq!(engine_of(&session).init_count(), 0);
    }

    #[test]
    fn test_unknown_name_fails_without_transaction() {
        let mut session = session();
        let err = session
            .install(&["nonexistent-zzz"], NONE, &TransactionOptions::new())
            .unwrap_err();

        assert!(matches!(err, Error::NoTargets));
        assert_eq!(engine_of(&session).init_count(), 0);
        assert!(engine_of(&session).committed().is_empty());

        // The name that could not be found is what gets logged
        let targets = resolve_targets(&["nonexistent-zzz"], NONE, &engine_of(&session).sync_dbs());
        assert!(targets.is_empty());
        assert_eq!(targets.missing(), ["nonexistent-zzz".to_string()]);
    }

    #[test]
    fn test_duplicates_and_conflicts_collapse() {
        let mut session = session();
        let report = session
            .install(&["bash", "bash", "connman"], &["connman"], &TransactionOptions::new())
            .unwrap();

        assert_eq!(report.targets, vec!["bash".to_string()]);
        assert!(report.committed);
        assert_eq!(engine_of(&session).committed(), vec!["bash".to_string()]);
    }

    #[test]
    fn test_group_with_conflicting_member() {
        let mut session = session();
        let report = session
            .install(&["connman", "base"], &["netctl"], &TransactionOptions::new())
            .unwrap();

        assert_eq!(report.targets, vec!["connman".to_string(), "bash".to_string()]);
        assert_eq!(
            engine_of(&session).calls()[1..3],
            [
                EngineCall::Add("connman".to_string()),
                EngineCall::Add("bash".to_string())
            ]
        );
    }

    #[test]
    fn test_options_reach_the_engine() {
        let mut session = session();
        let options = TransactionOptions::new().with_needed(true);
        session.install(&["bash"], NONE, &options).unwrap();

        assert_eq!(engine_of(&session).calls()[0], EngineCall::Init(options.flags()));
    }

    #[test]
    fn test_commit_failure_is_reported_not_raised() {
        let mut engine = MemoryEngine::from_toml(SCENARIO).unwrap();
        engine.fail_commit("conflicting files");
        let mut session = PacmanSession::with_engine(engine, EventEmitter::detached());

        let report = session.install(&["bash"], NONE, &TransactionOptions::new()).unwrap();

        assert!(!report.committed);
        assert_eq!(engine_of(&session).release_count(), 1);
        assert!(!engine_of(&session).in_transaction());
    }

    #[test]
    fn test_init_failure_is_reported_not_raised() {
        let mut engine = MemoryEngine::from_toml(SCENARIO).unwrap();
        engine.fail_init("unable to lock database");
        let mut session = PacmanSession::with_engine(engine, EventEmitter::detached());

        let report = session.install(&["bash"], NONE, &TransactionOptions::new()).unwrap();
        assert!(!report.committed);
        assert_eq!(engine_of(&session).release_count(), 0);
    }

    #[test]
    fn test_download_counter_resets_per_install() {
        let mut session = session();
        session.install(&["bash", "netctl"], NONE, &TransactionOptions::new()).unwrap();
        assert_eq!(session.progress().packages_expected(), 2);
        assert_eq!(session.progress().packages_downloaded(), 2);

        session.install(&["connman"], NONE, &TransactionOptions::new()).unwrap();
        assert_eq!(session.progress().packages_expected(), 1);
        assert_eq!(session.progress().packages_downloaded(), 1);
    }

    #[test]
    fn test_refresh_continues_after_failure() {
        let mut engine = MemoryEngine::from_toml(SCENARIO).unwrap();
        engine.fail_update("core");
        let mut session = PacmanSession::with_engine(engine, EventEmitter::detached());

        let report = session.refresh().unwrap();

        assert!(!report.is_success());
        assert_eq!(report.failed, vec!["core".to_string()]);
        assert_eq!(report.updated, vec!["extra".to_string()]);
        // One transaction per database, each released
        assert_eq!(engine_of(&session).init_count(), 2);
        assert_eq!(engine_of(&session).release_count(), 2);
    }

    #[test]
    fn test_refresh_reports_database_downloads() {
        let (sender, receiver) = event_queue(64);
        let engine = MemoryEngine::from_toml(SCENARIO).unwrap();
        let mut session = PacmanSession::with_engine(engine, EventEmitter::new(sender));

        let report = session.refresh().unwrap();
        assert!(report.is_success());

        let infos: Vec<_> = receiver
            .drain()
            .into_iter()
            .filter_map(|event| match event {
                Event::Info(text) => Some(text),
                _ => None,
            })
            .collect();
        assert_eq!(infos, vec!["Updating core database", "Updating extra database"]);
    }

    #[test]
    fn test_operations_after_release() {
        let mut session = session();
        session.release();
        assert!(!session.is_initialized());

        assert!(matches!(session.refresh(), Err(Error::EngineNotInitialized)));
        assert!(matches!(
            session.install(NONE, NONE, &TransactionOptions::new()),
            Err(Error::EngineNotInitialized)
        ));
    }

    #[test]
    fn test_initialize_from_config() {
        let config = PacmanConfig::parse(
            "[core]\nServer = https://mirror.example.org/$repo/os/$arch\n[extra]\n",
            Path::new("pacman.conf"),
        )
        .unwrap();

        let mut session: PacmanSession<MemoryEngine> =
            PacmanSession::new(&config, EventEmitter::detached()).unwrap();
        assert_eq!(engine_of(&session).sync_dbs().len(), 2);

        session.initialize(&config).unwrap();
        assert_eq!(
            engine_of(&session).calls(),
            &[
                EngineCall::Register("core".to_string()),
                EngineCall::Register("extra".to_string())
            ]
        );
    }
}
