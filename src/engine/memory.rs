// src/engine/memory.rs

//! In-memory package engine
//!
//! Drives the transaction manager without libalpm or root privileges: for
//! frontend development against a realistic event stream, and for tests.
//! A scenario describes the sync databases, optional scripted hook calls
//! per phase, and failures to inject:
//!
//! ```toml
//! [[repos]]
//! name = "core"
//! db_size = 131072
//! packages = [{ name = "bash", version = "5.2.026-2", size = 1894400 }]
//! groups = { base = ["bash"] }
//!
//! [failures]
//! commit = "failed to commit transaction (conflicting files)"
//!
//! [script]
//! prepare = [{ hook = "event", phase = "check_deps_start" }]
//! ```
//!
//! Phases without a script get a synthesized sequence that mirrors what
//! libalpm reports for a sync install. Every engine call is journaled.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::debug;

use super::{EngineError, Package, PackageEngine, SyncDb, TransFlags};
use crate::bridge::{EngineHooks, EventPhase, LogLevel, Question};

const DEFAULT_PACKAGE_SIZE: u64 = 1024 * 1024;

fn default_package_size() -> u64 {
    DEFAULT_PACKAGE_SIZE
}

/// A package entry in a scenario repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPackage {
    pub name: String,
    pub version: String,
    /// Archive size used for synthesized downloads
    #[serde(default = "default_package_size")]
    pub size: u64,
}

/// A sync database in a scenario
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRepo {
    pub name: String,
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default)]
    pub packages: Vec<MemoryPackage>,
    /// Group name -> member package names (members must be in this repo)
    #[serde(default)]
    pub groups: BTreeMap<String, Vec<String>>,
    /// Database file size for synthesized refresh downloads (0 = unknown)
    #[serde(default)]
    pub db_size: u64,
    /// Refresh reports the database as already current
    #[serde(default)]
    pub up_to_date: bool,
}

impl MemoryRepo {
    fn to_package(&self, entry: &MemoryPackage) -> Package {
        Package::new(&entry.name, &entry.version, &self.name)
    }

    fn entry(&self, name: &str) -> Option<&MemoryPackage> {
        self.packages.iter().find(|p| p.name == name)
    }
}

impl SyncDb for MemoryRepo {
    fn name(&self) -> &str {
        &self.name
    }

    fn package(&self, name: &str) -> Option<Package> {
        self.entry(name).map(|entry| self.to_package(entry))
    }

    fn group(&self, name: &str) -> Option<Vec<Package>> {
        let members = self.groups.get(name)?;
        Some(
            members
                .iter()
                .filter_map(|member| self.entry(member))
                .map(|entry| self.to_package(entry))
                .collect(),
        )
    }
}

/// One scripted hook invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum HookCall {
    Log { level: LogLevel, message: String },
    TotalDownload { bytes: u64 },
    Event { phase: EventPhase },
    Question { question: Question },
    Progress {
        #[serde(default)]
        target: Option<String>,
        #[serde(default)]
        percent: u32,
        total: usize,
        current: usize,
    },
    Download {
        filename: String,
        transferred: u64,
        total: u64,
    },
    /// Log line with the engine's numeric severity mask
    RawLog { mask: u32, message: String },
    /// Event with the engine's numeric phase id
    RawEvent { id: u32 },
}

impl HookCall {
    /// Invoke the matching hook
    pub fn dispatch(&self, hooks: &mut dyn EngineHooks) {
        match self {
            Self::Log { level, message } => hooks.on_log(*level, message),
            Self::TotalDownload { bytes } => hooks.on_total_download(*bytes),
            Self::Event { phase } => hooks.on_event(*phase),
            Self::Question { question } => {
                let answer = hooks.on_question(question);
                debug!("Question answered with {:?}", answer);
            }
            Self::Progress {
                target,
                percent,
                total,
                current,
            } => hooks.on_progress(target.as_deref(), *percent, *total, *current),
            Self::Download {
                filename,
                transferred,
                total,
            } => hooks.on_download(filename, *transferred, *total),
            Self::RawLog { mask, message } => match LogLevel::from_mask(*mask) {
                Some(level) => hooks.on_log(level, message),
                None => debug!("Dropping log line with unknown severity mask {:#x}", mask),
            },
            Self::RawEvent { id } => match EventPhase::try_from(*id) {
                Ok(phase) => hooks.on_event(phase),
                Err(id) => debug!("Ignoring unknown event id {}", id),
            },
        }
    }
}

/// Scripted hook calls per engine phase; `None` means synthesize
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HookScript {
    /// Replayed for every database update
    #[serde(default)]
    pub refresh: Option<Vec<HookCall>>,
    #[serde(default)]
    pub prepare: Option<Vec<HookCall>>,
    #[serde(default)]
    pub commit: Option<Vec<HookCall>>,
}

/// Failures to inject, as engine error messages
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailurePlan {
    #[serde(default)]
    pub init: Option<String>,
    #[serde(default)]
    pub prepare: Option<String>,
    #[serde(default)]
    pub commit: Option<String>,
    #[serde(default)]
    pub release: Option<String>,
    /// Databases whose update fails
    #[serde(default)]
    pub update: Vec<String>,
}

/// Journal entry for one engine call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Register(String),
    Update { name: String, force: bool },
    Init(TransFlags),
    Add(String),
    Prepare,
    Commit,
    Release,
}

#[derive(Debug, Clone, Default)]
struct ActiveTransaction {
    flags: TransFlags,
    targets: Vec<Package>,
    prepared: bool,
}

/// Scenario-driven engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryEngine {
    #[serde(default)]
    pub repos: Vec<MemoryRepo>,
    #[serde(default)]
    pub script: HookScript,
    #[serde(default)]
    pub failures: FailurePlan,
    #[serde(skip)]
    calls: Vec<EngineCall>,
    #[serde(skip)]
    active: Option<ActiveTransaction>,
    #[serde(skip)]
    committed: Vec<String>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a TOML scenario
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load a TOML scenario from disk
    pub fn load(path: &Path) -> crate::Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(Self::from_toml(&content)?)
    }

    pub fn fail_init(&mut self, reason: impl Into<String>) {
        self.failures.init = Some(reason.into());
    }

    pub fn fail_prepare(&mut self, reason: impl Into<String>) {
        self.failures.prepare = Some(reason.into());
    }

    pub fn fail_commit(&mut self, reason: impl Into<String>) {
        self.failures.commit = Some(reason.into());
    }

    pub fn fail_update(&mut self, db: impl Into<String>) {
        self.failures.update.push(db.into());
    }

    /// Every engine call so far, in order
    pub fn calls(&self) -> &[EngineCall] {
        &self.calls
    }

    pub fn release_count(&self) -> usize {
        self.count(|call| matches!(call, EngineCall::Release))
    }

    pub fn init_count(&self) -> usize {
        self.count(|call| matches!(call, EngineCall::Init(_)))
    }

    /// Names of every package applied by a successful commit
    pub fn committed(&self) -> Vec<String> {
        self.committed.clone()
    }

    /// True while a transaction is initialized
    pub fn in_transaction(&self) -> bool {
        self.active.is_some()
    }

    fn count(&self, predicate: impl Fn(&EngineCall) -> bool) -> usize {
        self.calls.iter().filter(|&call| predicate(call)).count()
    }

    fn repo(&self, name: &str) -> Option<&MemoryRepo> {
        self.repos.iter().find(|repo| repo.name == name)
    }

    fn active_mut(&mut self) -> Result<&mut ActiveTransaction, EngineError> {
        self.active.as_mut().ok_or(EngineError::NoTransaction)
    }

    fn replay(calls: &[HookCall], hooks: &mut dyn EngineHooks) {
        for call in calls {
            call.dispatch(hooks);
        }
    }

    fn synthesize_refresh(repo: &MemoryRepo, hooks: &mut dyn EngineHooks) {
        let filename = format!("{}.db", repo.name);
        if repo.db_size > 0 {
            let size = repo.db_size;
            for transferred in [0, size / 2, size] {
                hooks.on_download(&filename, transferred, size);
            }
        } else {
            for transferred in [0, 16 * 1024, 64 * 1024] {
                hooks.on_download(&filename, transferred, 0);
            }
        }
    }

    fn synthesize_prepare(hooks: &mut dyn EngineHooks) {
        for phase in [
            EventPhase::CheckDepsStart,
            EventPhase::ResolveDepsStart,
            EventPhase::ResolveDepsDone,
            EventPhase::InterConflictsStart,
            EventPhase::InterConflictsDone,
            EventPhase::CheckDepsDone,
        ] {
            hooks.on_event(phase);
        }
    }

    fn synthesize_commit(&self, active: &ActiveTransaction, hooks: &mut dyn EngineHooks) {
        let entries: Vec<(&Package, u64)> = active
            .targets
            .iter()
            .map(|package| {
                let size = self
                    .repo(&package.repository)
                    .and_then(|repo| repo.entry(&package.name))
                    .map_or(DEFAULT_PACKAGE_SIZE, |entry| entry.size);
                (package, size)
            })
            .collect();
        let total: u64 = entries.iter().map(|(_, size)| size).sum();
        let count = entries.len();

        hooks.on_total_download(total);
        hooks.on_event(EventPhase::RetrieveStart);
        for (package, size) in &entries {
            let filename = format!("{}-{}-x86_64.pkg.tar.zst", package.name, package.version);
            for transferred in [0, size / 2, *size] {
                hooks.on_download(&filename, transferred, *size);
            }
        }

        hooks.on_event(EventPhase::IntegrityStart);
        hooks.on_progress(None, 100, count, count);
        hooks.on_event(EventPhase::IntegrityDone);
        hooks.on_event(EventPhase::LoadStart);
        hooks.on_event(EventPhase::LoadDone);
        hooks.on_event(EventPhase::FileConflictsStart);
        hooks.on_event(EventPhase::FileConflictsDone);

        if active.flags.contains(TransFlags::DOWNLOAD_ONLY) {
            return;
        }

        hooks.on_event(EventPhase::AddStart);
        for (index, (package, _)) in entries.iter().enumerate() {
            hooks.on_progress(Some(package.name.as_str()), 100, count, index + 1);
        }
        hooks.on_event(EventPhase::AddDone);
    }
}

impl PackageEngine for MemoryEngine {
    fn open(root: &Path, db_path: &Path) -> Result<Self, EngineError> {
        debug!(
            "Opening in-memory engine (root {}, dbpath {})",
            root.display(),
            db_path.display()
        );
        Ok(Self::new())
    }

    fn register_syncdb(&mut self, name: &str, servers: &[String]) -> Result<(), EngineError> {
        self.calls.push(EngineCall::Register(name.to_string()));
        match self.repos.iter_mut().find(|repo| repo.name == name) {
            Some(repo) => repo.servers = servers.to_vec(),
            None => self.repos.push(MemoryRepo {
                name: name.to_string(),
                servers: servers.to_vec(),
                ..Default::default()
            }),
        }
        Ok(())
    }

    fn sync_dbs(&self) -> Vec<&dyn SyncDb> {
        self.repos.iter().map(|repo| repo as &dyn SyncDb).collect()
    }

    fn update_db(
        &mut self,
        name: &str,
        force: bool,
        hooks: &mut dyn EngineHooks,
    ) -> Result<bool, EngineError> {
        self.calls.push(EngineCall::Update {
            name: name.to_string(),
            force,
        });

        let repo = self.repo(name).ok_or_else(|| EngineError::DbUpdate {
            name: name.to_string(),
            reason: "database not registered".to_string(),
        })?;

        if self.failures.update.iter().any(|failing| failing == name) {
            return Err(EngineError::DbUpdate {
                name: name.to_string(),
                reason: "failed retrieving file from all mirrors".to_string(),
            });
        }

        if repo.up_to_date && !force {
            return Ok(false);
        }

        match &self.script.refresh {
            Some(calls) => Self::replay(calls, hooks),
            None => Self::synthesize_refresh(repo, hooks),
        }
        Ok(true)
    }

    fn trans_init(&mut self, flags: TransFlags) -> Result<(), EngineError> {
        self.calls.push(EngineCall::Init(flags));
        if self.active.is_some() {
            return Err(EngineError::TransInit(
                "transaction already initialized".to_string(),
            ));
        }
        if let Some(reason) = &self.failures.init {
            return Err(EngineError::TransInit(reason.clone()));
        }
        self.active = Some(ActiveTransaction {
            flags,
            ..Default::default()
        });
        Ok(())
    }

    fn trans_add_pkg(&mut self, package: &Package) -> Result<(), EngineError> {
        self.calls.push(EngineCall::Add(package.name.clone()));
        let known = self
            .repo(&package.repository)
            .is_some_and(|repo| repo.entry(&package.name).is_some());
        let active = self.active_mut()?;
        if !known {
            return Err(EngineError::AddTarget {
                name: package.name.clone(),
                reason: "target not found".to_string(),
            });
        }
        if !active.targets.iter().any(|p| p.name == package.name) {
            active.targets.push(package.clone());
        }
        Ok(())
    }

    fn trans_prepare(&mut self, hooks: &mut dyn EngineHooks) -> Result<(), EngineError> {
        self.calls.push(EngineCall::Prepare);
        self.active_mut()?;

        match &self.script.prepare {
            Some(calls) => Self::replay(calls, hooks),
            None => Self::synthesize_prepare(hooks),
        }

        if let Some(reason) = &self.failures.prepare {
            return Err(EngineError::Prepare(reason.clone()));
        }
        self.active_mut()?.prepared = true;
        Ok(())
    }

    fn trans_commit(&mut self, hooks: &mut dyn EngineHooks) -> Result<(), EngineError> {
        self.calls.push(EngineCall::Commit);
        let active = self.active.take().ok_or(EngineError::NoTransaction)?;
        if !active.prepared {
            self.active = Some(active);
            return Err(EngineError::Commit("transaction not prepared".to_string()));
        }

        match &self.script.commit {
            Some(calls) => Self::replay(calls, hooks),
            None => self.synthesize_commit(&active, hooks),
        }

        let result = match &self.failures.commit {
            Some(reason) => Err(EngineError::Commit(reason.clone())),
            None => {
                if !active.flags.contains(TransFlags::DOWNLOAD_ONLY) {
                    self.committed
                        .extend(active.targets.iter().map(|p| p.name.clone()));
                }
                Ok(())
            }
        };
        self.active = Some(active);
        result
    }

    fn trans_release(&mut self) -> Result<(), EngineError> {
        self.calls.push(EngineCall::Release);
        if self.active.take().is_none() {
            return Err(EngineError::NoTransaction);
        }
        if let Some(reason) = &self.failures.release {
            return Err(EngineError::Release(reason.clone()));
        }
        Ok(())
    }
}
