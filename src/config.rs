// src/config.rs

//! Configuration for package sessions
//!
//! Two sources feed a session:
//!
//! - `pacman.conf`: the system package manager configuration. Only what the
//!   engine handle needs is read: root and database paths, cache
//!   directories, architecture, and the ordered list of sync repositories
//!   with their servers (including `Include`d mirrorlists).
//! - Session settings: a small TOML file for this crate (config path, event
//!   queue capacity, default transaction options).
//!
//! Repository order is file order. Package lookups scan databases in that
//! order, so it decides which repository wins for a duplicated name.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::engine::PackageEngine;
use crate::error::{Error, Result};
use crate::transaction::TransactionOptions;

/// Well-known location of the system configuration
pub const DEFAULT_CONF_PATH: &str = "/etc/pacman.conf";

pub const DEFAULT_ROOT_DIR: &str = "/";
pub const DEFAULT_DB_PATH: &str = "/var/lib/pacman";
pub const DEFAULT_CACHE_DIR: &str = "/var/cache/pacman/pkg";
pub const DEFAULT_ARCHITECTURE: &str = "x86_64";

/// Default capacity of the frontend event queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

const MAX_INCLUDE_DEPTH: usize = 8;

/// One sync repository section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoConfig {
    pub name: String,
    /// Server URLs as written, before `$repo`/`$arch` substitution
    pub servers: Vec<String>,
    pub sig_level: Option<String>,
}

impl RepoConfig {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            servers: Vec::new(),
            sig_level: None,
        }
    }

    /// Server URLs with `$repo` and `$arch` expanded
    pub fn server_urls(&self, architecture: &str) -> Vec<String> {
        self.servers
            .iter()
            .map(|server| {
                server
                    .replace("$repo", &self.name)
                    .replace("$arch", architecture)
            })
            .collect()
    }
}

/// The parts of pacman.conf the engine handle is built from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacmanConfig {
    pub root_dir: PathBuf,
    pub db_path: PathBuf,
    pub cache_dirs: Vec<PathBuf>,
    pub architecture: String,
    pub repos: Vec<RepoConfig>,
}

impl Default for PacmanConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from(DEFAULT_ROOT_DIR),
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            cache_dirs: Vec::new(),
            architecture: DEFAULT_ARCHITECTURE.to_string(),
            repos: Vec::new(),
        }
    }
}

impl PacmanConfig {
    /// Read a configuration file
    ///
    /// A missing or unreadable file is a configuration error; the engine
    /// cannot be opened without one.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| Error::Config {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::parse(&content, path)
    }

    /// Parse configuration text; `origin` is used for error messages and
    /// nothing else
    pub fn parse(content: &str, origin: &Path) -> Result<Self> {
        let mut parser = Parser::default();
        parser.parse(content, origin, 0)?;
        Ok(parser.finish())
    }

    pub fn repo(&self, name: &str) -> Option<&RepoConfig> {
        self.repos.iter().find(|repo| repo.name == name)
    }

    /// Register every sync repository with the engine, in file order
    pub fn apply<E: PackageEngine>(&self, engine: &mut E) -> Result<()> {
        for repo in &self.repos {
            let servers = repo.server_urls(&self.architecture);
            debug!(
                "Registering sync database '{}' with {} servers",
                repo.name,
                servers.len()
            );
            engine.register_syncdb(&repo.name, &servers)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    None,
    Options,
    Repo(usize),
}

#[derive(Debug)]
struct Parser {
    config: PacmanConfig,
    section: Section,
}

impl Default for Parser {
    fn default() -> Self {
        Self {
            config: PacmanConfig::default(),
            section: Section::None,
        }
    }
}

fn config_error(path: &Path, line: usize, reason: impl std::fmt::Display) -> Error {
    Error::Config {
        path: path.to_path_buf(),
        reason: format!("line {}: {}", line, reason),
    }
}

impl Parser {
    fn parse(&mut self, content: &str, path: &Path, depth: usize) -> Result<()> {
        for (index, raw) in content.lines().enumerate() {
            let line_no = index + 1;
            let line = raw.split('#').next().unwrap_or_default().trim();
            if line.is_empty() {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim();
                if name.is_empty() {
                    return Err(config_error(path, line_no, "empty section name"));
                }
                self.section = self.enter_section(name);
                continue;
            }

            let (key, value) = match line.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim())),
                None => (line, None),
            };

            if self.section == Section::None {
                return Err(config_error(
                    path,
                    line_no,
                    format!("'{}' appears outside of a section", key),
                ));
            }

            if key == "Include" {
                let value =
                    value.ok_or_else(|| config_error(path, line_no, "Include needs a path"))?;
                self.include(Path::new(value), path, line_no, depth)?;
                continue;
            }

            match self.section {
                Section::Options => self.option(key, value),
                Section::Repo(index) => self.repo_directive(index, key, value, path, line_no)?,
                Section::None => {}
            }
        }
        Ok(())
    }

    fn enter_section(&mut self, name: &str) -> Section {
        if name == "options" {
            return Section::Options;
        }
        let repos = &mut self.config.repos;
        let index = match repos.iter().position(|repo| repo.name == name) {
            Some(index) => index,
            None => {
                repos.push(RepoConfig::new(name));
                repos.len() - 1
            }
        };
        Section::Repo(index)
    }

    fn option(&mut self, key: &str, value: Option<&str>) {
        let Some(value) = value else {
            // Bare flags such as CheckSpace or Color do not affect the handle
            return;
        };
        match key {
            "RootDir" => self.config.root_dir = PathBuf::from(value),
            "DBPath" => self.config.db_path = PathBuf::from(value),
            "CacheDir" => self
                .config
                .cache_dirs
                .extend(value.split_whitespace().map(PathBuf::from)),
            "Architecture" => {
                if let Some(arch) = value.split_whitespace().next() {
                    self.config.architecture = if arch == "auto" {
                        std::env::consts::ARCH.to_string()
                    } else {
                        arch.to_string()
                    };
                }
            }
            other => debug!("Ignoring option '{}'", other),
        }
    }

    fn repo_directive(
        &mut self,
        index: usize,
        key: &str,
        value: Option<&str>,
        path: &Path,
        line_no: usize,
    ) -> Result<()> {
        let value =
            value.ok_or_else(|| config_error(path, line_no, format!("'{}' needs a value", key)))?;
        match key {
            "Server" => self.config.repos[index].servers.push(value.to_string()),
            "SigLevel" => self.config.repos[index].sig_level = Some(value.to_string()),
            other => debug!(
                "Ignoring '{}' in repository '{}'",
                other, self.config.repos[index].name
            ),
        }
        Ok(())
    }

    fn include(
        &mut self,
        included: &Path,
        from: &Path,
        line_no: usize,
        depth: usize,
    ) -> Result<()> {
        if depth >= MAX_INCLUDE_DEPTH {
            return Err(config_error(
                from,
                line_no,
                format!("includes nested deeper than {}", MAX_INCLUDE_DEPTH),
            ));
        }

        let content = match fs::read_to_string(included) {
            Ok(content) => content,
            Err(e) => {
                warn!("Can't read included file {}: {}", included.display(), e);
                return Ok(());
            }
        };

        let section = self.section;
        self.parse(&content, included, depth + 1)?;
        self.section = section;
        Ok(())
    }

    fn finish(mut self) -> PacmanConfig {
        if self.config.cache_dirs.is_empty() {
            self.config.cache_dirs.push(PathBuf::from(DEFAULT_CACHE_DIR));
        }
        self.config
    }
}

fn default_conf_path() -> PathBuf {
    PathBuf::from(DEFAULT_CONF_PATH)
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

/// Settings for one installer session, loaded from TOML
///
/// ```toml
/// pacman_conf = "/etc/pacman.conf"
/// queue_capacity = 256
///
/// [options]
/// needed = true
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_conf_path")]
    pub pacman_conf: PathBuf,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Options used when the caller does not pass its own
    #[serde(default)]
    pub options: TransactionOptions,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            pacman_conf: default_conf_path(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            options: TransactionOptions::default(),
        }
    }
}

impl SessionSettings {
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_toml(&content)
    }
}
