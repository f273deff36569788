// src/transaction/targets.rs

//! Target resolution
//!
//! Requested names are looked up as packages first, then as groups, across
//! the sync databases in configuration order. The first database with a
//! match wins. Anything listed as a conflict is dropped silently.

use std::collections::HashSet;
use tracing::{debug, error};

use crate::engine::{Package, SyncDb};

/// Find a package by exact name; the first database with a match wins
pub fn find_sync_package(name: &str, dbs: &[&dyn SyncDb]) -> Option<Package> {
    dbs.iter().find_map(|db| db.package(name))
}

/// Members of the first group called `name`; later databases are ignored
pub fn get_group_pkgs(name: &str, dbs: &[&dyn SyncDb]) -> Option<Vec<Package>> {
    dbs.iter().find_map(|db| db.group(name))
}

/// Ordered set of package names to add to a transaction
///
/// Duplicates collapse onto the first occurrence, which also fixes the
/// order packages are added in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetSet {
    names: Vec<String>,
    seen: HashSet<String>,
    /// Requested names that matched neither a package nor a group
    missing: Vec<String>,
}

impl TargetSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a name; false if it was already present
    pub fn insert(&mut self, name: &str) -> bool {
        if !self.seen.insert(name.to_string()) {
            return false;
        }
        self.names.push(name.to_string());
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.seen.contains(name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn missing(&self) -> &[String] {
        &self.missing
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn into_names(self) -> Vec<String> {
        self.names
    }
}

/// Resolve requested package and group names into concrete targets
///
/// A name that is neither a package nor a group is logged and skipped; it
/// only matters if nothing at all resolves.
pub fn resolve_targets<N: AsRef<str>, C: AsRef<str>>(
    names: &[N],
    conflicts: &[C],
    dbs: &[&dyn SyncDb],
) -> TargetSet {
    let conflicts: HashSet<&str> = conflicts.iter().map(|c| c.as_ref()).collect();
    let mut requested: HashSet<&str> = HashSet::new();
    let mut targets = TargetSet::new();

    for name in names {
        let name: &str = name.as_ref();
        if !requested.insert(name) {
            continue;
        }

        if let Some(package) = find_sync_package(name, dbs) {
            if conflicts.contains(package.name.as_str()) {
                debug!("Skipping '{}': listed as a conflict", package.name);
            } else {
                targets.insert(&package.name);
            }
            continue;
        }

        match get_group_pkgs(name, dbs) {
            Some(members) => {
                debug!("'{}' is a group with {} packages", name, members.len());
                for member in members {
                    // e.g. connman conflicts with netctl pulled in by a base group
                    if conflicts.contains(member.name.as_str()) {
                        debug!("Skipping group member '{}': listed as a conflict", member.name);
                    } else {
                        targets.insert(&member.name);
                    }
                }
            }
            None => {
                error!("Can't find a package or group called '{}'", name);
                targets.missing.push(name.to_string());
            }
        }
    }

    targets
}
