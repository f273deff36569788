// src/progress.rs

//! Download progress smoothing
//!
//! The engine reports raw byte counts per file. This module turns them into
//! progress fractions that never go backwards, and into status text for the
//! start of each file.
//!
//! # Rules
//!
//! - A call with a different filename or a different total size than the
//!   previous call starts a new file: progress resets to zero.
//! - With a known total, progress is `transferred / total`.
//! - With an unknown total (0), progress follows `ln(1 + kib)^2 / 200`, which
//!   keeps moving without a denominator.
//! - A fraction is reported only when it is strictly greater than the last
//!   one reported for the current file.
//! - When the transaction-wide download size is 0, downloads are database
//!   refreshes and are labelled as such.

/// Package archive suffixes stripped for display (longest first)
const PACKAGE_SUFFIXES: &[&str] = &[".pkg.tar.zst", ".pkg.tar.xz", ".pkg.tar.gz", ".pkg.tar"];

/// Database file suffixes stripped for display
const DATABASE_SUFFIXES: &[&str] = &[".db", ".files"];

/// Progress for a stream whose size is unknown
pub fn fallback_fraction(transferred: u64) -> f64 {
    let kib = transferred as f64 / 1024.0;
    let curve = (1.0 + kib).ln();
    (curve * curve / 200.0).min(1.0)
}

fn strip_suffix<'a>(filename: &'a str, suffixes: &[&str]) -> &'a str {
    suffixes
        .iter()
        .find_map(|suffix| filename.strip_suffix(suffix))
        .unwrap_or(filename)
}

/// Outcome of feeding one download callback into the tracker
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadUpdate {
    /// A new file started; progress was reset to zero
    NewFile { label: String },
    /// Same file, progress grew to this fraction
    Advanced(f64),
    /// Same file, no growth; nothing to report
    Unchanged,
}

/// Per-session download state
#[derive(Debug, Clone, Default)]
pub struct DownloadProgress {
    last_filename: Option<String>,
    last_total: u64,
    last_fraction: f64,
    /// Aggregate size reported for the whole transaction (0 = metadata only)
    total_download_size: u64,
    packages_expected: usize,
    packages_downloaded: usize,
}

impl DownloadProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting downloads for a new batch of targets
    pub fn begin_batch(&mut self, packages_expected: usize) {
        self.packages_expected = packages_expected;
        self.packages_downloaded = 0;
    }

    pub fn set_total_download_size(&mut self, total: u64) {
        self.total_download_size = total;
    }

    pub fn total_download_size(&self) -> u64 {
        self.total_download_size
    }

    /// True while the engine is refreshing databases rather than fetching packages
    pub fn is_metadata_only(&self) -> bool {
        self.total_download_size == 0
    }

    pub fn packages_downloaded(&self) -> usize {
        self.packages_downloaded
    }

    pub fn packages_expected(&self) -> usize {
        self.packages_expected
    }

    /// Last fraction reported for the current file
    pub fn last_fraction(&self) -> f64 {
        self.last_fraction
    }

    /// Feed one download callback
    pub fn observe(&mut self, filename: &str, transferred: u64, total: u64) -> DownloadUpdate {
        let same_file = self.last_filename.as_deref() == Some(filename) && self.last_total == total;

        if !same_file {
            self.last_filename = Some(filename.to_string());
            self.last_total = total;
            self.last_fraction = 0.0;
            return DownloadUpdate::NewFile {
                label: self.start_label(filename),
            };
        }

        let fraction = if self.last_total > 0 {
            (transferred as f64 / self.last_total as f64).min(1.0)
        } else {
            fallback_fraction(transferred)
        };

        if fraction > self.last_fraction {
            self.last_fraction = fraction;
            DownloadUpdate::Advanced(fraction)
        } else {
            DownloadUpdate::Unchanged
        }
    }

    fn start_label(&mut self, filename: &str) -> String {
        if self.is_metadata_only() {
            let name = strip_suffix(filename, DATABASE_SUFFIXES);
            return format!("Updating {} database", name);
        }

        self.packages_downloaded += 1;
        let name = strip_suffix(filename, PACKAGE_SUFFIXES);
        if self.packages_expected > 0 {
            format!(
                "Downloading {}... ({}/{})",
                name, self.packages_downloaded, self.packages_expected
            )
        } else {
            format!("Downloading {}...", name)
        }
    }
}
