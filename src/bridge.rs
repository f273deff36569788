// src/bridge.rs

//! Callback bridge between the native engine and the event stream
//!
//! The engine calls these hooks synchronously from inside `update_db`,
//! `trans_prepare` and `trans_commit`. Each hook only updates in-memory
//! state and pushes onto the non-blocking event queue, so the transaction is
//! never stalled by the frontend.
//!
//! Engine payloads that arrive as raw numbers (severity bitmasks, event ids)
//! are decoded into closed enums at the engine boundary; the bridge matches
//! them exhaustively.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::events::EventEmitter;
use crate::progress::{DownloadProgress, DownloadUpdate};

/// Severity of an engine log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warning,
    Debug,
    Function,
}

impl LogLevel {
    const ERROR_BIT: u32 = 1;
    const WARNING_BIT: u32 = 1 << 1;
    const DEBUG_BIT: u32 = 1 << 2;
    const FUNCTION_BIT: u32 = 1 << 3;

    /// Decode a libalpm severity bitmask, most severe bit first
    pub fn from_mask(mask: u32) -> Option<Self> {
        if mask & Self::ERROR_BIT != 0 {
            Some(Self::Error)
        } else if mask & Self::WARNING_BIT != 0 {
            Some(Self::Warning)
        } else if mask & Self::DEBUG_BIT != 0 {
            Some(Self::Debug)
        } else if mask & Self::FUNCTION_BIT != 0 {
            Some(Self::Function)
        } else {
            None
        }
    }
}

/// Transaction phase announced by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u32)]
pub enum EventPhase {
    CheckDepsStart = 1,
    CheckDepsDone = 2,
    FileConflictsStart = 3,
    FileConflictsDone = 4,
    ResolveDepsStart = 5,
    ResolveDepsDone = 6,
    InterConflictsStart = 7,
    InterConflictsDone = 8,
    AddStart = 9,
    AddDone = 10,
    RemoveStart = 11,
    RemoveDone = 12,
    UpgradeStart = 13,
    UpgradeDone = 14,
    IntegrityStart = 15,
    IntegrityDone = 16,
    LoadStart = 17,
    LoadDone = 18,
    DeltaIntegrityStart = 19,
    DeltaIntegrityDone = 20,
    DeltaPatchesStart = 21,
    DeltaPatchesDone = 22,
    DeltaPatchStart = 23,
    DeltaPatchDone = 24,
    DeltaPatchFailed = 25,
    ScriptletInfo = 26,
    RetrieveStart = 27,
    DiskspaceStart = 28,
    DiskspaceDone = 29,
}

impl EventPhase {
    /// Status line shown to the user, if the phase has one
    pub fn status_text(self) -> Option<&'static str> {
        match self {
            Self::CheckDepsStart => Some("Checking dependencies..."),
            Self::FileConflictsStart => Some("Checking file conflicts..."),
            Self::ResolveDepsStart => Some("Resolving dependencies..."),
            Self::InterConflictsStart => Some("Checking inter conflicts..."),
            Self::RemoveStart => Some("Removing..."),
            Self::UpgradeStart => Some("Upgrading..."),
            Self::IntegrityStart => Some("Checking integrity..."),
            Self::LoadStart => Some("Loading packages files..."),
            Self::ScriptletInfo => Some("Configuring..."),
            Self::RetrieveStart => Some("Downloading a file"),
            // Installs are reported per package by the progress hook
            Self::AddStart => None,
            Self::CheckDepsDone
            | Self::FileConflictsDone
            | Self::ResolveDepsDone
            | Self::InterConflictsDone
            | Self::AddDone
            | Self::RemoveDone
            | Self::UpgradeDone
            | Self::IntegrityDone
            | Self::LoadDone
            | Self::DeltaIntegrityStart
            | Self::DeltaIntegrityDone
            | Self::DeltaPatchesStart
            | Self::DeltaPatchesDone
            | Self::DeltaPatchStart
            | Self::DeltaPatchDone
            | Self::DeltaPatchFailed
            | Self::DiskspaceStart
            | Self::DiskspaceDone => None,
        }
    }
}

impl TryFrom<u32> for EventPhase {
    type Error = u32;

    fn try_from(id: u32) -> Result<Self, Self::Error> {
        let phase = match id {
            1 => Self::CheckDepsStart,
            2 => Self::CheckDepsDone,
            3 => Self::FileConflictsStart,
            4 => Self::FileConflictsDone,
            5 => Self::ResolveDepsStart,
            6 => Self::ResolveDepsDone,
            7 => Self::InterConflictsStart,
            8 => Self::InterConflictsDone,
            9 => Self::AddStart,
            10 => Self::AddDone,
            11 => Self::RemoveStart,
            12 => Self::RemoveDone,
            13 => Self::UpgradeStart,
            14 => Self::UpgradeDone,
            15 => Self::IntegrityStart,
            16 => Self::IntegrityDone,
            17 => Self::LoadStart,
            18 => Self::LoadDone,
            19 => Self::DeltaIntegrityStart,
            20 => Self::DeltaIntegrityDone,
            21 => Self::DeltaPatchesStart,
            22 => Self::DeltaPatchesDone,
            23 => Self::DeltaPatchStart,
            24 => Self::DeltaPatchDone,
            25 => Self::DeltaPatchFailed,
            26 => Self::ScriptletInfo,
            27 => Self::RetrieveStart,
            28 => Self::DiskspaceStart,
            29 => Self::DiskspaceDone,
            unknown => return Err(unknown),
        };
        Ok(phase)
    }
}

/// Interactive prompt raised by the engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Question {
    InstallIgnored { package: String },
    Replace {
        old: String,
        new: String,
        repository: String,
    },
    Conflict {
        package: String,
        conflict: String,
        reason: String,
    },
    Corrupted { path: String, reason: String },
    RemoveUnresolvable { packages: Vec<String> },
    SelectProvider {
        dependency: String,
        providers: Vec<String>,
    },
    ImportKey { fingerprint: String, uid: String },
}

/// Reply to an engine prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuestionAnswer {
    /// Let the engine apply its default choice
    #[default]
    Default,
    Yes,
    No,
    /// Index into the offered choices
    Select(usize),
}

/// Hooks the engine invokes while it works
pub trait EngineHooks {
    fn on_log(&mut self, level: LogLevel, message: &str);

    /// Aggregate download size for the transaction (0 = metadata only)
    fn on_total_download(&mut self, total: u64);

    fn on_event(&mut self, phase: EventPhase);

    fn on_question(&mut self, question: &Question) -> QuestionAnswer;

    /// Per-item progress; `target` is `None` while the engine pre-scans
    fn on_progress(&mut self, target: Option<&str>, percent: u32, total: usize, current: usize);

    /// Per-file download progress
    fn on_download(&mut self, filename: &str, transferred: u64, total: u64);
}

/// Hooks that ignore everything, for engine calls nobody watches
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl EngineHooks for NoHooks {
    fn on_log(&mut self, _level: LogLevel, _message: &str) {}
    fn on_total_download(&mut self, _total: u64) {}
    fn on_event(&mut self, _phase: EventPhase) {}
    fn on_question(&mut self, _question: &Question) -> QuestionAnswer {
        QuestionAnswer::Default
    }
    fn on_progress(
        &mut self,
        _target: Option<&str>,
        _percent: u32,
        _total: usize,
        _current: usize,
    ) {
    }
    fn on_download(&mut self, _filename: &str, _transferred: u64, _total: u64) {}
}

/// Routes engine hooks into the download tracker and the event emitter
pub struct CallbackBridge<'a> {
    emitter: &'a mut EventEmitter,
    progress: &'a mut DownloadProgress,
}

impl<'a> CallbackBridge<'a> {
    pub fn new(emitter: &'a mut EventEmitter, progress: &'a mut DownloadProgress) -> Self {
        Self { emitter, progress }
    }
}

impl EngineHooks for CallbackBridge<'_> {
    fn on_log(&mut self, level: LogLevel, message: &str) {
        let message = message.trim_end();
        match level {
            LogLevel::Error => error!("{}", message),
            LogLevel::Warning => warn!("{}", message),
            LogLevel::Debug | LogLevel::Function => {}
        }
    }

    fn on_total_download(&mut self, total: u64) {
        self.progress.set_total_download_size(total);
    }

    fn on_event(&mut self, phase: EventPhase) {
        if let Some(text) = phase.status_text() {
            self.emitter.info(text);
        }
    }

    fn on_question(&mut self, question: &Question) -> QuestionAnswer {
        debug!("Leaving engine question to its default: {:?}", question);
        QuestionAnswer::Default
    }

    fn on_progress(&mut self, target: Option<&str>, percent: u32, total: usize, current: usize) {
        let (message, fraction) = match target {
            Some(target) if !target.is_empty() => {
                let fraction = if total > 0 {
                    current as f64 / total as f64
                } else {
                    0.0
                };
                (format!("Installing {} ({}/{})", target, current, total), fraction)
            }
            _ => (
                format!("Checking and loading packages... ({} targets)", total),
                f64::from(percent) / 100.0,
            ),
        };

        self.emitter.info(message);
        self.emitter.percent(fraction);
    }

    fn on_download(&mut self, filename: &str, transferred: u64, total: u64) {
        match self.progress.observe(filename, transferred, total) {
            DownloadUpdate::NewFile { label } => {
                self.emitter.info(label);
                self.emitter.percent(0.0);
            }
            DownloadUpdate::Advanced(fraction) => self.emitter.percent(fraction),
            DownloadUpdate::Unchanged => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Event, event_queue};

    fn info(text: &str) -> Event {
        Event::Info(text.to_string())
    }

    #[test]
    fn test_log_mask_precedence() {
        assert_eq!(LogLevel::from_mask(1), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_mask(2), Some(LogLevel::Warning));
        assert_eq!(LogLevel::from_mask(3), Some(LogLevel::Error));
        assert_eq!(LogLevel::from_mask(4), Some(LogLevel::Debug));
        assert_eq!(LogLevel::from_mask(8), Some(LogLevel::Function));
        assert_eq!(LogLevel::from_mask(0), None);
    }

    #[test]
    fn test_phase_ids_round_trip_through_table() {
        assert_eq!(EventPhase::try_from(1), Ok(EventPhase::CheckDepsStart));
        assert_eq!(EventPhase::try_from(27), Ok(EventPhase::RetrieveStart));
        assert_eq!(EventPhase::try_from(0), Err(0));
        assert_eq!(EventPhase::try_from(99), Err(99));

        for id in 1..=29 {
            let phase = EventPhase::try_from(id).unwrap();
            assert_eq!(phase as u32, id);
        }
    }

    #[test]
    fn test_phase_status_text() {
        assert_eq!(
            EventPhase::ResolveDepsStart.status_text(),
            Some("Resolving dependencies...")
        );
        assert_eq!(EventPhase::ScriptletInfo.status_text(), Some("Configuring..."));
        assert_eq!(EventPhase::AddStart.status_text(), None);
        assert_eq!(EventPhase::CheckDepsDone.status_text(), None);
    }

    #[test]
    fn test_event_hook_emits_only_known_text() {
        let (sender, receiver) = event_queue(16);
        let mut emitter = EventEmitter::new(sender);
        let mut progress = DownloadProgress::new();
        let mut bridge = CallbackBridge::new(&mut emitter, &mut progress);

        bridge.on_event(EventPhase::CheckDepsStart);
        bridge.on_event(EventPhase::CheckDepsDone);
        bridge.on_event(EventPhase::AddStart);
        bridge.on_event(EventPhase::IntegrityStart);

        assert_eq!(
            receiver.drain(),
            vec![info("Checking dependencies..."), info("Checking integrity...")]
        );
    }

    #[test]
    fn test_progress_hook_with_and_without_target() {
        let (sender, receiver) = event_queue(16);
        let mut emitter = EventEmitter::new(sender);
        let mut progress = DownloadProgress::new();
        let mut bridge = CallbackBridge::new(&mut emitter, &mut progress);

        bridge.on_progress(None, 40, 3, 0);
        bridge.on_progress(Some("bash"), 0, 4, 1);

        assert_eq!(
            receiver.drain(),
            vec![
                info("Checking and loading packages... (3 targets)"),
                Event::Percent(0.4),
                info("Installing bash (1/4)"),
                Event::Percent(0.25),
            ]
        );
    }

    #[test]
    fn test_download_hook_sequence() {
        let (sender, receiver) = event_queue(32);
        let mut emitter = EventEmitter::new(sender);
        let mut progress = DownloadProgress::new();
        let mut bridge = CallbackBridge::new(&mut emitter, &mut progress);

        bridge.on_download("core.db", 0, 100);
        bridge.on_download("core.db", 50, 100);
        bridge.on_download("core.db", 40, 100);
        bridge.on_download("core.db", 100, 100);

        assert_eq!(
            receiver.drain(),
            vec![
                info("Updating core database"),
                Event::Percent(0.0),
                Event::Percent(0.5),
                Event::Percent(1.0),
            ]
        );
    }

    #[test]
    fn test_total_download_switches_wording() {
        let (sender, receiver) = event_queue(32);
        let mut emitter = EventEmitter::new(sender);
        let mut progress = DownloadProgress::new();
        progress.begin_batch(1);
        let mut bridge = CallbackBridge::new(&mut emitter, &mut progress);

        bridge.on_total_download(2048);
        bridge.on_download("nano-8.0-1-x86_64.pkg.tar.zst", 0, 2048);

        assert_eq!(
            receiver.drain(),
            vec![info("Downloading nano-8.0-1-x86_64... (1/1)"), Event::Percent(0.0)]
        );
        assert_eq!(progress.total_download_size(), 2048);
    }

    #[test]
    fn test_question_defers_to_engine() {
        let mut emitter = EventEmitter::detached();
        let mut progress = DownloadProgress::new();
        let mut bridge = CallbackBridge::new(&mut emitter, &mut progress);

        let answer = bridge.on_question(&Question::Conflict {
            package: "connman".to_string(),
            conflict: "netctl".to_string(),
            reason: "openresolv".to_string(),
        });
        assert_eq!(answer, QuestionAnswer::Default);
    }

    #[test]
    fn test_log_hook_does_not_emit_events() {
        let (sender, receiver) = event_queue(4);
        let mut emitter = EventEmitter::new(sender);
        let mut progress = DownloadProgress::new();
        let mut bridge = CallbackBridge::new(&mut emitter, &mut progress);

        bridge.on_log(LogLevel::Error, "could not open file\n");
        bridge.on_log(LogLevel::Debug, "noise");

        assert!(receiver.is_empty());
    }
}
