// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.

#![allow(dead_code)]

use pactrans::{Event, EventEmitter, EventReceiver, MemoryEngine, PacmanSession, event_queue};
use parking_lot::Mutex;
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// Two repositories; `core` carries a `base` group with a member that
/// conflicts with `connman` in `extra`.
pub const SCENARIO: &str = r#"
[[repos]]
name = "core"
packages = [
    { name = "bash", version = "5.2-1", size = 2048 },
    { name = "netctl", version = "1.29-1", size = 1024 },
    { name = "openresolv", version = "3.13-1", size = 512 },
]
groups = { base = ["bash", "netctl", "openresolv"] }

[[repos]]
name = "extra"
packages = [
    { name = "connman", version = "1.42-1", size = 4096 },
    { name = "vim", version = "9.1-1", size = 8192 },
]
"#;

pub fn scenario_engine() -> MemoryEngine {
    MemoryEngine::from_toml(SCENARIO).unwrap()
}

/// Session over the shared scenario with a frontend queue attached
pub fn attached_session(capacity: usize) -> (PacmanSession<MemoryEngine>, EventReceiver) {
    session_with(scenario_engine(), capacity)
}

pub fn session_with(
    engine: MemoryEngine,
    capacity: usize,
) -> (PacmanSession<MemoryEngine>, EventReceiver) {
    let (sender, receiver) = event_queue(capacity);
    let session = PacmanSession::with_engine(engine, EventEmitter::new(sender));
    (session, receiver)
}

pub fn info(text: &str) -> Event {
    Event::Info(text.to_string())
}

/// Only the info texts of an event list
pub fn infos(events: &[Event]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Info(text) => Some(text.clone()),
            _ => None,
        })
        .collect()
}

/// Write a pacman.conf (and a mirrorlist it includes) into a temp dir
///
/// Returns (TempDir, conf_path) - keep the TempDir alive to prevent cleanup.
pub fn write_pacman_conf(repos: &[&str]) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let mirrorlist = dir.path().join("mirrorlist");
    fs::write(
        &mirrorlist,
        "Server = https://mirror.example.org/$repo/os/$arch\n",
    )
    .unwrap();

    let mut content = String::from("[options]\nArchitecture = x86_64\n");
    for repo in repos {
        content.push_str(&format!("\n[{}]\nInclude = {}\n", repo, mirrorlist.display()));
    }

    let conf = dir.path().join("pacman.conf");
    fs::write(&conf, content).unwrap();
    (dir, conf)
}

struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Run `f` on this thread with a subscriber that records every log line
pub fn capture_logs<T>(f: impl FnOnce() -> T) -> (T, String) {
    let buffer = Arc::new(Mutex::new(Vec::new()));
    let writer = Arc::clone(&buffer);
    let subscriber = tracing_subscriber::fmt()
        .with_ansi(false)
        .with_max_level(tracing::Level::DEBUG)
        .with_writer(move || LogBuffer(Arc::clone(&writer)))
        .finish();

    let result = tracing::subscriber::with_default(subscriber, f);
    let logs = String::from_utf8_lossy(&buffer.lock()).into_owned();
    (result, logs)
}
