// src/lib.rs

//! Package transaction manager for installer frontends
//!
//! Runs sync database refreshes and package installs against a libalpm-style
//! engine, and turns the engine's callbacks into a deduplicated stream of
//! progress events for a frontend running on another thread.
//!
//! # Architecture
//!
//! - `engine`: the native engine capability as a trait, plus an in-memory
//!   engine driven by TOML scenarios
//! - `transaction`: the transaction state machine, option flags and target
//!   resolution
//! - `bridge`: engine callbacks decoded into closed enums and routed into
//!   progress state and events
//! - `progress`: download progress smoothing and status text
//! - `events`: the bounded event queue and the fatal error protocol
//! - `session`: the transaction manager owning the engine handle
//! - `config`: pacman.conf and session settings

pub mod bridge;
pub mod config;
pub mod engine;
mod error;
pub mod events;
pub mod progress;
pub mod session;
pub mod transaction;

pub use bridge::{CallbackBridge, EngineHooks, EventPhase, LogLevel, Question, QuestionAnswer};
pub use config::{DEFAULT_CONF_PATH, PacmanConfig, SessionSettings};
pub use engine::{EngineError, MemoryEngine, Package, PackageEngine, SyncDb, TransFlags};
pub use error::{Error, Result};
pub use events::{Event, EventEmitter, EventKind, EventReceiver, EventSender, event_queue};
pub use progress::DownloadProgress;
pub use session::{InstallReport, PacmanSession, RefreshReport};
pub use transaction::{
    InstallReason, Recursion, Transaction, TransactionOptions, TransactionState,
    finalize_transaction,
};
