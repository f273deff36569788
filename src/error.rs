// src/error.rs

//! Error types for package transactions

use std::path::PathBuf;
use thiserror::Error;

use crate::engine::EngineError;
use crate::transaction::TransactionState;

/// Errors surfaced by the transaction manager
#[derive(Error, Debug)]
pub enum Error {
    /// An operation needing the engine handle ran after release (or before init)
    #[error("package engine is not initialized")]
    EngineNotInitialized,

    /// Failure reported by the native engine
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// Resolution left nothing to install
    #[error("no targets found")]
    NoTargets,

    /// Transaction step invoked out of order
    #[error("invalid transaction state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        expected: TransactionState,
        actual: TransactionState,
    },

    /// Unrecoverable installer error, already delivered to the event consumer
    #[error("fatal: {0}")]
    Fatal(String),

    /// Malformed or unreadable configuration
    #[error("configuration error in {}: {reason}", path.display())]
    Config { path: PathBuf, reason: String },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Session settings failed to parse
    #[error("invalid settings: {0}")]
    Settings(#[from] toml::de::Error),
}

impl Error {
    /// Returns true for the single error that must end the installer run
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }
}

/// Result alias for transaction manager operations
pub type Result<T> = std::result::Result<T, Error>;
