//! Rich diagnostic error types for the nudge engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text. Errors only surface through the
//! engine's fallible constructors and the CLI: scheduling, reconciliation and
//! geofence handling log their failures and degrade instead of returning them.

use miette::Diagnostic;
use thiserror::Error;

pub use crate::config::ConfigError;
pub use crate::paths::PathError;
pub use crate::platform::PlatformError;
pub use crate::time::TimeError;

/// Top-level error type for the nudge engine.
#[derive(Debug, Error, Diagnostic)]
pub enum NudgeError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Platform(#[from] PlatformError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Time(#[from] TimeError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(nudge::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(nudge::store::redb),
        help(
            "The embedded ledger database encountered a transaction error. \
             Deleting the ledger file resets rate-limit history but keeps \
             reminders working; run `nudge reset` to do so."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(nudge::store::serde),
        help(
            "Failed to serialize a ledger document. Unreadable documents are \
             treated as empty on load, so this only happens on write."
        )
    )]
    Serialization { message: String },
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum EngineError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(nudge::engine::invalid_config),
        help("Check the values in config.toml. {message}")
    )]
    InvalidConfig { message: String },

    #[error("data directory error: {path}")]
    #[diagnostic(
        code(nudge::engine::data_dir),
        help(
            "The data directory could not be accessed. \
             Ensure the path exists and has read/write permissions."
        )
    )]
    DataDir { path: String },

    #[error("no domain snapshot has been published")]
    #[diagnostic(
        code(nudge::engine::no_snapshot),
        help("Import one with `nudge snapshot import --file <snapshot.json>`.")
    )]
    NoSnapshot,
}

/// Convenience alias for functions returning nudge-engine results.
pub type NudgeResult<T> = std::result::Result<T, NudgeError>;
