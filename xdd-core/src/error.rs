use thiserror::Error;

/// Errors surfaced by the engine, grouped by the surfacing policy in
/// spec.md §7. The `xdd` binary maps these to process exit codes.
#[derive(Error, Debug)]
pub enum XddError {
    /// Configuration error: invalid flag, inconsistent options, unknown
    /// target reference. Surfaced at parse/validate time. Exit code 2.
    #[error("configuration error: {0}")]
    Config(String),

    /// Initialization error: open failed, allocation failed, barrier init
    /// failed, connection refused. Exit code 3.
    #[error("initialization error: {0}")]
    Init(String),

    /// I/O error during a pass (short read/write, OS errno). Exit code 4.
    #[error("I/O error on target {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// End-of-file on a read target. Not an error condition by itself;
    /// carried as a distinct variant so callers can distinguish it from
    /// `Io` without inspecting errno.
    #[error("end of file on target {0}")]
    Eof(String),

    /// E2E protocol error: unexpected magic, sequence mismatch beyond
    /// tolerated reorder, truncated header.
    #[error("E2E protocol error: {0}")]
    Protocol(String),

    /// Resource exhaustion: no more buffers, unable to lock memory. A
    /// pass cannot proceed.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
}

impl XddError {
    /// Process exit code per spec.md §6/§7. Unknown-flag (1) is handled
    /// entirely within the `xdd` binary's CLI layer and has no
    /// `XddError` variant.
    pub fn exit_code(&self) -> i32 {
        match self {
            XddError::Config(_) => 2,
            XddError::Init(_) => 3,
            XddError::Io { .. } | XddError::Protocol(_) | XddError::ResourceExhausted(_) => 4,
            XddError::Eof(_) => 0,
        }
    }
}

pub type Result<T> = std::result::Result<T, XddError>;
