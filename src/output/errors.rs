// Error types for spot

use std::num::ParseIntError;
use std::path::PathBuf;

use thiserror::Error;

/// All error types in spot
#[derive(Debug, Error)]
pub enum SpotError {
    /// Playbook could not be read or decoded
    #[error("can't load playbook {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("task {0} not found")]
    TaskNotFound(String),

    #[error("target {0} not found")]
    TargetNotFound(String),

    #[error("target {0} has no hosts")]
    NoHosts(String),

    #[error("can't parse port {value}: {source}")]
    InvalidPort {
        value: String,
        #[source]
        source: ParseIntError,
    },

    /// Inventory file or URL could not be read or parsed
    #[error("can't load inventory {location}: {message}")]
    Inventory { location: String, message: String },

    #[error("can't get inventory from http {url}, status: {status}")]
    InventoryStatus { url: String, status: String },

    #[error("can't connect to {host}: {message}")]
    Connect { host: String, message: String },

    /// A remote (or local) operation reported failure
    #[error("{operation} failed on {host}: {message}")]
    Transport {
        operation: &'static str,
        host: String,
        message: String,
    },

    /// One command step (script, copy, sync, delete, wait) failed on a host
    #[error("{action} on {host}: {source}")]
    Step {
        action: &'static str,
        host: String,
        #[source]
        source: Box<SpotError>,
    },

    #[error("can't run command {command:?} on host {host}: {source}")]
    CommandFailed {
        command: String,
        host: String,
        #[source]
        source: Box<SpotError>,
    },

    #[error("unknown command {0:?}")]
    UnknownCommand(String),

    #[error("timeout exceeded")]
    WaitTimeout,

    #[error("operation canceled")]
    Cancelled,

    /// Recovery hook failure, reported but never returned from a run
    #[error("can't run on-error command {command:?}: {message}")]
    Hook { command: String, message: String },

    #[error("i/o error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SpotError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SpotError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn step(action: &'static str, host: &str, source: SpotError) -> Self {
        SpotError::Step {
            action,
            host: host.to_string(),
            source: Box::new(source),
        }
    }

    pub fn transport(operation: &'static str, host: &str, message: impl ToString) -> Self {
        SpotError::Transport {
            operation,
            host: host.to_string(),
            message: message.to_string(),
        }
    }

    /// True when the error, or the cause it wraps, is a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            SpotError::Cancelled => true,
            SpotError::Step { source, .. } | SpotError::CommandFailed { source, .. } => {
                source.is_cancelled()
            }
            _ => false,
        }
    }
}
