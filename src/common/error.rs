//! Error types for minibulk
//!
//! Two layers:
//! - [`Error`] is a call-level failure (returned through `Result`)
//! - [`Status`] is a per-operation outcome carried inside shard and client replies

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Machine-readable code attached to a per-operation [`Status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The operation could not be mapped to a shard.
    CouldNotTarget,
    /// The shard's collection routing version differs from the stamped one.
    StaleShardVersion,
    /// The shard's database routing version differs from the stamped one.
    StaleDbVersion,
    /// The collection was dropped or recreated while the request ran.
    NamespaceDropped,
    NoProgressMade,
    DuplicateKey,
    DocumentValidationFailure,
    /// Generic failure reported by the shard-local executor.
    WriteFailed,
    HostUnreachable,
    ShutdownInProgress,
    /// Retry history on the shard is inconsistent. Aborts the whole request.
    IncompleteTransactionHistory,
    MultipleErrorsOccurred,
    Internal,
}

impl ErrorCode {
    /// Errors that a routing refresh can resolve.
    pub fn is_stale_routing(&self) -> bool {
        matches!(self, ErrorCode::StaleShardVersion | ErrorCode::StaleDbVersion)
    }

    /// Errors that terminate the request regardless of `ordered`.
    pub fn is_always_fatal(&self) -> bool {
        matches!(self, ErrorCode::IncompleteTransactionHistory)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCode::CouldNotTarget => "CouldNotTarget",
            ErrorCode::StaleShardVersion => "StaleShardVersion",
            ErrorCode::StaleDbVersion => "StaleDbVersion",
            ErrorCode::NamespaceDropped => "NamespaceDropped",
            ErrorCode::NoProgressMade => "NoProgressMade",
            ErrorCode::DuplicateKey => "DuplicateKey",
            ErrorCode::DocumentValidationFailure => "DocumentValidationFailure",
            ErrorCode::WriteFailed => "WriteFailed",
            ErrorCode::HostUnreachable => "HostUnreachable",
            ErrorCode::ShutdownInProgress => "ShutdownInProgress",
            ErrorCode::IncompleteTransactionHistory => "IncompleteTransactionHistory",
            ErrorCode::MultipleErrorsOccurred => "MultipleErrorsOccurred",
            ErrorCode::Internal => "Internal",
        };
        f.write_str(name)
    }
}

/// Routing details a shard attaches to a stale-version error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaleInfo {
    /// Namespace the shard found stale
    pub namespace: String,
    /// Version the router stamped on the request
    pub received: Option<String>,
    /// Version the shard currently knows about
    pub wanted: Option<String>,
}

/// Per-operation outcome of a failed write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub code: ErrorCode,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale_info: Option<StaleInfo>,
}

impl Status {
    pub fn new(code: ErrorCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
            stale_info: None,
        }
    }

    pub fn stale(code: ErrorCode, reason: impl Into<String>, info: StaleInfo) -> Self {
        Self {
            code,
            reason: reason.into(),
            stale_info: Some(info),
        }
    }

    /// Prefix the reason with extra context, keeping the code.
    pub fn with_context(&self, context: impl fmt::Display) -> Self {
        Self {
            code: self.code,
            reason: format!("{} :: caused by :: {}", context, self.reason),
            stale_info: self.stale_info.clone(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.reason)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    // === Targeting Errors ===
    #[error("Could not target {namespace}: {reason}")]
    CouldNotTarget { namespace: String, reason: String },

    #[error("Unknown namespace index {0}")]
    UnknownNamespace(usize),

    // === Routing Errors ===
    #[error("Namespace {0} was dropped")]
    NamespaceDropped(String),

    #[error("Routing catalog error: {0}")]
    Catalog(String),

    #[error("No progress made after {rounds} rounds ({completed} ops completed)")]
    NoProgress { rounds: usize, completed: usize },

    #[error("Request aborted: {0}")]
    AlwaysFatal(Status),

    // === Shard Errors ===
    #[error("Shard not found: {0}")]
    ShardNotFound(String),

    #[error("Connection to shard {shard} failed: {reason}")]
    ConnectionFailed { shard: String, reason: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Shutdown in progress: {0}")]
    Shutdown(String),

    // === Request / Config Errors ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::CouldNotTarget { .. } | Error::ConnectionFailed { .. } | Error::Http(_)
        )
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Error::Shutdown(_))
    }

    pub fn is_always_fatal(&self) -> bool {
        matches!(self, Error::AlwaysFatal(_))
    }

    /// Code used when this error is recorded against an operation.
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::CouldNotTarget { .. } | Error::UnknownNamespace(_) => ErrorCode::CouldNotTarget,
            Error::NamespaceDropped(_) => ErrorCode::NamespaceDropped,
            Error::NoProgress { .. } => ErrorCode::NoProgressMade,
            Error::AlwaysFatal(status) => status.code,
            Error::ShardNotFound(_) | Error::ConnectionFailed { .. } | Error::Http(_) => {
                ErrorCode::HostUnreachable
            }
            Error::Shutdown(_) => ErrorCode::ShutdownInProgress,
            _ => ErrorCode::Internal,
        }
    }

    /// Convert to a per-operation status for the client reply.
    pub fn to_status(&self) -> Status {
        match self {
            Error::AlwaysFatal(status) => status.clone(),
            _ => Status::new(self.code(), self.to_string()),
        }
    }
}

// Implement From for common error types
impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Http(e.to_string())
    }
}
