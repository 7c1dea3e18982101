//! Structured error taxonomy shared by every sandbox operation.
//!
//! Errors are plain data: they serialize with a `type` tag so the tool-call
//! layer can hand them back to the caller unchanged. `PathViolation` and
//! `SecurityViolation` are raised before any side effect happens; the others
//! describe something that went wrong once execution had started.

use serde::{Deserialize, Serialize};

/// Diagnostic context for an error raised by the executed code itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeFailure {
    /// Exception class or failure kind (e.g. `NameError`, `CommandError`).
    pub kind: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub traceback: String,
    /// Missing module name, for import failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    /// Interpreter search paths at the time of an import failure.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub search_paths: Vec<String>,
}

impl RuntimeFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            traceback: String::new(),
            module: None,
            search_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "type")]
pub enum SandboxError {
    #[error("path {path} is outside the allowed root {allowed_root}")]
    PathViolation { path: String, allowed_root: String },

    #[error("command blocked by security policy ({description}): matched `{pattern}`")]
    SecurityViolation {
        pattern: String,
        description: String,
        command: String,
    },

    #[error("operation timed out after {seconds}s")]
    TimeoutError { seconds: u64 },

    #[error("{}: {}", .0.kind, .0.message)]
    RuntimeFailure(RuntimeFailure),

    #[error("artifact error for {path}: {reason}")]
    ArtifactError { path: String, reason: String },

    #[error("invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("internal sandbox error: {message}")]
    Internal { message: String },
}

impl SandboxError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    pub fn artifact(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ArtifactError {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// The `type` tag as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PathViolation { .. } => "PathViolation",
            Self::SecurityViolation { .. } => "SecurityViolation",
            Self::TimeoutError { .. } => "TimeoutError",
            Self::RuntimeFailure(_) => "RuntimeFailure",
            Self::ArtifactError { .. } => "ArtifactError",
            Self::InvalidRequest { .. } => "InvalidRequest",
            Self::Internal { .. } => "Internal",
        }
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(e: std::io::Error) -> Self {
        Self::internal(e.to_string())
    }
}
