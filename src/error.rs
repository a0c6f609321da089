use serde::Serialize;
use thiserror::Error;

/// Per-item scan failures. They are collected as diagnostics and never abort a run.
#[derive(Clone, Debug, Eq, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum ScanError {
    /// The archive could not be opened or listed; none of its entries were scanned.
    #[error("cannot read archive {module}: {reason}")]
    UnreadableArchive { module: String, reason: String },

    /// One class entry could not be read or parsed; sibling entries are unaffected.
    #[error("malformed class {entry} in {module}: {reason}")]
    MalformedClass {
        module: String,
        entry: String,
        reason: String,
    },
}

impl ScanError {
    pub(crate) fn unreadable(module: &str, err: impl std::fmt::Display) -> Self {
        ScanError::UnreadableArchive {
            module: module.to_string(),
            reason: err.to_string(),
        }
    }

    /// Build a malformed-class error from an `anyhow` chain, keeping every cause.
    pub(crate) fn malformed(module: &str, entry: &str, err: &anyhow::Error) -> Self {
        ScanError::MalformedClass {
            module: module.to_string(),
            entry: entry.to_string(),
            reason: format!("{err:#}"),
        }
    }

    pub(crate) fn module(&self) -> &str {
        match self {
            ScanError::UnreadableArchive { module, .. } => module,
            ScanError::MalformedClass { module, .. } => module,
        }
    }
}
