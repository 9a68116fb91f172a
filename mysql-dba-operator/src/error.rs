use thiserror::Error;

use crate::sql;

/// Errors surfaced by reconciliation; ownership conflicts are statuses, not errors.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{kind} {name} not found")]
    NotFound { kind: &'static str, name: String },

    #[error("Connectivity failure: {0}")]
    Connectivity(String),

    #[error("Timed out: {operation}")]
    Timeout { operation: String },

    #[error("SQL execution failed: {reason} (statement: {statement})")]
    Sql { statement: String, reason: String },

    #[error("Invalid spec: {0}")]
    InvalidSpec(String),

    #[error("Kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// The statement is stored redacted; server messages quoting a redacted
    /// statement are cut at the quote.
    pub fn sql(statement: impl AsRef<str>, reason: impl std::fmt::Display) -> Self {
        let statement = statement.as_ref();
        let redacted = sql::redact(statement);
        let mut reason = reason.to_string();
        if redacted != statement {
            if let Some(at) = reason.find(" near '") {
                reason.truncate(at);
            }
        }
        Error::Sql {
            statement: redacted,
            reason,
        }
    }

    pub fn timeout(operation: impl AsRef<str>) -> Self {
        Error::Timeout {
            operation: sql::redact(operation.as_ref()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Connect, ping and timeout failures.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Error::Connectivity(_) | Error::Timeout { .. })
    }

    /// Failures a later pass may clear without a spec change.
    pub fn is_transient(&self) -> bool {
        self.is_connectivity() || matches!(self, Error::Sql { .. } | Error::Kube(_))
    }
}
