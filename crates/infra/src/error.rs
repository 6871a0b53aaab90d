//! Store error model.
//!
//! These are **infrastructure errors**. They fall into four classes:
//!
//! - **Configuration**: no tenant in context, unknown field, missing table
//!   configuration. Fatal to the calling operation, never retried.
//! - **Conflict**: a unique constraint rejected a write. Recovered by the
//!   idempotent writer, propagated everywhere else.
//! - **Transient**: connection loss, timeouts, serialization failures of the
//!   database. Propagated; retry policy belongs to the caller.
//! - **NotFound**: raised only by the `*_or_fail` lookups.

use thiserror::Error;

/// Result type used across the store layer.
pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("no tenant in context: {operation} refuses to run unscoped")]
    MissingTenant { operation: &'static str },

    #[error("unknown field '{field}' on table '{table}'")]
    UnknownField { table: String, field: String },

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("unique constraint violation: {0}")]
    Conflict(String),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("record serialization failed: {0}")]
    Serialization(String),

    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn missing_tenant(operation: &'static str) -> Self {
        Self::MissingTenant { operation }
    }

    pub fn unknown_field(table: impl Into<String>, field: impl Into<String>) -> Self {
        Self::UnknownField {
            table: table.into(),
            field: field.into(),
        }
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Missing tenant, unknown field, or bad table/claim configuration.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::MissingTenant { .. } | Self::UnknownField { .. } | Self::Configuration(_)
        )
    }

    /// Unique-constraint violation reported by the backend.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classification() {
        assert!(StoreError::missing_tenant("find").is_configuration());
        assert!(StoreError::unknown_field("jobs", "nope").is_configuration());
        assert!(StoreError::conflict("dup").is_conflict());
        assert!(!StoreError::conflict("dup").is_configuration());
        assert!(StoreError::Transient("timeout".into()).is_transient());
    }

    #[test]
    fn messages_name_the_offender() {
        let err = StoreError::unknown_field("outbox", "colour");
        assert_eq!(err.to_string(), "unknown field 'colour' on table 'outbox'");

        let err = StoreError::missing_tenant("claim_batch");
        assert!(err.to_string().contains("claim_batch"));
    }
}
