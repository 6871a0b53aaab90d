//! Per-table claim configuration.

use chrono::{DateTime, Utc};

use crate::backend::ClaimStatement;
use crate::error::{StoreError, StoreResult};
use crate::schema::{ColumnResolver, TableDescriptor};
use crate::value::Value;

/// Which logical fields drive the claim protocol of one record type.
///
/// Built once per worker type at startup; immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimConfig {
    status_field: String,
    pending: Value,
    in_progress: Value,
    created_at_field: String,
    next_attempt_at_field: String,
    schedule_field: Option<String>,
    attempts_field: String,
    claimed_at_field: Option<String>,
}

impl ClaimConfig {
    pub fn new(
        status_field: impl Into<String>,
        pending: impl Into<Value>,
        in_progress: impl Into<Value>,
        created_at_field: impl Into<String>,
        next_attempt_at_field: impl Into<String>,
    ) -> Self {
        Self {
            status_field: status_field.into(),
            pending: pending.into(),
            in_progress: in_progress.into(),
            created_at_field: created_at_field.into(),
            next_attempt_at_field: next_attempt_at_field.into(),
            schedule_field: None,
            attempts_field: "attempts".to_string(),
            claimed_at_field: None,
        }
    }

    /// Secondary "not before" field; rows are claimable once it is null or due.
    pub fn with_schedule(mut self, field: impl Into<String>) -> Self {
        self.schedule_field = Some(field.into());
        self
    }

    pub fn with_attempts(mut self, field: impl Into<String>) -> Self {
        self.attempts_field = field.into();
        self
    }

    /// Stamp claims with their time; enables stale-claim release.
    pub fn with_claimed_at(mut self, field: impl Into<String>) -> Self {
        self.claimed_at_field = Some(field.into());
        self
    }

    pub fn status_field(&self) -> &str {
        &self.status_field
    }

    pub fn pending(&self) -> &Value {
        &self.pending
    }

    pub fn in_progress(&self) -> &Value {
        &self.in_progress
    }

    pub fn attempts_field(&self) -> &str {
        &self.attempts_field
    }

    pub fn next_attempt_at_field(&self) -> &str {
        &self.next_attempt_at_field
    }

    pub fn claimed_at_field(&self) -> Option<&str> {
        self.claimed_at_field.as_deref()
    }

    /// The columns `mark_failure` writes.
    pub fn backoff_columns(&self) -> BackoffColumns {
        BackoffColumns::new(
            &self.attempts_field,
            &self.next_attempt_at_field,
            &self.status_field,
            self.pending.clone(),
        )
    }

    /// Check every field against the table and build the claim statement
    /// template (limit and time are filled per call).
    pub(crate) fn resolve(
        &self,
        descriptor: &TableDescriptor,
        resolver: &ColumnResolver,
    ) -> StoreResult<ClaimStatement> {
        let fields = [
            Some(&self.status_field),
            Some(&self.created_at_field),
            Some(&self.next_attempt_at_field),
            Some(&self.attempts_field),
            self.schedule_field.as_ref(),
            self.claimed_at_field.as_ref(),
        ];
        for field in fields.into_iter().flatten() {
            if field == descriptor.tenant_field() || field == descriptor.id_field() {
                return Err(StoreError::configuration(format!(
                    "claim field '{field}' on '{}' cannot be the id or tenant field",
                    descriptor.table()
                )));
            }
        }
        if self.pending.is_null() || self.in_progress.is_null() || self.pending == self.in_progress {
            return Err(StoreError::configuration(
                "pending and in-progress status values must be distinct and non-null",
            ));
        }

        let column = |field: &str| resolver.column(field).map(str::to_string);
        resolver.column(&self.attempts_field)?;
        Ok(ClaimStatement {
            status_column: column(&self.status_field)?,
            pending: self.pending.clone(),
            in_progress: self.in_progress.clone(),
            created_at_column: column(&self.created_at_field)?,
            next_attempt_at_column: column(&self.next_attempt_at_field)?,
            schedule_column: self.schedule_field.as_deref().map(column).transpose()?,
            claimed_at_column: self.claimed_at_field.as_deref().map(column).transpose()?,
            limit: 0,
            now: DateTime::<Utc>::MIN_UTC,
        })
    }
}

/// Fields written when a failed row is rescheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffColumns {
    pub attempts: String,
    pub next_attempt_at: String,
    pub status: String,
    pub pending: Value,
}

impl BackoffColumns {
    pub fn new(
        attempts: impl Into<String>,
        next_attempt_at: impl Into<String>,
        status: impl Into<String>,
        pending: impl Into<Value>,
    ) -> Self {
        Self {
            attempts: attempts.into(),
            next_attempt_at: next_attempt_at.into(),
            status: status.into(),
            pending: pending.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::NamingConvention;

    fn jobs() -> TableDescriptor {
        TableDescriptor::new(
            "jobs",
            ["id", "tenantId", "status", "attempts", "createdAt", "nextAttemptAt", "claimedAt"],
        )
        .with_convention(NamingConvention::SnakeCase)
        .with_tenant_field("tenantId")
    }

    #[test]
    fn resolves_columns_through_the_convention() {
        let descriptor = jobs();
        let (resolver, _) = descriptor.resolve().unwrap();
        let statement = ClaimConfig::new("status", "PENDING", "IN_PROGRESS", "createdAt", "nextAttemptAt")
            .with_claimed_at("claimedAt")
            .resolve(&descriptor, &resolver)
            .unwrap();

        assert_eq!(statement.status_column, "status");
        assert_eq!(statement.created_at_column, "created_at");
        assert_eq!(statement.next_attempt_at_column, "next_attempt_at");
        assert_eq!(statement.claimed_at_column.as_deref(), Some("claimed_at"));
        assert_eq!(statement.schedule_column, None);
    }

    #[test]
    fn undeclared_fields_are_rejected() {
        let descriptor = jobs();
        let (resolver, _) = descriptor.resolve().unwrap();
        let err = ClaimConfig::new("status", "PENDING", "IN_PROGRESS", "createdAt", "nextAttemptAt")
            .with_schedule("notBefore")
            .resolve(&descriptor, &resolver)
            .unwrap_err();
        assert_eq!(err, StoreError::unknown_field("jobs", "notBefore"));
    }

    #[test]
    fn status_values_must_differ() {
        let descriptor = jobs();
        let (resolver, _) = descriptor.resolve().unwrap();
        let err = ClaimConfig::new("status", "PENDING", "PENDING", "createdAt", "nextAttemptAt")
            .resolve(&descriptor, &resolver)
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn tenant_field_cannot_drive_claims() {
        let descriptor = jobs();
        let (resolver, _) = descriptor.resolve().unwrap();
        let err = ClaimConfig::new("tenantId", "A", "B", "createdAt", "nextAttemptAt")
            .resolve(&descriptor, &resolver)
            .unwrap_err();
        assert!(matches!(err, StoreError::Configuration(msg) if msg.contains("tenantId")));
    }
}
