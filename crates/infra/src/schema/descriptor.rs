//! Table descriptors and the `Record` contract.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{StoreError, StoreResult};

use super::columns::{ColumnResolver, NamingConvention};

/// A row type stored in a tenant-partitioned table.
///
/// Records move through the store as serde values, so any attribute beyond
/// the id and tenant fields is opaque to the engine. The descriptor is
/// read once per store; it is not consulted per call.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    fn descriptor() -> TableDescriptor;
}

/// Declaration of one record type's physical layout.
///
/// Field names are the serde (logical) names of the record; columns are
/// derived through the naming convention unless overridden.
#[derive(Debug, Clone)]
pub struct TableDescriptor {
    table: String,
    fields: Vec<String>,
    id_field: String,
    tenant_field: String,
    soft_delete_field: Option<String>,
    unique_keys: Vec<Vec<String>>,
    convention: NamingConvention,
    overrides: Vec<(String, String)>,
}

impl TableDescriptor {
    pub fn new<I, S>(table: impl Into<String>, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            table: table.into(),
            fields: fields.into_iter().map(Into::into).collect(),
            id_field: "id".to_string(),
            tenant_field: "tenant_id".to_string(),
            soft_delete_field: None,
            unique_keys: Vec::new(),
            convention: NamingConvention::Identity,
            overrides: Vec::new(),
        }
    }

    pub fn with_id_field(mut self, field: impl Into<String>) -> Self {
        self.id_field = field.into();
        self
    }

    pub fn with_tenant_field(mut self, field: impl Into<String>) -> Self {
        self.tenant_field = field.into();
        self
    }

    /// Nullable timestamp field marking soft-deleted rows.
    pub fn with_soft_delete(mut self, field: impl Into<String>) -> Self {
        self.soft_delete_field = Some(field.into());
        self
    }

    /// Declare a unique key (set of fields).
    ///
    /// Postgres enforces these through its own constraints; the declaration
    /// lets the in-memory backend reproduce the same conflicts.
    pub fn with_unique<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.unique_keys
            .push(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_convention(mut self, convention: NamingConvention) -> Self {
        self.convention = convention;
        self
    }

    pub fn with_column(mut self, field: impl Into<String>, column: impl Into<String>) -> Self {
        self.overrides.push((field.into(), column.into()));
        self
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn id_field(&self) -> &str {
        &self.id_field
    }

    pub fn tenant_field(&self) -> &str {
        &self.tenant_field
    }

    pub fn soft_delete_field(&self) -> Option<&str> {
        self.soft_delete_field.as_deref()
    }

    /// Build the column resolver and the physical view of this table.
    ///
    /// Fails if any field referenced by the descriptor itself is undeclared.
    pub fn resolve(&self) -> StoreResult<(ColumnResolver, PhysicalTable)> {
        let resolver = ColumnResolver::new(
            self.table.clone(),
            self.fields.iter().cloned(),
            self.convention,
            &self.overrides,
        )?;

        if self.id_field == self.tenant_field {
            return Err(StoreError::configuration(format!(
                "'{}' cannot be both id and tenant field",
                self.id_field
            )));
        }

        let id_column = resolver.column(&self.id_field)?.to_string();
        let tenant_column = resolver.column(&self.tenant_field)?.to_string();
        let soft_delete_column = self
            .soft_delete_field
            .as_deref()
            .map(|f| resolver.column(f).map(str::to_string))
            .transpose()?;

        let mut unique_keys = Vec::with_capacity(self.unique_keys.len());
        for key in &self.unique_keys {
            if key.is_empty() {
                return Err(StoreError::configuration("unique key with no fields"));
            }
            let columns = key
                .iter()
                .map(|f| resolver.column(f).map(str::to_string))
                .collect::<StoreResult<Vec<_>>>()?;
            unique_keys.push(columns);
        }

        let physical = PhysicalTable {
            name: resolver.table().to_string(),
            id_column,
            tenant_column,
            soft_delete_column,
            unique_keys,
        };
        Ok((resolver, physical))
    }
}

/// Column-level view of a table handed to backends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhysicalTable {
    pub name: String,
    pub id_column: String,
    pub tenant_column: String,
    pub soft_delete_column: Option<String>,
    pub unique_keys: Vec<Vec<String>>,
}
