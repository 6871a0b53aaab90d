//! Logical field → physical column resolution.

use std::collections::HashMap;

use serde_json::{Map, Value as JsonValue};

use crate::error::{StoreError, StoreResult};

/// How logical (Rust/serde) field names translate to column names when no
/// explicit override is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NamingConvention {
    /// Column name equals the field name.
    #[default]
    Identity,
    /// `createdAt` → `created_at`.
    SnakeCase,
    /// `created_at` → `createdAt`.
    CamelCase,
}

impl NamingConvention {
    pub fn apply(&self, field: &str) -> String {
        match self {
            NamingConvention::Identity => field.to_string(),
            NamingConvention::SnakeCase => to_snake_case(field),
            NamingConvention::CamelCase => to_camel_case(field),
        }
    }
}

fn to_snake_case(field: &str) -> String {
    let chars: Vec<char> = field.chars().collect();
    let mut out = String::with_capacity(field.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev = i.checked_sub(1).map(|p| chars[p]);
            let next = chars.get(i + 1).copied();
            let boundary = match prev {
                Some(p) if p.is_ascii_lowercase() || p.is_ascii_digit() => true,
                // Acronym end: the `S` in `HTTPStatus` starts a new word.
                Some(p) if p.is_ascii_uppercase() => next.is_some_and(|n| n.is_ascii_lowercase()),
                _ => false,
            };
            if boundary && !out.ends_with('_') {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }
    out
}

fn to_camel_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut upper_next = false;
    for c in field.chars() {
        if c == '_' {
            upper_next = !out.is_empty();
        } else if upper_next {
            out.push(c.to_ascii_uppercase());
            upper_next = false;
        } else {
            out.push(c);
        }
    }
    out
}

/// Maps the declared fields of one record type to physical columns.
///
/// Pure and immutable once built. Any reference to an undeclared field is a
/// configuration error raised at call time.
#[derive(Debug, Clone)]
pub struct ColumnResolver {
    table: String,
    fields: Vec<String>,
    to_column: HashMap<String, String>,
    to_field: HashMap<String, String>,
}

impl ColumnResolver {
    pub fn new<I, S>(
        table: impl Into<String>,
        fields: I,
        convention: NamingConvention,
        overrides: &[(String, String)],
    ) -> StoreResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let table = table.into();
        if table.trim().is_empty() {
            return Err(StoreError::configuration("table name cannot be empty"));
        }

        let fields: Vec<String> = fields.into_iter().map(Into::into).collect();
        let mut to_column = HashMap::with_capacity(fields.len());
        let mut to_field = HashMap::with_capacity(fields.len());

        for (field, _) in overrides {
            if !fields.contains(field) {
                return Err(StoreError::unknown_field(&table, field));
            }
        }

        for field in &fields {
            let column = overrides
                .iter()
                .find(|(f, _)| f == field)
                .map(|(_, c)| c.clone())
                .unwrap_or_else(|| convention.apply(field));

            if column.is_empty() {
                return Err(StoreError::configuration(format!(
                    "field '{field}' on '{table}' resolves to an empty column name"
                )));
            }
            if let Some(previous) = to_field.insert(column.clone(), field.clone()) {
                return Err(StoreError::configuration(format!(
                    "fields '{previous}' and '{field}' on '{table}' both map to column '{column}'"
                )));
            }
            if to_column.insert(field.clone(), column).is_some() {
                return Err(StoreError::configuration(format!(
                    "field '{field}' declared twice on '{table}'"
                )));
            }
        }

        Ok(Self {
            table,
            fields,
            to_column,
            to_field,
        })
    }

    /// Physical table identifier (possibly schema-qualified).
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }

    /// Physical column for a logical field.
    pub fn column(&self, field: &str) -> StoreResult<&str> {
        self.to_column
            .get(field)
            .map(String::as_str)
            .ok_or_else(|| StoreError::unknown_field(&self.table, field))
    }

    /// Logical field for a physical column, if declared.
    pub fn field(&self, column: &str) -> Option<&str> {
        self.to_field.get(column).map(String::as_str)
    }

    /// Re-key a serialized record from field names to column names.
    pub fn to_physical(&self, logical: Map<String, JsonValue>) -> StoreResult<Map<String, JsonValue>> {
        let mut row = Map::with_capacity(logical.len());
        for (field, value) in logical {
            let column = self.column(&field)?;
            row.insert(column.to_string(), value);
        }
        Ok(row)
    }

    /// Re-key a stored row from column names to field names.
    ///
    /// Columns the record type does not declare are dropped.
    pub fn to_logical(&self, physical: Map<String, JsonValue>) -> Map<String, JsonValue> {
        physical
            .into_iter()
            .filter_map(|(column, value)| self.field(&column).map(|f| (f.to_string(), value)))
            .collect()
    }
}
