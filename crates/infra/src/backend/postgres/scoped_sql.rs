//! Tenant-scoped raw SQL for bespoke joins and aggregates.

use sqlx::postgres::PgRow;
use sqlx::{Postgres, QueryBuilder};

use tenantgate_core::TenantId;

use crate::error::{StoreError, StoreResult};
use crate::filter::Direction;
use crate::schema::PhysicalTable;
use crate::value::Value;

use super::map_sqlx_error;
use super::statements::{push_value, quote_part, quote_table};

#[derive(Debug, Clone)]
enum Predicate {
    Raw(String),
    /// `lhs` followed by one bound value, e.g. `o.total >` + `$n`.
    Bound(String, Value),
}

/// SQL builder whose WHERE clause always starts with `alias.tenant = $1`.
///
/// Joins, select lists and extra predicates are raw SQL supplied by the
/// caller; joined tables are not scoped automatically, so join conditions
/// should carry the tenant column too.
///
/// ```ignore
/// let rows = store
///     .scoped_sql("o")?
///     .select("o.status")
///     .select("COUNT(*) AS n")
///     .and_where_bind("o.created_at >=", since)
///     .group_by("o.status")
///     .fetch_all(store.backend().pool())
///     .await?;
/// ```
#[derive(Debug, Clone)]
pub struct ScopedSql {
    table: String,
    alias: String,
    tenant_column: String,
    tenant_id: TenantId,
    soft_delete_column: Option<String>,
    select: Vec<String>,
    joins: Vec<String>,
    predicates: Vec<Predicate>,
    group_by: Vec<String>,
    order_by: Vec<String>,
    limit: Option<i64>,
}

impl ScopedSql {
    pub(crate) fn new(table: &PhysicalTable, alias: &str, tenant_id: TenantId) -> StoreResult<Self> {
        let valid = alias
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && alias.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            return Err(StoreError::configuration(format!(
                "'{alias}' is not a valid table alias"
            )));
        }

        Ok(Self {
            table: table.name.clone(),
            alias: alias.to_string(),
            tenant_column: table.tenant_column.clone(),
            tenant_id,
            soft_delete_column: table.soft_delete_column.clone(),
            select: Vec::new(),
            joins: Vec::new(),
            predicates: Vec::new(),
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        })
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Add a select-list expression. Defaults to `alias.*`.
    pub fn select(mut self, expr: impl Into<String>) -> Self {
        self.select.push(expr.into());
        self
    }

    /// Raw join clause, e.g. `JOIN parties p ON p.id = o.party_id AND p.tenant_id = o.tenant_id`.
    pub fn join(mut self, clause: impl Into<String>) -> Self {
        self.joins.push(clause.into());
        self
    }

    /// Raw predicate ANDed after the tenant predicate.
    pub fn and_where(mut self, predicate: impl Into<String>) -> Self {
        self.predicates.push(Predicate::Raw(predicate.into()));
        self
    }

    /// `lhs $n` with `value` bound, e.g. `and_where_bind("o.total >", 100)`.
    pub fn and_where_bind(mut self, lhs: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate::Bound(lhs.into(), value.into()));
        self
    }

    /// `alias.column = $n` (or `IS NULL` for a null value).
    pub fn and_where_eq(self, column: &str, value: impl Into<Value>) -> Self {
        let target = format!("{}.{}", self.alias, quote_part(column));
        match value.into() {
            Value::Null => self.and_where(format!("{target} IS NULL")),
            value => self.and_where_bind(format!("{target} ="), value),
        }
    }

    /// Include soft-deleted rows of the base table.
    pub fn with_deleted(mut self) -> Self {
        self.soft_delete_column = None;
        self
    }

    pub fn group_by(mut self, expr: impl Into<String>) -> Self {
        self.group_by.push(expr.into());
        self
    }

    pub fn order_by(mut self, expr: impl Into<String>, direction: Direction) -> Self {
        let direction = match direction {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        };
        self.order_by.push(format!("{} {direction}", expr.into()));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit as i64);
        self
    }

    /// Render into a query builder; the tenant is always bound as `$1`.
    pub fn build(&self) -> QueryBuilder<'static, Postgres> {
        let select = if self.select.is_empty() {
            format!("{}.*", self.alias)
        } else {
            self.select.join(", ")
        };
        let mut qb = QueryBuilder::new(format!(
            "SELECT {select} FROM {} AS {}",
            quote_table(&self.table),
            self.alias
        ));
        for join in &self.joins {
            qb.push(" ").push(join);
        }

        qb.push(format!(
            " WHERE {}.{} = ",
            self.alias,
            quote_part(&self.tenant_column)
        ));
        qb.push_bind(*self.tenant_id.as_uuid());

        if let Some(deleted) = &self.soft_delete_column {
            qb.push(format!(" AND {}.{} IS NULL", self.alias, quote_part(deleted)));
        }
        for predicate in &self.predicates {
            qb.push(" AND (");
            match predicate {
                Predicate::Raw(sql) => {
                    qb.push(sql);
                }
                Predicate::Bound(lhs, value) => {
                    qb.push(lhs).push(" ");
                    push_value(&mut qb, value);
                }
            }
            qb.push(")");
        }

        if !self.group_by.is_empty() {
            qb.push(" GROUP BY ").push(self.group_by.join(", "));
        }
        if !self.order_by.is_empty() {
            qb.push(" ORDER BY ").push(self.order_by.join(", "));
        }
        if let Some(limit) = self.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }
        qb
    }

    /// Run on any Postgres executor (pool, connection or transaction).
    pub async fn fetch_all<'e, E>(&self, executor: E) -> StoreResult<Vec<PgRow>>
    where
        E: sqlx::Executor<'e, Database = Postgres>,
    {
        let mut qb = self.build();
        qb.build()
            .fetch_all(executor)
            .await
            .map_err(|e| map_sqlx_error("scoped_sql", e))
    }
}
