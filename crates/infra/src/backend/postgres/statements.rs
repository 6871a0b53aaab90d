//! SQL text for the Postgres backend.
//!
//! Pure builders: nothing here touches a connection, so the generated SQL is
//! asserted directly in tests. Every scoped statement starts its WHERE clause
//! with the tenant predicate bound as `$1`.

use sqlx::{Postgres, QueryBuilder};

use tenantgate_core::TenantId;

use crate::backend::{ClaimStatement, Row, Select};
use crate::filter::{Assignment, ColumnCondition, Direction, Op};
use crate::schema::PhysicalTable;
use crate::value::Value;

/// Row alias used by generated statements.
pub(crate) const ALIAS: &str = "tg_row";
/// Output column carrying each row as a JSON object.
pub(crate) const DOC: &str = "doc";

const CLAIMED: &str = "tg_claimed";
const CANDIDATES: &str = "tg_candidates";

/// Quote one identifier part.
pub(crate) fn quote_part(part: &str) -> String {
    format!("\"{}\"", part.replace('"', "\"\""))
}

/// Quote a possibly schema-qualified table name (`app.outbox` → `"app"."outbox"`).
pub(crate) fn quote_table(name: &str) -> String {
    name.split('.').map(quote_part).collect::<Vec<_>>().join(".")
}

fn column(alias: &str, column: &str) -> String {
    format!("{alias}.{}", quote_part(column))
}

pub(crate) fn push_value(qb: &mut QueryBuilder<'static, Postgres>, value: &Value) {
    match value {
        Value::Null => {
            qb.push("NULL");
        }
        Value::Bool(b) => {
            qb.push_bind(*b);
        }
        Value::Int(i) => {
            qb.push_bind(*i);
        }
        Value::Float(f) => {
            qb.push_bind(*f);
        }
        Value::Text(s) => {
            qb.push_bind(s.clone());
        }
        Value::Uuid(u) => {
            qb.push_bind(*u);
        }
        Value::Timestamp(t) => {
            qb.push_bind(*t);
        }
        Value::Json(v) => {
            qb.push_bind(sqlx::types::Json(v.clone()));
        }
    }
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Bind `value` against `column` of `table`.
///
/// A string binds as `text`, which Postgres will not compare with or assign
/// to uuid, timestamptz or enum columns. Strings are therefore read through
/// the table's row type so the column's own input function parses them.
fn push_column_value(
    qb: &mut QueryBuilder<'static, Postgres>,
    table: &PhysicalTable,
    column: &str,
    value: &Value,
) {
    match value {
        Value::Text(s) => {
            qb.push(format!(
                "(jsonb_populate_record(NULL::{}, jsonb_build_object({}, ",
                quote_table(&table.name),
                quote_literal(column)
            ));
            qb.push_bind(s.clone());
            qb.push(format!("::text))).{}", quote_part(column)));
        }
        other => push_value(qb, other),
    }
}

fn push_condition(
    qb: &mut QueryBuilder<'static, Postgres>,
    alias: &str,
    table: &PhysicalTable,
    condition: &ColumnCondition,
) {
    let target = column(alias, &condition.column);
    let (symbol, value) = match &condition.op {
        Op::IsNull => {
            qb.push(format!("{target} IS NULL"));
            return;
        }
        Op::IsNotNull => {
            qb.push(format!("{target} IS NOT NULL"));
            return;
        }
        Op::In(values) if values.is_empty() => {
            qb.push("FALSE");
            return;
        }
        Op::In(values) => {
            qb.push(format!("{target} IN ("));
            for (i, v) in values.iter().enumerate() {
                if i > 0 {
                    qb.push(", ");
                }
                push_column_value(qb, table, &condition.column, v);
            }
            qb.push(")");
            return;
        }
        Op::Eq(v) => ("=", v),
        Op::Ne(v) => ("<>", v),
        Op::Lt(v) => ("<", v),
        Op::Lte(v) => ("<=", v),
        Op::Gt(v) => (">", v),
        Op::Gte(v) => (">=", v),
    };
    qb.push(format!("{target} {symbol} "));
    push_column_value(qb, table, &condition.column, value);
}

/// ` WHERE alias.tenant = $1 AND ...`
fn push_scope(
    qb: &mut QueryBuilder<'static, Postgres>,
    alias: &str,
    table: &PhysicalTable,
    tenant_id: TenantId,
    conditions: &[ColumnCondition],
) {
    qb.push(format!(" WHERE {} = ", column(alias, &table.tenant_column)));
    qb.push_bind(*tenant_id.as_uuid());
    for condition in conditions {
        qb.push(" AND ");
        push_condition(qb, alias, table, condition);
    }
}

fn direction(d: Direction) -> &'static str {
    match d {
        Direction::Asc => "ASC",
        Direction::Desc => "DESC",
    }
}

pub(crate) fn select(
    table: &PhysicalTable,
    tenant_id: TenantId,
    query: &Select,
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "SELECT to_jsonb({ALIAS}) AS {DOC} FROM {} AS {ALIAS}",
        quote_table(&table.name)
    ));
    push_scope(&mut qb, ALIAS, table, tenant_id, &query.conditions);

    if !query.order.is_empty() {
        let order = query
            .order
            .iter()
            .map(|(c, d)| format!("{} {}", column(ALIAS, c), direction(*d)))
            .collect::<Vec<_>>()
            .join(", ");
        qb.push(format!(" ORDER BY {order}"));
    }
    if let Some(limit) = query.limit {
        qb.push(" LIMIT ").push_bind(limit as i64);
    }
    if let Some(offset) = query.offset {
        qb.push(" OFFSET ").push_bind(offset as i64);
    }
    qb
}

pub(crate) fn count(
    table: &PhysicalTable,
    tenant_id: TenantId,
    conditions: &[ColumnCondition],
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "SELECT COUNT(*) FROM {} AS {ALIAS}",
        quote_table(&table.name)
    ));
    push_scope(&mut qb, ALIAS, table, tenant_id, conditions);
    qb
}

/// Multi-row insert of rows sharing the same column set.
///
/// Rows travel as one jsonb array expanded by `jsonb_populate_recordset`,
/// so each column is typed by the table itself. With `upsert`, an id
/// conflict updates the existing row only when it belongs to the same
/// tenant; otherwise the row is silently skipped and missing from
/// `RETURNING`.
pub(crate) fn insert(
    table: &PhysicalTable,
    columns: &[String],
    rows: Vec<Row>,
    upsert: bool,
) -> QueryBuilder<'static, Postgres> {
    let name = quote_table(&table.name);
    let column_list = columns.iter().map(|c| quote_part(c)).collect::<Vec<_>>().join(", ");

    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {name} AS {ALIAS} ({column_list}) SELECT {column_list} \
         FROM jsonb_populate_recordset(NULL::{name}, "
    ));
    let payload = serde_json::Value::Array(rows.into_iter().map(serde_json::Value::Object).collect());
    qb.push_bind(sqlx::types::Json(payload));
    qb.push("::jsonb)");

    if upsert {
        let id = quote_part(&table.id_column);
        let mut set: Vec<String> = columns
            .iter()
            .filter(|c| **c != table.id_column)
            .map(|c| format!("{0} = EXCLUDED.{0}", quote_part(c)))
            .collect();
        if set.is_empty() {
            set.push(format!("{id} = EXCLUDED.{id}"));
        }
        qb.push(format!(
            " ON CONFLICT ({id}) DO UPDATE SET {} WHERE {} = EXCLUDED.{}",
            set.join(", "),
            column(ALIAS, &table.tenant_column),
            quote_part(&table.tenant_column),
        ));
    }

    qb.push(format!(" RETURNING to_jsonb({ALIAS}) AS {DOC}"));
    qb
}

pub(crate) fn update(
    table: &PhysicalTable,
    tenant_id: TenantId,
    conditions: &[ColumnCondition],
    assignments: &[Assignment],
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "UPDATE {} AS {ALIAS} SET ",
        quote_table(&table.name)
    ));
    if assignments.is_empty() {
        let id = quote_part(&table.id_column);
        qb.push(format!("{id} = {}", column(ALIAS, &table.id_column)));
    }
    for (i, a) in assignments.iter().enumerate() {
        if i > 0 {
            qb.push(", ");
        }
        qb.push(format!("{} = ", quote_part(&a.column)));
        push_column_value(&mut qb, table, &a.column, &a.value);
    }
    push_scope(&mut qb, ALIAS, table, tenant_id, conditions);
    qb.push(format!(" RETURNING to_jsonb({ALIAS}) AS {DOC}"));
    qb
}

pub(crate) fn delete(
    table: &PhysicalTable,
    tenant_id: TenantId,
    conditions: &[ColumnCondition],
) -> QueryBuilder<'static, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "DELETE FROM {} AS {ALIAS}",
        quote_table(&table.name)
    ));
    push_scope(&mut qb, ALIAS, table, tenant_id, conditions);
    qb
}

/// The claim: a skip-locked candidate CTE feeding a single `UPDATE`.
pub(crate) fn claim(
    table: &PhysicalTable,
    tenant_id: TenantId,
    claim: &ClaimStatement,
) -> QueryBuilder<'static, Postgres> {
    let name = quote_table(&table.name);
    let id = quote_part(&table.id_column);

    let mut qb = QueryBuilder::new(format!(
        "WITH {CANDIDATES} AS (SELECT {} FROM {name} AS {ALIAS}",
        column(ALIAS, &table.id_column)
    ));
    push_scope(&mut qb, ALIAS, table, tenant_id, &[]);

    qb.push(format!(" AND {} = ", column(ALIAS, &claim.status_column)));
    push_column_value(&mut qb, table, &claim.status_column, &claim.pending);

    let due = std::iter::once(&claim.next_attempt_at_column).chain(claim.schedule_column.as_ref());
    for c in due {
        let target = column(ALIAS, c);
        qb.push(format!(" AND ({target} IS NULL OR {target} <= "));
        qb.push_bind(claim.now);
        qb.push(")");
    }
    if let Some(deleted) = &table.soft_delete_column {
        qb.push(format!(" AND {} IS NULL", column(ALIAS, deleted)));
    }

    qb.push(format!(
        " ORDER BY {} ASC, {} ASC LIMIT ",
        column(ALIAS, &claim.created_at_column),
        column(ALIAS, &table.id_column)
    ));
    qb.push_bind(claim.limit as i64);
    qb.push(" FOR UPDATE SKIP LOCKED)");

    qb.push(format!(
        " UPDATE {name} AS {CLAIMED} SET {} = ",
        quote_part(&claim.status_column)
    ));
    push_column_value(&mut qb, table, &claim.status_column, &claim.in_progress);
    if let Some(claimed_at) = &claim.claimed_at_column {
        qb.push(format!(", {} = ", quote_part(claimed_at)));
        qb.push_bind(claim.now);
    }

    qb.push(format!(
        " FROM {CANDIDATES} WHERE {CLAIMED}.{id} = {CANDIDATES}.{id} AND {} = ",
        column(CLAIMED, &table.tenant_column)
    ));
    qb.push_bind(*tenant_id.as_uuid());
    qb.push(format!(" RETURNING to_jsonb({CLAIMED}) AS {DOC}"));
    qb
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn table() -> PhysicalTable {
        PhysicalTable {
            name: "app.outbox".into(),
            id_column: "id".into(),
            tenant_column: "tenant_id".into(),
            soft_delete_column: Some("deleted_at".into()),
            unique_keys: vec![],
        }
    }

    #[test]
    fn identifiers_are_quoted_per_part() {
        assert_eq!(quote_table("app.outbox"), r#""app"."outbox""#);
        assert_eq!(quote_part(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn select_leads_with_tenant_predicate() {
        let query = Select {
            conditions: vec![
                ColumnCondition { column: "status".into(), op: Op::Eq(Value::from("PENDING")) },
                ColumnCondition { column: "kind".into(), op: Op::In(vec![]) },
                ColumnCondition { column: "deleted_at".into(), op: Op::IsNull },
            ],
            order: vec![("created_at".into(), Direction::Desc)],
            limit: Some(10),
            offset: None,
        };
        let qb = select(&table(), TenantId::new(), &query);
        assert_eq!(
            qb.sql(),
            r#"SELECT to_jsonb(tg_row) AS doc FROM "app"."outbox" AS tg_row WHERE tg_row."tenant_id" = $1 AND tg_row."status" = (jsonb_populate_record(NULL::"app"."outbox", jsonb_build_object('status', $2::text)))."status" AND FALSE AND tg_row."deleted_at" IS NULL ORDER BY tg_row."created_at" DESC LIMIT $3"#
        );
    }

    #[test]
    fn upsert_only_updates_same_tenant_rows() {
        let row = json!({"id": 1, "tenant_id": "t", "body": "x"}).as_object().cloned().unwrap();
        let columns = vec!["id".to_string(), "tenant_id".to_string(), "body".to_string()];
        let qb = insert(&table(), &columns, vec![row], true);
        let sql = qb.sql();
        assert!(sql.starts_with(r#"INSERT INTO "app"."outbox" AS tg_row ("id", "tenant_id", "body") SELECT "id", "tenant_id", "body" FROM jsonb_populate_recordset(NULL::"app"."outbox", $1::jsonb)"#));
        assert!(sql.contains(r#"ON CONFLICT ("id") DO UPDATE SET "tenant_id" = EXCLUDED."tenant_id", "body" = EXCLUDED."body" WHERE tg_row."tenant_id" = EXCLUDED."tenant_id""#));
        assert!(sql.ends_with("RETURNING to_jsonb(tg_row) AS doc"));
    }

    #[test]
    fn update_binds_values_after_tenant() {
        let qb = update(
            &table(),
            TenantId::new(),
            &[ColumnCondition { column: "id".into(), op: Op::Eq(Value::Int(4)) }],
            &[
                Assignment { column: "status".into(), value: Value::from("DONE") },
                Assignment { column: "error".into(), value: Value::Null },
            ],
        );
        assert_eq!(
            qb.sql(),
            r#"UPDATE "app"."outbox" AS tg_row SET "status" = (jsonb_populate_record(NULL::"app"."outbox", jsonb_build_object('status', $1::text)))."status", "error" = NULL WHERE tg_row."tenant_id" = $2 AND tg_row."id" = $3 RETURNING to_jsonb(tg_row) AS doc"#
        );
    }

    #[test]
    fn string_keys_are_typed_by_the_column() {
        let qb = update(
            &table(),
            TenantId::new(),
            &[
                ColumnCondition {
                    column: "id".into(),
                    op: Op::Eq(Value::from("0192d3c4-5e6f-7a8b-9c0d-1e2f3a4b5c6d")),
                },
                ColumnCondition {
                    column: "it's".into(),
                    op: Op::In(vec![Value::from("a"), Value::Int(2)]),
                },
            ],
            &[],
        );
        assert_eq!(
            qb.sql(),
            concat!(
                r#"UPDATE "app"."outbox" AS tg_row SET "id" = tg_row."id" WHERE tg_row."tenant_id" = $1"#,
                r#" AND tg_row."id" = (jsonb_populate_record(NULL::"app"."outbox", jsonb_build_object('id', $2::text)))."id""#,
                r#" AND tg_row."it's" IN ((jsonb_populate_record(NULL::"app"."outbox", jsonb_build_object('it''s', $3::text)))."it's", $4)"#,
                r#" RETURNING to_jsonb(tg_row) AS doc"#,
            )
        );
    }

    #[test]
    fn claim_is_one_skip_locked_statement() {
        let statement = ClaimStatement {
            status_column: "status".into(),
            pending: Value::from("PENDING"),
            in_progress: Value::from("IN_PROGRESS"),
            created_at_column: "created_at".into(),
            next_attempt_at_column: "next_attempt_at".into(),
            schedule_column: Some("not_before".into()),
            claimed_at_column: Some("claimed_at".into()),
            limit: 2,
            now: Utc::now(),
        };
        let qb = claim(&table(), TenantId::new(), &statement);
        assert_eq!(
            qb.sql(),
            concat!(
                r#"WITH tg_candidates AS (SELECT tg_row."id" FROM "app"."outbox" AS tg_row"#,
                r#" WHERE tg_row."tenant_id" = $1"#,
                r#" AND tg_row."status" = (jsonb_populate_record(NULL::"app"."outbox", jsonb_build_object('status', $2::text)))."status""#,
                r#" AND (tg_row."next_attempt_at" IS NULL OR tg_row."next_attempt_at" <= $3)"#,
                r#" AND (tg_row."not_before" IS NULL OR tg_row."not_before" <= $4)"#,
                r#" AND tg_row."deleted_at" IS NULL"#,
                r#" ORDER BY tg_row."created_at" ASC, tg_row."id" ASC LIMIT $5 FOR UPDATE SKIP LOCKED)"#,
                r#" UPDATE "app"."outbox" AS tg_claimed"#,
                r#" SET "status" = (jsonb_populate_record(NULL::"app"."outbox", jsonb_build_object('status', $6::text)))."status","#,
                r#" "claimed_at" = $7"#,
                r#" FROM tg_candidates WHERE tg_claimed."id" = tg_candidates."id" AND tg_claimed."tenant_id" = $8"#,
                r#" RETURNING to_jsonb(tg_claimed) AS doc"#,
            )
        );
    }
}
