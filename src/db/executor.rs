//! Statement execution.
//!
//! Every function here runs inside an implicit connection scope, so a call made
//! outside any scope opens a connection, runs its statement and closes it again,
//! while calls inside an enclosing scope share the unit's connection.
//!
//! Statements use `?` positional placeholders whatever the backend.
//! [`update`] and [`insert`] commit immediately when no transaction is open.

use crate::db::context::{self, Cursor, current_transaction_depth};
use crate::db::driver::SqlSyntax;
use crate::db::params::translate_placeholders;
use crate::db::scope::with_connection;
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, ResultSet, Row};
use serde_json::Value as JsonValue;
use std::time::Instant;
use tracing::{debug, warn};

async fn run_query(sql: &str, params: &[QueryParam]) -> DbResult<ResultSet> {
    let mut cursor = Cursor::acquire().await?;
    let native = translate_placeholders(sql, params.len(), cursor.syntax())?;

    debug!(sql = %sql, params = params.len(), "Executing query");
    let start = Instant::now();
    let result = match cursor.query(&native, params).await {
        Ok(result) => result,
        Err(e) => {
            drop(cursor);
            rollback_outside_transaction().await;
            return Err(e);
        }
    };
    debug!(
        rows = result.len(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Query finished"
    );
    Ok(result)
}

/// After a failed statement at depth 0, end the implicit physical transaction so
/// the next statement of the unit does not inherit an aborted one. Best effort: the
/// statement's own error is what the caller sees.
async fn rollback_outside_transaction() {
    if current_transaction_depth() != 0 {
        return;
    }
    if let Err(rollback_error) = context::rollback().await {
        warn!(error = %rollback_error, "Rollback after failed statement failed");
    }
}

/// Run a write statement on `cursor`, auto-committing outside transactions.
async fn run_update(mut cursor: Cursor, sql: &str, params: &[QueryParam]) -> DbResult<u64> {
    let native = translate_placeholders(sql, params.len(), cursor.syntax())?;

    debug!(sql = %sql, params = params.len(), "Executing statement");
    let start = Instant::now();
    let affected = match cursor.execute(&native, params).await {
        Ok(affected) => affected,
        Err(e) => {
            drop(cursor);
            rollback_outside_transaction().await;
            return Err(e);
        }
    };
    debug!(
        rows_affected = affected,
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Statement finished"
    );

    // Hand the connection back before committing through the context.
    drop(cursor);
    if current_transaction_depth() == 0 {
        debug!("No open transaction; auto-committing");
        context::commit_or_rollback().await?;
    }
    Ok(affected)
}

/// Run a query and return every row.
pub async fn select(sql: &str, params: &[QueryParam]) -> DbResult<Vec<Row>> {
    with_connection(|| async { Ok(run_query(sql, params).await?.into_rows()) }).await
}

/// Run a query and return its first row, or `None` when nothing matched.
pub async fn select_one(sql: &str, params: &[QueryParam]) -> DbResult<Option<Row>> {
    with_connection(|| async { Ok(run_query(sql, params).await?.into_first()) }).await
}

/// Run a single-column query and return the value of its first row.
///
/// Returns `None` when nothing matched and `MultiColumn` when the result has more
/// than one column.
pub async fn select_scalar(sql: &str, params: &[QueryParam]) -> DbResult<Option<JsonValue>> {
    let Some(row) = select_one(sql, params).await? else {
        return Ok(None);
    };
    if row.len() != 1 {
        return Err(DbError::MultiColumn { columns: row.len() });
    }
    Ok(row.into_values().into_iter().next())
}

/// Like [`select_scalar`], for integer results such as `count(*)`.
///
/// A SQL `NULL` reads as `None`. Integer-valued strings are accepted, since some
/// backends return aggregates as decimals.
pub async fn select_int(sql: &str, params: &[QueryParam]) -> DbResult<Option<i64>> {
    match select_scalar(sql, params).await? {
        None | Some(JsonValue::Null) => Ok(None),
        Some(value) => scalar_to_i64(&value).map(Some),
    }
}

fn scalar_to_i64(value: &JsonValue) -> DbResult<i64> {
    let parsed = match value {
        JsonValue::Number(n) => n.as_i64(),
        JsonValue::String(s) => s.trim().parse::<i64>().ok(),
        JsonValue::Bool(b) => Some(i64::from(*b)),
        _ => None,
    };
    parsed.ok_or_else(|| DbError::unexpected_type("integer", json_type_name(value)))
}

fn json_type_name(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "null".to_string(),
        JsonValue::Bool(_) => "boolean".to_string(),
        JsonValue::Number(n) => format!("number {}", n),
        JsonValue::String(s) => format!("string {:?}", s),
        JsonValue::Array(_) => "array".to_string(),
        JsonValue::Object(_) => "object".to_string(),
    }
}

/// Run a write statement and return the affected-row count.
///
/// Outside a transaction the statement is committed immediately; inside one it is
/// left for the outermost transaction scope to commit or roll back.
pub async fn update(sql: &str, params: &[QueryParam]) -> DbResult<u64> {
    with_connection(|| async {
        let cursor = Cursor::acquire().await?;
        run_update(cursor, sql, params).await
    })
    .await
}

/// Insert one row built from `(column, value)` pairs.
///
/// Table and column names are quoted for the connected backend.
pub async fn insert(table: &str, fields: &[(&str, QueryParam)]) -> DbResult<u64> {
    if fields.is_empty() {
        return Err(DbError::invalid_input(format!(
            "insert into {} needs at least one field",
            table
        )));
    }

    with_connection(|| async {
        let cursor = Cursor::acquire().await?;
        let sql = build_insert(&cursor.syntax(), table, fields);
        let params: Vec<QueryParam> = fields.iter().map(|(_, value)| value.clone()).collect();
        run_update(cursor, &sql, &params).await
    })
    .await
}

fn build_insert(
    syntax: &SqlSyntax,
    table: &str,
    fields: &[(&str, QueryParam)],
) -> String {
    let columns: Vec<String> = fields
        .iter()
        .map(|(name, _)| syntax.quote_identifier(name))
        .collect();
    let placeholders = vec!["?"; fields.len()].join(", ");
    format!(
        "insert into {} ({}) values ({})",
        syntax.quote_identifier(table),
        columns.join(", "),
        placeholders
    )
}
