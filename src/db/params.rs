//! Statement parameters.
//!
//! Callers always write `?` positional placeholders. This module checks them against
//! the supplied parameters, rewrites them into the backend's native syntax, and binds
//! `QueryParam` values to database-specific sqlx queries.

use crate::db::driver::{PlaceholderStyle, SqlSyntax};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, QueryParam};
use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect, SQLiteDialect};
use sqlparser::tokenizer::{Token, Tokenizer};
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};
use std::borrow::Cow;
use tracing::debug;

/// Get the tokenizer dialect for the given database type.
fn get_dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::PostgreSQL => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
        DatabaseType::SQLite => Box::new(SQLiteDialect {}),
    }
}

/// Placeholders found in a statement, outside literals and comments.
struct PlaceholderScan {
    /// Byte offsets of bare `?` placeholders.
    question_marks: Vec<usize>,
    /// True if the statement also uses numbered or named placeholders.
    other_forms: bool,
}

fn scan_placeholders(sql: &str, db_type: DatabaseType) -> DbResult<PlaceholderScan> {
    let dialect = get_dialect(db_type);
    let tokens = Tokenizer::new(dialect.as_ref(), sql)
        .tokenize_with_location()
        .map_err(|e| DbError::invalid_input(format!("Failed to tokenize SQL: {}", e)))?;

    let line_starts: Vec<usize> = std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(idx, _)| idx + 1))
        .collect();

    let mut scan = PlaceholderScan {
        question_marks: Vec::new(),
        other_forms: false,
    };

    for token in tokens {
        match &token.token {
            Token::Placeholder(text) if text == "?" => {}
            Token::Placeholder(_) => {
                scan.other_forms = true;
                continue;
            }
            // Some dialects lex a lone `?` as an operator token.
            other if other.to_string() == "?" => {}
            _ => continue,
        }
        let line = token.span.start.line as usize;
        let column = token.span.start.column as usize;
        let offset = line
            .checked_sub(1)
            .and_then(|l| line_starts.get(l))
            .and_then(|&start| {
                sql[start..]
                    .char_indices()
                    .nth(column.saturating_sub(1))
                    .map(|(idx, _)| start + idx)
            })
            .filter(|&offset| sql[offset..].starts_with('?'))
            .ok_or_else(|| {
                DbError::internal(format!(
                    "Placeholder location {}:{} does not match statement text",
                    line, column
                ))
            })?;
        scan.question_marks.push(offset);
    }

    Ok(scan)
}

/// Rewrite `?` placeholders into the backend's native syntax.
///
/// Fails with `InvalidInput` when the number of `?` placeholders differs from
/// `param_count`. Statements that already use numbered or named placeholders are
/// passed through unchecked.
pub fn translate_placeholders<'a>(
    sql: &'a str,
    param_count: usize,
    syntax: SqlSyntax,
) -> DbResult<Cow<'a, str>> {
    if !sql.contains('?') {
        return Ok(Cow::Borrowed(sql));
    }

    let scan = match scan_placeholders(sql, syntax.database) {
        Ok(scan) => scan,
        Err(e) if syntax.placeholder == PlaceholderStyle::Question => {
            debug!(error = %e, "Could not scan statement; passing it through unchanged");
            return Ok(Cow::Borrowed(sql));
        }
        Err(e) => return Err(e),
    };

    if scan.other_forms {
        return Ok(Cow::Borrowed(sql));
    }

    if scan.question_marks.len() != param_count {
        return Err(DbError::invalid_input(format!(
            "Statement has {} placeholder(s) but {} parameter(s) were given",
            scan.question_marks.len(),
            param_count
        )));
    }

    match syntax.placeholder {
        PlaceholderStyle::Question => Ok(Cow::Borrowed(sql)),
        PlaceholderStyle::Dollar => {
            let mut out = String::with_capacity(sql.len() + scan.question_marks.len() * 2);
            let mut last = 0;
            for (n, offset) in scan.question_marks.iter().enumerate() {
                out.push_str(&sql[last..*offset]);
                out.push('$');
                out.push_str(&(n + 1).to_string());
                last = offset + 1;
            }
            out.push_str(&sql[last..]);
            Ok(Cow::Owned(out))
        }
    }
}

/// Bind a parameter to a MySQL query.
pub(crate) fn bind_mysql_param<'q>(
    query: sqlx::query::Query<'q, MySql, MySqlArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, MySql, MySqlArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_postgres_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a parameter to a SQLite query.
pub(crate) fn bind_sqlite_param<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match param {
        QueryParam::Null => query.bind(None::<String>),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
    }
}
