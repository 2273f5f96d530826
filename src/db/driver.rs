//! Driver seam.
//!
//! The scope engine only needs a handful of primitives from a database driver:
//! open a connection, run a statement, fetch its rows, commit, roll back and close.
//! `Driver` and `PhysicalConnection` describe exactly those, so the sqlx backends
//! and test doubles plug in the same way.

use crate::error::DbResult;
use crate::models::{DatabaseType, QueryParam, ResultSet};
use futures_util::future::BoxFuture;
use std::future::Future;

/// Native positional placeholder syntax of a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceholderStyle {
    /// `?` (MySQL, SQLite)
    Question,
    /// `$1`, `$2`, ... (PostgreSQL)
    Dollar,
}

/// The pieces of backend syntax the statement layer has to produce itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SqlSyntax {
    /// Dialect used when scanning statement text.
    pub database: DatabaseType,
    pub placeholder: PlaceholderStyle,
    pub identifier_quote: char,
}

impl SqlSyntax {
    pub const MYSQL: Self = Self {
        database: DatabaseType::MySQL,
        placeholder: PlaceholderStyle::Question,
        identifier_quote: '`',
    };

    pub const POSTGRES: Self = Self {
        database: DatabaseType::PostgreSQL,
        placeholder: PlaceholderStyle::Dollar,
        identifier_quote: '"',
    };

    pub const SQLITE: Self = Self {
        database: DatabaseType::SQLite,
        placeholder: PlaceholderStyle::Question,
        identifier_quote: '"',
    };

    pub fn for_database(db_type: DatabaseType) -> Self {
        match db_type {
            DatabaseType::MySQL => Self::MYSQL,
            DatabaseType::PostgreSQL => Self::POSTGRES,
            DatabaseType::SQLite => Self::SQLITE,
        }
    }

    /// Quote an identifier, doubling any embedded quote character.
    pub fn quote_identifier(&self, ident: &str) -> String {
        let q = self.identifier_quote;
        let mut quoted = String::with_capacity(ident.len() + 2);
        quoted.push(q);
        for c in ident.chars() {
            if c == q {
                quoted.push(q);
            }
            quoted.push(c);
        }
        quoted.push(q);
        quoted
    }
}

impl Default for SqlSyntax {
    fn default() -> Self {
        Self::SQLITE
    }
}

/// An open database connection.
///
/// Connections run with autocommit off: the first statement after open, commit or
/// rollback starts a physical transaction that stays open until `commit` or `rollback`.
pub trait PhysicalConnection: Send {
    fn syntax(&self) -> SqlSyntax;

    /// Run a statement that returns rows. `sql` is already in native placeholder syntax.
    fn query<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [QueryParam],
    ) -> BoxFuture<'a, DbResult<ResultSet>>;

    /// Run a statement and return the affected-row count.
    fn execute<'a>(
        &'a mut self,
        sql: &'a str,
        params: &'a [QueryParam],
    ) -> BoxFuture<'a, DbResult<u64>>;

    fn commit(&mut self) -> BoxFuture<'_, DbResult<()>>;

    fn rollback(&mut self) -> BoxFuture<'_, DbResult<()>>;

    /// Close the connection. Uncommitted work is discarded by the server.
    fn close(self: Box<Self>) -> BoxFuture<'static, DbResult<()>>;
}

/// Opens physical connections.
pub trait Driver: Send + Sync {
    /// Human-readable target for logs. Must not contain credentials.
    fn target(&self) -> String {
        "custom driver".to_string()
    }

    fn connect(&self) -> BoxFuture<'_, DbResult<Box<dyn PhysicalConnection>>>;
}

/// Adapts a connection-construction closure into a [`Driver`].
pub struct FnDriver<F> {
    connect: F,
}

impl<F> FnDriver<F> {
    pub fn new(connect: F) -> Self {
        Self { connect }
    }
}

impl<F, Fut> Driver for FnDriver<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = DbResult<Box<dyn PhysicalConnection>>> + Send + 'static,
{
    fn connect(&self) -> BoxFuture<'_, DbResult<Box<dyn PhysicalConnection>>> {
        Box::pin((self.connect)())
    }
}
