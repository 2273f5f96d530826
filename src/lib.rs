//! lazydb
//!
//! Database access with lazily opened connections and nestable transactions scoped
//! to the calling task (SQLite, PostgreSQL, MySQL).
//!
//! # Example
//!
//! ```no_run
//! use lazydb::{EngineConfig, create_engine, insert, params, select_one, update, with_transaction};
//!
//! # async fn run() -> lazydb::DbResult<()> {
//! create_engine(EngineConfig::sqlite("app.db"))?;
//!
//! update("create table if not exists t (id integer primary key, v text)", &[]).await?;
//! with_transaction(|| async {
//!     insert("t", &[("id", 1.into()), ("v", "a".into())]).await?;
//!     update("update t set v = ? where id = ?", &params!["b", 1]).await
//! })
//! .await?;
//!
//! let row = select_one("select * from t where id = ?", &params![1]).await?;
//! assert_eq!(row.and_then(|r| r.get_str("v").map(String::from)).as_deref(), Some("b"));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, EngineConfig};
pub use db::{
    ConnectionScope, Driver, Engine, PhysicalConnection, SqlSyntax, TransactionScope,
    create_engine, create_engine_with, current_transaction_depth, engine, in_execution_unit,
    insert, is_connection_initialized, next_id, reset_engine, select, select_int, select_one,
    select_scalar, unit, update, with_connection, with_transaction,
};
pub use error::{DbError, DbResult};
pub use models::{DatabaseType, QueryParam, ResultSet, Row};
