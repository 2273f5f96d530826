//! Database access layer.
//!
//! This module provides:
//! - The driver seam and its sqlx implementation
//! - Parameter binding, placeholder translation and row decoding
//! - The engine factory
//! - Per-unit execution contexts with lazily opened connections
//! - Connection and transaction scopes
//! - Statement execution helpers

pub mod context;
pub mod driver;
pub mod engine;
pub mod executor;
pub mod id;
pub mod macros;
pub mod params;
pub mod scope;
pub mod sqlx_driver;
pub mod types;

pub use context::{current_transaction_depth, in_execution_unit, is_connection_initialized, unit};
pub use driver::{Driver, FnDriver, PhysicalConnection, PlaceholderStyle, SqlSyntax};
pub use engine::{Engine, create_engine, create_engine_with, engine, reset_engine};
pub use executor::{insert, select, select_int, select_one, select_scalar, update};
pub use id::next_id;
pub use scope::{ConnectionScope, TransactionScope, with_connection, with_transaction};
pub use sqlx_driver::{SqlxConnection, SqlxDriver, SqlxPhysicalConnection};
