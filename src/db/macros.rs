//! Declarative macros for statement parameters and backend dispatch.

/// Build a `Vec<QueryParam>` from heterogeneous values.
///
/// # Example
///
/// ```
/// use lazydb::{params, QueryParam};
///
/// let p = params![1, "a", None::<i64>];
/// assert_eq!(p[1], QueryParam::String("a".to_string()));
/// assert!(p[2].is_null());
/// ```
#[macro_export]
macro_rules! params {
    () => {
        ::std::vec::Vec::<$crate::QueryParam>::new()
    };
    ($($value:expr),+ $(,)?) => {
        ::std::vec![$($crate::QueryParam::from($value)),+]
    };
}

/// Macro for generating backend dispatch match arms.
///
/// This macro generates match arms for `SqlxConnection` variants, reducing the need
/// to manually write repetitive match statements.
///
/// # Example
///
/// ```ignore
/// impl_db_dispatch!(conn, {
///     MySql(c) => do_mysql(c),
///     Postgres(c) => do_postgres(c),
///     SQLite(c) => do_sqlite(c),
/// });
/// ```
macro_rules! impl_db_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::sqlx_driver::SqlxConnection::$variant($c) => $body,
            )+
        }
    };
}

pub(crate) use impl_db_dispatch;
