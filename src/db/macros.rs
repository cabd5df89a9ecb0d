//! Database dispatch macros for reducing code duplication.
//!
//! The driver keeps one native sqlx connection per backend; these macros expand the
//! per-backend match arms at compile time.

/// Macro for generating database dispatch match arms over `DbConnection`.
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
#[macro_export]
macro_rules! impl_db_dispatch {
    ($conn:expr, { $($variant:ident($c:ident) => $body:expr),+ $(,)? }) => {
        match $conn {
            $(
                $crate::db::driver::DbConnection::$variant($c) => $body,
            )+
        }
    };
}

pub use impl_db_dispatch;
