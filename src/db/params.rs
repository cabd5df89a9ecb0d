//! Parameter binding for the three sqlx backends.
//!
//! Every backend binds the same `QueryParam` variants the same way except
//! timestamps, which SQLite stores as RFC 3339 text so that version comparisons
//! stay exact.

use crate::models::QueryParam;
use sqlx::mysql::MySqlArguments;
use sqlx::postgres::PgArguments;
use sqlx::sqlite::SqliteArguments;
use sqlx::{MySql, Postgres, Sqlite};

macro_rules! define_binder {
    ($(#[$doc:meta])* $name:ident<$q:lifetime>, $db:ty, $args:ty, |$ts:ident| $bind_ts:expr) => {
        $(#[$doc])*
        pub(crate) fn $name<$q>(
            query: sqlx::query::Query<$q, $db, $args>,
            param: &$q QueryParam,
        ) -> sqlx::query::Query<$q, $db, $args> {
            match param {
                QueryParam::Null => query.bind(None::<String>),
                QueryParam::Bool(v) => query.bind(*v),
                QueryParam::Int(v) => query.bind(*v),
                QueryParam::Float(v) => query.bind(*v),
                QueryParam::Timestamp($ts) => query.bind($bind_ts),
                QueryParam::String(v) => query.bind(v.as_str()),
                QueryParam::Bytes(v) => query.bind(v.as_slice()),
            }
        }
    };
}

define_binder!(
    /// Bind a parameter to a MySQL query.
    bind_mysql_param<'q>, MySql, MySqlArguments, |ts| *ts
);

define_binder!(
    /// Bind a parameter to a PostgreSQL query.
    bind_postgres_param<'q>, Postgres, PgArguments, |ts| *ts
);

define_binder!(
    /// Bind a parameter to a SQLite query.
    bind_sqlite_param<'q>, Sqlite, SqliteArguments<'q>, |ts| ts.to_rfc3339()
);
