//! Optimistic concurrency control.
//!
//! A version column is read together with the row. An update writes the next
//! version and only matches when the stored version still equals the one that
//! was read; zero matched rows means another writer got there first. No row
//! locks are taken.
//!
//! Supported version kinds:
//! - integers of every width, incremented with wrap-around
//! - UTC timestamps, replaced with the current time
//! - fixed-length row versions, incremented as a big-endian counter
//! - GUIDs, replaced with a fresh random UUID

use crate::db::transaction::{Transaction, validate_identifier};
use crate::db::types::{decode_binary, encode_binary};
use crate::error::{DbError, DbResult};
use crate::models::{QueryParam, Row};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info};
use uuid::Uuid;

/// Default length of a row version in bytes.
pub const DEFAULT_ROW_VERSION_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IntegerWidth {
    I16,
    I32,
    I64,
    U16,
    U32,
    U64,
}

/// How a version column is generated and advanced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VersionKind {
    Integer(IntegerWidth),
    Timestamp,
    /// Opaque big-endian counter of the given byte length
    RowVersion(usize),
    Guid,
}

impl VersionKind {
    /// Row version with the default length.
    pub fn row_version() -> Self {
        Self::RowVersion(DEFAULT_ROW_VERSION_LEN)
    }

    /// Version value for a newly inserted row.
    pub fn default_value(&self) -> VersionValue {
        match self {
            Self::Integer(IntegerWidth::I16) => VersionValue::Int16(1),
            Self::Integer(IntegerWidth::I32) => VersionValue::Int32(1),
            Self::Integer(IntegerWidth::I64) => VersionValue::Int64(1),
            Self::Integer(IntegerWidth::U16) => VersionValue::UInt16(1),
            Self::Integer(IntegerWidth::U32) => VersionValue::UInt32(1),
            Self::Integer(IntegerWidth::U64) => VersionValue::UInt64(1),
            Self::Timestamp => VersionValue::Timestamp(Utc::now()),
            Self::RowVersion(len) => {
                let mut bytes = vec![0u8; (*len).max(1)];
                if let Some(last) = bytes.last_mut() {
                    *last = 1;
                }
                VersionValue::RowVersion(bytes)
            }
            Self::Guid => VersionValue::Guid(Uuid::new_v4()),
        }
    }

    /// Next version after `current`.
    pub fn increment(&self, current: &VersionValue) -> DbResult<VersionValue> {
        let next = match (self, current) {
            (Self::Integer(IntegerWidth::I16), VersionValue::Int16(v)) => {
                VersionValue::Int16(v.wrapping_add(1))
            }
            (Self::Integer(IntegerWidth::I32), VersionValue::Int32(v)) => {
                VersionValue::Int32(v.wrapping_add(1))
            }
            (Self::Integer(IntegerWidth::I64), VersionValue::Int64(v)) => {
                VersionValue::Int64(v.wrapping_add(1))
            }
            (Self::Integer(IntegerWidth::U16), VersionValue::UInt16(v)) => {
                VersionValue::UInt16(v.wrapping_add(1))
            }
            (Self::Integer(IntegerWidth::U32), VersionValue::UInt32(v)) => {
                VersionValue::UInt32(v.wrapping_add(1))
            }
            (Self::Integer(IntegerWidth::U64), VersionValue::UInt64(v)) => {
                VersionValue::UInt64(v.wrapping_add(1))
            }
            (Self::Timestamp, VersionValue::Timestamp(_)) => VersionValue::Timestamp(Utc::now()),
            (Self::RowVersion(_), VersionValue::RowVersion(bytes)) => {
                VersionValue::RowVersion(increment_big_endian(bytes))
            }
            (Self::Guid, VersionValue::Guid(_)) => VersionValue::Guid(Uuid::new_v4()),
            (kind, value) => {
                return Err(DbError::invalid_input(format!(
                    "Version value {} does not match version kind {:?}",
                    value, kind
                )));
            }
        };
        Ok(next)
    }
}

/// Add one to a big-endian byte counter. All-0xFF wraps to all zeros.
fn increment_big_endian(bytes: &[u8]) -> Vec<u8> {
    let mut next = bytes.to_vec();
    for byte in next.iter_mut().rev() {
        let (value, overflow) = byte.overflowing_add(1);
        *byte = value;
        if !overflow {
            break;
        }
    }
    next
}

/// A concrete version value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum VersionValue {
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Timestamp(DateTime<Utc>),
    RowVersion(Vec<u8>),
    Guid(Uuid),
}

impl VersionValue {
    /// Bind parameter for this value.
    pub fn to_param(&self) -> QueryParam {
        match self {
            Self::Int16(v) => QueryParam::Int(*v as i64),
            Self::Int32(v) => QueryParam::Int(*v as i64),
            Self::Int64(v) => QueryParam::Int(*v),
            Self::UInt16(v) => QueryParam::Int(*v as i64),
            Self::UInt32(v) => QueryParam::Int(*v as i64),
            // Stored bit-for-bit in a signed BIGINT
            Self::UInt64(v) => QueryParam::Int(*v as i64),
            Self::Timestamp(v) => QueryParam::Timestamp(*v),
            Self::RowVersion(v) => QueryParam::Bytes(v.clone()),
            Self::Guid(v) => QueryParam::String(v.hyphenated().to_string()),
        }
    }

    /// Value as it appears in a decoded row snapshot.
    pub fn to_json(&self) -> JsonValue {
        match self {
            Self::Int16(v) => JsonValue::from(*v),
            Self::Int32(v) => JsonValue::from(*v),
            Self::Int64(v) => JsonValue::from(*v),
            Self::UInt16(v) => JsonValue::from(*v),
            Self::UInt32(v) => JsonValue::from(*v),
            Self::UInt64(v) => JsonValue::from(*v as i64),
            Self::Timestamp(v) => JsonValue::String(v.to_rfc3339()),
            Self::RowVersion(v) => encode_binary(v),
            Self::Guid(v) => JsonValue::String(v.hyphenated().to_string()),
        }
    }

    /// Parse a version of `kind` from a row snapshot value.
    pub fn from_json(kind: VersionKind, value: &JsonValue) -> DbResult<Self> {
        let invalid = || {
            DbError::invalid_input(format!(
                "Cannot read a {:?} version from {}",
                kind, value
            ))
        };

        let parsed = match kind {
            VersionKind::Integer(width) => {
                let n = value.as_i64().ok_or_else(invalid)?;
                match width {
                    IntegerWidth::I16 => Self::Int16(i16::try_from(n).map_err(|_| invalid())?),
                    IntegerWidth::I32 => Self::Int32(i32::try_from(n).map_err(|_| invalid())?),
                    IntegerWidth::I64 => Self::Int64(n),
                    IntegerWidth::U16 => Self::UInt16(u16::try_from(n).map_err(|_| invalid())?),
                    IntegerWidth::U32 => Self::UInt32(u32::try_from(n).map_err(|_| invalid())?),
                    IntegerWidth::U64 => Self::UInt64(n as u64),
                }
            }
            VersionKind::Timestamp => {
                let s = value.as_str().ok_or_else(invalid)?;
                let parsed = DateTime::parse_from_rfc3339(s).map_err(|_| invalid())?;
                Self::Timestamp(parsed.with_timezone(&Utc))
            }
            VersionKind::RowVersion(_) => Self::RowVersion(decode_binary(value).ok_or_else(invalid)?),
            VersionKind::Guid => {
                let s = value.as_str().ok_or_else(invalid)?;
                Self::Guid(Uuid::parse_str(s).map_err(|_| invalid())?)
            }
        };
        Ok(parsed)
    }
}

impl std::fmt::Display for VersionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Int16(v) => write!(f, "{}", v),
            Self::Int32(v) => write!(f, "{}", v),
            Self::Int64(v) => write!(f, "{}", v),
            Self::UInt16(v) => write!(f, "{}", v),
            Self::UInt32(v) => write!(f, "{}", v),
            Self::UInt64(v) => write!(f, "{}", v),
            Self::Timestamp(v) => write!(f, "{}", v.to_rfc3339()),
            Self::RowVersion(bytes) => {
                write!(f, "0x")?;
                for b in bytes {
                    write!(f, "{:02X}", b)?;
                }
                Ok(())
            }
            Self::Guid(v) => write!(f, "{}", v),
        }
    }
}

/// The version column of an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionColumn {
    /// Column name in the table.
    pub column: String,
    /// Field name on the entity, for diagnostics.
    pub field: String,
    pub kind: VersionKind,
}

impl VersionColumn {
    pub fn new(column: impl Into<String>, kind: VersionKind) -> Self {
        let column = column.into();
        Self {
            field: column.clone(),
            column,
            kind,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    pub fn default_value(&self) -> VersionValue {
        self.kind.default_value()
    }

    pub fn increment(&self, current: &VersionValue) -> DbResult<VersionValue> {
        self.kind.increment(current)
    }

    /// Read the version from a row snapshot.
    pub fn read(&self, row: &Row) -> DbResult<VersionValue> {
        let value = row.get(&self.column).ok_or_else(|| {
            DbError::invalid_input(format!(
                "Row has no version column '{}' (field {})",
                self.column, self.field
            ))
        })?;
        VersionValue::from_json(self.kind, value)
    }
}

/// An update guarded by a version check.
#[derive(Debug, Clone)]
pub struct VersionedUpdate {
    pub table: String,
    pub key_column: String,
    pub key: QueryParam,
    pub version: VersionColumn,
    /// The row as it was read, including the version column.
    pub original: Row,
    /// Columns to write. Key and version columns are ignored.
    pub changes: Row,
}

impl VersionedUpdate {
    fn validate(&self) -> DbResult<()> {
        validate_identifier(&self.table)?;
        validate_identifier(&self.key_column)?;
        validate_identifier(&self.version.column)?;
        for column in self.changes.keys() {
            validate_identifier(column)?;
        }
        Ok(())
    }

    /// Columns to write, in a stable order.
    fn written_columns(&self) -> Vec<(&String, &JsonValue)> {
        self.changes
            .iter()
            .filter(|(column, _)| **column != self.key_column && **column != self.version.column)
            .collect()
    }

    /// `original` with `changes` applied.
    fn incoming(&self) -> Row {
        let mut incoming = self.original.clone();
        for (column, value) in &self.changes {
            incoming.insert(column.clone(), value.clone());
        }
        incoming
    }
}

/// A versioned update matched no row: the row changed or was deleted after it
/// was read.
#[derive(Debug, Clone, Serialize)]
pub struct ConcurrencyConflict {
    pub table: String,
    pub key: JsonValue,
    /// The row as the caller read it.
    pub original: Row,
    /// The row the caller tried to write.
    pub incoming: Row,
    /// The row as stored now; `None` if it was deleted.
    pub current: Option<Row>,
}

impl ConcurrencyConflict {
    pub fn is_deleted(&self) -> bool {
        self.current.is_none()
    }

    /// Columns the caller changed relative to what it read.
    pub fn incoming_changes(&self) -> Row {
        self.incoming
            .iter()
            .filter(|(column, value)| self.original.get(*column) != Some(*value))
            .map(|(column, value)| (column.clone(), value.clone()))
            .collect()
    }

    /// Version currently stored, if the row still exists.
    pub fn stored_version(&self, version: &VersionColumn) -> Option<VersionValue> {
        self.current
            .as_ref()
            .and_then(|row| version.read(row).ok())
    }
}

impl std::fmt::Display for ConcurrencyConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_deleted() {
            write!(
                f,
                "Concurrency conflict on {} (key {}): row was deleted",
                self.table, self.key
            )
        } else {
            write!(
                f,
                "Concurrency conflict on {} (key {}): row was modified since it was read",
                self.table, self.key
            )
        }
    }
}

/// What to do about a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Give up and return the conflict.
    Fail,
    /// Write these columns over the stored row, checked against the stored version.
    Write(Row),
    /// Keep the stored row.
    KeepStored,
}

/// Decides how to resolve a [`ConcurrencyConflict`].
pub trait ConflictResolver: Send + Sync {
    fn resolve(&self, conflict: &ConcurrencyConflict) -> Resolution;
}

impl<F> ConflictResolver for F
where
    F: Fn(&ConcurrencyConflict) -> Resolution + Send + Sync,
{
    fn resolve(&self, conflict: &ConcurrencyConflict) -> Resolution {
        self(conflict)
    }
}

/// Built-in resolution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictStrategy {
    #[default]
    Fail,
    /// The caller's changes win over the stored row.
    PreferIncoming,
    /// The stored row wins; the caller's changes are dropped.
    PreferStored,
}

impl ConflictResolver for ConflictStrategy {
    fn resolve(&self, conflict: &ConcurrencyConflict) -> Resolution {
        match self {
            Self::Fail => Resolution::Fail,
            Self::PreferIncoming => Resolution::Write(conflict.incoming_changes()),
            Self::PreferStored => Resolution::KeepStored,
        }
    }
}

/// Result of a versioned update after conflict resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// The row was written with this new version.
    Updated(VersionValue),
    /// The stored row was kept.
    Stored(Row),
}

fn build_update_sql(
    db_type: crate::models::DatabaseType,
    update: &VersionedUpdate,
    columns: &[&String],
) -> String {
    let mut index = 0;
    let mut placeholder = || {
        index += 1;
        db_type.placeholder(index)
    };

    let mut assignments: Vec<String> = columns
        .iter()
        .map(|column| format!("{} = {}", column, placeholder()))
        .collect();
    assignments.push(format!("{} = {}", update.version.column, placeholder()));

    let key = placeholder();
    let expected = placeholder();
    format!(
        "UPDATE {} SET {} WHERE {} = {} AND {} = {}",
        update.table,
        assignments.join(", "),
        update.key_column,
        key,
        update.version.column,
        expected
    )
}

impl Transaction {
    /// Apply a versioned update.
    ///
    /// Returns the new version when exactly one row matched. When none matched,
    /// the stored row is re-read and a `ConcurrencyConflict` is returned.
    pub async fn update_versioned(&self, update: &VersionedUpdate) -> DbResult<VersionValue> {
        update.validate()?;
        let expected = update.version.read(&update.original)?;
        let next = update.version.increment(&expected)?;

        let written = update.written_columns();
        let columns: Vec<&String> = written.iter().map(|(column, _)| *column).collect();
        let sql = build_update_sql(self.database_type(), update, &columns);

        let mut params: Vec<QueryParam> = written
            .iter()
            .map(|(_, value)| QueryParam::from_json(value))
            .collect();
        params.push(next.to_param());
        params.push(update.key.clone());
        params.push(expected.to_param());

        let affected = self.execute(&sql, &params).await?;
        match affected {
            1 => {
                debug!(
                    transaction_id = %self.id(),
                    table = %update.table,
                    version = %next,
                    "Versioned update applied"
                );
                Ok(next)
            }
            0 => {
                let current = self
                    .query_one(
                        &format!(
                            "SELECT * FROM {} WHERE {} = {}",
                            update.table,
                            update.key_column,
                            self.database_type().placeholder(1)
                        ),
                        std::slice::from_ref(&update.key),
                    )
                    .await?;
                let conflict = ConcurrencyConflict {
                    table: update.table.clone(),
                    key: serde_json::to_value(&update.key).unwrap_or(JsonValue::Null),
                    original: update.original.clone(),
                    incoming: update.incoming(),
                    current,
                };
                info!(
                    transaction_id = %self.id(),
                    table = %update.table,
                    expected = %expected,
                    deleted = conflict.is_deleted(),
                    "Versioned update conflict"
                );
                Err(conflict.into())
            }
            n => Err(DbError::internal(format!(
                "Versioned update on {} matched {} rows; {} must be unique",
                update.table, n, update.key_column
            ))),
        }
    }

    /// Apply a versioned update, consulting `resolver` on conflict.
    ///
    /// A [`Resolution::Write`] retries once against the stored version; a second
    /// conflict is returned as is.
    pub async fn update_versioned_with<R>(
        &self,
        update: &VersionedUpdate,
        resolver: &R,
    ) -> DbResult<UpdateOutcome>
    where
        R: ConflictResolver + ?Sized,
    {
        let conflict = match self.update_versioned(update).await {
            Ok(version) => return Ok(UpdateOutcome::Updated(version)),
            Err(DbError::ConcurrencyConflict(conflict)) => conflict,
            Err(e) => return Err(e),
        };

        let resolution = resolver.resolve(&conflict);
        debug!(table = %conflict.table, resolution = ?resolution, "Resolving concurrency conflict");

        match (resolution, conflict.current.clone()) {
            (Resolution::KeepStored, Some(current)) => Ok(UpdateOutcome::Stored(current)),
            (Resolution::Write(changes), Some(current)) => {
                let retry = VersionedUpdate {
                    original: current,
                    changes,
                    ..update.clone()
                };
                self.update_versioned(&retry)
                    .await
                    .map(UpdateOutcome::Updated)
            }
            // A deleted row cannot be kept or overwritten
            _ => Err(DbError::ConcurrencyConflict(conflict)),
        }
    }
}
