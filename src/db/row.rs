//! Result rows.
//!
//! [`DbRow`] wraps a backend-specific row. It decodes into any [`Record`]
//! (anything deriving `sqlx::FromRow`) or into a JSON object for display.

use crate::error::{DbError, DbResult, classify};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::{Map, Value as JsonValue};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, FromRow, Row, TypeInfo};

/// A type that can be decoded from a row of any supported backend.
///
/// Implemented automatically for `#[derive(sqlx::FromRow)]` structs whose
/// field types decode on MySQL, PostgreSQL and SQLite alike.
pub trait Record:
    for<'r> FromRow<'r, MySqlRow>
    + for<'r> FromRow<'r, PgRow>
    + for<'r> FromRow<'r, SqliteRow>
    + Send
    + Unpin
{
}

impl<T> Record for T where
    T: for<'r> FromRow<'r, MySqlRow>
        + for<'r> FromRow<'r, PgRow>
        + for<'r> FromRow<'r, SqliteRow>
        + Send
        + Unpin
{
}

/// Logical category for a column's declared type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TypeCategory {
    Integer,
    Float,
    Boolean,
    Binary,
    Timestamp,
    Text,
}

pub(crate) fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();
    if lower == "bool" || lower == "boolean" {
        TypeCategory::Boolean
    } else if lower.contains("int") || lower.contains("serial") {
        TypeCategory::Integer
    } else if lower.contains("float")
        || lower.contains("double")
        || lower.contains("real")
        || lower.contains("decimal")
        || lower.contains("numeric")
    {
        TypeCategory::Float
    } else if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        TypeCategory::Binary
    } else if lower.starts_with("timestamp") || lower == "datetime" {
        TypeCategory::Timestamp
    } else {
        TypeCategory::Text
    }
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

/// Try each listed type in turn until one decodes; `None` on SQL NULL or when
/// nothing fits.
macro_rules! try_decode {
    ($row:expr, $idx:expr, $($ty:ty => $map:expr),+ $(,)?) => {{
        let mut value: Option<JsonValue> = None;
        $(
            if value.is_none() {
                if let Ok(Some(v)) = $row.try_get::<Option<$ty>, _>($idx) {
                    value = Some(($map)(v));
                }
            }
        )+
        value
    }};
}

macro_rules! row_to_json {
    ($row:expr) => {{
        let row = $row;
        row.columns()
            .iter()
            .map(|col| {
                let idx = col.ordinal();
                let value = match categorize_type(col.type_info().name()) {
                    TypeCategory::Integer => try_decode!(row, idx,
                        i64 => JsonValue::from,
                        i32 => JsonValue::from,
                        i16 => JsonValue::from,
                    ),
                    TypeCategory::Float => try_decode!(row, idx,
                        f64 => float_value,
                        f32 => |v: f32| float_value(v as f64),
                    ),
                    TypeCategory::Boolean => try_decode!(row, idx, bool => JsonValue::Bool),
                    TypeCategory::Binary => try_decode!(row, idx,
                        Vec<u8> => |v: Vec<u8>| JsonValue::String(STANDARD.encode(v)),
                    ),
                    TypeCategory::Timestamp => try_decode!(row, idx,
                        chrono::DateTime<chrono::Utc> => |v: chrono::DateTime<chrono::Utc>| JsonValue::String(v.to_rfc3339()),
                        chrono::NaiveDateTime => |v: chrono::NaiveDateTime| JsonValue::String(v.to_string()),
                        String => JsonValue::String,
                    ),
                    TypeCategory::Text => try_decode!(row, idx,
                        String => JsonValue::String,
                        i64 => JsonValue::from,
                        f64 => float_value,
                    ),
                };
                (col.name().to_string(), value.unwrap_or(JsonValue::Null))
            })
            .collect::<Map<String, JsonValue>>()
    }};
}

pub enum DbRow {
    MySql(MySqlRow),
    Postgres(PgRow),
    SQLite(SqliteRow),
}

impl From<MySqlRow> for DbRow {
    fn from(row: MySqlRow) -> Self {
        Self::MySql(row)
    }
}

impl From<PgRow> for DbRow {
    fn from(row: PgRow) -> Self {
        Self::Postgres(row)
    }
}

impl From<SqliteRow> for DbRow {
    fn from(row: SqliteRow) -> Self {
        Self::SQLite(row)
    }
}

impl std::fmt::Debug for DbRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match self {
            Self::MySql(_) => "MySql",
            Self::Postgres(_) => "Postgres",
            Self::SQLite(_) => "SQLite",
        };
        f.debug_struct("DbRow")
            .field("backend", &backend)
            .field("columns", &self.column_names())
            .finish()
    }
}

impl DbRow {
    /// Decode this row into `T`.
    pub fn decode<T: Record>(&self) -> Result<T, sqlx::Error> {
        match self {
            Self::MySql(row) => <T as FromRow<'_, MySqlRow>>::from_row(row),
            Self::Postgres(row) => <T as FromRow<'_, PgRow>>::from_row(row),
            Self::SQLite(row) => <T as FromRow<'_, SqliteRow>>::from_row(row),
        }
    }

    /// Column names in result order.
    pub fn column_names(&self) -> Vec<String> {
        match self {
            Self::MySql(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            Self::Postgres(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
            Self::SQLite(row) => row.columns().iter().map(|c| c.name().to_string()).collect(),
        }
    }

    /// Render the row as a JSON object keyed by column name.
    ///
    /// Binary values are base64 encoded; values that cannot be decoded become
    /// `null`.
    pub fn to_json(&self) -> Map<String, JsonValue> {
        match self {
            Self::MySql(row) => row_to_json!(row),
            Self::Postgres(row) => row_to_json!(row),
            Self::SQLite(row) => row_to_json!(row),
        }
    }
}

/// Why a single-row read produced no row.
#[derive(Debug)]
pub(crate) enum RowFailure {
    /// Reported by the driver, classified only when the row is read.
    Driver(sqlx::Error),
    /// Raised by this layer before or around the statement.
    Layer(DbError),
}

impl From<DbError> for RowFailure {
    fn from(err: DbError) -> Self {
        Self::Layer(err)
    }
}

impl std::fmt::Display for RowFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Driver(err) => err.fmt(f),
            Self::Layer(err) => err.fmt(f),
        }
    }
}

/// A single-row read whose errors are classified only when it is read.
#[derive(Debug)]
pub struct QueryRow {
    operation: &'static str,
    result: Result<Option<DbRow>, RowFailure>,
}

impl QueryRow {
    pub(crate) fn new(operation: &'static str, result: Result<Option<DbRow>, RowFailure>) -> Self {
        Self { operation, result }
    }

    /// Take the row; a missing row is [`DbError::NotFound`].
    pub fn into_row(self) -> DbResult<DbRow> {
        match self.result {
            Ok(Some(row)) => Ok(row),
            Ok(None) => Err(DbError::NotFound),
            Err(RowFailure::Driver(err)) => Err(classify(self.operation, err)),
            Err(RowFailure::Layer(err)) => Err(err),
        }
    }

    /// Decode the row into `T`.
    pub fn scan<T: Record>(self) -> DbResult<T> {
        let operation = self.operation;
        let row = self.into_row()?;
        row.decode().map_err(|e| classify(operation, e))
    }
}
