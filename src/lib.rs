//! sqlscope
//!
//! A data-access layer over sqlx (SQLite, PostgreSQL, MySQL) with two
//! features: transactions that propagate implicitly through a [`Context`],
//! and keyset pagination that stays stable when many rows share a sort value.

pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod pagination;

pub use config::{Config, DatabaseConfig};
pub use context::Context;
pub use db::{Database, QueryParam, Queryable, SqlQueryable};
pub use error::{DbError, DbResult, RecordError};
pub use pagination::{BaseQuery, ListParams, ListSpec, PageQuery, SortOrder};
