//! Database access layer.
//!
//! - Connection pools and transactions per backend
//! - Capability handles (pool or ambient transaction) and their resolution
//! - Transaction scopes propagated through a [`Context`](crate::context::Context)
//! - Placeholder rebinding and parameter binding
//! - Slow query logging
//! - Row decoding

pub mod database;
pub mod handle;
pub mod interceptor;
pub mod params;
pub mod pool;
pub mod rebind;
pub mod row;
pub mod scope;

pub use database::Database;
pub use handle::{
    ConnectionHandle, ExecResult, PreparedStatement, Queryable, SqlQueryable, StatementSettings,
    TransactionHandle,
};
pub use interceptor::{QueryInterceptor, SlowQueryRecord};
pub use params::QueryParam;
pub use pool::{DatabaseType, DbPool, DbTransaction};
pub use row::{DbRow, QueryRow, Record};
pub use scope::{TransactionBackend, TransactionScope, run_in_transaction};
