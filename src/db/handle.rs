//! Capability handles.
//!
//! A handle is what a statement actually runs on: [`ConnectionHandle`] uses
//! the shared pool, [`TransactionHandle`] uses the transaction carried by a
//! [`Context`]. Both implement [`SqlQueryable`], and [`Queryable`] is the
//! resolved choice between them.
//!
//! Every operation follows the same path: rebind placeholders for the
//! dialect, execute under the context deadline (capped by the database's
//! query timeout) through the slow-query interceptor, then classify the
//! driver error.

use crate::config::DEFAULT_QUERY_TIMEOUT_SECS;
use crate::context::Context;
use crate::db::interceptor::QueryInterceptor;
use crate::db::params::{QueryParam, bind_params, named_params};
use crate::db::pool::{DatabaseType, DbPool, DbTransaction};
use crate::db::rebind::{compile_named, rebind};
use crate::db::row::{DbRow, QueryRow, Record, RowFailure};
use crate::db::scope::TransactionScope;
use crate::error::{DbError, DbResult, classify};
use serde::Serialize;
use sqlx::mysql::MySqlQueryResult;
use sqlx::postgres::PgQueryResult;
use sqlx::sqlite::SqliteQueryResult;
use sqlx::{Column, Either, Executor, Statement};
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Outcome of a statement that returns no rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecResult {
    pub rows_affected: u64,
    /// Generated key of the last inserted row, where the dialect reports one.
    pub last_insert_id: Option<i64>,
}

/// MySQL reports 0 when no key was generated, and ids past `i64::MAX` do not fit.
fn mysql_insert_id(id: u64) -> Option<i64> {
    i64::try_from(id).ok().filter(|id| *id != 0)
}

impl From<MySqlQueryResult> for ExecResult {
    fn from(result: MySqlQueryResult) -> Self {
        Self {
            rows_affected: result.rows_affected(),
            last_insert_id: mysql_insert_id(result.last_insert_id()),
        }
    }
}

impl From<PgQueryResult> for ExecResult {
    fn from(result: PgQueryResult) -> Self {
        Self {
            rows_affected: result.rows_affected(),
            last_insert_id: None,
        }
    }
}

impl From<SqliteQueryResult> for ExecResult {
    fn from(result: SqliteQueryResult) -> Self {
        let id = result.last_insert_rowid();
        Self {
            rows_affected: result.rows_affected(),
            last_insert_id: (id != 0).then_some(id),
        }
    }
}

/// Server-side description of a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedStatement {
    /// The statement text as sent to the server (after rebinding).
    pub sql: String,
    pub columns: Vec<String>,
    /// `None` when the driver cannot tell.
    pub parameter_count: Option<usize>,
}

impl PreparedStatement {
    fn describe<'q, S: Statement<'q>>(statement: &S) -> Self {
        Self {
            sql: statement.sql().to_string(),
            columns: statement
                .columns()
                .iter()
                .map(|c| c.name().to_string())
                .collect(),
            parameter_count: statement.parameters().map(|p| match p {
                Either::Left(types) => types.len(),
                Either::Right(count) => count,
            }),
        }
    }
}

/// Per-database statement policy shared by every handle.
#[derive(Debug, Clone, Copy)]
pub struct StatementSettings {
    pub interceptor: QueryInterceptor,
    pub query_timeout: Duration,
}

impl StatementSettings {
    /// The instant a statement started now must finish by.
    fn deadline(&self, ctx: &Context) -> Instant {
        let cap = Instant::now() + self.query_timeout;
        ctx.deadline().map_or(cap, |deadline| deadline.min(cap))
    }
}

impl Default for StatementSettings {
    fn default() -> Self {
        Self {
            interceptor: QueryInterceptor::default(),
            query_timeout: Duration::from_secs(DEFAULT_QUERY_TIMEOUT_SECS),
        }
    }
}

/// The operations available on every handle.
pub trait SqlQueryable: Send + Sync {
    fn db_type(&self) -> DatabaseType;

    /// Run a statement that returns no rows.
    fn exec(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> impl Future<Output = DbResult<ExecResult>> + Send;

    /// Fetch exactly one row into `T`. No row is [`DbError::NotFound`].
    fn get<T: Record>(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> impl Future<Output = DbResult<T>> + Send;

    /// Run a statement with `:name` placeholders bound from `arg`'s fields.
    fn named_exec<A: Serialize + Sync + ?Sized>(
        &self,
        ctx: &Context,
        sql: &str,
        arg: &A,
    ) -> impl Future<Output = DbResult<ExecResult>> + Send;

    fn prepare(
        &self,
        ctx: &Context,
        sql: &str,
    ) -> impl Future<Output = DbResult<PreparedStatement>> + Send;

    fn query(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> impl Future<Output = DbResult<Vec<DbRow>>> + Send;

    /// Fetch at most one row. Errors surface when the row is read.
    fn query_row(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> impl Future<Output = QueryRow> + Send;

    fn select<T: Record>(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> impl Future<Output = DbResult<Vec<T>>> + Send;
}

/// Raw driver calls. Statements arrive already rebound.
trait Driver: Sync {
    fn dialect(&self) -> DatabaseType;

    fn settings(&self) -> &StatementSettings;

    fn transaction_id(&self) -> Option<&str>;

    fn execute(
        &self,
        operation: &'static str,
        sql: &str,
        params: &[QueryParam],
    ) -> impl Future<Output = DbResult<ExecResult>> + Send;

    fn fetch_all(
        &self,
        operation: &'static str,
        sql: &str,
        params: &[QueryParam],
    ) -> impl Future<Output = DbResult<Vec<DbRow>>> + Send;

    /// Driver errors come back unclassified.
    fn fetch_optional(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> impl Future<Output = Result<Option<DbRow>, RowFailure>> + Send;

    fn describe(
        &self,
        operation: &'static str,
        sql: &str,
    ) -> impl Future<Output = DbResult<PreparedStatement>> + Send;
}

/// Match on a [`DbPool`], binding the pool as `$exec` (and optionally its sqlx
/// database type as `$db`) in every arm.
macro_rules! on_pool {
    ($pool:expr, |$exec:ident: $db:ident| $body:expr) => {
        match $pool {
            DbPool::MySql($exec) => {
                type $db = sqlx::MySql;
                $body
            }
            DbPool::Postgres($exec) => {
                type $db = sqlx::Postgres;
                $body
            }
            DbPool::SQLite($exec) => {
                type $db = sqlx::Sqlite;
                $body
            }
        }
    };
    ($pool:expr, |$exec:ident| $body:expr) => {
        match $pool {
            DbPool::MySql($exec) => $body,
            DbPool::Postgres($exec) => $body,
            DbPool::SQLite($exec) => $body,
        }
    };
}

/// Same as `on_pool!` for a `&mut DbTransaction`; `$exec` is the
/// transaction's connection.
macro_rules! on_transaction {
    ($tx:expr, |$exec:ident: $db:ident| $body:expr) => {
        match $tx {
            DbTransaction::MySql(tx) => {
                type $db = sqlx::MySql;
                let $exec = &mut **tx;
                $body
            }
            DbTransaction::Postgres(tx) => {
                type $db = sqlx::Postgres;
                let $exec = &mut **tx;
                $body
            }
            DbTransaction::SQLite(tx) => {
                type $db = sqlx::Sqlite;
                let $exec = &mut **tx;
                $body
            }
        }
    };
    ($tx:expr, |$exec:ident| $body:expr) => {
        match $tx {
            DbTransaction::MySql(tx) => {
                let $exec = &mut **tx;
                $body
            }
            DbTransaction::Postgres(tx) => {
                let $exec = &mut **tx;
                $body
            }
            DbTransaction::SQLite(tx) => {
                let $exec = &mut **tx;
                $body
            }
        }
    };
}

/// Handle on the shared pool. Safe for concurrent independent callers.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pool: DbPool,
    settings: StatementSettings,
}

impl ConnectionHandle {
    pub fn new(pool: DbPool, settings: StatementSettings) -> Self {
        Self { pool, settings }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

impl Driver for ConnectionHandle {
    fn dialect(&self) -> DatabaseType {
        self.pool.db_type()
    }

    fn settings(&self) -> &StatementSettings {
        &self.settings
    }

    fn transaction_id(&self) -> Option<&str> {
        None
    }

    async fn execute(
        &self,
        operation: &'static str,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecResult> {
        on_pool!(&self.pool, |pool: Db| {
            bind_params(sqlx::query::<Db>(sql), params)
                .execute(pool)
                .await
                .map(ExecResult::from)
        })
        .map_err(|e| classify(operation, e))
    }

    async fn fetch_all(
        &self,
        operation: &'static str,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<DbRow>> {
        on_pool!(&self.pool, |pool: Db| {
            bind_params(sqlx::query::<Db>(sql), params)
                .fetch_all(pool)
                .await
                .map(|rows| rows.into_iter().map(DbRow::from).collect())
        })
        .map_err(|e| classify(operation, e))
    }

    async fn fetch_optional(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<Option<DbRow>, RowFailure> {
        on_pool!(&self.pool, |pool: Db| {
            bind_params(sqlx::query::<Db>(sql), params)
                .fetch_optional(pool)
                .await
                .map(|row| row.map(DbRow::from))
        })
        .map_err(RowFailure::Driver)
    }

    async fn describe(&self, operation: &'static str, sql: &str) -> DbResult<PreparedStatement> {
        on_pool!(&self.pool, |pool| {
            pool.prepare(sql)
                .await
                .map(|statement| PreparedStatement::describe(&statement))
        })
        .map_err(|e| classify(operation, e))
    }
}

/// Handle on the transaction carried by a context.
///
/// Statements issued through clones of the same handle run one at a time on
/// the transaction's connection. Once the owning scope has finished, every
/// operation fails with [`DbError::Transaction`].
#[derive(Debug, Clone)]
pub struct TransactionHandle {
    scope: TransactionScope<DbTransaction>,
    db_type: DatabaseType,
    settings: StatementSettings,
}

impl TransactionHandle {
    pub(crate) fn new(
        scope: TransactionScope<DbTransaction>,
        db_type: DatabaseType,
        settings: StatementSettings,
    ) -> Self {
        Self {
            scope,
            db_type,
            settings,
        }
    }

    pub fn transaction_id(&self) -> &str {
        self.scope.id()
    }

    fn finished(&self) -> DbError {
        DbError::transaction("Transaction already finished", self.scope.id())
    }
}

impl Driver for TransactionHandle {
    fn dialect(&self) -> DatabaseType {
        self.db_type
    }

    fn settings(&self) -> &StatementSettings {
        &self.settings
    }

    fn transaction_id(&self) -> Option<&str> {
        Some(self.scope.id())
    }

    async fn execute(
        &self,
        operation: &'static str,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecResult> {
        let mut slot = self.scope.lock().await;
        let tx = slot.as_mut().ok_or_else(|| self.finished())?;
        on_transaction!(tx, |conn: Db| {
            bind_params(sqlx::query::<Db>(sql), params)
                .execute(conn)
                .await
                .map(ExecResult::from)
        })
        .map_err(|e| classify(operation, e))
    }

    async fn fetch_all(
        &self,
        operation: &'static str,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<DbRow>> {
        let mut slot = self.scope.lock().await;
        let tx = slot.as_mut().ok_or_else(|| self.finished())?;
        on_transaction!(tx, |conn: Db| {
            bind_params(sqlx::query::<Db>(sql), params)
                .fetch_all(conn)
                .await
                .map(|rows| rows.into_iter().map(DbRow::from).collect())
        })
        .map_err(|e| classify(operation, e))
    }

    async fn fetch_optional(
        &self,
        sql: &str,
        params: &[QueryParam],
    ) -> Result<Option<DbRow>, RowFailure> {
        let mut slot = self.scope.lock().await;
        let tx = slot.as_mut().ok_or_else(|| self.finished())?;
        on_transaction!(tx, |conn: Db| {
            bind_params(sqlx::query::<Db>(sql), params)
                .fetch_optional(conn)
                .await
                .map(|row| row.map(DbRow::from))
        })
        .map_err(RowFailure::Driver)
    }

    async fn describe(&self, operation: &'static str, sql: &str) -> DbResult<PreparedStatement> {
        let mut slot = self.scope.lock().await;
        let tx = slot.as_mut().ok_or_else(|| self.finished())?;
        on_transaction!(tx, |conn| {
            conn.prepare(sql)
                .await
                .map(|statement| PreparedStatement::describe(&statement))
        })
        .map_err(|e| classify(operation, e))
    }
}

/// Run `statement` through the interceptor, bounded by the statement deadline.
async fn guarded<T, E>(
    settings: &StatementSettings,
    ctx: &Context,
    operation: &'static str,
    sql: &str,
    params: &[QueryParam],
    statement: impl Future<Output = Result<T, E>>,
) -> Result<T, E>
where
    E: From<DbError> + Display,
{
    let deadline = settings.deadline(ctx);
    let started_at = Instant::now();
    settings
        .interceptor
        .observe(sql, params, async move {
            match tokio::time::timeout_at(deadline, statement).await {
                Ok(result) => result,
                Err(_) => Err(DbError::timeout(
                    operation,
                    started_at.elapsed().as_millis() as u64,
                )
                .into()),
            }
        })
        .await
}

fn trace_statement<D: Driver>(driver: &D, operation: &'static str, sql: &str, params: &[QueryParam]) {
    debug!(
        operation,
        sql,
        params = params.len(),
        transaction_id = driver.transaction_id(),
        "Executing statement"
    );
}

async fn execute_as<D: Driver>(
    driver: &D,
    ctx: &Context,
    operation: &'static str,
    sql: &str,
    params: &[QueryParam],
) -> DbResult<ExecResult> {
    let sql = rebind(sql, driver.dialect().placeholder_style());
    trace_statement(driver, operation, &sql, params);
    guarded(
        driver.settings(),
        ctx,
        operation,
        &sql,
        params,
        driver.execute(operation, &sql, params),
    )
    .await
}

/// Fetch at most one row, deferring classification to the returned [`QueryRow`].
async fn fetch_optional_as<D: Driver>(
    driver: &D,
    ctx: &Context,
    operation: &'static str,
    sql: &str,
    params: &[QueryParam],
) -> QueryRow {
    let sql = rebind(sql, driver.dialect().placeholder_style());
    trace_statement(driver, operation, &sql, params);
    let result = guarded(
        driver.settings(),
        ctx,
        operation,
        &sql,
        params,
        driver.fetch_optional(&sql, params),
    )
    .await;
    QueryRow::new(operation, result)
}

async fn fetch_all_as<D: Driver>(
    driver: &D,
    ctx: &Context,
    operation: &'static str,
    sql: &str,
    params: &[QueryParam],
) -> DbResult<Vec<DbRow>> {
    let sql = rebind(sql, driver.dialect().placeholder_style());
    trace_statement(driver, operation, &sql, params);
    guarded(
        driver.settings(),
        ctx,
        operation,
        &sql,
        params,
        driver.fetch_all(operation, &sql, params),
    )
    .await
}

mod ops {
    use super::*;

    pub(super) async fn exec<D: Driver>(
        driver: &D,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<ExecResult> {
        execute_as(driver, ctx, "ExecContext", sql, params).await
    }

    pub(super) async fn get<D: Driver, T: Record>(
        driver: &D,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<T> {
        fetch_optional_as(driver, ctx, "GetContext", sql, params)
            .await
            .scan()
    }

    pub(super) async fn named_exec<D: Driver, A: Serialize + Sync + ?Sized>(
        driver: &D,
        ctx: &Context,
        sql: &str,
        arg: &A,
    ) -> DbResult<ExecResult> {
        let (compiled, names) = compile_named(sql, driver.dialect().lexicon());
        let params = named_params(&names, arg)?;
        execute_as(driver, ctx, "NamedExecContext", &compiled, &params).await
    }

    pub(super) async fn prepare<D: Driver>(
        driver: &D,
        ctx: &Context,
        sql: &str,
    ) -> DbResult<PreparedStatement> {
        const OPERATION: &str = "PrepareContext";
        let sql = rebind(sql, driver.dialect().placeholder_style());
        trace_statement(driver, OPERATION, &sql, &[]);
        guarded(
            driver.settings(),
            ctx,
            OPERATION,
            &sql,
            &[],
            driver.describe(OPERATION, &sql),
        )
        .await
    }

    pub(super) async fn query<D: Driver>(
        driver: &D,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<DbRow>> {
        fetch_all_as(driver, ctx, "QueryContext", sql, params).await
    }

    pub(super) async fn query_row<D: Driver>(
        driver: &D,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> QueryRow {
        fetch_optional_as(driver, ctx, "QueryRowContext", sql, params).await
    }

    pub(super) async fn select<D: Driver, T: Record>(
        driver: &D,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<T>> {
        const OPERATION: &str = "SelectContext";
        fetch_all_as(driver, ctx, OPERATION, sql, params)
            .await?
            .iter()
            .map(|row| row.decode().map_err(|e| classify(OPERATION, e)))
            .collect()
    }
}

macro_rules! impl_sql_queryable {
    ($handle:ty, |$this:ident| $db_type:expr) => {
        impl SqlQueryable for $handle {
            fn db_type(&self) -> DatabaseType {
                let $this = self;
                $db_type
            }

            async fn exec(
                &self,
                ctx: &Context,
                sql: &str,
                params: &[QueryParam],
            ) -> DbResult<ExecResult> {
                ops::exec(self, ctx, sql, params).await
            }

            async fn get<T: Record>(
                &self,
                ctx: &Context,
                sql: &str,
                params: &[QueryParam],
            ) -> DbResult<T> {
                ops::get(self, ctx, sql, params).await
            }

            async fn named_exec<A: Serialize + Sync + ?Sized>(
                &self,
                ctx: &Context,
                sql: &str,
                arg: &A,
            ) -> DbResult<ExecResult> {
                ops::named_exec(self, ctx, sql, arg).await
            }

            async fn prepare(&self, ctx: &Context, sql: &str) -> DbResult<PreparedStatement> {
                ops::prepare(self, ctx, sql).await
            }

            async fn query(
                &self,
                ctx: &Context,
                sql: &str,
                params: &[QueryParam],
            ) -> DbResult<Vec<DbRow>> {
                ops::query(self, ctx, sql, params).await
            }

            async fn query_row(&self, ctx: &Context, sql: &str, params: &[QueryParam]) -> QueryRow {
                ops::query_row(self, ctx, sql, params).await
            }

            async fn select<T: Record>(
                &self,
                ctx: &Context,
                sql: &str,
                params: &[QueryParam],
            ) -> DbResult<Vec<T>> {
                ops::select(self, ctx, sql, params).await
            }
        }
    };
}

impl_sql_queryable!(ConnectionHandle, |handle| handle.pool.db_type());
impl_sql_queryable!(TransactionHandle, |handle| handle.db_type);

/// The handle a context resolves to.
#[derive(Debug, Clone)]
pub enum Queryable {
    Connection(ConnectionHandle),
    Transaction(TransactionHandle),
}

impl Queryable {
    pub fn is_transaction(&self) -> bool {
        matches!(self, Self::Transaction(_))
    }

    pub fn transaction_id(&self) -> Option<&str> {
        match self {
            Self::Connection(_) => None,
            Self::Transaction(handle) => Some(handle.transaction_id()),
        }
    }
}

macro_rules! dispatch {
    ($queryable:expr, |$handle:ident| $body:expr) => {
        match $queryable {
            Queryable::Connection($handle) => $body,
            Queryable::Transaction($handle) => $body,
        }
    };
}

impl SqlQueryable for Queryable {
    fn db_type(&self) -> DatabaseType {
        dispatch!(self, |h| h.db_type())
    }

    async fn exec(&self, ctx: &Context, sql: &str, params: &[QueryParam]) -> DbResult<ExecResult> {
        dispatch!(self, |h| h.exec(ctx, sql, params).await)
    }

    async fn get<T: Record>(&self, ctx: &Context, sql: &str, params: &[QueryParam]) -> DbResult<T> {
        dispatch!(self, |h| h.get(ctx, sql, params).await)
    }

    async fn named_exec<A: Serialize + Sync + ?Sized>(
        &self,
        ctx: &Context,
        sql: &str,
        arg: &A,
    ) -> DbResult<ExecResult> {
        dispatch!(self, |h| h.named_exec(ctx, sql, arg).await)
    }

    async fn prepare(&self, ctx: &Context, sql: &str) -> DbResult<PreparedStatement> {
        dispatch!(self, |h| h.prepare(ctx, sql).await)
    }

    async fn query(&self, ctx: &Context, sql: &str, params: &[QueryParam]) -> DbResult<Vec<DbRow>> {
        dispatch!(self, |h| h.query(ctx, sql, params).await)
    }

    async fn query_row(&self, ctx: &Context, sql: &str, params: &[QueryParam]) -> QueryRow {
        dispatch!(self, |h| h.query_row(ctx, sql, params).await)
    }

    async fn select<T: Record>(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<T>> {
        dispatch!(self, |h| h.select(ctx, sql, params).await)
    }
}
