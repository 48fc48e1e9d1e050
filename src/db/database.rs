//! The database entry point.
//!
//! A [`Database`] owns a pool and hands out handles. Repository code calls
//! the capability operations on it with the [`Context`] it was given; each
//! call runs inside the context's transaction when there is one and on the
//! pool otherwise.

use crate::config::DatabaseConfig;
use crate::context::Context;
use crate::db::handle::{
    ConnectionHandle, ExecResult, PreparedStatement, Queryable, SqlQueryable, StatementSettings,
    TransactionHandle,
};
use crate::db::interceptor::QueryInterceptor;
use crate::db::params::QueryParam;
use crate::db::pool::{DatabaseType, DbPool, DbTransaction};
use crate::db::row::{DbRow, QueryRow, Record};
use crate::db::scope::{TransactionBackend, TransactionScope, run_in_transaction};
use crate::error::{DbError, DbResult};
use crate::pagination::{BaseQuery, ListParams, ListSpec};
use serde::Serialize;
use std::future::Future;
use tracing::debug;
use uuid::Uuid;

/// A connection pool plus the transaction propagation around it.
///
/// Cloning is cheap; clones share the pool and see each other's
/// transaction scopes.
#[derive(Debug, Clone)]
pub struct Database {
    pool: DbPool,
    instance: Uuid,
    settings: StatementSettings,
}

impl Database {
    /// Connect using a parsed [`DatabaseConfig`].
    pub async fn connect(config: &DatabaseConfig) -> DbResult<Self> {
        let pool = DbPool::connect(config).await?;
        let settings = StatementSettings {
            interceptor: QueryInterceptor::new(config.pool_options.slow_query_threshold()),
            query_timeout: config.pool_options.query_timeout_or_default(),
        };
        Ok(Self::with_settings(pool, settings))
    }

    /// Connect from a URL; pool options may be passed as query parameters.
    pub async fn open(url: &str) -> DbResult<Self> {
        let config = DatabaseConfig::parse(url).map_err(DbError::invalid_input)?;
        Self::connect(&config).await
    }

    /// Wrap an existing pool with default statement settings.
    pub fn from_pool(pool: DbPool) -> Self {
        Self::with_settings(pool, StatementSettings::default())
    }

    pub fn with_settings(pool: DbPool, settings: StatementSettings) -> Self {
        Self {
            pool,
            instance: Uuid::new_v4(),
            settings,
        }
    }

    pub fn db_type(&self) -> DatabaseType {
        self.pool.db_type()
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// The handle the next statement under `ctx` should run on.
    pub fn resolve(&self, ctx: &Context) -> Queryable {
        match ctx.keyed_value::<TransactionScope<DbTransaction>>(self.instance.as_u128()) {
            Some(scope) => Queryable::Transaction(TransactionHandle::new(
                scope.clone(),
                self.db_type(),
                self.settings,
            )),
            None => Queryable::Connection(ConnectionHandle::new(self.pool.clone(), self.settings)),
        }
    }

    /// Run `work` in a transaction, joining the one `ctx` already carries.
    ///
    /// See [`run_in_transaction`] for the commit and rollback rules.
    pub async fn within_transaction<F, Fut, R, E>(&self, ctx: &Context, work: F) -> Result<R, E>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<R, E>>,
        E: From<DbError>,
    {
        run_in_transaction(self, ctx, work).await
    }

    pub async fn exec(&self, ctx: &Context, sql: &str, params: &[QueryParam]) -> DbResult<ExecResult> {
        self.resolve(ctx).exec(ctx, sql, params).await
    }

    pub async fn get<T: Record>(&self, ctx: &Context, sql: &str, params: &[QueryParam]) -> DbResult<T> {
        self.resolve(ctx).get(ctx, sql, params).await
    }

    pub async fn named_exec<A: Serialize + Sync + ?Sized>(
        &self,
        ctx: &Context,
        sql: &str,
        arg: &A,
    ) -> DbResult<ExecResult> {
        self.resolve(ctx).named_exec(ctx, sql, arg).await
    }

    pub async fn prepare(&self, ctx: &Context, sql: &str) -> DbResult<PreparedStatement> {
        self.resolve(ctx).prepare(ctx, sql).await
    }

    pub async fn query(&self, ctx: &Context, sql: &str, params: &[QueryParam]) -> DbResult<Vec<DbRow>> {
        self.resolve(ctx).query(ctx, sql, params).await
    }

    pub async fn query_row(&self, ctx: &Context, sql: &str, params: &[QueryParam]) -> QueryRow {
        self.resolve(ctx).query_row(ctx, sql, params).await
    }

    pub async fn select<T: Record>(
        &self,
        ctx: &Context,
        sql: &str,
        params: &[QueryParam],
    ) -> DbResult<Vec<T>> {
        self.resolve(ctx).select(ctx, sql, params).await
    }

    /// Fetch one keyset page. An empty page is `Ok(vec![])`, never `NotFound`.
    pub async fn list<T: Record>(
        &self,
        ctx: &Context,
        spec: &ListSpec,
        base: &BaseQuery,
        params: &ListParams,
    ) -> DbResult<Vec<T>> {
        let page = spec.build_page(base, params)?;
        debug!(sql = %page.sql, args = page.args.len(), "Listing page");
        match self.select(ctx, &page.sql, &page.args).await {
            Err(DbError::NotFound) => Ok(Vec::new()),
            other => other,
        }
    }

    /// Same as [`Database::list`], returning raw rows.
    pub async fn list_rows(
        &self,
        ctx: &Context,
        spec: &ListSpec,
        base: &BaseQuery,
        params: &ListParams,
    ) -> DbResult<Vec<DbRow>> {
        let page = spec.build_page(base, params)?;
        debug!(sql = %page.sql, args = page.args.len(), "Listing page");
        match self.query(ctx, &page.sql, &page.args).await {
            Err(DbError::NotFound) => Ok(Vec::new()),
            other => other,
        }
    }
}

impl TransactionBackend for Database {
    type Tx = DbTransaction;

    fn scope_key(&self) -> u128 {
        self.instance.as_u128()
    }

    async fn begin(&self) -> Result<DbTransaction, sqlx::Error> {
        self.pool.begin().await
    }

    async fn commit(&self, tx: DbTransaction) -> Result<(), sqlx::Error> {
        tx.commit().await
    }

    async fn rollback(&self, tx: DbTransaction) -> Result<(), sqlx::Error> {
        tx.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_db() -> Database {
        Database::open("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_resolve_without_scope_uses_pool() {
        let db = memory_db().await;
        let handle = db.resolve(&Context::background());
        assert!(!handle.is_transaction());
        assert_eq!(handle.transaction_id(), None);
        assert_eq!(handle.db_type(), DatabaseType::SQLite);
    }

    #[tokio::test]
    async fn test_resolve_inside_scope_uses_transaction() {
        let db = memory_db().await;
        let result: DbResult<()> = db
            .within_transaction(&Context::background(), |ctx| {
                let db = db.clone();
                async move {
                    let handle = db.resolve(&ctx);
                    assert!(handle.is_transaction());
                    assert!(handle.transaction_id().unwrap().starts_with("tx_"));
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_other_database_ignores_scope() {
        let first = memory_db().await;
        let second = memory_db().await;
        let result: DbResult<()> = first
            .within_transaction(&Context::background(), |ctx| {
                let second = second.clone();
                async move {
                    assert!(!second.resolve(&ctx).is_transaction());
                    Ok(())
                }
            })
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_exec_and_get_on_pool() {
        let db = memory_db().await;
        let ctx = Context::background();
        db.exec(&ctx, "CREATE TABLE t (id INTEGER PRIMARY KEY, name TEXT NOT NULL)", &[])
            .await
            .unwrap();
        let result = db
            .exec(&ctx, "INSERT INTO t (name) VALUES (?)", &["alpha".into()])
            .await
            .unwrap();
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.last_insert_id, Some(1));

        let (name,): (String,) = db
            .get(&ctx, "SELECT name FROM t WHERE id = ?", &[1.into()])
            .await
            .unwrap();
        assert_eq!(name, "alpha");

        let missing = db
            .get::<(String,)>(&ctx, "SELECT name FROM t WHERE id = ?", &[2.into()])
            .await;
        assert!(matches!(missing, Err(DbError::NotFound)));
    }

    #[tokio::test]
    async fn test_handle_after_scope_ends_is_rejected() {
        let db = memory_db().await;
        let leaked: DbResult<Queryable> = db
            .within_transaction(&Context::background(), |ctx| {
                let db = db.clone();
                async move { Ok(db.resolve(&ctx)) }
            })
            .await;
        let handle = leaked.unwrap();
        let result = handle.exec(&Context::background(), "SELECT 1", &[]).await;
        assert!(matches!(result, Err(DbError::Transaction { .. })));
    }
}
