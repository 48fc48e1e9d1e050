//! Integration tests for ambient transaction scopes on SQLite.

use futures_util::FutureExt;
use sqlscope::db::SqlQueryable;
use sqlscope::{Context, Database, DbError, DbResult, RecordError};
use std::panic::AssertUnwindSafe;
use tempfile::TempDir;

async fn setup() -> (TempDir, Database) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}/scope.db", dir.path().display());
    let db = Database::open(&url).await.unwrap();
    db.exec(
        &Context::background(),
        "CREATE TABLE objectType (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            typeId TEXT NOT NULL UNIQUE,
            definition TEXT
        )",
        &[],
    )
    .await
    .unwrap();
    (dir, db)
}

async fn count(db: &Database, ctx: &Context) -> i64 {
    let (n,): (i64,) = db
        .get(ctx, "SELECT COUNT(*) FROM objectType", &[])
        .await
        .unwrap();
    n
}

async fn insert(db: &Database, ctx: &Context, type_id: &str) -> DbResult<()> {
    db.exec(
        ctx,
        "INSERT INTO objectType (typeId, definition) VALUES (?, ?)",
        &[type_id.into(), "{}".into()],
    )
    .await
    .map(|_| ())
}

/// A repository call that opens its own scope; joins the caller's if any.
async fn create_with_default_role(db: &Database, ctx: &Context, type_id: &str) -> DbResult<i64> {
    db.within_transaction(ctx, |ctx| async move {
        insert(db, &ctx, type_id).await?;
        insert(db, &ctx, &format!("{type_id}-role")).await?;
        Ok(count(db, &ctx).await)
    })
    .await
}

#[tokio::test]
async fn test_commit_persists_writes() {
    let (_dir, db) = setup().await;
    let ctx = Context::background();

    let seen = db
        .within_transaction(&ctx, |ctx| {
            let db = db.clone();
            async move {
                insert(&db, &ctx, "document").await?;
                insert(&db, &ctx, "folder").await?;
                Ok::<_, DbError>(count(&db, &ctx).await)
            }
        })
        .await
        .unwrap();

    assert_eq!(seen, 2);
    assert_eq!(count(&db, &ctx).await, 2);
}

#[tokio::test]
async fn test_error_rolls_back_and_keeps_error() {
    let (_dir, db) = setup().await;
    let ctx = Context::background();

    let result: Result<(), RecordError> = db
        .within_transaction(&ctx, |ctx| {
            let db = db.clone();
            async move {
                insert(&db, &ctx, "document").await?;
                Err(RecordError::duplicate("ObjectType", "document", "already exists"))
            }
        })
        .await;

    match result {
        Err(RecordError::Duplicate { resource, id, .. }) => {
            assert_eq!(resource, "ObjectType");
            assert_eq!(id, "document");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(count(&db, &ctx).await, 0);
}

#[tokio::test]
async fn test_statement_error_rolls_back_earlier_writes() {
    let (_dir, db) = setup().await;
    let ctx = Context::background();

    let result = db
        .within_transaction(&ctx, |ctx| {
            let db = db.clone();
            async move {
                insert(&db, &ctx, "document").await?;
                insert(&db, &ctx, "document").await
            }
        })
        .await;

    match result {
        Err(DbError::Execution { operation, source }) => {
            assert_eq!(operation, "ExecContext");
            assert!(matches!(source, sqlx::Error::Database(_)));
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert_eq!(count(&db, &ctx).await, 0);
}

#[tokio::test]
async fn test_panic_rolls_back_before_unwinding() {
    let (_dir, db) = setup().await;
    let ctx = Context::background();

    let outcome = AssertUnwindSafe(db.within_transaction(&ctx, |ctx| {
        let db = db.clone();
        async move {
            insert(&db, &ctx, "document").await?;
            if count(&db, &ctx).await == 1 {
                panic!("invariant violated");
            }
            Ok::<(), DbError>(())
        }
    }))
    .catch_unwind()
    .await;

    let payload = outcome.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>().copied(), Some("invariant violated"));
    assert_eq!(count(&db, &ctx).await, 0);
}

#[tokio::test]
async fn test_nested_scope_joins_outer_transaction() {
    let (_dir, db) = setup().await;
    let ctx = Context::background();

    let seen = db
        .within_transaction(&ctx, |ctx| {
            let db = db.clone();
            async move {
                insert(&db, &ctx, "tenant").await?;
                let inner_id = db.resolve(&ctx).transaction_id().map(str::to_owned);
                let seen = create_with_default_role(&db, &ctx, "document").await?;
                assert_eq!(db.resolve(&ctx).transaction_id().map(str::to_owned), inner_id);
                Ok::<_, DbError>(seen)
            }
        })
        .await
        .unwrap();

    assert_eq!(seen, 3);
    assert_eq!(count(&db, &ctx).await, 3);
}

#[tokio::test]
async fn test_inner_failure_rolls_back_whole_chain() {
    let (_dir, db) = setup().await;
    let ctx = Context::background();

    let result = db
        .within_transaction(&ctx, |ctx| {
            let db = db.clone();
            async move {
                insert(&db, &ctx, "document").await?;
                // The second insert of the nested call collides with this one.
                insert(&db, &ctx, "folder-role").await?;
                create_with_default_role(&db, &ctx, "folder").await
            }
        })
        .await;

    assert!(matches!(result, Err(DbError::Execution { .. })));
    assert_eq!(count(&db, &ctx).await, 0);
}

#[tokio::test]
async fn test_standalone_repository_call_commits_itself() {
    let (_dir, db) = setup().await;
    let ctx = Context::background();

    let seen = create_with_default_role(&db, &ctx, "document").await.unwrap();
    assert_eq!(seen, 2);
    assert_eq!(count(&db, &ctx).await, 2);
}

#[tokio::test]
async fn test_handle_capabilities_inside_scope() {
    let (_dir, db) = setup().await;
    let ctx = Context::background();

    db.within_transaction(&ctx, |ctx| {
        let db = db.clone();
        async move {
            let handle = db.resolve(&ctx);
            assert!(handle.is_transaction());

            let result = handle
                .exec(
                    &ctx,
                    "INSERT INTO objectType (typeId) VALUES (?)",
                    &["document".into()],
                )
                .await?;
            assert_eq!(result.rows_affected, 1);

            let prepared = handle
                .prepare(&ctx, "SELECT id, typeId FROM objectType WHERE typeId = ?")
                .await?;
            assert_eq!(prepared.columns, vec!["id", "typeId"]);

            let rows = handle.query(&ctx, "SELECT typeId FROM objectType", &[]).await?;
            assert_eq!(rows.len(), 1);
            Ok::<(), DbError>(())
        }
    })
    .await
    .unwrap();

    assert_eq!(count(&db, &ctx).await, 1);
}
