//! Integration tests exercising the capability operations the way a
//! repository uses them: typed reads, named writes, soft deletes, typed
//! not-found and duplicate errors, and a service call wrapped in a scope.

use chrono::Utc;
use serde::Serialize;
use sqlscope::db::SqlQueryable;
use sqlscope::error::is_not_found;
use sqlscope::{
    BaseQuery, Context, Database, DbError, ListParams, ListSpec, RecordError, SortOrder,
};
use tempfile::TempDir;
use tokio_test::{assert_err, assert_ok};

const RESOURCE: &str = "ObjectType";

#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
struct ObjectType {
    id: i64,
    #[sqlx(rename = "typeId")]
    type_id: String,
    definition: String,
}

#[derive(Debug, Serialize)]
struct NewObjectType<'a> {
    #[serde(rename = "typeId")]
    type_id: &'a str,
    definition: &'a str,
}

struct ObjectTypeRepository {
    db: Database,
}

impl ObjectTypeRepository {
    async fn create(&self, ctx: &Context, model: &NewObjectType<'_>) -> Result<(), RecordError> {
        self.db
            .named_exec(
                ctx,
                "INSERT INTO objectType (typeId, definition) VALUES (:typeId, :definition)
                 ON CONFLICT(typeId) DO UPDATE SET definition = :definition, deletedAt = NULL",
                model,
            )
            .await?;
        Ok(())
    }

    async fn get_by_id(&self, ctx: &Context, id: i64) -> Result<ObjectType, RecordError> {
        self.db
            .get(
                ctx,
                "SELECT id, typeId, definition FROM objectType WHERE id = ? AND deletedAt IS NULL",
                &[id.into()],
            )
            .await
            .map_err(|e| RecordError::from_db(e, RESOURCE, id))
    }

    async fn get_by_type_id(&self, ctx: &Context, type_id: &str) -> Result<ObjectType, RecordError> {
        self.db
            .query_row(
                ctx,
                "SELECT id, typeId, definition FROM objectType WHERE typeId = ? AND deletedAt IS NULL",
                &[type_id.into()],
            )
            .await
            .scan()
            .map_err(|e| RecordError::from_db(e, RESOURCE, type_id))
    }

    async fn list(&self, ctx: &Context, params: &ListParams) -> Result<Vec<ObjectType>, RecordError> {
        let spec = ListSpec::new("typeId").searchable("typeId").sortable(["id"]);
        let base = BaseQuery::new("SELECT id, typeId, definition FROM objectType")
            .filter("deletedAt IS NULL", vec![]);
        Ok(self.db.list(ctx, &spec, &base, params).await?)
    }

    async fn update_by_type_id(
        &self,
        ctx: &Context,
        type_id: &str,
        definition: &str,
    ) -> Result<(), RecordError> {
        self.db
            .exec(
                ctx,
                "UPDATE objectType SET definition = ? WHERE typeId = ? AND deletedAt IS NULL",
                &[definition.into(), type_id.into()],
            )
            .await?;
        Ok(())
    }

    async fn delete_by_type_id(&self, ctx: &Context, type_id: &str) -> Result<(), RecordError> {
        let result = self
            .db
            .exec(
                ctx,
                "UPDATE objectType SET deletedAt = ? WHERE typeId = ? AND deletedAt IS NULL",
                &[Utc::now().into(), type_id.into()],
            )
            .await?;
        if result.rows_affected == 0 {
            return Err(RecordError::not_found(RESOURCE, type_id));
        }
        Ok(())
    }
}

/// Service-level create: refuses duplicates, then writes and reads back in one
/// transaction.
async fn create_object_type(
    repo: &ObjectTypeRepository,
    ctx: &Context,
    model: &NewObjectType<'_>,
) -> Result<ObjectType, RecordError> {
    repo.db
        .within_transaction(ctx, |ctx| async move {
            match repo.get_by_type_id(&ctx, model.type_id).await {
                Ok(_) => {
                    return Err(RecordError::duplicate(
                        RESOURCE,
                        model.type_id,
                        "An object type with the given typeId already exists",
                    ));
                }
                Err(RecordError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
            repo.create(&ctx, model).await?;
            repo.get_by_type_id(&ctx, model.type_id).await
        })
        .await
}

async fn setup() -> (TempDir, ObjectTypeRepository) {
    let dir = TempDir::new().unwrap();
    let url = format!("sqlite://{}/authz.db?slow_query_ms=1000&query_timeout=5", dir.path().display());
    let db = Database::open(&url).await.unwrap();
    db.exec(
        &Context::background(),
        "CREATE TABLE objectType (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            typeId TEXT NOT NULL UNIQUE,
            definition TEXT NOT NULL,
            createdAt TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
            deletedAt TEXT
        )",
        &[],
    )
    .await
    .unwrap();
    (dir, ObjectTypeRepository { db })
}

#[derive(Debug, thiserror::Error)]
#[error("Unable to get ObjectType from sqlite")]
struct Wrapped(#[source] DbError);

#[tokio::test]
async fn test_create_then_read_back() {
    let (_dir, repo) = setup().await;
    let ctx = Context::background();
    let model = NewObjectType {
        type_id: "document",
        definition: r#"{"relations":{"owner":{}}}"#,
    };

    let created = create_object_type(&repo, &ctx, &model).await.unwrap();
    assert_eq!(created.type_id, "document");
    assert_eq!(created.definition, model.definition);

    let by_id = repo.get_by_id(&ctx, created.id).await.unwrap();
    assert_eq!(by_id, created);
}

#[tokio::test]
async fn test_missing_record_is_typed_not_found() {
    let (_dir, repo) = setup().await;
    let ctx = Context::background();

    match repo.get_by_id(&ctx, 42).await {
        Err(RecordError::NotFound { resource, id }) => {
            assert_eq!(resource, "ObjectType");
            assert_eq!(id, "42");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    assert!(matches!(
        repo.get_by_type_id(&ctx, "folder").await,
        Err(RecordError::NotFound { .. })
    ));
}

#[tokio::test]
async fn test_not_found_survives_wrapping() {
    let (_dir, repo) = setup().await;
    let ctx = Context::background();

    let err = repo
        .db
        .query_row(&ctx, "SELECT id FROM objectType WHERE id = ?", &[7.into()])
        .await
        .into_row()
        .unwrap_err();
    assert!(err.is_not_found());

    let wrapped = Wrapped(err);
    assert!(is_not_found(&wrapped));

    let other = repo
        .db
        .exec(&ctx, "INSERT INTO missingTable (id) VALUES (1)", &[])
        .await
        .unwrap_err();
    assert!(!is_not_found(&Wrapped(other)));
}

#[tokio::test]
async fn test_duplicate_is_rejected_without_writes() {
    let (_dir, repo) = setup().await;
    let ctx = Context::background();
    let model = NewObjectType {
        type_id: "document",
        definition: "{}",
    };
    create_object_type(&repo, &ctx, &model).await.unwrap();

    let changed = NewObjectType {
        type_id: "document",
        definition: r#"{"changed":true}"#,
    };
    let result = create_object_type(&repo, &ctx, &changed).await;
    assert!(matches!(result, Err(RecordError::Duplicate { .. })));

    let stored = repo.get_by_type_id(&ctx, "document").await.unwrap();
    assert_eq!(stored.definition, "{}");
}

#[tokio::test]
async fn test_soft_delete_and_recreate() {
    let (_dir, repo) = setup().await;
    let ctx = Context::background();
    let model = NewObjectType {
        type_id: "folder",
        definition: "{}",
    };
    create_object_type(&repo, &ctx, &model).await.unwrap();

    assert_ok!(repo.delete_by_type_id(&ctx, "folder").await);
    assert!(matches!(
        repo.get_by_type_id(&ctx, "folder").await,
        Err(RecordError::NotFound { .. })
    ));
    let err = assert_err!(repo.delete_by_type_id(&ctx, "folder").await);
    assert!(matches!(err, RecordError::NotFound { .. }));

    // The upsert revives the soft-deleted row.
    let recreated = create_object_type(&repo, &ctx, &model).await.unwrap();
    assert_eq!(recreated.type_id, "folder");
}

#[tokio::test]
async fn test_update_and_list() {
    let (_dir, repo) = setup().await;
    let ctx = Context::background();
    for type_id in ["user", "document", "folder", "group"] {
        let model = NewObjectType {
            type_id,
            definition: "{}",
        };
        create_object_type(&repo, &ctx, &model).await.unwrap();
    }
    repo.update_by_type_id(&ctx, "group", r#"{"relations":{"member":{}}}"#)
        .await
        .unwrap();
    repo.delete_by_type_id(&ctx, "user").await.unwrap();

    let first = repo
        .list(&ctx, &ListParams::new().with_limit(2))
        .await
        .unwrap();
    let type_ids: Vec<&str> = first.iter().map(|o| o.type_id.as_str()).collect();
    assert_eq!(type_ids, vec!["document", "folder"]);

    let next = ListParams::new()
        .with_limit(2)
        .next_page(first[1].type_id.as_str(), None);
    let second = repo.list(&ctx, &next).await.unwrap();
    let type_ids: Vec<&str> = second.iter().map(|o| o.type_id.as_str()).collect();
    assert_eq!(type_ids, vec!["group"]);
    assert_eq!(second[0].definition, r#"{"relations":{"member":{}}}"#);

    let by_id_desc = repo
        .list(&ctx, &ListParams::new().sorted_by("id", SortOrder::Desc))
        .await
        .unwrap();
    let type_ids: Vec<&str> = by_id_desc.iter().map(|o| o.type_id.as_str()).collect();
    assert_eq!(type_ids, vec!["group", "folder", "document"]);

    let searched = repo
        .list(&ctx, &ListParams::new().search("OLD"))
        .await
        .unwrap();
    assert_eq!(searched.len(), 1);
    assert_eq!(searched[0].type_id, "folder");
}

#[tokio::test]
async fn test_named_exec_requires_every_field() {
    let (_dir, repo) = setup().await;
    let ctx = Context::background();

    #[derive(Serialize)]
    struct Partial {
        #[serde(rename = "typeId")]
        type_id: &'static str,
    }

    let result = repo
        .db
        .named_exec(
            &ctx,
            "INSERT INTO objectType (typeId, definition) VALUES (:typeId, :definition)",
            &Partial { type_id: "x" },
        )
        .await;
    assert!(matches!(result, Err(DbError::InvalidInput { .. })));
}

#[tokio::test]
async fn test_execution_error_keeps_driver_cause() {
    let (_dir, repo) = setup().await;
    let ctx = Context::background();
    let model = NewObjectType {
        type_id: "document",
        definition: "{}",
    };
    create_object_type(&repo, &ctx, &model).await.unwrap();

    let err = repo
        .db
        .exec(
            &ctx,
            "INSERT INTO objectType (typeId, definition) VALUES (?, ?)",
            &["document".into(), "{}".into()],
        )
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Execution { operation: "ExecContext", .. }));
    assert!(matches!(err.cause(), Some(sqlx::Error::Database(_))));
    assert!(err.sql_state().is_some());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_prepare_describes_statement() {
    let (_dir, repo) = setup().await;
    let ctx = Context::background();

    let prepared = repo
        .db
        .prepare(
            &ctx,
            "SELECT id, typeId FROM objectType WHERE typeId = ? AND deletedAt IS NULL AND id > ?",
        )
        .await
        .unwrap();
    assert_eq!(prepared.columns, vec!["id", "typeId"]);
    assert_eq!(prepared.parameter_count, Some(2));

    let err = repo.db.prepare(&ctx, "SELEC nonsense").await.unwrap_err();
    assert!(matches!(err, DbError::Execution { operation: "PrepareContext", .. }));
}

#[tokio::test]
async fn test_select_and_resolved_handle_agree() {
    let (_dir, repo) = setup().await;
    let ctx = Context::background();
    for type_id in ["a", "b"] {
        let result = repo
            .db
            .exec(
                &ctx,
                "INSERT INTO objectType (typeId, definition) VALUES (?, ?)",
                &[type_id.into(), "{}".into()],
            )
            .await
            .unwrap();
        assert_eq!(result.rows_affected, 1);
        assert!(result.last_insert_id.is_some());
    }

    let sql = "SELECT id, typeId, definition FROM objectType ORDER BY id";
    let via_db: Vec<ObjectType> = repo.db.select(&ctx, sql, &[]).await.unwrap();
    let via_handle: Vec<ObjectType> = repo.db.resolve(&ctx).select(&ctx, sql, &[]).await.unwrap();
    assert_eq!(via_db, via_handle);
    assert_eq!(via_db.len(), 2);

    let empty: Vec<ObjectType> = repo
        .db
        .select(&ctx, "SELECT id, typeId, definition FROM objectType WHERE id < 0", &[])
        .await
        .unwrap();
    assert!(empty.is_empty());
}
