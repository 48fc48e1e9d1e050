//! sqlscope - Main entry point.
//!
//! Small command line front end over the library: `check` verifies a
//! connection through a transaction scope, `list` prints one keyset page of a
//! table as JSON together with the cursors for the neighbouring pages.

use clap::Parser;
use serde_json::{Value as JsonValue, json};
use sqlscope::config::{Command, Config, ListArgs};
use sqlscope::pagination::validate_identifier;
use sqlscope::{BaseQuery, Context, Database, DbResult, ListParams, ListSpec, QueryParam};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Initialize the tracing subscriber for logging.
fn init_tracing(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.json_logs {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber
            .with(fmt::layer().with_target(true).with_thread_ids(false))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::parse();

    // Logs go to stderr so stdout stays machine readable
    init_tracing(&config);

    info!("Starting sqlscope v{}", env!("CARGO_PKG_VERSION"));

    let db_config = config.database_config()?;
    let db = Database::connect(&db_config).await?;
    let ctx = Context::background();

    let result = match &config.command {
        Command::Check => check(&db, &ctx).await,
        Command::List(args) => list(&db, &ctx, args).await,
    };

    db.close().await;

    if let Err(e) = result {
        error!(error = %e, "Command failed");
        return Err(e);
    }
    Ok(())
}

async fn check(db: &Database, ctx: &Context) -> Result<(), Box<dyn std::error::Error>> {
    let row = db
        .within_transaction(ctx, |ctx| async move {
            db.query_row(&ctx, "SELECT 1 AS ok", &[]).await.into_row()
        })
        .await?;

    let report = json!({
        "dialect": db.db_type().display_name(),
        "result": row.to_json(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn list(
    db: &Database,
    ctx: &Context,
    args: &ListArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    validate_identifier(&args.table)?;

    let mut spec = ListSpec::new(&args.id_column).sortable(args.sortable.iter().cloned());
    if let Some(column) = &args.search_column {
        spec = spec.searchable(column);
    }
    let base = BaseQuery::new(format!("SELECT * FROM {}", args.table));
    let params = list_params(args);

    let rows = fetch_page(db, ctx, &spec, &base, &params).await?;

    let sort_column = params.sort_by.as_deref().unwrap_or(&spec.id_column);
    let cursor_of = |row: &serde_json::Map<String, JsonValue>| {
        let id = row
            .get(&spec.id_column)
            .map(QueryParam::from_json)
            .unwrap_or(QueryParam::Null);
        let value = row.get(sort_column).map(QueryParam::from_json);
        (id, value)
    };
    let next = rows.last().map(|row| {
        let (id, value) = cursor_of(row);
        params.next_page(id, value)
    });
    let previous = rows.first().map(|row| {
        let (id, value) = cursor_of(row);
        params.previous_page(id, value)
    });

    let output = json!({
        "count": rows.len(),
        "rows": rows,
        "next": next,
        "previous": previous,
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn fetch_page(
    db: &Database,
    ctx: &Context,
    spec: &ListSpec,
    base: &BaseQuery,
    params: &ListParams,
) -> DbResult<Vec<serde_json::Map<String, JsonValue>>> {
    let rows = db.list_rows(ctx, spec, base, params).await?;
    Ok(rows.iter().map(|row| row.to_json()).collect())
}

fn list_params(args: &ListArgs) -> ListParams {
    ListParams {
        query: args.query.clone(),
        sort_by: args.sort_by.clone(),
        sort_order: args.sort_order,
        after_id: args.after_id.as_deref().map(cursor_param),
        after_value: args.after_value.as_deref().map(cursor_param),
        before_id: args.before_id.as_deref().map(cursor_param),
        before_value: args.before_value.as_deref().map(cursor_param),
        limit: args.limit,
    }
}

/// Cursor values typed on the command line: integers and floats are bound as
/// numbers, anything else as text.
fn cursor_param(raw: &str) -> QueryParam {
    if let Ok(v) = raw.parse::<i64>() {
        QueryParam::Int(v)
    } else if let Ok(v) = raw.parse::<f64>() {
        QueryParam::Float(v)
    } else {
        QueryParam::from(raw)
    }
}
