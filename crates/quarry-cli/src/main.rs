//! quarry command-line tool.
//!
//! Provides the `quarry` binary for working with a SQLite database described
//! by a JSON model file. `create` makes sure the database and its tables
//! exist, retrying while the database is not yet available; `query` prints
//! every entity of one type as a JSON line; `drop` deletes the database.
//!
//! Store options come from the `QUARRY_*` environment variables, logging
//! from `RUST_LOG`.

use std::path::Path;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use quarry_core::{Direction, Expr, Materialized, Model, QueryModel};
use quarry_storage::{DataStore, SqliteStore, StoreOptions};

/// Query and persist entities in a SQLite database.
#[derive(Parser)]
#[command(name = "quarry", about = "Query and persist entities in a SQLite database")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the database and its tables if they do not exist.
    Create {
        /// Path to the database file.
        #[arg(short, long)]
        db: String,

        /// Path to the JSON model file.
        #[arg(short, long)]
        model: String,
    },
    /// Print every entity of a type, one JSON object per line.
    Query {
        /// Path to the database file.
        #[arg(short, long)]
        db: String,

        /// Path to the JSON model file.
        #[arg(short, long)]
        model: String,

        /// Entity type to query; subtypes are included.
        #[arg(short, long)]
        entity: String,

        /// Property to order by.
        #[arg(long)]
        order_by: Option<String>,

        /// Maximum number of entities to print.
        #[arg(short, long)]
        take: Option<u64>,
    },
    /// Delete the database.
    Drop {
        /// Path to the database file.
        #[arg(short, long)]
        db: String,

        /// Path to the JSON model file.
        #[arg(short, long)]
        model: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match cli.command {
        Commands::Create { db, model } => run_create(&db, &model),
        Commands::Query {
            db,
            model,
            entity,
            order_by,
            take,
        } => run_query(&db, &model, &entity, order_by.as_deref(), take),
        Commands::Drop { db, model } => run_drop(&db, &model),
    };
    process::exit(exit_code);
}

/// Load and validate the model file.
fn load_model(path: &str) -> Result<Arc<Model>, String> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read model file '{}': {}", path, e))?;
    let model: Model =
        serde_json::from_str(&text).map_err(|e| format!("invalid model file '{}': {}", path, e))?;
    tracing::debug!(path, entity_types = model.entity_types().count(), "loaded model");
    Ok(Arc::new(model))
}

fn open_store(db_path: &str, model_path: &str) -> Result<SqliteStore, String> {
    let model = load_model(model_path)?;
    Ok(SqliteStore::open(Path::new(db_path), model, StoreOptions::from_env()))
}

/// Execute the create subcommand.
///
/// Returns exit code: 0 = success, 1 = store error, 3 = model file error.
fn run_create(db_path: &str, model_path: &str) -> i32 {
    let store = match open_store(db_path, model_path) {
        Ok(store) => store,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return 3;
        }
    };
    match store.ensure_created() {
        Ok(true) => {
            println!("created '{}'", db_path);
            0
        }
        Ok(false) => {
            println!("'{}' is up to date", db_path);
            0
        }
        Err(e) => {
            eprintln!("Error: failed to create '{}': {}", db_path, e);
            1
        }
    }
}

/// Execute the query subcommand.
///
/// Returns exit code: 0 = success, 1 = store error, 2 = unknown entity type
/// or property, 3 = model file error.
fn run_query(
    db_path: &str,
    model_path: &str,
    entity: &str,
    order_by: Option<&str>,
    take: Option<u64>,
) -> i32 {
    let store = match open_store(db_path, model_path) {
        Ok(store) => store,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return 3;
        }
    };
    let entity_type = match store.model().entity_type_by_name(entity) {
        Ok(entity_type) => entity_type.id,
        Err(e) => {
            eprintln!("Error: {}", e);
            return 2;
        }
    };

    let mut query = QueryModel::entities(entity_type);
    let source = query.root_source();
    if let Some(property) = order_by {
        if let Err(e) = store.model().property(entity_type, property) {
            eprintln!("Error: {}", e);
            return 2;
        }
        query = query.order_by(Expr::property(source, property), Direction::Ascending);
    }
    if let Some(n) = take {
        query = query.take(n);
    }

    let results = match store.query::<Materialized>(&query) {
        Ok(results) => results,
        Err(e) => {
            eprintln!("Error: query failed: {}", e);
            return 1;
        }
    };
    for row in results {
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        };
        match serde_json::to_string(&row) {
            Ok(line) => println!("{}", line),
            Err(e) => {
                eprintln!("Error: failed to serialize row: {}", e);
                return 1;
            }
        }
    }
    0
}

/// Execute the drop subcommand.
fn run_drop(db_path: &str, model_path: &str) -> i32 {
    let store = match open_store(db_path, model_path) {
        Ok(store) => store,
        Err(msg) => {
            eprintln!("Error: {}", msg);
            return 3;
        }
    };
    match store.ensure_deleted() {
        Ok(true) => {
            println!("deleted '{}'", db_path);
            0
        }
        Ok(false) => {
            println!("'{}' does not exist", db_path);
            0
        }
        Err(e) => {
            eprintln!("Error: failed to delete '{}': {}", db_path, e);
            1
        }
    }
}
