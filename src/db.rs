use sea_orm::{ConnectOptions, ConnectionTrait, Database, DatabaseConnection, DbBackend, DbErr, Schema, Statement};
use sea_orm::sea_query::TableCreateStatement;
use std::time::Duration;
use tracing::info;

use crate::config::DatabaseConfig;
use crate::entity::{department, department_location, department_position, location, op_log, position};

/// Prefix lookups on `path` (LIKE 'a.b.%') need a pattern-ops index
const PATH_INDEX_SQL: &str =
    "CREATE INDEX IF NOT EXISTS idx_departments_path ON departments (path text_pattern_ops)";

/// Initialize database connection and auto-migrate tables
pub async fn init_database(config: &DatabaseConfig) -> Result<DatabaseConnection, DbErr> {
    let database_url = config.connection_url();

    info!("Connecting to database: {}:{}/{}", config.host, config.port, config.name);

    let mut opt = ConnectOptions::new(&database_url);
    opt.max_connections(config.max_connections)
        .min_connections(2)
        .connect_timeout(Duration::from_secs(8))
        .acquire_timeout(Duration::from_secs(8))
        .idle_timeout(Duration::from_secs(60))
        .sqlx_logging(true)
        .sqlx_logging_level(tracing::log::LevelFilter::Debug)
        .set_schema_search_path("public");

    let db = Database::connect(opt).await?;
    info!("Database connection established");

    auto_migrate(&db).await?;

    Ok(db)
}

/// Create missing tables and indexes
async fn auto_migrate(db: &DatabaseConnection) -> Result<(), DbErr> {
    let backend = db.get_database_backend();
    let schema = Schema::new(backend);

    info!("Running auto-migration for all entities...");

    // 1. Independent tables first
    create_table_if_not_exists(db, backend, schema.create_table_from_entity(department::Entity)).await?;
    create_table_if_not_exists(db, backend, schema.create_table_from_entity(location::Entity)).await?;
    create_table_if_not_exists(db, backend, schema.create_table_from_entity(position::Entity)).await?;
    create_table_if_not_exists(db, backend, schema.create_table_from_entity(op_log::Entity)).await?;

    // 2. Link tables
    create_table_if_not_exists(db, backend, schema.create_table_from_entity(department_location::Entity)).await?;
    create_table_if_not_exists(db, backend, schema.create_table_from_entity(department_position::Entity)).await?;

    db.execute(Statement::from_string(backend, PATH_INDEX_SQL.to_string()))
        .await?;

    info!("Auto-migration completed successfully");
    Ok(())
}

/// Create a table if it doesn't exist
async fn create_table_if_not_exists(
    db: &DatabaseConnection,
    backend: DbBackend,
    mut stmt: TableCreateStatement,
) -> Result<(), DbErr> {
    stmt.if_not_exists();

    let sql = backend.build(&stmt);

    db.execute(Statement::from_string(backend, sql.to_string())).await?;

    Ok(())
}
