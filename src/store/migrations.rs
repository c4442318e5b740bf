//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS expressions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner_id TEXT NOT NULL,
                expression TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                result REAL,
                error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_expressions_owner ON expressions(owner_id);
            CREATE INDEX IF NOT EXISTS idx_expressions_status ON expressions(status);

            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                expression_id INTEGER NOT NULL REFERENCES expressions(id) ON DELETE CASCADE,
                ordinal INTEGER NOT NULL,
                operator TEXT NOT NULL,
                arg1_value REAL,
                arg1_ref INTEGER,
                arg2_value REAL,
                arg2_ref INTEGER,
                status TEXT NOT NULL DEFAULT 'pending',
                result REAL,
                error TEXT,
                operation_time_ms INTEGER NOT NULL DEFAULT 0,
                completed_at TEXT,
                UNIQUE (expression_id, ordinal)
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status_ordinal ON tasks(status, ordinal);
            CREATE INDEX IF NOT EXISTS idx_tasks_expression ON tasks(expression_id, ordinal);
        "#,
    },
    Migration {
        version: 2,
        name: "task_leases",
        sql: r#"
            ALTER TABLE tasks ADD COLUMN claimed_by TEXT;
            ALTER TABLE tasks ADD COLUMN claimed_at TEXT;
            ALTER TABLE tasks ADD COLUMN lease_expires_at INTEGER;
            ALTER TABLE tasks ADD COLUMN attempts INTEGER NOT NULL DEFAULT 0;
            CREATE INDEX IF NOT EXISTS idx_tasks_lease ON tasks(status, lease_expires_at);
        "#,
    },
    Migration {
        version: 3,
        name: "expression_task_count",
        sql: r#"
            ALTER TABLE expressions ADD COLUMN task_count INTEGER;
            UPDATE expressions
               SET task_count = (SELECT COUNT(*) FROM tasks WHERE tasks.expression_id = expressions.id);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::info!(
        version = version,
        "Database migrations complete"
    );

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
