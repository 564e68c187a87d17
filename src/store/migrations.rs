//! Schema versions for the swarm store.
//!
//! `_migrations` records every applied version; a migration and its record
//! commit together.

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
            CREATE TABLE IF NOT EXISTS problems (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                statement TEXT NOT NULL,
                hints TEXT NOT NULL DEFAULT '[]',
                phase TEXT NOT NULL DEFAULT 'collecting',
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS active_problem (
                slot INTEGER PRIMARY KEY CHECK (slot = 1),
                problem_id TEXT NOT NULL REFERENCES problems(id),
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS agents (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT,
                api_key TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL,
                last_active_at TEXT
            );

            CREATE TABLE IF NOT EXISTS solutions (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL REFERENCES agents(id),
                problem_id TEXT NOT NULL REFERENCES problems(id),
                level INTEGER NOT NULL CHECK (level >= 1),
                content TEXT NOT NULL,
                answer TEXT,
                confidence REAL CHECK (confidence IS NULL OR (confidence >= 0 AND confidence <= 1)),
                parent_ids TEXT NOT NULL DEFAULT '[]',
                claim_task_id TEXT,
                aggregated_into_id TEXT,
                aggregated_at TEXT,
                is_final INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_solutions_problem_level
                ON solutions(problem_id, level);
            CREATE INDEX IF NOT EXISTS idx_solutions_claim ON solutions(claim_task_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_solutions_one_final
                ON solutions(problem_id) WHERE is_final = 1;

            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL REFERENCES agents(id),
                problem_id TEXT NOT NULL REFERENCES problems(id),
                task_type TEXT NOT NULL,
                level INTEGER,
                status TEXT NOT NULL DEFAULT 'in_progress',
                payload TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL,
                completed_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_tasks_one_in_progress
                ON tasks(agent_id, problem_id) WHERE status = 'in_progress';
        "#,
    },
];

/// Bring the schema up to the newest version.
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

    let applied = applied_version(conn).await?;
    let pending = MIGRATIONS.iter().filter(|m| m.version > applied);

    for migration in pending {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        apply(conn, migration).await?;
    }

    let version = applied_version(conn).await?;
    tracing::info!(version, "Database migrations complete");
    Ok(())
}

async fn apply(conn: &Connection, migration: &Migration) -> Result<(), DatabaseError> {
    let failed = |stage: &str, e: libsql::Error| {
        DatabaseError::Migration(format!(
            "V{} ({}) {stage}: {e}",
            migration.version, migration.name
        ))
    };

    let tx = conn.transaction().await.map_err(|e| failed("begin", e))?;
    tx.execute_batch(migration.sql)
        .await
        .map_err(|e| failed("schema", e))?;
    tx.execute(
        "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![migration.version, migration.name],
    )
    .await
    .map_err(|e| failed("record", e))?;
    tx.commit().await.map_err(|e| failed("commit", e))
}

async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read schema version: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => Ok(row.get::<i64>(0).unwrap_or(0)),
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::Migration(format!(
            "Failed to read schema version: {e}"
        ))),
    }
}
