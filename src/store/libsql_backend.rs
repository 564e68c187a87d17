//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Multi-row mutations run in
//! `BEGIN IMMEDIATE` transactions serialized by a write gate, since every
//! operation shares one connection.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, TransactionBehavior, params};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{
    ClaimOutcome, CompletionOutcome, Database, ProblemStats, SolutionFilter,
};
use crate::swarm::model::{
    AggregationSource, Agent, AgentSummary, Confidence, LevelCount, Problem, ProblemPhase,
    Solution, SourceState, Task, TaskKind, TaskPayload, TaskStatus,
};

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Held for the lifetime of each write transaction.
    write_gate: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_gate: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn begin_write(&self, op: &str) -> Result<libsql::Transaction, DatabaseError> {
        self.conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .await
            .map_err(|e| DatabaseError::from_libsql(op, e))
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width timestamps so lexical order matches chronological order.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

fn parse_optional_uuid(s: &Option<String>) -> Option<Uuid> {
    s.as_deref().and_then(|s| Uuid::parse_str(s).ok())
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

/// `?, ?, ?` for an IN list of `n` items.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn uuid_values(ids: &[Uuid]) -> Vec<libsql::Value> {
    ids.iter()
        .map(|id| libsql::Value::Text(id.to_string()))
        .collect()
}

fn json_list(ids: &[Uuid]) -> Result<String, DatabaseError> {
    serde_json::to_string(ids).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Map a libsql Row to a Problem.
///
/// Column order matches PROBLEM_COLUMNS plus a trailing is_active flag.
fn row_to_problem(row: &libsql::Row) -> Result<Problem, libsql::Error> {
    let id_str: String = row.get(0)?;
    let hints_str: String = row.get(3)?;
    let phase_str: String = row.get(4)?;
    let created_str: String = row.get(5)?;
    let is_active: i64 = row.get(6).unwrap_or(0);

    Ok(Problem {
        id: parse_uuid(&id_str),
        title: row.get(1)?,
        statement: row.get(2)?,
        hints: serde_json::from_str(&hints_str).unwrap_or_default(),
        phase: phase_str.parse().unwrap_or_default(),
        is_active: is_active != 0,
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to an Agent. Column order matches AGENT_COLUMNS.
fn row_to_agent(row: &libsql::Row) -> Result<Agent, libsql::Error> {
    let id_str: String = row.get(0)?;
    let api_key: String = row.get(3)?;
    let created_str: String = row.get(4)?;
    let last_active: Option<String> = row.get(5).ok();

    Ok(Agent {
        id: parse_uuid(&id_str),
        name: row.get(1)?,
        description: row.get(2).ok(),
        api_key: SecretString::from(api_key),
        created_at: parse_datetime(&created_str),
        last_active_at: parse_optional_datetime(&last_active),
    })
}

/// Map a libsql Row to a Solution.
///
/// Column order matches SOLUTION_COLUMNS:
/// 0:id, 1:agent_id, 2:problem_id, 3:level, 4:content, 5:answer, 6:confidence,
/// 7:parent_ids, 8:claim_task_id, 9:aggregated_into_id, 10:aggregated_at,
/// 11:is_final, 12:created_at
fn row_to_solution(row: &libsql::Row) -> Result<Solution, libsql::Error> {
    let id_str: String = row.get(0)?;
    let agent_str: String = row.get(1)?;
    let problem_str: String = row.get(2)?;
    let level: i64 = row.get(3)?;
    let confidence: Option<f64> = row.get(6).ok();
    let parents_str: String = row.get(7)?;
    let claim_task: Option<String> = row.get(8).ok();
    let aggregated_into: Option<String> = row.get(9).ok();
    let aggregated_at: Option<String> = row.get(10).ok();
    let is_final: i64 = row.get(11)?;
    let created_str: String = row.get(12)?;

    let state = match (
        parse_optional_uuid(&aggregated_into),
        parse_optional_uuid(&claim_task),
    ) {
        (Some(solution_id), _) => SourceState::Aggregated {
            solution_id,
            at: parse_optional_datetime(&aggregated_at).unwrap_or(DateTime::<Utc>::MIN_UTC),
        },
        (None, Some(task_id)) => SourceState::ClaimedBy(task_id),
        (None, None) => SourceState::Unclaimed,
    };

    Ok(Solution {
        id: parse_uuid(&id_str),
        agent_id: parse_uuid(&agent_str),
        problem_id: parse_uuid(&problem_str),
        level: level.max(1) as u32,
        content: row.get(4)?,
        answer: row.get(5).ok(),
        confidence: confidence.and_then(Confidence::clamped),
        parent_ids: serde_json::from_str(&parents_str).unwrap_or_default(),
        state,
        is_final: is_final != 0,
        created_at: parse_datetime(&created_str),
    })
}

/// Map a libsql Row to an AggregationSource. Column order matches SOURCE_COLUMNS.
fn row_to_source(row: &libsql::Row) -> Result<AggregationSource, libsql::Error> {
    let id_str: String = row.get(0)?;
    let confidence: Option<f64> = row.get(3).ok();
    let level: i64 = row.get(5)?;

    Ok(AggregationSource {
        id: parse_uuid(&id_str),
        content: row.get(1)?,
        answer: row.get(2).ok(),
        confidence: confidence.and_then(Confidence::clamped),
        agent_name: row.get(4).unwrap_or_default(),
        level: level.max(1) as u32,
    })
}

/// Map a libsql Row to a Task. Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<Task, libsql::Error> {
    let id_str: String = row.get(0)?;
    let agent_str: String = row.get(1)?;
    let problem_str: String = row.get(2)?;
    let kind_str: String = row.get(3)?;
    let level: Option<i64> = row.get(4).ok();
    let status_str: String = row.get(5)?;
    let payload_str: String = row.get(6)?;
    let created_str: String = row.get(7)?;
    let completed_str: Option<String> = row.get(8).ok();

    Ok(Task {
        id: parse_uuid(&id_str),
        agent_id: parse_uuid(&agent_str),
        problem_id: parse_uuid(&problem_str),
        kind: kind_str.parse().unwrap_or(TaskKind::Solve),
        level: level.map(|l| l.max(1) as u32),
        status: status_str.parse().unwrap_or(TaskStatus::InProgress),
        payload: serde_json::from_str::<TaskPayload>(&payload_str).unwrap_or_default(),
        created_at: parse_datetime(&created_str),
        completed_at: parse_optional_datetime(&completed_str),
    })
}

/// Drain rows through `map`, skipping rows that fail to parse.
async fn collect_rows<T>(
    mut rows: libsql::Rows,
    what: &str,
    map: fn(&libsql::Row) -> Result<T, libsql::Error>,
) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        match map(&row) {
            Ok(item) => out.push(item),
            Err(e) => warn!("Skipping {what} row: {e}"),
        }
    }
    out
}

async fn query_level_counts(
    conn: &Connection,
    sql: &str,
    problem_id: Uuid,
    op: &str,
) -> Result<Vec<LevelCount>, DatabaseError> {
    let mut rows = conn
        .query(sql, params![problem_id.to_string()])
        .await
        .map_err(|e| DatabaseError::from_libsql(op, e))?;

    let mut counts = Vec::new();
    while let Ok(Some(row)) = rows.next().await {
        let level: i64 = row.get(0).unwrap_or(1);
        let count: i64 = row.get(1).unwrap_or(0);
        counts.push(LevelCount {
            level: level.max(1) as u32,
            count: count as usize,
        });
    }
    Ok(counts)
}

async fn query_count(
    conn: &Connection,
    sql: &str,
    values: Vec<libsql::Value>,
    op: &str,
) -> Result<u64, DatabaseError> {
    let mut rows = conn
        .query(sql, values)
        .await
        .map_err(|e| DatabaseError::from_libsql(op, e))?;
    match rows.next().await {
        Ok(Some(row)) => {
            let count: i64 = row.get(0).unwrap_or(0);
            Ok(count.max(0) as u64)
        }
        Ok(None) => Ok(0),
        Err(e) => Err(DatabaseError::from_libsql(op, e)),
    }
}

async fn insert_task_row(conn: &Connection, task: &Task) -> Result<(), DatabaseError> {
    let payload = serde_json::to_string(&task.payload)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    let level = match task.level {
        Some(l) => libsql::Value::Integer(l as i64),
        None => libsql::Value::Null,
    };
    conn.execute(
        &format!("INSERT INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
        params![
            task.id.to_string(),
            task.agent_id.to_string(),
            task.problem_id.to_string(),
            task.kind.to_string(),
            level,
            task.status.to_string(),
            payload,
            fmt_datetime(&task.created_at),
            opt_text_owned(task.completed_at.as_ref().map(fmt_datetime)),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("insert_task", e))?;
    Ok(())
}

async fn insert_solution_row(conn: &Connection, solution: &Solution) -> Result<(), DatabaseError> {
    let (claim_task, aggregated_into, aggregated_at) = match &solution.state {
        SourceState::Unclaimed => (None, None, None),
        SourceState::ClaimedBy(task_id) => (Some(task_id.to_string()), None, None),
        SourceState::Aggregated { solution_id, at } => {
            (None, Some(solution_id.to_string()), Some(fmt_datetime(at)))
        }
    };
    let confidence = match solution.confidence {
        Some(c) => libsql::Value::Real(c.value()),
        None => libsql::Value::Null,
    };

    conn.execute(
        &format!(
            "INSERT INTO solutions ({SOLUTION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            solution.id.to_string(),
            solution.agent_id.to_string(),
            solution.problem_id.to_string(),
            solution.level as i64,
            solution.content.clone(),
            opt_text_owned(solution.answer.clone()),
            confidence,
            json_list(&solution.parent_ids)?,
            opt_text_owned(claim_task),
            opt_text_owned(aggregated_into),
            opt_text_owned(aggregated_at),
            solution.is_final as i64,
            fmt_datetime(&solution.created_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("insert_solution", e))?;
    Ok(())
}

/// Body of `claim_batch`, run inside the write transaction.
async fn claim_in_tx(conn: &Connection, task: &Task) -> Result<Option<Task>, DatabaseError> {
    let mut task = task.clone();

    if task.payload.is_final {
        let finals = query_count(
            conn,
            "SELECT
                (SELECT COUNT(*) FROM tasks
                  WHERE problem_id = ?1 AND task_type = 'aggregate' AND status = 'in_progress'
                    AND json_extract(payload, '$.is_final') = 1)
              + (SELECT COUNT(*) FROM solutions WHERE problem_id = ?1 AND is_final = 1)",
            vec![libsql::Value::Text(task.problem_id.to_string())],
            "claim_batch final check",
        )
        .await?;
        if finals > 0 {
            debug!(task_id = %task.id, "Final synthesis already in flight, planning non-final batch");
            task.payload.is_final = false;
        }
    }

    insert_task_row(conn, &task).await?;

    let ids = &task.payload.source_ids;
    let mut values = vec![libsql::Value::Text(task.id.to_string())];
    values.extend(uuid_values(ids));
    let claimed = conn
        .execute(
            &format!(
                "UPDATE solutions SET claim_task_id = ? \
                 WHERE claim_task_id IS NULL AND aggregated_into_id IS NULL AND id IN ({})",
                placeholders(ids.len())
            ),
            values,
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("claim_batch", e))?;

    if claimed as usize != ids.len() {
        return Ok(None);
    }
    Ok(Some(task))
}

/// Body of `complete_task`, run inside the write transaction.
async fn complete_in_tx(
    conn: &Connection,
    task_id: Uuid,
    solution: &Solution,
) -> Result<CompletionOutcome, DatabaseError> {
    let active = query_count(
        conn,
        "SELECT COUNT(*) FROM active_problem WHERE slot = 1 AND problem_id = ?1",
        vec![libsql::Value::Text(solution.problem_id.to_string())],
        "complete_task active check",
    )
    .await?;
    if active == 0 {
        return Ok(CompletionOutcome::ProblemInactive);
    }

    let now = fmt_datetime(&Utc::now());
    let closed = conn
        .execute(
            "UPDATE tasks SET status = 'completed', completed_at = ?2 \
             WHERE id = ?1 AND status = 'in_progress'",
            params![task_id.to_string(), now.clone()],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("complete_task", e))?;
    if closed == 0 {
        return Ok(CompletionOutcome::NotInProgress);
    }

    insert_solution_row(conn, solution).await?;

    let resolved = conn
        .execute(
            "UPDATE solutions SET claim_task_id = NULL, aggregated_into_id = ?1, aggregated_at = ?2 \
             WHERE claim_task_id = ?3",
            params![solution.id.to_string(), now, task_id.to_string()],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("resolve_claims", e))?;

    debug!(task_id = %task_id, solution_id = %solution.id, resolved, "Claims resolved");
    Ok(CompletionOutcome::Completed)
}

/// Body of `create_problem`, run inside the write transaction.
async fn create_problem_in_tx(conn: &Connection, problem: &Problem) -> Result<(), DatabaseError> {
    let hints = serde_json::to_string(&problem.hints)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    conn.execute(
        "INSERT INTO problems (id, title, statement, hints, phase, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            problem.id.to_string(),
            problem.title.clone(),
            problem.statement.clone(),
            hints,
            problem.phase.to_string(),
            fmt_datetime(&problem.created_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("create_problem", e))?;

    conn.execute(
        "INSERT INTO active_problem (slot, problem_id, updated_at) VALUES (1, ?1, ?2)
         ON CONFLICT (slot) DO UPDATE SET problem_id = excluded.problem_id, updated_at = excluded.updated_at",
        params![problem.id.to_string(), fmt_datetime(&Utc::now())],
    )
    .await
    .map_err(|e| DatabaseError::from_libsql("swap_active_problem", e))?;
    Ok(())
}

/// Body of `expire_stale_tasks`, run inside the write transaction.
async fn expire_in_tx(conn: &Connection, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
    let expired = conn
        .execute(
            "UPDATE tasks SET status = 'expired', completed_at = ?2 \
             WHERE status = 'in_progress' AND created_at < ?1",
            params![fmt_datetime(&cutoff), fmt_datetime(&Utc::now())],
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("expire_tasks", e))?;

    if expired > 0 {
        conn.execute(
            "UPDATE solutions SET claim_task_id = NULL \
             WHERE claim_task_id IN (SELECT id FROM tasks WHERE status = 'expired')",
            (),
        )
        .await
        .map_err(|e| DatabaseError::from_libsql("release_claims", e))?;
    }
    Ok(expired as usize)
}

/// Commit on success, roll back otherwise.
async fn finish<T>(
    tx: libsql::Transaction,
    op: &str,
    result: Result<T, DatabaseError>,
    keep: impl Fn(&T) -> bool,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) if keep(&value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::from_libsql(op, e))?;
            Ok(value)
        }
        Ok(value) => {
            tx.rollback()
                .await
                .map_err(|e| DatabaseError::from_libsql(op, e))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rb) = tx.rollback().await {
                warn!(op, error = %rb, "Rollback failed");
            }
            Err(e)
        }
    }
}

/// WHERE clause and values for a solution listing.
fn solution_filter_sql(problem_id: Uuid, filter: &SolutionFilter) -> (String, Vec<libsql::Value>) {
    let mut clause = String::from("problem_id = ?");
    let mut values = vec![libsql::Value::Text(problem_id.to_string())];
    if let Some(level) = filter.level {
        clause.push_str(" AND level = ?");
        values.push(libsql::Value::Integer(level as i64));
    }
    if let Some(above) = filter.above_level {
        clause.push_str(" AND level > ?");
        values.push(libsql::Value::Integer(above as i64));
    }
    (clause, values)
}

// ── Trait implementation ────────────────────────────────────────────

const PROBLEM_COLUMNS: &str = "p.id, p.title, p.statement, p.hints, p.phase, p.created_at";

const AGENT_COLUMNS: &str = "id, name, description, api_key, created_at, last_active_at";

const SOLUTION_COLUMNS: &str = "id, agent_id, problem_id, level, content, answer, confidence, parent_ids, claim_task_id, aggregated_into_id, aggregated_at, is_final, created_at";

const SOURCE_COLUMNS: &str =
    "s.id, s.content, s.answer, s.confidence, COALESCE(a.name, ''), s.level";

const TASK_COLUMNS: &str =
    "id, agent_id, problem_id, task_type, level, status, payload, created_at, completed_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Problems ────────────────────────────────────────────────────

    async fn create_problem(&self, problem: &Problem) -> Result<Problem, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let tx = self.begin_write("create_problem").await?;
        let result = create_problem_in_tx(&tx, problem).await;
        finish(tx, "create_problem", result, |_| true).await?;

        info!(problem_id = %problem.id, title = %problem.title, "Problem created and activated");
        Ok(Problem {
            is_active: true,
            ..problem.clone()
        })
    }

    async fn get_problem(&self, id: Uuid) -> Result<Option<Problem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PROBLEM_COLUMNS}, ap.problem_id IS NOT NULL FROM problems p \
                     LEFT JOIN active_problem ap ON ap.problem_id = p.id WHERE p.id = ?1"
                ),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_problem", e))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_problem(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_problem row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_problem", e)),
        }
    }

    async fn get_active_problem(&self) -> Result<Option<Problem>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {PROBLEM_COLUMNS}, 1 FROM active_problem ap \
                     JOIN problems p ON p.id = ap.problem_id WHERE ap.slot = 1"
                ),
                (),
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_active_problem", e))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_problem(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_active_problem row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_active_problem", e)),
        }
    }

    async fn is_problem_active(&self, id: Uuid) -> Result<bool, DatabaseError> {
        let count = query_count(
            self.conn(),
            "SELECT COUNT(*) FROM active_problem WHERE slot = 1 AND problem_id = ?1",
            vec![libsql::Value::Text(id.to_string())],
            "is_problem_active",
        )
        .await?;
        Ok(count > 0)
    }

    async fn update_problem_phase(
        &self,
        id: Uuid,
        phase: ProblemPhase,
    ) -> Result<bool, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE problems SET phase = ?1 WHERE id = ?2",
                params![phase.to_string(), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("update_problem_phase", e))?;

        debug!(problem_id = %id, phase = %phase, "Problem phase updated");
        Ok(updated > 0)
    }

    async fn problem_stats(&self, id: Uuid) -> Result<ProblemStats, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT
                    (SELECT COUNT(*) FROM solutions WHERE problem_id = ?1 AND level = 1),
                    (SELECT COUNT(*) FROM solutions WHERE problem_id = ?1 AND level > 1),
                    (SELECT COUNT(DISTINCT agent_id) FROM solutions WHERE problem_id = ?1),
                    (SELECT COALESCE(MAX(level), 0) FROM solutions WHERE problem_id = ?1)",
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("problem_stats", e))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(ProblemStats {
                l1_solutions: row.get::<i64>(0).unwrap_or(0) as u64,
                total_aggregations: row.get::<i64>(1).unwrap_or(0) as u64,
                participating_agents: row.get::<i64>(2).unwrap_or(0) as u64,
                highest_level: row.get::<i64>(3).unwrap_or(0) as u32,
            }),
            Ok(None) => Ok(ProblemStats::default()),
            Err(e) => Err(DatabaseError::from_libsql("problem_stats", e)),
        }
    }

    // ── Agents ──────────────────────────────────────────────────────

    async fn insert_agent(&self, agent: &Agent) -> Result<(), DatabaseError> {
        let _gate = self.write_gate.lock().await;
        self.conn()
            .execute(
                &format!("INSERT INTO agents ({AGENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
                params![
                    agent.id.to_string(),
                    agent.name.clone(),
                    opt_text_owned(agent.description.clone()),
                    agent.api_key.expose_secret().to_string(),
                    fmt_datetime(&agent.created_at),
                    opt_text_owned(agent.last_active_at.as_ref().map(fmt_datetime)),
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("insert_agent", e))?;

        debug!(agent_id = %agent.id, name = %agent.name, "Agent inserted into DB");
        Ok(())
    }

    async fn get_agent(&self, id: Uuid) -> Result<Option<Agent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_agent", e))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_agent(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_agent row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_agent", e)),
        }
    }

    async fn get_agent_by_api_key(&self, api_key: &str) -> Result<Option<Agent>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM agents WHERE api_key = ?1"),
                params![api_key],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_agent_by_api_key", e))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_agent(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_agent_by_api_key row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_agent_by_api_key", e)),
        }
    }

    async fn touch_agent(&self, id: Uuid) -> Result<(), DatabaseError> {
        let _gate = self.write_gate.lock().await;
        self.conn()
            .execute(
                "UPDATE agents SET last_active_at = ?1 WHERE id = ?2",
                params![fmt_datetime(&Utc::now()), id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("touch_agent", e))?;
        Ok(())
    }

    async fn list_agents(&self) -> Result<Vec<AgentSummary>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT a.id, a.name, a.description, a.created_at, a.last_active_at,
                    (SELECT COUNT(*) FROM solutions s WHERE s.agent_id = a.id)
                 FROM agents a ORDER BY a.created_at DESC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list_agents", e))?;

        let mut agents = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            let created_str: String = row.get(3).unwrap_or_default();
            let last_active: Option<String> = row.get(4).ok();
            agents.push(AgentSummary {
                id: parse_uuid(&id_str),
                name: row.get(1).unwrap_or_default(),
                description: row.get(2).ok(),
                created_at: parse_datetime(&created_str),
                last_active_at: parse_optional_datetime(&last_active),
                solution_count: row.get::<i64>(5).unwrap_or(0) as u64,
            });
        }
        Ok(agents)
    }

    async fn agent_stats(&self, id: Uuid) -> Result<(u64, u64), DatabaseError> {
        let solutions = query_count(
            self.conn(),
            "SELECT COUNT(*) FROM solutions WHERE agent_id = ?1",
            vec![libsql::Value::Text(id.to_string())],
            "agent_stats",
        )
        .await?;
        let tasks = query_count(
            self.conn(),
            "SELECT COUNT(*) FROM tasks WHERE agent_id = ?1 AND status = 'completed'",
            vec![libsql::Value::Text(id.to_string())],
            "agent_stats",
        )
        .await?;
        Ok((solutions, tasks))
    }

    // ── Solutions ───────────────────────────────────────────────────

    async fn get_solution(&self, id: Uuid) -> Result<Option<Solution>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SOLUTION_COLUMNS} FROM solutions WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_solution", e))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_solution(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_solution row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_solution", e)),
        }
    }

    async fn get_solutions_by_ids(&self, ids: &[Uuid]) -> Result<Vec<Solution>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SOLUTION_COLUMNS} FROM solutions WHERE id IN ({})",
                    placeholders(ids.len())
                ),
                uuid_values(ids),
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_solutions_by_ids", e))?;

        let mut by_id: HashMap<Uuid, Solution> = collect_rows(rows, "solution", row_to_solution)
            .await
            .into_iter()
            .map(|s| (s.id, s))
            .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn list_solutions(
        &self,
        problem_id: Uuid,
        filter: &SolutionFilter,
    ) -> Result<Vec<Solution>, DatabaseError> {
        let (clause, mut values) = solution_filter_sql(problem_id, filter);
        values.push(libsql::Value::Integer(
            filter
                .limit
                .map(|l| i64::try_from(l).unwrap_or(i64::MAX))
                .unwrap_or(-1),
        ));
        values.push(libsql::Value::Integer(filter.offset as i64));

        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SOLUTION_COLUMNS} FROM solutions WHERE {clause} \
                     ORDER BY level DESC, created_at DESC, rowid DESC LIMIT ? OFFSET ?"
                ),
                values,
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("list_solutions", e))?;

        Ok(collect_rows(rows, "solution", row_to_solution).await)
    }

    async fn count_solutions(
        &self,
        problem_id: Uuid,
        filter: &SolutionFilter,
    ) -> Result<u64, DatabaseError> {
        let (clause, values) = solution_filter_sql(problem_id, filter);
        query_count(
            self.conn(),
            &format!("SELECT COUNT(*) FROM solutions WHERE {clause}"),
            values,
            "count_solutions",
        )
        .await
    }

    async fn level_counts(&self, problem_id: Uuid) -> Result<Vec<LevelCount>, DatabaseError> {
        query_level_counts(
            self.conn(),
            "SELECT level, COUNT(*) FROM solutions WHERE problem_id = ?1 \
             GROUP BY level ORDER BY level ASC",
            problem_id,
            "level_counts",
        )
        .await
    }

    async fn unclaimed_level_counts(
        &self,
        problem_id: Uuid,
    ) -> Result<Vec<LevelCount>, DatabaseError> {
        query_level_counts(
            self.conn(),
            "SELECT level, COUNT(*) FROM solutions \
             WHERE problem_id = ?1 AND claim_task_id IS NULL AND aggregated_into_id IS NULL \
             GROUP BY level ORDER BY level ASC",
            problem_id,
            "unclaimed_level_counts",
        )
        .await
    }

    async fn select_batch(
        &self,
        problem_id: Uuid,
        level: u32,
        exclude_agent: Uuid,
        limit: usize,
    ) -> Result<Vec<AggregationSource>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SOURCE_COLUMNS} FROM solutions s LEFT JOIN agents a ON a.id = s.agent_id \
                     WHERE s.problem_id = ?1 AND s.level = ?2 \
                       AND s.claim_task_id IS NULL AND s.aggregated_into_id IS NULL \
                       AND s.agent_id != ?3 \
                     ORDER BY s.created_at ASC, s.rowid ASC LIMIT ?4"
                ),
                params![
                    problem_id.to_string(),
                    level as i64,
                    exclude_agent.to_string(),
                    limit as i64
                ],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("select_batch", e))?;

        Ok(collect_rows(rows, "source", row_to_source).await)
    }

    async fn get_aggregation_sources(
        &self,
        ids: &[Uuid],
    ) -> Result<Vec<AggregationSource>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SOURCE_COLUMNS} FROM solutions s LEFT JOIN agents a ON a.id = s.agent_id \
                     WHERE s.id IN ({})",
                    placeholders(ids.len())
                ),
                uuid_values(ids),
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_aggregation_sources", e))?;

        let mut by_id: HashMap<Uuid, AggregationSource> =
            collect_rows(rows, "source", row_to_source)
                .await
                .into_iter()
                .map(|s| (s.id, s))
                .collect();
        Ok(ids.iter().filter_map(|id| by_id.remove(id)).collect())
    }

    async fn get_final_solution(&self, problem_id: Uuid) -> Result<Option<Solution>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SOLUTION_COLUMNS} FROM solutions WHERE problem_id = ?1 AND is_final = 1 LIMIT 1"
                ),
                params![problem_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_final_solution", e))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_solution(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_final_solution row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_final_solution", e)),
        }
    }

    async fn get_highest_level_solution(
        &self,
        problem_id: Uuid,
    ) -> Result<Option<Solution>, DatabaseError> {
        let filter = SolutionFilter {
            limit: Some(1),
            ..SolutionFilter::default()
        };
        Ok(self
            .list_solutions(problem_id, &filter)
            .await?
            .into_iter()
            .next())
    }

    async fn agent_names(&self, ids: &[Uuid]) -> Result<Vec<(Uuid, String)>, DatabaseError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT id, name FROM agents WHERE id IN ({})",
                    placeholders(ids.len())
                ),
                uuid_values(ids),
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("agent_names", e))?;

        let mut names = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id_str: String = row.get(0).unwrap_or_default();
            let name: String = row.get(1).unwrap_or_default();
            names.push((parse_uuid(&id_str), name));
        }
        Ok(names)
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("get_task", e))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_task(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("get_task row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("get_task", e)),
        }
    }

    async fn find_in_progress_task(
        &self,
        agent_id: Uuid,
        problem_id: Uuid,
    ) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE agent_id = ?1 AND problem_id = ?2 AND status = 'in_progress' LIMIT 1"
                ),
                params![agent_id.to_string(), problem_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::from_libsql("find_in_progress_task", e))?;

        match rows.next().await {
            Ok(Some(row)) => row_to_task(&row)
                .map(Some)
                .map_err(|e| DatabaseError::Query(format!("find_in_progress_task row parse: {e}"))),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::from_libsql("find_in_progress_task", e)),
        }
    }

    async fn insert_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let _gate = self.write_gate.lock().await;
        insert_task_row(self.conn(), task).await?;
        debug!(task_id = %task.id, kind = %task.kind, "Task inserted into DB");
        Ok(())
    }

    async fn claim_batch(&self, task: &Task) -> Result<ClaimOutcome, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let tx = self.begin_write("claim_batch").await?;
        let result = claim_in_tx(&tx, task).await;
        let claimed = finish(tx, "claim_batch", result, Option::is_some).await?;

        Ok(match claimed {
            Some(task) => ClaimOutcome::Claimed(task),
            None => ClaimOutcome::Contended,
        })
    }

    async fn complete_task(
        &self,
        task_id: Uuid,
        solution: &Solution,
    ) -> Result<CompletionOutcome, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let tx = self.begin_write("complete_task").await?;
        let result = complete_in_tx(&tx, task_id, solution).await;
        finish(tx, "complete_task", result, |outcome| {
            *outcome == CompletionOutcome::Completed
        })
        .await
    }

    async fn expire_stale_tasks(&self, cutoff: DateTime<Utc>) -> Result<usize, DatabaseError> {
        let _gate = self.write_gate.lock().await;
        let tx = self.begin_write("expire_stale_tasks").await?;
        let result = expire_in_tx(&tx, cutoff).await;
        let count = finish(tx, "expire_stale_tasks", result, |_| true).await?;

        if count > 0 {
            info!(count, "Expired stale tasks and released their claims");
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swarm::model::TaskResult;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    async fn make_agent(db: &LibSqlBackend, name: &str) -> Agent {
        let agent = Agent::new(name, None, "clawswarm_");
        db.insert_agent(&agent).await.unwrap();
        agent
    }

    async fn make_problem(db: &LibSqlBackend) -> Problem {
        db.create_problem(&Problem::new("Sum", "What is 40 + 2?", vec![]))
            .await
            .unwrap()
    }

    fn solution_for(task: &Task, result: TaskResult) -> Solution {
        Solution {
            id: Uuid::new_v4(),
            agent_id: task.agent_id,
            problem_id: task.problem_id,
            level: task.output_level(),
            content: result.content,
            answer: result.answer,
            confidence: result.confidence,
            parent_ids: task.payload.source_ids.clone(),
            state: SourceState::Unclaimed,
            is_final: task.payload.is_final,
            created_at: Utc::now(),
        }
    }

    /// Solve-and-submit in one go; returns the new solution id.
    async fn seed_solution(db: &LibSqlBackend, agent: &Agent, problem: &Problem) -> Uuid {
        let task = Task::solve(agent.id, problem.id);
        db.insert_task(&task).await.unwrap();
        let solution = solution_for(
            &task,
            TaskResult {
                content: format!("work by {}", agent.name),
                answer: Some("42".into()),
                confidence: Confidence::clamped(0.8),
            },
        );
        let outcome = db.complete_task(task.id, &solution).await.unwrap();
        assert_eq!(outcome, CompletionOutcome::Completed);
        solution.id
    }

    // ── Problem tests ───────────────────────────────────────────────

    #[tokio::test]
    async fn create_problem_replaces_active() {
        let db = test_db().await;
        assert!(db.get_active_problem().await.unwrap().is_none());

        let first = make_problem(&db).await;
        assert!(first.is_active);
        assert!(db.is_problem_active(first.id).await.unwrap());

        let second = make_problem(&db).await;
        assert!(!db.is_problem_active(first.id).await.unwrap());
        assert!(db.is_problem_active(second.id).await.unwrap());

        let active = db.get_active_problem().await.unwrap().unwrap();
        assert_eq!(active.id, second.id);
        let old = db.get_problem(first.id).await.unwrap().unwrap();
        assert!(!old.is_active);
    }

    #[tokio::test]
    async fn hints_and_phase_round_trip() {
        let db = test_db().await;
        let problem = db
            .create_problem(&Problem::new("T", "S", vec!["a".into(), "b".into()]))
            .await
            .unwrap();
        assert!(db
            .update_problem_phase(problem.id, ProblemPhase::Aggregating)
            .await
            .unwrap());
        assert!(!db
            .update_problem_phase(Uuid::new_v4(), ProblemPhase::Finalized)
            .await
            .unwrap());

        let fetched = db.get_problem(problem.id).await.unwrap().unwrap();
        assert_eq!(fetched.hints, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(fetched.phase, ProblemPhase::Aggregating);
    }

    // ── Agent tests ─────────────────────────────────────────────────

    #[tokio::test]
    async fn duplicate_agent_name_is_constraint() {
        let db = test_db().await;
        make_agent(&db, "alpha").await;
        let dup = Agent::new("alpha", None, "clawswarm_");
        let err = db.insert_agent(&dup).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn agent_lookup_by_key_and_touch() {
        let db = test_db().await;
        let agent = make_agent(&db, "alpha").await;

        let found = db
            .get_agent_by_api_key(agent.api_key.expose_secret())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, agent.id);
        assert!(found.last_active_at.is_none());

        db.touch_agent(agent.id).await.unwrap();
        let touched = db.get_agent(agent.id).await.unwrap().unwrap();
        assert!(touched.last_active_at.is_some());

        assert!(db.get_agent_by_api_key("nope").await.unwrap().is_none());
    }

    // ── Solution + task tests ───────────────────────────────────────

    #[tokio::test]
    async fn select_batch_excludes_author_oldest_first() {
        let db = test_db().await;
        let problem = make_problem(&db).await;
        let a = make_agent(&db, "a").await;
        let b = make_agent(&db, "b").await;
        let c = make_agent(&db, "c").await;

        let s_a = seed_solution(&db, &a, &problem).await;
        let s_b = seed_solution(&db, &b, &problem).await;
        let s_c = seed_solution(&db, &c, &problem).await;

        let batch = db.select_batch(problem.id, 1, b.id, 10).await.unwrap();
        let ids: Vec<Uuid> = batch.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![s_a, s_c]);
        assert_eq!(batch[0].agent_name, "a");

        let limited = db.select_batch(problem.id, 1, Uuid::new_v4(), 2).await.unwrap();
        let ids: Vec<Uuid> = limited.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![s_a, s_b]);
    }

    #[tokio::test]
    async fn claim_batch_claims_all_sources() {
        let db = test_db().await;
        let problem = make_problem(&db).await;
        let a = make_agent(&db, "a").await;
        let b = make_agent(&db, "b").await;
        let f = make_agent(&db, "f").await;
        let ids = vec![
            seed_solution(&db, &a, &problem).await,
            seed_solution(&db, &b, &problem).await,
        ];

        let task = Task::aggregate(f.id, problem.id, 2, ids.clone(), false);
        let outcome = db.claim_batch(&task).await.unwrap();
        assert!(matches!(outcome, ClaimOutcome::Claimed(_)));

        for sol in db.get_solutions_by_ids(&ids).await.unwrap() {
            assert_eq!(sol.state, SourceState::ClaimedBy(task.id));
        }
        assert!(db.unclaimed_level_counts(problem.id).await.unwrap().is_empty());
        assert_eq!(
            db.find_in_progress_task(f.id, problem.id).await.unwrap().unwrap().id,
            task.id
        );
    }

    #[tokio::test]
    async fn claim_batch_is_contended_when_source_taken() {
        let db = test_db().await;
        let problem = make_problem(&db).await;
        let a = make_agent(&db, "a").await;
        let b = make_agent(&db, "b").await;
        let c = make_agent(&db, "c").await;
        let f = make_agent(&db, "f").await;
        let g = make_agent(&db, "g").await;
        let s_a = seed_solution(&db, &a, &problem).await;
        let s_b = seed_solution(&db, &b, &problem).await;
        let s_c = seed_solution(&db, &c, &problem).await;

        let first = Task::aggregate(f.id, problem.id, 2, vec![s_a, s_b], false);
        assert!(matches!(
            db.claim_batch(&first).await.unwrap(),
            ClaimOutcome::Claimed(_)
        ));

        let overlapping = Task::aggregate(g.id, problem.id, 2, vec![s_b, s_c], false);
        assert!(matches!(
            db.claim_batch(&overlapping).await.unwrap(),
            ClaimOutcome::Contended
        ));

        // Rolled back: no task for g, and s_c still available.
        assert!(db.get_task(overlapping.id).await.unwrap().is_none());
        let sol_c = db.get_solution(s_c).await.unwrap().unwrap();
        assert!(sol_c.state.is_unclaimed());
    }

    #[tokio::test]
    async fn second_final_claim_is_downgraded() {
        let db = test_db().await;
        let problem = make_problem(&db).await;
        let mut ids = Vec::new();
        for name in ["a", "b", "c", "d"] {
            let agent = make_agent(&db, name).await;
            ids.push(seed_solution(&db, &agent, &problem).await);
        }
        let f = make_agent(&db, "f").await;
        let g = make_agent(&db, "g").await;

        let first = Task::aggregate(f.id, problem.id, 3, ids[..2].to_vec(), true);
        let ClaimOutcome::Claimed(first) = db.claim_batch(&first).await.unwrap() else {
            panic!("first claim should succeed");
        };
        assert!(first.payload.is_final);

        let second = Task::aggregate(g.id, problem.id, 3, ids[2..].to_vec(), true);
        let ClaimOutcome::Claimed(second) = db.claim_batch(&second).await.unwrap() else {
            panic!("second claim should succeed");
        };
        assert!(!second.payload.is_final);
        let stored = db.get_task(second.id).await.unwrap().unwrap();
        assert!(!stored.payload.is_final);
    }

    #[tokio::test]
    async fn second_in_progress_task_is_constraint() {
        let db = test_db().await;
        let problem = make_problem(&db).await;
        let a = make_agent(&db, "a").await;

        db.insert_task(&Task::solve(a.id, problem.id)).await.unwrap();
        let err = db
            .insert_task(&Task::solve(a.id, problem.id))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Constraint(_)));
    }

    #[tokio::test]
    async fn complete_task_resolves_claims() {
        let db = test_db().await;
        let problem = make_problem(&db).await;
        let a = make_agent(&db, "a").await;
        let b = make_agent(&db, "b").await;
        let f = make_agent(&db, "f").await;
        let ids = vec![
            seed_solution(&db, &a, &problem).await,
            seed_solution(&db, &b, &problem).await,
        ];
        let task = Task::aggregate(f.id, problem.id, 2, ids.clone(), false);
        db.claim_batch(&task).await.unwrap();

        let solution = solution_for(
            &task,
            TaskResult {
                content: "merged".into(),
                answer: Some("42".into()),
                confidence: None,
            },
        );
        assert_eq!(
            db.complete_task(task.id, &solution).await.unwrap(),
            CompletionOutcome::Completed
        );

        for sol in db.get_solutions_by_ids(&ids).await.unwrap() {
            assert_eq!(sol.state.aggregated_into(), Some(solution.id));
        }
        let stored = db.get_solution(solution.id).await.unwrap().unwrap();
        assert_eq!(stored.level, 2);
        assert_eq!(stored.parent_ids, ids);
        let closed = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(closed.status, TaskStatus::Completed);
        assert!(closed.completed_at.is_some());
    }

    #[tokio::test]
    async fn complete_task_twice_is_not_in_progress() {
        let db = test_db().await;
        let problem = make_problem(&db).await;
        let a = make_agent(&db, "a").await;
        let task = Task::solve(a.id, problem.id);
        db.insert_task(&task).await.unwrap();

        let result = TaskResult {
            content: "x".into(),
            answer: None,
            confidence: None,
        };
        let first = solution_for(&task, result.clone());
        let second = solution_for(&task, result);
        assert_eq!(
            db.complete_task(task.id, &first).await.unwrap(),
            CompletionOutcome::Completed
        );
        assert_eq!(
            db.complete_task(task.id, &second).await.unwrap(),
            CompletionOutcome::NotInProgress
        );
        assert!(db.get_solution(second.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expire_stale_tasks_releases_claims() {
        let db = test_db().await;
        let problem = make_problem(&db).await;
        let a = make_agent(&db, "a").await;
        let b = make_agent(&db, "b").await;
        let f = make_agent(&db, "f").await;
        let ids = vec![
            seed_solution(&db, &a, &problem).await,
            seed_solution(&db, &b, &problem).await,
        ];
        let task = Task::aggregate(f.id, problem.id, 2, ids.clone(), false);
        db.claim_batch(&task).await.unwrap();

        // Cutoff in the past leaves the task alone.
        let none = db
            .expire_stale_tasks(Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(none, 0);

        let expired = db
            .expire_stale_tasks(Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(expired, 1);

        let task = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Expired);
        for sol in db.get_solutions_by_ids(&ids).await.unwrap() {
            assert!(sol.state.is_unclaimed());
        }
    }

    #[tokio::test]
    async fn stats_and_listings() {
        let db = test_db().await;
        let problem = make_problem(&db).await;
        let a = make_agent(&db, "a").await;
        let b = make_agent(&db, "b").await;
        seed_solution(&db, &a, &problem).await;
        seed_solution(&db, &a, &problem).await;
        seed_solution(&db, &b, &problem).await;

        let stats = db.problem_stats(problem.id).await.unwrap();
        assert_eq!(stats.l1_solutions, 3);
        assert_eq!(stats.total_aggregations, 0);
        assert_eq!(stats.participating_agents, 2);
        assert_eq!(stats.highest_level, 1);

        let page = SolutionFilter {
            level: Some(1),
            limit: Some(2),
            offset: 0,
            ..SolutionFilter::default()
        };
        assert_eq!(db.list_solutions(problem.id, &page).await.unwrap().len(), 2);
        assert_eq!(db.count_solutions(problem.id, &page).await.unwrap(), 3);

        let agents = db.list_agents().await.unwrap();
        let alpha = agents.iter().find(|s| s.name == "a").unwrap();
        assert_eq!(alpha.solution_count, 2);
        assert_eq!(db.agent_stats(a.id).await.unwrap(), (2, 2));
    }

    #[tokio::test]
    async fn file_database_persists_across_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("swarm.db");
        let problem_id = {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.create_problem(&Problem::new("T", "S", vec![]))
                .await
                .unwrap()
                .id
        };
        assert!(path.exists());

        let db = LibSqlBackend::new_local(&path).await.unwrap();
        let active = db.get_active_problem().await.unwrap().unwrap();
        assert_eq!(active.id, problem_id);
    }

    #[tokio::test]
    async fn writes_wait_for_an_open_transaction() {
        let db = Arc::new(test_db().await);
        let problem = make_problem(&db).await;
        let existing_id = make_agent(&db, "existing").await.id;
        let problem_id = problem.id;
        let newcomer = Agent::new("newcomer", None, "clawswarm_");
        let newcomer_id = newcomer.id;

        // Another request's transaction is open and will roll back.
        let gate = db.write_gate.lock().await;
        let tx = db.begin_write("held").await.unwrap();

        let pending = tokio::spawn({
            let db = Arc::clone(&db);
            async move {
                db.insert_agent(&newcomer).await?;
                db.touch_agent(existing_id).await?;
                db.update_problem_phase(problem_id, ProblemPhase::Aggregating)
                    .await
            }
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        tx.rollback().await.unwrap();
        drop(gate);
        assert!(pending.await.unwrap().unwrap());

        assert!(db.get_agent(newcomer_id).await.unwrap().is_some());
        let touched = db.get_agent(existing_id).await.unwrap().unwrap();
        assert!(touched.last_active_at.is_some());
        let problem = db.get_problem(problem_id).await.unwrap().unwrap();
        assert_eq!(problem.phase, ProblemPhase::Aggregating);
    }

    #[tokio::test]
    async fn completion_for_replaced_problem_writes_nothing() {
        let db = test_db().await;
        let old = make_problem(&db).await;
        let agent = make_agent(&db, "a").await;
        let task = Task::solve(agent.id, old.id);
        db.insert_task(&task).await.unwrap();

        // Replaced after the caller checked, before it committed.
        db.create_problem(&Problem::new("Next", "What is 6 * 7?", vec![]))
            .await
            .unwrap();

        let solution = solution_for(
            &task,
            TaskResult {
                content: "late".into(),
                answer: Some("42".into()),
                confidence: None,
            },
        );
        let outcome = db.complete_task(task.id, &solution).await.unwrap();
        assert_eq!(outcome, CompletionOutcome::ProblemInactive);

        assert_eq!(
            db.count_solutions(old.id, &SolutionFilter::default())
                .await
                .unwrap(),
            0
        );
        let task = db.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::InProgress);
    }
}
