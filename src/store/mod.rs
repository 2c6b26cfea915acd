//! Durable task store on a single SQLite file.
//!
//! The store exclusively owns persistent rows and hands out immutable
//! snapshots. All multi-statement operations run inside one transaction;
//! status updates are compare-and-set so concurrent writers observe
//! `ConflictingState` instead of clobbering each other. A small round-robin
//! pool of connections (WAL mode) serializes access with short critical
//! sections.

use crate::{
    models::{
        AgentAvailability, AgentRecord, Capability, ConsensusStrategy, Decision, EventEnvelope,
        Proposal, ProposalKind, RoutingStrategy, Task, TaskStatus, TaskType, WorkflowRole,
    },
    QuorumError, Result,
};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use tokio::sync::Mutex;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tasks (
    id              TEXT PRIMARY KEY,
    title           TEXT NOT NULL,
    description     TEXT NOT NULL,
    task_type       TEXT NOT NULL,
    complexity      INTEGER NOT NULL CHECK (complexity BETWEEN 1 AND 10),
    risk            INTEGER NOT NULL CHECK (risk BETWEEN 1 AND 10),
    strategy        TEXT NOT NULL,
    created_by      TEXT NOT NULL,
    assignees       TEXT NOT NULL DEFAULT '[]',
    status          TEXT NOT NULL,
    role            TEXT NOT NULL,
    created_at      TEXT NOT NULL,
    updated_at      TEXT NOT NULL,
    completed_at    TEXT,
    due_at          TEXT,
    metadata        TEXT NOT NULL DEFAULT '{}',
    parent_id       TEXT REFERENCES tasks(id),
    result_summary  TEXT
);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at);

CREATE TABLE IF NOT EXISTS proposals (
    id          TEXT PRIMARY KEY,
    task_id     TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
    agent_id    TEXT NOT NULL,
    kind        TEXT NOT NULL,
    content     TEXT NOT NULL,
    confidence  REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
    tokens_in   INTEGER NOT NULL DEFAULT 0,
    tokens_out  INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,
    revises     TEXT,
    superseded  INTEGER NOT NULL DEFAULT 0,
    metadata    TEXT NOT NULL DEFAULT '{}'
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_proposals_active
    ON proposals(task_id, agent_id) WHERE superseded = 0;

CREATE TABLE IF NOT EXISTS decisions (
    id                  TEXT PRIMARY KEY,
    task_id             TEXT NOT NULL UNIQUE REFERENCES tasks(id) ON DELETE CASCADE,
    strategy            TEXT NOT NULL,
    consensus           INTEGER NOT NULL,
    winning_proposal_id TEXT,
    runner_up_ids       TEXT NOT NULL DEFAULT '[]',
    content             TEXT NOT NULL,
    confidence          REAL NOT NULL,
    total_tokens        INTEGER NOT NULL,
    tokens_saved        INTEGER NOT NULL CHECK (tokens_saved >= 0),
    rationale           TEXT NOT NULL,
    partial             INTEGER NOT NULL DEFAULT 0,
    decided_at          TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS agents (
    id                TEXT PRIMARY KEY,
    kind              TEXT NOT NULL,
    display_name      TEXT NOT NULL,
    capabilities      TEXT NOT NULL DEFAULT '{}',
    availability      TEXT NOT NULL,
    endpoint          TEXT,
    last_health_check TEXT,
    latency_ema_ms    REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS metrics_timeseries (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    name  TEXT NOT NULL,
    tags  TEXT NOT NULL DEFAULT '{}',
    value REAL NOT NULL,
    ts    INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_metrics_name_ts ON metrics_timeseries(name, ts);

CREATE TABLE IF NOT EXISTS events_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    seq        INTEGER NOT NULL,
    topic      TEXT NOT NULL,
    event_type TEXT NOT NULL,
    payload    TEXT NOT NULL,
    ts         INTEGER NOT NULL
);
"#;

/// Fields a status update may patch alongside the transition.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub assignees: Option<Vec<String>>,
    pub strategy: Option<RoutingStrategy>,
    pub role: Option<WorkflowRole>,
    pub result_summary: Option<String>,
    /// Merged into the existing metadata map.
    pub metadata: HashMap<String, String>,
}

/// Filter/sort/page inputs for `list_tasks`.
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub task_type: Option<TaskType>,
    pub agent_id: Option<String>,
    pub created_by: Option<String>,
    pub min_complexity: Option<u8>,
    pub max_complexity: Option<u8>,
    pub min_risk: Option<u8>,
    pub max_risk: Option<u8>,
    pub created_after: Option<chrono::DateTime<chrono::Utc>>,
    pub created_before: Option<chrono::DateTime<chrono::Utc>>,
    pub sort: TaskSort,
    pub descending: bool,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TaskSort {
    #[default]
    CreatedAt,
    UpdatedAt,
    Complexity,
    Risk,
    Status,
}

impl TaskSort {
    fn column(&self) -> &'static str {
        match self {
            TaskSort::CreatedAt => "created_at",
            TaskSort::UpdatedAt => "updated_at",
            TaskSort::Complexity => "complexity",
            TaskSort::Risk => "risk",
            TaskSort::Status => "status",
        }
    }
}

/// One time bucket from `query_metric`.
#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricPoint {
    pub bucket_start_ms: i64,
    pub count: u64,
    pub sum: f64,
    pub avg: f64,
}

#[derive(Clone)]
pub struct Store {
    pool: Arc<Vec<Mutex<Connection>>>,
    next: Arc<AtomicUsize>,
}

impl Store {
    /// Open (or create) the database file and initialize the schema.
    pub fn open(path: &Path, pool_size: usize) -> Result<Self> {
        let size = pool_size.max(1);
        let mut pool = Vec::with_capacity(size);
        for i in 0..size {
            let conn = Connection::open(path)?;
            Self::configure(&conn)?;
            if i == 0 {
                conn.execute_batch(SCHEMA)?;
            }
            pool.push(Mutex::new(conn));
        }
        info!(path = %path.display(), pool = size, "store opened");
        Ok(Self {
            pool: Arc::new(pool),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Single in-memory connection, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            pool: Arc::new(vec![Mutex::new(conn)]),
            next: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn configure(conn: &Connection) -> Result<()> {
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        // journal_mode returns a row, so query_row to ignore it
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .ok();
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(())
    }

    async fn conn(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[i].lock().await
    }

    // ---- tasks -----------------------------------------------------------

    /// Persist a new task, assigning an ID if absent. Returns the canonical ID.
    pub async fn create_task(&self, task: &Task) -> Result<String> {
        let mut task = task.clone();
        if task.id.is_empty() {
            task.id = uuid::Uuid::new_v4().to_string();
        }
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO tasks (id, title, description, task_type, complexity, risk, strategy,
                                created_by, assignees, status, role, created_at, updated_at,
                                completed_at, due_at, metadata, parent_id, result_summary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
            params![
                task.id,
                task.title,
                task.description,
                task.task_type.as_str(),
                task.complexity,
                task.risk,
                task.strategy.as_str(),
                task.created_by,
                serde_json::to_string(&task.assignees)?,
                task.status.as_str(),
                task.role.as_str(),
                task.created_at.to_rfc3339(),
                task.updated_at.to_rfc3339(),
                task.completed_at.map(|t| t.to_rfc3339()),
                task.due_at.map(|t| t.to_rfc3339()),
                serde_json::to_string(&task.metadata)?,
                task.parent_id,
                task.result_summary,
            ],
        )?;
        debug!(task_id = %task.id, "task created");
        Ok(task.id)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        let conn = self.conn().await;
        Self::get_task_on(&conn, id)
    }

    fn get_task_on(conn: &Connection, id: &str) -> Result<Task> {
        conn.query_row("SELECT * FROM tasks WHERE id = ?1", params![id], |row| {
            Ok(row_to_task(row))
        })
        .optional()?
        .transpose()?
        .ok_or_else(|| QuorumError::TaskNotFound(id.to_string()))
    }

    /// Compare-and-set status transition with an optional field patch.
    ///
    /// Observing a different current status surfaces `ConflictingState`;
    /// a transition the lifecycle forbids surfaces `InvalidArgument`.
    /// Returns the fresh task snapshot.
    pub async fn update_task_status(
        &self,
        id: &str,
        expected_from: TaskStatus,
        to: TaskStatus,
        patch: TaskPatch,
    ) -> Result<Task> {
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;
        let task = Self::apply_transition(&tx, id, expected_from, to, patch)?;
        tx.commit()?;
        Ok(task)
    }

    fn apply_transition(
        tx: &rusqlite::Transaction<'_>,
        id: &str,
        expected_from: TaskStatus,
        to: TaskStatus,
        patch: TaskPatch,
    ) -> Result<Task> {
        let current = Self::get_task_on(tx, id)?;
        if current.status != expected_from {
            return Err(QuorumError::ConflictingState {
                task_id: id.to_string(),
                expected: expected_from.as_str().to_string(),
                actual: current.status.as_str().to_string(),
            });
        }
        if !expected_from.can_transition(to) {
            return Err(QuorumError::invalid(
                "status",
                format!(
                    "illegal transition {} -> {}",
                    expected_from.as_str(),
                    to.as_str()
                ),
            ));
        }

        let now = chrono::Utc::now();
        let assignees = patch.assignees.unwrap_or(current.assignees);
        let strategy = patch.strategy.unwrap_or(current.strategy);
        let role = patch.role.unwrap_or(current.role);
        let result_summary = patch.result_summary.or(current.result_summary);
        let mut metadata = current.metadata;
        metadata.extend(patch.metadata);
        let completed_at = if to.is_terminal() {
            Some(now)
        } else {
            current.completed_at
        };

        let changed = tx.execute(
            "UPDATE tasks SET status = ?1, assignees = ?2, strategy = ?3, role = ?4,
                              result_summary = ?5, metadata = ?6, updated_at = ?7,
                              completed_at = ?8
             WHERE id = ?9 AND status = ?10",
            params![
                to.as_str(),
                serde_json::to_string(&assignees)?,
                strategy.as_str(),
                role.as_str(),
                result_summary,
                serde_json::to_string(&metadata)?,
                now.to_rfc3339(),
                completed_at.map(|t| t.to_rfc3339()),
                id,
                expected_from.as_str(),
            ],
        )?;
        if changed == 0 {
            let fresh = Self::get_task_on(tx, id)?;
            return Err(QuorumError::ConflictingState {
                task_id: id.to_string(),
                expected: expected_from.as_str().to_string(),
                actual: fresh.status.as_str().to_string(),
            });
        }
        Self::get_task_on(tx, id)
    }

    /// Patch task fields without a status transition. Still compare-and-set
    /// on the status so a concurrent transition surfaces as a conflict.
    pub async fn patch_task(
        &self,
        id: &str,
        expected_status: TaskStatus,
        patch: TaskPatch,
    ) -> Result<Task> {
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;
        let current = Self::get_task_on(&tx, id)?;
        if current.status != expected_status {
            return Err(QuorumError::ConflictingState {
                task_id: id.to_string(),
                expected: expected_status.as_str().to_string(),
                actual: current.status.as_str().to_string(),
            });
        }
        let assignees = patch.assignees.unwrap_or(current.assignees);
        let strategy = patch.strategy.unwrap_or(current.strategy);
        let role = patch.role.unwrap_or(current.role);
        let result_summary = patch.result_summary.or(current.result_summary);
        let mut metadata = current.metadata;
        metadata.extend(patch.metadata);
        tx.execute(
            "UPDATE tasks SET assignees = ?1, strategy = ?2, role = ?3, result_summary = ?4,
                              metadata = ?5, updated_at = ?6
             WHERE id = ?7 AND status = ?8",
            params![
                serde_json::to_string(&assignees)?,
                strategy.as_str(),
                role.as_str(),
                result_summary,
                serde_json::to_string(&metadata)?,
                chrono::Utc::now().to_rfc3339(),
                id,
                expected_status.as_str(),
            ],
        )?;
        let fresh = Self::get_task_on(&tx, id)?;
        tx.commit()?;
        Ok(fresh)
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> Result<(Vec<Task>, u64)> {
        let conn = self.conn().await;
        let mut clauses: Vec<String> = Vec::new();
        let mut args: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            clauses.push(format!("status = ?{}", args.len() + 1));
            args.push(Box::new(status.as_str().to_string()));
        }
        if let Some(task_type) = filter.task_type {
            clauses.push(format!("task_type = ?{}", args.len() + 1));
            args.push(Box::new(task_type.as_str().to_string()));
        }
        if let Some(agent) = &filter.agent_id {
            clauses.push(format!("instr(assignees, ?{}) > 0", args.len() + 1));
            args.push(Box::new(format!("\"{agent}\"")));
        }
        if let Some(creator) = &filter.created_by {
            clauses.push(format!("created_by = ?{}", args.len() + 1));
            args.push(Box::new(creator.clone()));
        }
        if let Some(min) = filter.min_complexity {
            clauses.push(format!("complexity >= ?{}", args.len() + 1));
            args.push(Box::new(min));
        }
        if let Some(max) = filter.max_complexity {
            clauses.push(format!("complexity <= ?{}", args.len() + 1));
            args.push(Box::new(max));
        }
        if let Some(min) = filter.min_risk {
            clauses.push(format!("risk >= ?{}", args.len() + 1));
            args.push(Box::new(min));
        }
        if let Some(max) = filter.max_risk {
            clauses.push(format!("risk <= ?{}", args.len() + 1));
            args.push(Box::new(max));
        }
        if let Some(after) = filter.created_after {
            clauses.push(format!("created_at >= ?{}", args.len() + 1));
            args.push(Box::new(after.to_rfc3339()));
        }
        if let Some(before) = filter.created_before {
            clauses.push(format!("created_at <= ?{}", args.len() + 1));
            args.push(Box::new(before.to_rfc3339()));
        }

        let where_clause = if clauses.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", clauses.join(" AND "))
        };
        let direction = if filter.descending { "DESC" } else { "ASC" };
        let limit = filter.limit.unwrap_or(i64::MAX as u64);
        let offset = filter.offset.unwrap_or(0);

        let total: u64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM tasks{where_clause}"),
            params_from_iter(args.iter().map(|a| a.as_ref())),
            |row| row.get(0),
        )?;

        let sql = format!(
            "SELECT * FROM tasks{where_clause} ORDER BY {} {direction} LIMIT {limit} OFFSET {offset}",
            filter.sort.column()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter().map(|a| a.as_ref())), |row| {
            Ok(row_to_task(row))
        })?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row??);
        }
        Ok((tasks, total))
    }

    /// Tasks assigned to `agent_id` that are waiting on it.
    pub async fn pending_for(&self, agent_id: &str) -> Result<Vec<Task>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM tasks
             WHERE status IN ('ASSIGNED', 'WAITING_INPUT') AND instr(assignees, ?1) > 0
             ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map(params![format!("\"{agent_id}\"")], |row| {
            Ok(row_to_task(row))
        })?;
        let mut tasks = Vec::new();
        for row in rows {
            tasks.push(row??);
        }
        Ok(tasks)
    }

    // ---- proposals -------------------------------------------------------

    /// Persist a proposal, enforcing at most one active proposal per
    /// (task, agent).
    ///
    /// Resubmitting identical content is a no-op returning the existing ID;
    /// different content supersedes the earlier proposal and links it via
    /// `revises`. Returns the canonical proposal ID.
    pub async fn put_proposal(&self, proposal: &Proposal) -> Result<String> {
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;

        // TaskNotFound beats the raw FK violation for callers.
        Self::get_task_on(&tx, &proposal.task_id)?;

        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT id, content FROM proposals
                 WHERE task_id = ?1 AND agent_id = ?2 AND superseded = 0",
                params![proposal.task_id, proposal.agent_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let mut row = proposal.clone();
        if row.id.is_empty() {
            row.id = uuid::Uuid::new_v4().to_string();
        }
        if let Some((prior_id, prior_content)) = existing {
            if prior_content == row.content {
                tx.commit()?;
                debug!(proposal_id = %prior_id, "duplicate proposal, no-op");
                return Ok(prior_id);
            }
            tx.execute(
                "UPDATE proposals SET superseded = 1 WHERE id = ?1",
                params![prior_id],
            )?;
            row.revises = Some(prior_id);
        }

        tx.execute(
            "INSERT INTO proposals (id, task_id, agent_id, kind, content, confidence,
                                    tokens_in, tokens_out, created_at, revises, superseded, metadata)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, ?11)",
            params![
                row.id,
                row.task_id,
                row.agent_id,
                row.kind.as_str(),
                row.content,
                row.confidence,
                row.tokens_in,
                row.tokens_out,
                row.created_at.to_rfc3339(),
                row.revises,
                serde_json::to_string(&row.metadata)?,
            ],
        )?;
        tx.commit()?;
        debug!(proposal_id = %row.id, task_id = %row.task_id, "proposal stored");
        Ok(row.id)
    }

    /// All proposals for a task, active ones first, oldest first within
    /// each group.
    pub async fn list_proposals(&self, task_id: &str) -> Result<Vec<Proposal>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM proposals WHERE task_id = ?1 ORDER BY superseded ASC, created_at ASC",
        )?;
        let rows = stmt.query_map(params![task_id], |row| Ok(row_to_proposal(row)))?;
        let mut proposals = Vec::new();
        for row in rows {
            proposals.push(row??);
        }
        Ok(proposals)
    }

    pub async fn active_proposals(&self, task_id: &str) -> Result<Vec<Proposal>> {
        Ok(self
            .list_proposals(task_id)
            .await?
            .into_iter()
            .filter(|p| !p.superseded)
            .collect())
    }

    // ---- decisions -------------------------------------------------------

    /// Write the decision and move the task to COMPLETED in one
    /// transaction. If anything fails the task stays in its prior state
    /// for the retry path.
    pub async fn complete_with_decision(
        &self,
        decision: &Decision,
        expected_from: TaskStatus,
        result_summary: Option<String>,
    ) -> Result<Task> {
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;
        Self::insert_decision(&tx, decision)?;
        let patch = TaskPatch {
            result_summary,
            ..TaskPatch::default()
        };
        let task =
            Self::apply_transition(&tx, &decision.task_id, expected_from, TaskStatus::Completed, patch)?;
        tx.commit()?;
        info!(task_id = %decision.task_id, decision_id = %decision.id, "task completed");
        Ok(task)
    }

    /// Standalone decision write; one per task, references checked.
    pub async fn put_decision(&self, decision: &Decision) -> Result<()> {
        let mut conn = self.conn().await;
        let tx = conn.transaction()?;
        Self::insert_decision(&tx, decision)?;
        tx.commit()?;
        Ok(())
    }

    fn insert_decision(tx: &rusqlite::Transaction<'_>, decision: &Decision) -> Result<()> {
        // Every referenced proposal must belong to the same task.
        let mut referenced: Vec<&String> = decision.runner_up_ids.iter().collect();
        if let Some(winner) = &decision.winning_proposal_id {
            referenced.push(winner);
        }
        for proposal_id in referenced {
            let owner: Option<String> = tx
                .query_row(
                    "SELECT task_id FROM proposals WHERE id = ?1",
                    params![proposal_id],
                    |row| row.get(0),
                )
                .optional()?;
            match owner {
                Some(task_id) if task_id == decision.task_id => {}
                Some(_) => {
                    return Err(QuorumError::invalid(
                        "decision",
                        format!("proposal {proposal_id} belongs to a different task"),
                    ))
                }
                None => {
                    return Err(QuorumError::NotFound(format!("proposal {proposal_id}")));
                }
            }
        }

        let inserted = tx.execute(
            "INSERT OR IGNORE INTO decisions (id, task_id, strategy, consensus,
                                    winning_proposal_id, runner_up_ids, content, confidence,
                                    total_tokens, tokens_saved, rationale, partial, decided_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                decision.id,
                decision.task_id,
                decision.strategy.as_str(),
                decision.consensus,
                decision.winning_proposal_id,
                serde_json::to_string(&decision.runner_up_ids)?,
                decision.content,
                decision.confidence,
                decision.total_tokens,
                decision.tokens_saved,
                decision.rationale,
                decision.partial,
                decision.decided_at.to_rfc3339(),
            ],
        )?;
        if inserted == 0 {
            return Err(QuorumError::ConflictingState {
                task_id: decision.task_id.clone(),
                expected: "no decision".to_string(),
                actual: "decision exists".to_string(),
            });
        }
        Ok(())
    }

    pub async fn get_decision(&self, task_id: &str) -> Result<Option<Decision>> {
        let conn = self.conn().await;
        conn.query_row(
            "SELECT * FROM decisions WHERE task_id = ?1",
            params![task_id],
            |row| Ok(row_to_decision(row)),
        )
        .optional()?
        .transpose()
    }

    // ---- agents ----------------------------------------------------------

    pub async fn upsert_agent(&self, record: &AgentRecord) -> Result<()> {
        let capabilities: HashMap<&str, f64> = record
            .capabilities
            .iter()
            .map(|(c, s)| (c.as_str(), *s))
            .collect();
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO agents (id, kind, display_name, capabilities, availability,
                                 endpoint, last_health_check, latency_ema_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET
                 kind = excluded.kind,
                 display_name = excluded.display_name,
                 capabilities = excluded.capabilities,
                 availability = excluded.availability,
                 endpoint = excluded.endpoint,
                 last_health_check = excluded.last_health_check,
                 latency_ema_ms = excluded.latency_ema_ms",
            params![
                record.id,
                record.kind,
                record.display_name,
                serde_json::to_string(&capabilities)?,
                record.availability.as_str(),
                record.endpoint,
                record.last_health_check.map(|t| t.to_rfc3339()),
                record.latency_ema_ms,
            ],
        )?;
        Ok(())
    }

    pub async fn load_agents(&self) -> Result<Vec<AgentRecord>> {
        let conn = self.conn().await;
        let mut stmt = conn.prepare("SELECT * FROM agents ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| Ok(row_to_agent(row)))?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row??);
        }
        Ok(agents)
    }

    // ---- metrics & event log ---------------------------------------------

    pub async fn record_metric(
        &self,
        name: &str,
        tags: &HashMap<String, String>,
        value: f64,
        ts_ms: i64,
    ) -> Result<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO metrics_timeseries (name, tags, value, ts) VALUES (?1, ?2, ?3, ?4)",
            params![name, serde_json::to_string(tags)?, value, ts_ms],
        )?;
        Ok(())
    }

    /// Time-bucketed aggregates for one metric name.
    pub async fn query_metric(
        &self,
        name: &str,
        since_ms: i64,
        until_ms: i64,
        bucket_secs: u64,
    ) -> Result<Vec<MetricPoint>> {
        let bucket_ms = (bucket_secs.max(1) * 1000) as i64;
        let conn = self.conn().await;
        let mut stmt = conn.prepare(
            "SELECT (ts / ?1) * ?1 AS bucket, COUNT(*), SUM(value), AVG(value)
             FROM metrics_timeseries
             WHERE name = ?2 AND ts >= ?3 AND ts <= ?4
             GROUP BY bucket ORDER BY bucket ASC",
        )?;
        let rows = stmt.query_map(params![bucket_ms, name, since_ms, until_ms], |row| {
            Ok(MetricPoint {
                bucket_start_ms: row.get(0)?,
                count: row.get(1)?,
                sum: row.get(2)?,
                avg: row.get(3)?,
            })
        })?;
        let mut points = Vec::new();
        for row in rows {
            points.push(row?);
        }
        Ok(points)
    }

    /// Append one envelope to the audit log.
    pub async fn append_event(&self, envelope: &EventEnvelope) -> Result<()> {
        let conn = self.conn().await;
        conn.execute(
            "INSERT INTO events_log (seq, topic, event_type, payload, ts)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                envelope.seq,
                envelope.event.topic().as_str(),
                envelope.event.kind(),
                serde_json::to_string(envelope)?,
                envelope.timestamp.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    /// Audit-log entries mentioning one task, oldest first.
    pub async fn events_for_task(
        &self,
        task_id: &str,
        limit: u64,
    ) -> Result<Vec<serde_json::Value>> {
        let needle = format!("\"task_id\":\"{task_id}\"");
        let conn = self.conn().await;
        let mut stmt = conn.prepare(
            "SELECT payload FROM events_log WHERE instr(payload, ?1) > 0
             ORDER BY seq ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![needle, limit.min(i64::MAX as u64)], |row| {
            row.get::<_, String>(0)
        })?;
        let mut events = Vec::new();
        for row in rows {
            let payload = row?;
            events.push(serde_json::from_str(&payload)?);
        }
        Ok(events)
    }

    /// Trim the audit ring to the newest `retain` rows. Returns rows removed.
    pub async fn trim_events_log(&self, retain: u64) -> Result<u64> {
        let conn = self.conn().await;
        let removed = conn.execute(
            "DELETE FROM events_log
             WHERE id <= (SELECT COALESCE(MAX(id), 0) FROM events_log) - ?1",
            params![retain],
        )?;
        Ok(removed as u64)
    }
}

// ---- row mapping ---------------------------------------------------------
//
// Mapping failures mean the file was edited outside the store; they surface
// as StorageCorrupt rather than panicking.

fn corrupt(what: &str, detail: impl std::fmt::Display) -> QuorumError {
    QuorumError::StorageCorrupt(format!("{what}: {detail}"))
}

fn parse_ts(value: String) -> Result<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| corrupt("timestamp", e))
}

fn row_to_task(row: &Row<'_>) -> Result<Task> {
    let assignees: String = row.get("assignees")?;
    let metadata: String = row.get("metadata")?;
    let task_type: String = row.get("task_type")?;
    let strategy: String = row.get("strategy")?;
    let status: String = row.get("status")?;
    let role: String = row.get("role")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let completed_at: Option<String> = row.get("completed_at")?;
    let due_at: Option<String> = row.get("due_at")?;
    Ok(Task {
        id: row.get("id")?,
        title: row.get("title")?,
        description: row.get("description")?,
        task_type: TaskType::from_str(&task_type).map_err(|e| corrupt("task_type", e))?,
        complexity: row.get("complexity")?,
        risk: row.get("risk")?,
        strategy: RoutingStrategy::from_str(&strategy).map_err(|e| corrupt("strategy", e))?,
        created_by: row.get("created_by")?,
        assignees: serde_json::from_str(&assignees).map_err(|e| corrupt("assignees", e))?,
        status: TaskStatus::from_str(&status).map_err(|e| corrupt("status", e))?,
        role: WorkflowRole::from_str(&role).map_err(|e| corrupt("role", e))?,
        created_at: parse_ts(created_at)?,
        updated_at: parse_ts(updated_at)?,
        completed_at: completed_at.map(parse_ts).transpose()?,
        due_at: due_at.map(parse_ts).transpose()?,
        metadata: serde_json::from_str(&metadata).map_err(|e| corrupt("metadata", e))?,
        parent_id: row.get("parent_id")?,
        result_summary: row.get("result_summary")?,
    })
}

fn row_to_proposal(row: &Row<'_>) -> Result<Proposal> {
    let kind: String = row.get("kind")?;
    let created_at: String = row.get("created_at")?;
    let metadata: String = row.get("metadata")?;
    Ok(Proposal {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        agent_id: row.get("agent_id")?,
        kind: ProposalKind::from_str(&kind).map_err(|e| corrupt("kind", e))?,
        content: row.get("content")?,
        confidence: row.get("confidence")?,
        tokens_in: row.get::<_, i64>("tokens_in")? as u64,
        tokens_out: row.get::<_, i64>("tokens_out")? as u64,
        created_at: parse_ts(created_at)?,
        revises: row.get("revises")?,
        superseded: row.get("superseded")?,
        metadata: serde_json::from_str(&metadata).map_err(|e| corrupt("metadata", e))?,
    })
}

fn row_to_decision(row: &Row<'_>) -> Result<Decision> {
    let strategy: String = row.get("strategy")?;
    let runner_up_ids: String = row.get("runner_up_ids")?;
    let decided_at: String = row.get("decided_at")?;
    Ok(Decision {
        id: row.get("id")?,
        task_id: row.get("task_id")?,
        strategy: ConsensusStrategy::from_str(&strategy).map_err(|e| corrupt("strategy", e))?,
        consensus: row.get("consensus")?,
        winning_proposal_id: row.get("winning_proposal_id")?,
        runner_up_ids: serde_json::from_str(&runner_up_ids)
            .map_err(|e| corrupt("runner_up_ids", e))?,
        content: row.get("content")?,
        confidence: row.get("confidence")?,
        total_tokens: row.get::<_, i64>("total_tokens")? as u64,
        tokens_saved: row.get::<_, i64>("tokens_saved")? as u64,
        rationale: row.get("rationale")?,
        partial: row.get("partial")?,
        decided_at: parse_ts(decided_at)?,
    })
}

fn row_to_agent(row: &Row<'_>) -> Result<AgentRecord> {
    let capabilities: String = row.get("capabilities")?;
    let availability: String = row.get("availability")?;
    let last_health_check: Option<String> = row.get("last_health_check")?;
    let raw: HashMap<String, f64> =
        serde_json::from_str(&capabilities).map_err(|e| corrupt("capabilities", e))?;
    let mut parsed = HashMap::new();
    for (name, strength) in raw {
        let capability = Capability::from_str(&name).map_err(|e| corrupt("capability", e))?;
        parsed.insert(capability, strength);
    }
    Ok(AgentRecord {
        id: row.get("id")?,
        kind: row.get("kind")?,
        display_name: row.get("display_name")?,
        capabilities: parsed,
        availability: AgentAvailability::from_str(&availability)
            .map_err(|e| corrupt("availability", e))?,
        endpoint: row.get("endpoint")?,
        last_health_check: last_health_check.map(parse_ts).transpose()?,
        latency_ema_ms: row.get("latency_ema_ms")?,
    })
}
