use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use tutti_core::ensemble::Ensemble;
use tutti_core::error::{Result, TuttiError};
use tutti_core::state::{StateManager, StateSnapshot};
use tutti_core::types::{RunId, StepMetric};

use crate::context::ExecutionContext;
use crate::scoring::ScoringState;

/// Serializable snapshot of a suspended run.
///
/// Captures everything needed to continue from `resume_from_step`: the
/// ensemble definition, the run accumulator (input, step outputs),
/// state and scoring snapshots, and metrics collected so far.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendedState {
    pub ensemble: Ensemble,
    pub run_id: RunId,
    pub input: Value,
    pub outputs: HashMap<String, Value>,
    pub order: Vec<String>,
    #[serde(default)]
    pub state: Option<StateSnapshot>,
    #[serde(default)]
    pub scoring: Option<ScoringState>,
    pub metrics: Vec<StepMetric>,
    #[serde(default)]
    pub cache_hits: usize,
    pub resume_from_step: usize,
    pub created_at: DateTime<Utc>,
}

impl SuspendedState {
    /// Snapshot a running context.
    pub fn capture(
        ensemble: &Ensemble,
        ctx: &ExecutionContext,
        resume_from_step: usize,
    ) -> Self {
        Self {
            ensemble: ensemble.clone(),
            run_id: ctx.run_id.clone(),
            input: ctx.input.clone(),
            outputs: ctx.outputs.clone(),
            order: ctx.order.clone(),
            state: Some(ctx.state.snapshot()),
            scoring: if ctx.scoring.history.is_empty() {
                None
            } else {
                Some(ctx.scoring.clone())
            },
            metrics: ctx.metrics.clone(),
            cache_hits: ctx.cache_hits,
            resume_from_step,
            created_at: Utc::now(),
        }
    }

    /// Rebuild an execution context from this snapshot.
    pub fn restore(&self) -> ExecutionContext {
        let state = match &self.state {
            Some(snapshot) => StateManager::from_snapshot(snapshot.clone()),
            None => self
                .ensemble
                .state
                .as_ref()
                .map(StateManager::new)
                .unwrap_or_else(StateManager::empty),
        };

        let mut ctx = ExecutionContext::new(
            self.run_id.clone(),
            &self.ensemble.name,
            self.input.clone(),
            state,
        );
        ctx.outputs = self.outputs.clone();
        ctx.order = self.order.clone();
        ctx.metrics = self.metrics.clone();
        ctx.cache_hits = self.cache_hits;
        if let Some(scoring) = &self.scoring {
            ctx.scoring = scoring.clone();
        }
        ctx
    }
}

/// Durable suspend store backed by SQLite.
///
/// The in-memory `SuspendedState` is the engine's contract; this store
/// is an optional convenience for parking approval-gated runs across
/// process restarts. Latest snapshot wins per (ensemble, run).
pub struct SuspendStore {
    conn: Mutex<Connection>,
}

impl SuspendStore {
    /// Open or create the suspend database.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| TuttiError::Database(format!("failed to open suspend store: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;

             CREATE TABLE IF NOT EXISTS suspensions (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 ensemble TEXT NOT NULL,
                 run_id TEXT NOT NULL,
                 resume_from_step INTEGER NOT NULL,
                 snapshot_json TEXT NOT NULL,
                 created_at TEXT NOT NULL
             );

             CREATE INDEX IF NOT EXISTS idx_susp_ensemble
                 ON suspensions(ensemble, created_at DESC);",
        )
        .map_err(|e| TuttiError::Database(format!("failed to initialize suspend schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Save a snapshot (latest wins per ensemble + run).
    pub fn save(&self, snapshot: &SuspendedState) -> Result<()> {
        let snapshot_json = serde_json::to_string(snapshot)?;
        let conn = self
            .conn
            .lock()
            .map_err(|e| TuttiError::Database(e.to_string()))?;

        conn.execute(
            "DELETE FROM suspensions WHERE ensemble = ?1 AND run_id = ?2",
            params![snapshot.ensemble.name, snapshot.run_id.0],
        )
        .map_err(|e| TuttiError::Database(format!("failed to clean old snapshots: {}", e)))?;

        conn.execute(
            "INSERT INTO suspensions (ensemble, run_id, resume_from_step, snapshot_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                snapshot.ensemble.name,
                snapshot.run_id.0,
                snapshot.resume_from_step as i64,
                snapshot_json,
                snapshot.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| TuttiError::Database(format!("failed to save snapshot: {}", e)))?;

        Ok(())
    }

    /// Load the most recent snapshot for an ensemble (any run).
    pub fn load_latest(&self, ensemble: &str) -> Result<Option<SuspendedState>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TuttiError::Database(e.to_string()))?;

        let mut stmt = conn
            .prepare(
                "SELECT snapshot_json FROM suspensions
                 WHERE ensemble = ?1
                 ORDER BY created_at DESC
                 LIMIT 1",
            )
            .map_err(|e| TuttiError::Database(format!("failed to prepare query: {}", e)))?;

        let json: Option<String> = stmt
            .query_row(params![ensemble], |row| row.get(0))
            .ok();

        match json {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    /// Delete all snapshots for an ensemble. Returns the count removed.
    pub fn delete(&self, ensemble: &str) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TuttiError::Database(e.to_string()))?;
        let deleted = conn
            .execute(
                "DELETE FROM suspensions WHERE ensemble = ?1",
                params![ensemble],
            )
            .map_err(|e| TuttiError::Database(format!("failed to delete snapshots: {}", e)))?;
        Ok(deleted)
    }

    /// Delete one run's snapshot.
    pub fn delete_run(&self, ensemble: &str, run_id: &RunId) -> Result<usize> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| TuttiError::Database(e.to_string()))?;
        let deleted = conn
            .execute(
                "DELETE FROM suspensions WHERE ensemble = ?1 AND run_id = ?2",
                params![ensemble, run_id.0],
            )
            .map_err(|e| TuttiError::Database(format!("failed to delete snapshot: {}", e)))?;
        Ok(deleted)
    }
}
