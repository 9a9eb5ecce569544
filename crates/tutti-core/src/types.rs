use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::state::ScopedState;

/// Unique identifier for one ensemble run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Result of one executable-unit invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOutput {
    /// The unit's payload.
    pub data: Value,
    /// Whether the unit served this result from its own cache.
    #[serde(default)]
    pub cached: bool,
}

impl UnitOutput {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            cached: false,
        }
    }

    pub fn cached(data: Value) -> Self {
        Self { data, cached: true }
    }
}

/// Run-level information handed to every unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub run_id: RunId,
    pub ensemble: String,
    pub step: String,
}

/// Context passed to an executable unit.
///
/// Carries the resolved input, the shared environment, outputs of every
/// step recorded so far, and (when the step declares state access) a
/// scoped state view with staged writes.
#[derive(Debug, Clone)]
pub struct UnitContext {
    pub input: Value,
    pub env: HashMap<String, String>,
    pub run: RunInfo,
    pub previous_outputs: HashMap<String, Value>,
    pub state: Option<Arc<ScopedState>>,
}

impl UnitContext {
    pub fn new(input: Value, run: RunInfo) -> Self {
        Self {
            input,
            env: HashMap::new(),
            run,
            previous_outputs: HashMap::new(),
            state: None,
        }
    }

    /// Read a key from the scoped state, if this step declared one.
    pub fn state_get(&self, key: &str) -> Option<Value> {
        self.state.as_ref().and_then(|s| s.get(key))
    }

    /// Stage a state write, if this step declared one.
    pub fn state_set(&self, key: &str, value: Value) -> crate::error::Result<()> {
        match self.state.as_ref() {
            Some(s) => s.set(key, value),
            None => Err(crate::error::TuttiError::StateAccess {
                owner: self.run.step.clone(),
                key: key.to_string(),
                operation: "write".to_string(),
            }),
        }
    }
}

/// Per-step execution metric.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMetric {
    pub name: String,
    pub duration_ms: u64,
    pub cached: bool,
    pub success: bool,
}

/// Aggregate metrics for a whole run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExecutionMetrics {
    pub per_step: Vec<StepMetric>,
    pub cache_hits: usize,
    pub total_duration_ms: u64,
}

/// Ensemble-level scoring summary attached to the run output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringSummary {
    pub final_score: f64,
    pub pass_rate: f64,
    pub mean_attempts: f64,
    pub total_attempts: u32,
}

/// Final result of an ensemble run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutput {
    pub output: Value,
    pub metrics: ExecutionMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_report: Option<crate::state::AccessReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scoring: Option<ScoringSummary>,
}

/// Engine event broadcast to all subscribers.
///
/// Delivery is best-effort: a missing or slow subscriber never affects
/// the run that published the event.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// An ensemble run started.
    ExecutionStarted { run_id: RunId, ensemble: String },
    /// A step began executing.
    StepStarted { run_id: RunId, step: String },
    /// A step finished.
    StepCompleted {
        run_id: RunId,
        step: String,
        duration_ms: u64,
        success: bool,
    },
    /// A scoring attempt was evaluated.
    ScoreRecorded {
        run_id: RunId,
        step: String,
        score: f64,
        passed: bool,
        attempt: u32,
    },
    /// The run completed successfully.
    ExecutionCompleted {
        run_id: RunId,
        ensemble: String,
        total_duration_ms: u64,
    },
    /// The run failed.
    ExecutionFailed {
        run_id: RunId,
        ensemble: String,
        error: String,
    },
    /// The run was suspended for later resumption.
    ExecutionSuspended {
        run_id: RunId,
        ensemble: String,
        resume_from_step: usize,
    },
}
