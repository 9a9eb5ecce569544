use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::ensemble::{StateAccess, StateConfig};
use crate::error::{Result, TuttiError};

/// State operation recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessOp {
    Read,
    Write,
}

/// One audited state access.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessLogEntry {
    pub owner: String,
    pub key: String,
    pub operation: AccessOp,
    pub timestamp: DateTime<Utc>,
}

/// Read/write counts for one state key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyAccess {
    pub reads: usize,
    pub writes: usize,
}

/// Access summary derived from the cumulative audit log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessReport {
    /// Keys present in state that no step ever read.
    pub unused_keys: Vec<String>,
    /// Per-key read/write counts.
    pub patterns: HashMap<String, KeyAccess>,
}

/// Immutable shared state with copy-on-write updates.
///
/// Every mutator returns a new `StateManager`; prior instances remain
/// valid and unchanged, which makes speculative branches and replay
/// safe. The only way a unit mutates state is through a `ScopedState`
/// whose staged writes are applied explicitly via `apply_pending`.
#[derive(Debug, Clone)]
pub struct StateManager {
    /// Advisory schema; never enforced by the engine.
    schema: Option<Value>,
    state: Arc<HashMap<String, Value>>,
    access_log: Vec<AccessLogEntry>,
}

impl StateManager {
    pub fn new(config: &StateConfig) -> Self {
        Self {
            schema: config.schema.clone(),
            state: Arc::new(config.initial.clone()),
            access_log: Vec::new(),
        }
    }

    pub fn empty() -> Self {
        Self {
            schema: None,
            state: Arc::new(HashMap::new()),
            access_log: Vec::new(),
        }
    }

    /// Rebuild a manager from a serialized snapshot.
    pub fn from_snapshot(snapshot: StateSnapshot) -> Self {
        Self {
            schema: snapshot.schema,
            state: Arc::new(snapshot.state),
            access_log: snapshot.access_log,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.state
    }

    pub fn schema(&self) -> Option<&Value> {
        self.schema.as_ref()
    }

    pub fn access_log(&self) -> &[AccessLogEntry] {
        &self.access_log
    }

    /// Return a new instance with one key set. The receiver is untouched.
    pub fn with_value(&self, key: impl Into<String>, value: Value) -> Self {
        let mut next = (*self.state).clone();
        next.insert(key.into(), value);
        Self {
            schema: self.schema.clone(),
            state: Arc::new(next),
            access_log: self.access_log.clone(),
        }
    }

    /// Build a scoped view for one step, restricted to its declared keys.
    pub fn scope_for(&self, owner: impl Into<String>, access: &StateAccess) -> ScopedState {
        ScopedState {
            owner: owner.into(),
            readable: access.use_keys.iter().cloned().collect(),
            writable: access.set_keys.iter().cloned().collect(),
            snapshot: Arc::clone(&self.state),
            pending: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Apply a scope's staged writes, returning the next instance.
    ///
    /// The scope's audit entries are absorbed into the new instance's
    /// log. The receiver is untouched.
    pub fn apply_pending(&self, scope: &ScopedState) -> Self {
        let pending = scope.pending_updates();
        let scope_log = scope.drain_log();

        let mut next_state = (*self.state).clone();
        for (key, value) in &pending {
            next_state.insert(key.clone(), value.clone());
        }

        if !pending.is_empty() {
            debug!(
                owner = %scope.owner,
                keys = pending.len(),
                "Committed pending state updates"
            );
        }

        let mut next_log = self.access_log.clone();
        next_log.extend(scope_log);

        Self {
            schema: self.schema.clone(),
            state: Arc::new(next_state),
            access_log: next_log,
        }
    }

    /// Apply a raw update batch (used when merging concurrent branches).
    pub fn apply_updates(
        &self,
        updates: &HashMap<String, Value>,
        log: Vec<AccessLogEntry>,
    ) -> Self {
        let mut next_state = (*self.state).clone();
        for (key, value) in updates {
            next_state.insert(key.clone(), value.clone());
        }
        let mut next_log = self.access_log.clone();
        next_log.extend(log);
        Self {
            schema: self.schema.clone(),
            state: Arc::new(next_state),
            access_log: next_log,
        }
    }

    /// Serializable snapshot of this instance.
    pub fn snapshot(&self) -> StateSnapshot {
        StateSnapshot {
            schema: self.schema.clone(),
            state: (*self.state).clone(),
            access_log: self.access_log.clone(),
        }
    }

    /// Derive unused keys and per-key access patterns from the log.
    pub fn access_report(&self) -> AccessReport {
        let mut patterns: HashMap<String, KeyAccess> = HashMap::new();
        for entry in &self.access_log {
            let counts = patterns.entry(entry.key.clone()).or_default();
            match entry.operation {
                AccessOp::Read => counts.reads += 1,
                AccessOp::Write => counts.writes += 1,
            }
        }

        let mut unused_keys: Vec<String> = self
            .state
            .keys()
            .filter(|k| patterns.get(*k).map_or(true, |p| p.reads == 0))
            .cloned()
            .collect();
        unused_keys.sort();

        AccessReport {
            unused_keys,
            patterns,
        }
    }
}

/// Serializable form of a `StateManager`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub state: HashMap<String, Value>,
    #[serde(default)]
    pub access_log: Vec<AccessLogEntry>,
}

/// A state view restricted to one step's declared keys.
///
/// Reads come from the snapshot taken when the scope was created.
/// Writes are staged, not applied; the engine commits them with
/// `StateManager::apply_pending` after the step succeeds.
#[derive(Debug)]
pub struct ScopedState {
    owner: String,
    readable: HashSet<String>,
    writable: HashSet<String>,
    snapshot: Arc<HashMap<String, Value>>,
    pending: Mutex<HashMap<String, Value>>,
    log: Mutex<Vec<AccessLogEntry>>,
}

impl ScopedState {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Read a declared key. Undeclared keys read as `None` and are not
    /// logged.
    pub fn get(&self, key: &str) -> Option<Value> {
        if !self.readable.contains(key) {
            return None;
        }
        self.push_log(key, AccessOp::Read);
        // Staged writes are visible to the step that staged them.
        if let Some(staged) = self.pending.lock().ok().and_then(|p| p.get(key).cloned()) {
            return Some(staged);
        }
        self.snapshot.get(key).cloned()
    }

    /// Stage a write to a declared key.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        if !self.writable.contains(key) {
            return Err(TuttiError::StateAccess {
                owner: self.owner.clone(),
                key: key.to_string(),
                operation: "write".to_string(),
            });
        }
        self.push_log(key, AccessOp::Write);
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(key.to_string(), value);
        }
        Ok(())
    }

    /// The writes staged so far, unapplied.
    pub fn pending_updates(&self) -> HashMap<String, Value> {
        self.pending.lock().map(|p| p.clone()).unwrap_or_default()
    }

    /// Take the accumulated audit entries out of the scope.
    pub fn drain_log(&self) -> Vec<AccessLogEntry> {
        self.log.lock().map(|mut l| std::mem::take(&mut *l)).unwrap_or_default()
    }

    fn push_log(&self, key: &str, operation: AccessOp) {
        if let Ok(mut log) = self.log.lock() {
            log.push(AccessLogEntry {
                owner: self.owner.clone(),
                key: key.to_string(),
                operation,
                timestamp: Utc::now(),
            });
        }
    }
}
