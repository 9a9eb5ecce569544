use std::collections::HashMap;

use serde_json::{Map, Value};

use tutti_core::state::{AccessLogEntry, ScopedState, StateManager};
use tutti_core::types::{RunId, StepMetric};

use crate::scoring::ScoringState;

/// A state commit captured for replay into a parent context.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    pub updates: HashMap<String, Value>,
    pub log: Vec<AccessLogEntry>,
}

/// Bookkeeping captured when a context is forked, so a merge can tell
/// which entries the child added.
#[derive(Debug, Clone, Copy, Default)]
struct ForkBase {
    metrics: usize,
    history: usize,
    cache_hits: usize,
}

/// Per-run mutable accumulator.
///
/// Holds the run input, every recorded step output (in execution
/// order), the current state snapshot, scoring state, and metrics.
/// Concurrent graph branches work on forked copies that are merged
/// back in settlement order; state commits replay as deltas so
/// non-overlapping writes from sibling branches all survive.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub run_id: RunId,
    pub ensemble: String,
    pub input: Value,
    pub outputs: HashMap<String, Value>,
    pub order: Vec<String>,
    /// Scope variables (`item`, `index`, `error`) visible to expressions.
    pub vars: HashMap<String, Value>,
    pub state: StateManager,
    pub scoring: ScoringState,
    pub metrics: Vec<StepMetric>,
    pub cache_hits: usize,
    state_updates: Vec<StateUpdate>,
    base: ForkBase,
}

impl ExecutionContext {
    pub fn new(run_id: RunId, ensemble: impl Into<String>, input: Value, state: StateManager) -> Self {
        Self {
            run_id,
            ensemble: ensemble.into(),
            input,
            outputs: HashMap::new(),
            order: Vec::new(),
            vars: HashMap::new(),
            state,
            scoring: ScoringState::new(),
            metrics: Vec::new(),
            cache_hits: 0,
            state_updates: Vec::new(),
            base: ForkBase::default(),
        }
    }

    /// Record a step output under its identifier.
    pub fn record_output(&mut self, id: impl Into<String>, value: Value) {
        let id = id.into();
        if !self.outputs.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.outputs.insert(id, value);
    }

    /// The most recently recorded output.
    pub fn last_output(&self) -> Option<&Value> {
        self.order.last().and_then(|id| self.outputs.get(id))
    }

    /// Commit a scope's staged writes into the state chain, keeping the
    /// delta for parent-context replay.
    pub fn commit_state(&mut self, scope: &ScopedState) {
        let updates = scope.pending_updates();
        let next = self.state.apply_pending(scope);
        let log_len = next.access_log().len();
        let prior_len = self.state.access_log().len();
        let log = next.access_log()[prior_len..log_len].to_vec();
        self.state = next;
        self.state_updates.push(StateUpdate { updates, log });
    }

    /// Expression scope: `context` (input, state, vars), `results`
    /// (step outputs), and loop/error vars at the root.
    pub fn scope(&self) -> Value {
        let mut context = Map::new();
        context.insert("input".into(), self.input.clone());
        context.insert(
            "state".into(),
            Value::Object(self.state.values().clone().into_iter().collect()),
        );
        for (k, v) in &self.vars {
            context.insert(k.clone(), v.clone());
        }

        let mut root = Map::new();
        root.insert("context".into(), Value::Object(context));
        root.insert(
            "results".into(),
            Value::Object(self.outputs.clone().into_iter().collect()),
        );
        for (k, v) in &self.vars {
            root.insert(k.clone(), v.clone());
        }
        Value::Object(root)
    }

    /// Fork a copy for a concurrent branch or nested block.
    pub fn fork(&self) -> Self {
        let mut child = self.clone();
        child.state_updates.clear();
        child.base = ForkBase {
            metrics: self.metrics.len(),
            history: self.scoring.history.len(),
            cache_hits: self.cache_hits,
        };
        child
    }

    /// Fork with an extra scope variable (`item`, `error`, ...).
    pub fn fork_with_var(&self, key: impl Into<String>, value: Value) -> Self {
        let mut child = self.fork();
        child.vars.insert(key.into(), value);
        child
    }

    /// Merge a settled child back. State deltas replay in call order,
    /// which makes overlapping writes last-committer-wins while
    /// preserving non-overlapping sibling writes.
    pub fn merge_child(&mut self, child: ExecutionContext) {
        for update in &child.state_updates {
            self.state = self.state.apply_updates(&update.updates, update.log.clone());
        }
        self.state_updates.extend(child.state_updates);

        for id in &child.order {
            if let Some(value) = child.outputs.get(id) {
                if !self.outputs.contains_key(id) {
                    self.order.push(id.clone());
                }
                self.outputs.insert(id.clone(), value.clone());
            }
        }

        self.metrics
            .extend(child.metrics.into_iter().skip(child.base.metrics));
        self.scoring
            .history
            .extend(child.scoring.history.into_iter().skip(child.base.history));
        for (step, count) in child.scoring.retry_counts {
            let entry = self.scoring.retry_counts.entry(step).or_insert(0);
            *entry = (*entry).max(count);
        }
        self.cache_hits += child.cache_hits.saturating_sub(child.base.cache_hits);
    }
}
