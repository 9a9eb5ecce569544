use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A named, declarative workflow definition.
///
/// An ensemble is immutable once built: the engine never mutates the
/// definition during a run, so one `Ensemble` can drive any number of
/// concurrent runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ensemble {
    /// Unique ensemble name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Ordered steps.
    pub flow: Vec<Step>,
    /// Shared state configuration.
    #[serde(default)]
    pub state: Option<StateConfig>,
    /// Ensemble-level scoring defaults.
    #[serde(default)]
    pub scoring: Option<ScoringConfig>,
    /// Output mapping expression; defaults to the last step's output.
    #[serde(default)]
    pub output: Option<String>,
}

impl Ensemble {
    /// Create an ensemble with an empty flow.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            flow: vec![],
            state: None,
            scoring: None,
            output: None,
        }
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Append a step to the flow.
    pub fn with_step(mut self, step: impl Into<Step>) -> Self {
        self.flow.push(step.into());
        self
    }

    /// Replace the whole flow.
    pub fn with_flow(mut self, flow: Vec<Step>) -> Self {
        self.flow = flow;
        self
    }

    /// Set the shared state configuration.
    pub fn with_state(mut self, state: StateConfig) -> Self {
        self.state = Some(state);
        self
    }

    /// Set the output mapping expression.
    pub fn with_output(mut self, expr: impl Into<String>) -> Self {
        self.output = Some(expr.into());
        self
    }

    /// True when the flow is a plain ordered list of unit steps with no
    /// explicit dependencies — eligible for the sequential driver.
    pub fn is_linear(&self) -> bool {
        self.flow
            .iter()
            .all(|s| matches!(s, Step::Unit(u) if u.depends_on.is_empty()))
    }
}

/// One element of an ensemble flow: either a unit invocation or a
/// control-flow construct.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Step {
    Unit(UnitStep),
    Parallel(ParallelStep),
    Branch(BranchStep),
    Foreach(ForeachStep),
    Try(TryStep),
    Switch(SwitchStep),
    While(WhileStep),
    MapReduce(MapReduceStep),
}

impl Step {
    /// Shorthand for a bare unit invocation.
    pub fn unit(reference: impl Into<String>) -> Self {
        Self::Unit(UnitStep::new(reference))
    }

    /// Step kind name, used for generated identifiers and node tags.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unit(_) => "unit",
            Self::Parallel(_) => "parallel",
            Self::Branch(_) => "branch",
            Self::Foreach(_) => "foreach",
            Self::Try(_) => "try",
            Self::Switch(_) => "switch",
            Self::While(_) => "while",
            Self::MapReduce(_) => "map_reduce",
        }
    }

    /// Explicit identifier, if one was declared.
    pub fn declared_id(&self) -> Option<&str> {
        let id = match self {
            Self::Unit(s) => &s.id,
            Self::Parallel(s) => &s.id,
            Self::Branch(s) => &s.id,
            Self::Foreach(s) => &s.id,
            Self::Try(s) => &s.id,
            Self::Switch(s) => &s.id,
            Self::While(s) => &s.id,
            Self::MapReduce(s) => &s.id,
        };
        id.as_deref()
    }

    /// Effective identifier: explicit id, else the unit reference, else
    /// `kind-<index>`. Stable for a given flow.
    pub fn effective_id(&self, index: usize) -> String {
        if let Some(id) = self.declared_id() {
            return id.to_string();
        }
        match self {
            Self::Unit(s) => s.unit.clone(),
            other => format!("{}-{}", other.kind(), index),
        }
    }

    /// Declared dependencies of this step.
    pub fn depends_on(&self) -> &[String] {
        match self {
            Self::Unit(s) => &s.depends_on,
            Self::Parallel(s) => &s.depends_on,
            Self::Branch(s) => &s.depends_on,
            Self::Foreach(s) => &s.depends_on,
            Self::Try(s) => &s.depends_on,
            Self::Switch(s) => &s.depends_on,
            Self::While(s) => &s.depends_on,
            Self::MapReduce(s) => &s.depends_on,
        }
    }
}

impl From<UnitStep> for Step {
    fn from(s: UnitStep) -> Self {
        Self::Unit(s)
    }
}

/// Invocation of a named executable unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitStep {
    /// Unit reference: `name` or `name@version`.
    pub unit: String,
    /// Explicit step identifier; defaults to the unit reference.
    #[serde(default)]
    pub id: Option<String>,
    /// Input mapping; `{{ ... }}` placeholders are interpolated against
    /// the run scope. Absent = default-chain from the previous output.
    #[serde(default)]
    pub input: Option<Value>,
    /// Guard expression; false skips the unit with a skip marker.
    #[serde(default)]
    pub when: Option<String>,
    /// Retry policy for failed executions.
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    /// Timeout race configuration.
    #[serde(default)]
    pub timeout: Option<TimeoutPolicy>,
    /// Declared state access for this step.
    #[serde(default)]
    pub state: Option<StateAccess>,
    /// Quality gate; executes via the scoring loop when present.
    #[serde(default)]
    pub scoring: Option<ScoringConfig>,
    /// Graph dependencies (step identifiers).
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl UnitStep {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            id: None,
            input: None,
            when: None,
            retry: None,
            timeout: None,
            state: None,
            scoring: None,
            depends_on: vec![],
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_when(mut self, expr: impl Into<String>) -> Self {
        self.when = Some(expr.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_timeout(mut self, timeout: TimeoutPolicy) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_state(mut self, state: StateAccess) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_scoring(mut self, scoring: ScoringConfig) -> Self {
        self.scoring = Some(scoring);
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// Join policy for parallel children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitFor {
    /// Join all children; any failure fails the step.
    #[default]
    All,
    /// Return the first settled child; the rest keep running detached.
    Any,
}

/// Concurrent execution of child steps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParallelStep {
    #[serde(default)]
    pub id: Option<String>,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub wait_for: WaitFor,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ParallelStep {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            id: None,
            steps,
            wait_for: WaitFor::All,
            depends_on: vec![],
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn wait_for_any(mut self) -> Self {
        self.wait_for = WaitFor::Any;
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// Two-way conditional.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchStep {
    #[serde(default)]
    pub id: Option<String>,
    /// Condition evaluated against `{context, results}`.
    pub condition: String,
    #[serde(rename = "then")]
    pub then_steps: Vec<Step>,
    #[serde(rename = "else", default)]
    pub else_steps: Vec<Step>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl BranchStep {
    pub fn new(condition: impl Into<String>, then_steps: Vec<Step>) -> Self {
        Self {
            id: None,
            condition: condition.into(),
            then_steps,
            else_steps: vec![],
            depends_on: vec![],
        }
    }

    pub fn with_else(mut self, else_steps: Vec<Step>) -> Self {
        self.else_steps = else_steps;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// Per-item iteration over a resolved array.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForeachStep {
    #[serde(default)]
    pub id: Option<String>,
    /// Expression resolving to an array; anything else is a type error.
    pub items: String,
    /// Step instantiated once per item.
    pub step: Box<Step>,
    /// Batch size; absent = all items at once.
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    /// Early-exit condition evaluated after each batch.
    #[serde(default)]
    pub break_when: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ForeachStep {
    pub fn new(items: impl Into<String>, step: Step) -> Self {
        Self {
            id: None,
            items: items.into(),
            step: Box::new(step),
            max_concurrency: None,
            break_when: None,
            depends_on: vec![],
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn with_break_when(mut self, expr: impl Into<String>) -> Self {
        self.break_when = Some(expr.into());
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// Failure containment with optional catch and finally blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryStep {
    #[serde(default)]
    pub id: Option<String>,
    pub steps: Vec<Step>,
    /// Runs on failure with the error injected into the scope as `error`.
    #[serde(rename = "catch", default)]
    pub catch_steps: Vec<Step>,
    /// Always runs afterward; never suppresses a pending failure.
    #[serde(rename = "finally", default)]
    pub finally_steps: Vec<Step>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl TryStep {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            id: None,
            steps,
            catch_steps: vec![],
            finally_steps: vec![],
            depends_on: vec![],
        }
    }

    pub fn with_catch(mut self, steps: Vec<Step>) -> Self {
        self.catch_steps = steps;
        self
    }

    pub fn with_finally(mut self, steps: Vec<Step>) -> Self {
        self.finally_steps = steps;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// Exact-match dispatch on a stringified value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchStep {
    #[serde(default)]
    pub id: Option<String>,
    /// Value expression; the result is stringified for case lookup.
    pub value: String,
    pub cases: HashMap<String, Vec<Step>>,
    #[serde(rename = "default", default)]
    pub default_steps: Vec<Step>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl SwitchStep {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            id: None,
            value: value.into(),
            cases: HashMap::new(),
            default_steps: vec![],
            depends_on: vec![],
        }
    }

    pub fn with_case(mut self, key: impl Into<String>, steps: Vec<Step>) -> Self {
        self.cases.insert(key.into(), steps);
        self
    }

    pub fn with_default(mut self, steps: Vec<Step>) -> Self {
        self.default_steps = steps;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

fn default_max_iterations() -> usize {
    1000
}

/// Condition-bounded loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhileStep {
    #[serde(default)]
    pub id: Option<String>,
    pub condition: String,
    pub steps: Vec<Step>,
    /// Hard bound; exceeding it is a fatal error, never a silent stop.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl WhileStep {
    pub fn new(condition: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            id: None,
            condition: condition.into(),
            steps,
            max_iterations: default_max_iterations(),
            depends_on: vec![],
        }
    }

    pub fn with_max_iterations(mut self, n: usize) -> Self {
        self.max_iterations = n;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// Batched map phase followed by a single reduce step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapReduceStep {
    #[serde(default)]
    pub id: Option<String>,
    /// Expression resolving to the items array.
    pub items: String,
    /// Step instantiated once per item; results keep input order.
    pub map_step: Box<Step>,
    /// Step receiving the full ordered map-results array as input.
    pub reduce_step: Box<Step>,
    #[serde(default)]
    pub max_concurrency: Option<usize>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl MapReduceStep {
    pub fn new(items: impl Into<String>, map_step: Step, reduce_step: Step) -> Self {
        Self {
            id: None,
            items: items.into(),
            map_step: Box::new(map_step),
            reduce_step: Box::new(reduce_step),
            max_concurrency: None,
            depends_on: vec![],
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    pub fn with_depends_on(mut self, deps: Vec<String>) -> Self {
        self.depends_on = deps;
        self
    }
}

/// Shared state configuration for an ensemble.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateConfig {
    /// Advisory schema; recorded but never enforced.
    #[serde(default)]
    pub schema: Option<Value>,
    /// Initial key/value contents.
    #[serde(default)]
    pub initial: HashMap<String, Value>,
}

/// Declared state access for one step.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateAccess {
    /// Keys this step may read.
    #[serde(rename = "use", default)]
    pub use_keys: Vec<String>,
    /// Keys this step may write.
    #[serde(rename = "set", default)]
    pub set_keys: Vec<String>,
}

impl StateAccess {
    pub fn new(use_keys: Vec<String>, set_keys: Vec<String>) -> Self {
        Self { use_keys, set_keys }
    }
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    30000
}

/// Retry policy for a unit step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Error codes eligible for retry; empty = any unit failure.
    #[serde(default)]
    pub retry_on: Vec<String>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: Backoff::Exponential,
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            retry_on: vec![],
        }
    }
}

fn default_timeout_error() -> bool {
    true
}

/// Timeout race configuration for a unit step.
///
/// On expiry the unit's future is dropped; work the unit already
/// delegated elsewhere keeps running detached — the engine does not
/// thread a cancellation signal into units.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutPolicy {
    pub timeout_ms: u64,
    /// When true (default) a timeout raises an error; when false the
    /// configured fallback value is returned instead.
    #[serde(default = "default_timeout_error")]
    pub error: bool,
    #[serde(default)]
    pub fallback: Option<Value>,
}

impl TimeoutPolicy {
    pub fn new(timeout_ms: u64) -> Self {
        Self {
            timeout_ms,
            error: true,
            fallback: None,
        }
    }

    pub fn with_fallback(mut self, fallback: Value) -> Self {
        self.error = false;
        self.fallback = Some(fallback);
        self
    }
}

/// Behavior when a scored attempt fails the quality gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    /// Retry until the limit, then surface the last result.
    #[default]
    Retry,
    /// Accept the failing result and continue the flow.
    Continue,
    /// Retry until the limit, then fail the run.
    Abort,
}

/// Strategy for folding score history into an ensemble-level score.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateStrategy {
    #[default]
    WeightedAverage,
    /// Bottleneck: the lowest step score.
    Minimum,
    GeometricMean,
}

fn default_threshold() -> f64 {
    0.7
}

fn default_retry_limit() -> u32 {
    2
}

fn default_weight() -> f64 {
    1.0
}

/// Quality gate configuration for a scored step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Name of the evaluator to resolve from the registry.
    pub evaluator: String,
    /// Minimum passing score.
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    /// Retries allowed after the first attempt.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Require each retry to beat the previous score.
    #[serde(default)]
    pub require_improvement: bool,
    /// Minimum score gain for a retry to count as helpful.
    #[serde(default)]
    pub min_improvement: f64,
    #[serde(default)]
    pub on_failure: OnFailure,
    /// Weight of this step in the ensemble-level aggregate.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Aggregation strategy for the ensemble-level score.
    #[serde(default)]
    pub strategy: AggregateStrategy,
}

impl ScoringConfig {
    pub fn new(evaluator: impl Into<String>) -> Self {
        Self {
            evaluator: evaluator.into(),
            threshold: default_threshold(),
            retry_limit: default_retry_limit(),
            require_improvement: false,
            min_improvement: 0.0,
            on_failure: OnFailure::Retry,
            weight: default_weight(),
            strategy: AggregateStrategy::WeightedAverage,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_on_failure(mut self, on_failure: OnFailure) -> Self {
        self.on_failure = on_failure;
        self
    }

    pub fn require_improvement(mut self, min_improvement: f64) -> Self {
        self.require_improvement = true;
        self.min_improvement = min_improvement;
        self
    }
}
