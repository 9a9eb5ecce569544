use std::collections::HashMap;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{UnitContext, UnitOutput};

/// Executable unit — anything an ensemble step can invoke.
///
/// Concrete adapters (AI calls, HTTP fetches, storage operations) live
/// outside the engine; they only need to implement this contract and
/// register under a name.
pub trait ExecutableUnit: Send + Sync + 'static {
    /// Unit name used for registry lookups.
    fn name(&self) -> &str;

    /// Execute with the resolved input and run context.
    fn execute(&self, ctx: UnitContext) -> BoxFuture<'_, Result<UnitOutput>>;
}

/// Context handed to an evaluator alongside the output being scored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EvalContext {
    /// 1-based attempt number.
    pub attempt: u32,
    /// Score of the previous attempt, if any.
    pub previous_score: Option<f64>,
}

/// Verdict returned by an evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    /// Quality score, expected in `0.0..=1.0`.
    pub score: f64,
    /// Explicit pass/fail; absent = compare against the threshold.
    #[serde(default)]
    pub passed: Option<bool>,
    #[serde(default)]
    pub feedback: Option<String>,
    /// Per-criterion sub-scores.
    #[serde(default)]
    pub breakdown: HashMap<String, f64>,
}

impl Score {
    pub fn new(score: f64) -> Self {
        Self {
            score,
            passed: None,
            feedback: None,
            breakdown: HashMap::new(),
        }
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }
}

/// Evaluator — scores a unit output for the quality-gated retry loop.
pub trait Evaluator: Send + Sync + 'static {
    /// Evaluator name used for registry lookups.
    fn name(&self) -> &str;

    /// Score one attempt's output.
    fn evaluate(&self, output: UnitOutput, ctx: EvalContext) -> BoxFuture<'_, Result<Score>>;
}
