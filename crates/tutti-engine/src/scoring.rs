use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::Future;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tutti_core::ensemble::{AggregateStrategy, OnFailure, ScoringConfig};
use tutti_core::error::{Result, TuttiError};
use tutti_core::traits::{EvalContext, Evaluator};
use tutti_core::types::{ScoringSummary, UnitOutput};

/// One evaluated attempt in the run's score history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreRecord {
    /// Step that produced the scored output.
    pub step: String,
    pub score: f64,
    pub passed: bool,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub breakdown: HashMap<String, f64>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Weight in the ensemble-level aggregate.
    pub weight: f64,
    pub timestamp: DateTime<Utc>,
}

/// Accumulated scoring data for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScoringState {
    /// Ordered history of every evaluated attempt.
    pub history: Vec<ScoreRecord>,
    /// Retries consumed per step.
    pub retry_counts: HashMap<String, u32>,
    #[serde(default)]
    pub final_score: Option<f64>,
}

impl ScoringState {
    pub fn new() -> Self {
        Self::default()
    }

    fn record(&mut self, record: ScoreRecord) {
        if record.attempt > 1 {
            *self.retry_counts.entry(record.step.clone()).or_insert(0) += 1;
        }
        self.history.push(record);
    }

    /// Final (passing or last) record per step, in first-seen order.
    fn final_records(&self) -> Vec<&ScoreRecord> {
        let mut order: Vec<&str> = Vec::new();
        let mut last: HashMap<&str, &ScoreRecord> = HashMap::new();
        for record in &self.history {
            if !last.contains_key(record.step.as_str()) {
                order.push(&record.step);
            }
            last.insert(&record.step, record);
        }
        order.into_iter().filter_map(|s| last.get(s).copied()).collect()
    }
}

/// How a scored execution terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringStatus {
    /// The quality gate passed.
    Passed,
    /// The gate never passed; the last attempt's result is surfaced.
    MaxRetriesExceeded,
    /// `on_failure = continue`: the failing result was accepted.
    Continued,
}

/// Result of a quality-gated execution.
#[derive(Debug, Clone)]
pub struct ScoredOutcome {
    pub output: UnitOutput,
    pub score: f64,
    pub attempts: u32,
    pub status: ScoringStatus,
}

/// Runs an action under a quality gate with retries.
///
/// Each attempt's output is fed to the evaluator together with the
/// attempt number and the previous score; the attempt passes when the
/// evaluator says so, or — absent an explicit verdict — when the score
/// meets the threshold. The last attempt's result is always returned,
/// never discarded.
#[derive(Debug, Default)]
pub struct ScoringExecutor;

impl ScoringExecutor {
    pub fn new() -> Self {
        Self
    }

    pub async fn execute_with_scoring<F, Fut>(
        &self,
        step: &str,
        config: &ScoringConfig,
        evaluator: Arc<dyn Evaluator>,
        state: &mut ScoringState,
        mut action: F,
    ) -> Result<ScoredOutcome>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<UnitOutput>>,
    {
        let max_attempts = config.retry_limit + 1;
        let mut previous_score: Option<f64> = None;
        let mut last: Option<(UnitOutput, f64)> = None;

        for attempt in 1..=max_attempts {
            let output = action(attempt).await?;

            let score = evaluator
                .evaluate(
                    output.clone(),
                    EvalContext {
                        attempt,
                        previous_score,
                    },
                )
                .await
                .map_err(|e| {
                    TuttiError::Scoring(format!("evaluator failed for step '{}': {}", step, e))
                })?;

            let passed = score.passed.unwrap_or(score.score >= config.threshold);

            state.record(ScoreRecord {
                step: step.to_string(),
                score: score.score,
                passed,
                feedback: score.feedback.clone(),
                breakdown: score.breakdown.clone(),
                attempt,
                weight: config.weight,
                timestamp: Utc::now(),
            });

            debug!(
                step,
                attempt,
                score = score.score,
                passed,
                threshold = config.threshold,
                "Scored attempt"
            );

            if passed {
                return Ok(ScoredOutcome {
                    output,
                    score: score.score,
                    attempts: attempt,
                    status: ScoringStatus::Passed,
                });
            }

            if config.require_improvement {
                if let Some(prev) = previous_score {
                    if score.score <= prev + config.min_improvement {
                        warn!(
                            step,
                            attempt,
                            score = score.score,
                            previous = prev,
                            "Retry did not improve the score"
                        );
                    }
                }
            }

            if config.on_failure == OnFailure::Continue {
                warn!(step, score = score.score, "Score below threshold, continuing per policy");
                return Ok(ScoredOutcome {
                    output,
                    score: score.score,
                    attempts: attempt,
                    status: ScoringStatus::Continued,
                });
            }

            previous_score = Some(match previous_score {
                Some(prev) if config.require_improvement => prev.max(score.score),
                _ => score.score,
            });
            last = Some((output, score.score));
        }

        let (output, score) = last.unwrap_or_else(|| (UnitOutput::new(serde_json::Value::Null), 0.0));

        if config.on_failure == OnFailure::Abort {
            return Err(TuttiError::Scoring(format!(
                "step '{}' failed the quality gate after {} attempts (last score {:.2}, threshold {:.2})",
                step, max_attempts, score, config.threshold
            )));
        }

        warn!(
            step,
            attempts = max_attempts,
            score,
            threshold = config.threshold,
            "Quality gate never passed, surfacing last result"
        );

        Ok(ScoredOutcome {
            output,
            score,
            attempts: max_attempts,
            status: ScoringStatus::MaxRetriesExceeded,
        })
    }
}

/// Folds a run's score history into an ensemble-level score plus
/// summary quality metrics.
#[derive(Debug, Default)]
pub struct EnsembleScorer;

impl EnsembleScorer {
    pub fn new() -> Self {
        Self
    }

    /// Aggregate final per-step scores with the given strategy.
    pub fn aggregate(&self, state: &ScoringState, strategy: AggregateStrategy) -> Option<f64> {
        let records = state.final_records();
        if records.is_empty() {
            return None;
        }

        let score = match strategy {
            AggregateStrategy::WeightedAverage => {
                let total_weight: f64 = records.iter().map(|r| r.weight).sum();
                if total_weight == 0.0 {
                    return Some(0.0);
                }
                records.iter().map(|r| r.score * r.weight).sum::<f64>() / total_weight
            }
            AggregateStrategy::Minimum => records
                .iter()
                .map(|r| r.score)
                .fold(f64::INFINITY, f64::min),
            AggregateStrategy::GeometricMean => {
                let product: f64 = records.iter().map(|r| r.score.max(0.0)).product();
                product.powf(1.0 / records.len() as f64)
            }
        };
        Some(score)
    }

    /// Build the run-level summary and stamp the final score into state.
    pub fn finalize(
        &self,
        state: &mut ScoringState,
        strategy: AggregateStrategy,
    ) -> Option<ScoringSummary> {
        let final_score = self.aggregate(state, strategy)?;
        state.final_score = Some(final_score);

        let records = state.final_records();
        let passed = records.iter().filter(|r| r.passed).count();
        let total_attempts: u32 = records.iter().map(|r| r.attempt).sum();

        Some(ScoringSummary {
            final_score,
            pass_rate: passed as f64 / records.len() as f64,
            mean_attempts: f64::from(total_attempts) / records.len() as f64,
            total_attempts: state.history.len() as u32,
        })
    }
}
