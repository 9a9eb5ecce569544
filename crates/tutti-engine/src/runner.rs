use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tracing::{debug, warn};

use tutti_core::config::EngineConfig;
use tutti_core::ensemble::{TimeoutPolicy, UnitStep};
use tutti_core::error::{Result, TuttiError};
use tutti_core::event::EventBus;
use tutti_core::traits::ExecutableUnit;
use tutti_core::types::{EngineEvent, RunInfo, StepMetric, UnitContext, UnitOutput};

use crate::context::ExecutionContext;
use crate::expr::{evaluate_condition, interpolate};
use crate::registry::UnitRegistry;
use crate::retry::execute_with_retry;
use crate::scoring::ScoringExecutor;

/// Marker recorded for a unit whose `when` guard was false.
///
/// A skipped step leaves a marker, not an absence, so downstream steps
/// and dependency tracking still see a settled result.
pub fn skip_marker() -> Value {
    json!({ "skipped": true })
}

/// True when a recorded output is the skip marker.
pub fn is_skipped(value: &Value) -> bool {
    value.get("skipped").and_then(Value::as_bool) == Some(true)
}

/// Executes one unit step end-to-end: guard, input resolution, unit
/// lookup, timeout/retry/scoring wrapping, state commit, metrics.
/// Shared by the sequential and graph drivers.
#[derive(Clone)]
pub struct UnitRunner {
    pub registry: Arc<UnitRegistry>,
    pub event_bus: Arc<EventBus>,
    pub config: EngineConfig,
    pub env: HashMap<String, String>,
    scoring: Arc<ScoringExecutor>,
}

impl UnitRunner {
    pub fn new(
        registry: Arc<UnitRegistry>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            registry,
            event_bus,
            config,
            env,
            scoring: Arc::new(ScoringExecutor::new()),
        }
    }

    /// Default input for a unit step that declares no mapping:
    /// dependency outputs first, then the current loop item, then the
    /// previous step's output, then the run input.
    pub fn default_input(&self, step: &UnitStep, ctx: &ExecutionContext) -> Value {
        match step.depends_on.len() {
            0 => {}
            1 => {
                if let Some(out) = ctx.outputs.get(&step.depends_on[0]) {
                    return out.clone();
                }
            }
            _ => {
                let map: serde_json::Map<String, Value> = step
                    .depends_on
                    .iter()
                    .filter_map(|dep| ctx.outputs.get(dep).map(|v| (dep.clone(), v.clone())))
                    .collect();
                return Value::Object(map);
            }
        }
        if let Some(item) = ctx.vars.get("item") {
            return item.clone();
        }
        ctx.last_output().cloned().unwrap_or_else(|| ctx.input.clone())
    }

    /// Run one unit step against the context. Returns the step result;
    /// the caller records it under the step identifier.
    pub async fn run_unit_step(
        &self,
        step: &UnitStep,
        step_id: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<Value> {
        let scope = ctx.scope();

        if let Some(when) = &step.when {
            if !evaluate_condition(when, &scope) {
                debug!(step = step_id, guard = %when, "Guard is false, skipping unit");
                return Ok(skip_marker());
            }
        }

        let input = match &step.input {
            Some(mapping) => interpolate(mapping, &scope),
            None => self.default_input(step, ctx),
        };

        let unit = self.registry.resolve(&step.unit)?;

        let state_scope = step
            .state
            .as_ref()
            .map(|access| Arc::new(ctx.state.scope_for(step_id, access)));

        let unit_ctx = UnitContext {
            input,
            env: self.env.clone(),
            run: RunInfo {
                run_id: ctx.run_id.clone(),
                ensemble: ctx.ensemble.clone(),
                step: step_id.to_string(),
            },
            previous_outputs: ctx.outputs.clone(),
            state: state_scope.clone(),
        };

        self.event_bus.publish(EngineEvent::StepStarted {
            run_id: ctx.run_id.clone(),
            step: step_id.to_string(),
        });

        let timeout = step.timeout.clone().or_else(|| {
            self.config
                .engine
                .default_timeout_ms
                .map(TimeoutPolicy::new)
        });

        let start = Instant::now();
        let result = self
            .execute_gated(step, step_id, &unit, &unit_ctx, timeout.as_ref(), ctx)
            .await;
        let duration_ms = start.elapsed().as_millis() as u64;

        match result {
            Ok(output) => {
                if let Some(scope) = state_scope.as_deref() {
                    ctx.commit_state(scope);
                }
                if output.cached {
                    ctx.cache_hits += 1;
                }
                ctx.metrics.push(StepMetric {
                    name: step_id.to_string(),
                    duration_ms,
                    cached: output.cached,
                    success: true,
                });
                self.event_bus.publish(EngineEvent::StepCompleted {
                    run_id: ctx.run_id.clone(),
                    step: step_id.to_string(),
                    duration_ms,
                    success: true,
                });
                Ok(output.data)
            }
            Err(e) => {
                ctx.metrics.push(StepMetric {
                    name: step_id.to_string(),
                    duration_ms,
                    cached: false,
                    success: false,
                });
                self.event_bus.publish(EngineEvent::StepCompleted {
                    run_id: ctx.run_id.clone(),
                    step: step_id.to_string(),
                    duration_ms,
                    success: false,
                });
                Err(e)
            }
        }
    }

    /// Execute with the scoring gate when declared, else directly; both
    /// paths apply the step's retry policy and timeout race.
    async fn execute_gated(
        &self,
        step: &UnitStep,
        step_id: &str,
        unit: &Arc<dyn ExecutableUnit>,
        unit_ctx: &UnitContext,
        timeout: Option<&TimeoutPolicy>,
        ctx: &mut ExecutionContext,
    ) -> Result<UnitOutput> {
        match &step.scoring {
            Some(scoring) => {
                let evaluator = self.registry.resolve_evaluator(&scoring.evaluator)?;
                let unit = Arc::clone(unit);
                let unit_ctx = unit_ctx.clone();
                let retry = step.retry.clone();
                let timeout = timeout.cloned();
                let step_id_owned = step_id.to_string();

                let outcome = self
                    .scoring
                    .execute_with_scoring(
                        step_id,
                        scoring,
                        evaluator,
                        &mut ctx.scoring,
                        move |_attempt| {
                            let unit = Arc::clone(&unit);
                            let unit_ctx = unit_ctx.clone();
                            let retry = retry.clone();
                            let timeout = timeout.clone();
                            let step_id = step_id_owned.clone();
                            async move {
                                execute_attempts(&unit, &unit_ctx, retry.as_ref(), timeout.as_ref(), &step_id)
                                    .await
                            }
                        },
                    )
                    .await?;

                self.event_bus.publish(EngineEvent::ScoreRecorded {
                    run_id: ctx.run_id.clone(),
                    step: step_id.to_string(),
                    score: outcome.score,
                    passed: outcome.status == crate::scoring::ScoringStatus::Passed,
                    attempt: outcome.attempts,
                });

                Ok(outcome.output)
            }
            None => {
                execute_attempts(unit, unit_ctx, step.retry.as_ref(), timeout, step_id).await
            }
        }
    }
}

/// One logical execution: timeout race per attempt, retries per policy.
async fn execute_attempts(
    unit: &Arc<dyn ExecutableUnit>,
    unit_ctx: &UnitContext,
    retry: Option<&tutti_core::ensemble::RetryPolicy>,
    timeout: Option<&TimeoutPolicy>,
    step_id: &str,
) -> Result<UnitOutput> {
    match retry {
        Some(policy) => {
            execute_with_retry(policy, step_id, |_attempt| {
                execute_once(unit, unit_ctx.clone(), timeout, step_id)
            })
            .await
        }
        None => execute_once(unit, unit_ctx.clone(), timeout, step_id).await,
    }
}

/// Race the unit's future against the timeout, if any.
///
/// On expiry the future is dropped; work the unit delegated elsewhere
/// may keep running detached.
async fn execute_once(
    unit: &Arc<dyn ExecutableUnit>,
    unit_ctx: UnitContext,
    timeout: Option<&TimeoutPolicy>,
    step_id: &str,
) -> Result<UnitOutput> {
    match timeout {
        Some(policy) => {
            match tokio::time::timeout(
                Duration::from_millis(policy.timeout_ms),
                unit.execute(unit_ctx),
            )
            .await
            {
                Ok(result) => result,
                Err(_) if policy.error => Err(TuttiError::Timeout {
                    step: step_id.to_string(),
                    timeout_ms: policy.timeout_ms,
                }),
                Err(_) => {
                    warn!(
                        step = step_id,
                        timeout_ms = policy.timeout_ms,
                        "Unit timed out, returning configured fallback"
                    );
                    Ok(UnitOutput::new(
                        policy.fallback.clone().unwrap_or(Value::Null),
                    ))
                }
            }
        }
        None => unit.execute(unit_ctx).await,
    }
}
