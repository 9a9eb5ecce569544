use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tracing::{error, info};

use tutti_core::config::EngineConfig;
use tutti_core::ensemble::{Ensemble, Step};
use tutti_core::error::{Result, TuttiError};
use tutti_core::event::EventBus;
use tutti_core::state::StateManager;
use tutti_core::types::{EngineEvent, ExecutionMetrics, ExecutionOutput, RunId};

use crate::context::ExecutionContext;
use crate::expr::resolve_value;
use crate::graph::GraphExecutor;
use crate::registry::UnitRegistry;
use crate::runner::UnitRunner;
use crate::scoring::EnsembleScorer;
use crate::suspend::SuspendedState;

/// Drives ensemble runs.
///
/// Linear flows (ordered unit steps, no explicit dependencies) execute
/// strictly in index order with fail-fast semantics; anything else is
/// handed to the `GraphExecutor`. Composes the state manager, scoring
/// loop, and metrics collection, and supports suspend/resume for
/// long-running approval gates.
pub struct EnsembleExecutor {
    runner: UnitRunner,
}

impl EnsembleExecutor {
    pub fn new(registry: Arc<UnitRegistry>, event_bus: Arc<EventBus>) -> Self {
        Self {
            runner: UnitRunner::new(
                registry,
                event_bus,
                EngineConfig::default(),
                HashMap::new(),
            ),
        }
    }

    /// Replace the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.runner.config = config;
        self
    }

    /// Set the shared environment passed to every unit.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.runner.env = env;
        self
    }

    /// Execute an ensemble from the beginning.
    pub async fn execute(&self, ensemble: &Ensemble, input: Value) -> Result<ExecutionOutput> {
        if !ensemble.is_linear() {
            return GraphExecutor::from_runner(self.runner.clone())
                .execute(ensemble, input)
                .await;
        }

        let run_id = RunId::new();
        let state = ensemble
            .state
            .as_ref()
            .map(StateManager::new)
            .unwrap_or_else(StateManager::empty);
        let ctx = ExecutionContext::new(run_id, &ensemble.name, input, state);
        self.run_linear(ensemble, ctx, 0).await
    }

    /// Execute a linear ensemble up to (not including) `stop_before`,
    /// returning a snapshot that `resume` can continue from. Used for
    /// human-approval gates between steps.
    pub async fn execute_until(
        &self,
        ensemble: &Ensemble,
        input: Value,
        stop_before: usize,
    ) -> Result<SuspendedState> {
        if !ensemble.is_linear() {
            return Err(TuttiError::Config(
                "suspend/resume requires a linear flow".into(),
            ));
        }

        let run_id = RunId::new();
        let state = ensemble
            .state
            .as_ref()
            .map(StateManager::new)
            .unwrap_or_else(StateManager::empty);
        let mut ctx = ExecutionContext::new(run_id.clone(), &ensemble.name, input, state);

        self.runner.event_bus.publish(EngineEvent::ExecutionStarted {
            run_id: run_id.clone(),
            ensemble: ensemble.name.clone(),
        });

        let stop_before = stop_before.min(ensemble.flow.len());
        for index in 0..stop_before {
            self.run_step(ensemble, &mut ctx, index).await?;
        }

        let snapshot = SuspendedState::capture(ensemble, &ctx, stop_before);
        self.runner
            .event_bus
            .publish(EngineEvent::ExecutionSuspended {
                run_id,
                ensemble: ensemble.name.clone(),
                resume_from_step: stop_before,
            });
        info!(
            ensemble = %ensemble.name,
            resume_from_step = stop_before,
            "Execution suspended"
        );
        Ok(snapshot)
    }

    /// Continue a suspended run from its recorded step index.
    pub async fn resume(&self, suspended: &SuspendedState) -> Result<ExecutionOutput> {
        let ensemble = &suspended.ensemble;
        if !ensemble.is_linear() {
            return Err(TuttiError::Config(
                "suspend/resume requires a linear flow".into(),
            ));
        }
        let ctx = suspended.restore();
        info!(
            ensemble = %ensemble.name,
            resume_from_step = suspended.resume_from_step,
            "Resuming suspended execution"
        );
        self.run_linear(ensemble, ctx, suspended.resume_from_step)
            .await
    }

    async fn run_linear(
        &self,
        ensemble: &Ensemble,
        mut ctx: ExecutionContext,
        start_index: usize,
    ) -> Result<ExecutionOutput> {
        let started = Instant::now();
        let run_id = ctx.run_id.clone();

        self.runner.event_bus.publish(EngineEvent::ExecutionStarted {
            run_id: run_id.clone(),
            ensemble: ensemble.name.clone(),
        });
        info!(ensemble = %ensemble.name, run_id = %run_id, "Execution started");

        for index in start_index..ensemble.flow.len() {
            if let Err(e) = self.run_step(ensemble, &mut ctx, index).await {
                self.runner.event_bus.publish(EngineEvent::ExecutionFailed {
                    run_id,
                    ensemble: ensemble.name.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        }

        let output =
            build_execution_output(ensemble, ctx, started.elapsed().as_millis() as u64);
        self.runner
            .event_bus
            .publish(EngineEvent::ExecutionCompleted {
                run_id,
                ensemble: ensemble.name.clone(),
                total_duration_ms: output.metrics.total_duration_ms,
            });
        Ok(output)
    }

    /// Run one linear step, wrapping failures with ensemble context.
    /// The remaining flow is abandoned on the first failure.
    async fn run_step(
        &self,
        ensemble: &Ensemble,
        ctx: &mut ExecutionContext,
        index: usize,
    ) -> Result<()> {
        let step = &ensemble.flow[index];
        let Step::Unit(unit_step) = step else {
            return Err(TuttiError::Config(format!(
                "linear driver cannot execute a '{}' step",
                step.kind()
            )));
        };
        let id = step.effective_id(index);

        match self.runner.run_unit_step(unit_step, &id, ctx).await {
            Ok(value) => {
                ctx.record_output(id, value);
                Ok(())
            }
            Err(e) => {
                error!(
                    ensemble = %ensemble.name,
                    step = %id,
                    error = %e,
                    "Step failed, aborting remaining flow"
                );
                Err(TuttiError::EnsembleExecution {
                    ensemble: ensemble.name.clone(),
                    step: id,
                    message: e.to_string(),
                })
            }
        }
    }
}

/// Fold a finished context into the run's external output.
pub(crate) fn build_execution_output(
    ensemble: &Ensemble,
    mut ctx: ExecutionContext,
    total_duration_ms: u64,
) -> ExecutionOutput {
    let output = match &ensemble.output {
        Some(expr) => resolve_value(expr, &ctx.scope()),
        None => ctx.last_output().cloned().unwrap_or(Value::Null),
    };

    let scoring = if ctx.scoring.history.is_empty() {
        None
    } else {
        let strategy = ensemble
            .scoring
            .as_ref()
            .map(|s| s.strategy)
            .unwrap_or_default();
        EnsembleScorer::new().finalize(&mut ctx.scoring, strategy)
    };

    let state_report = ensemble.state.as_ref().map(|_| ctx.state.access_report());

    ExecutionOutput {
        output,
        metrics: ExecutionMetrics {
            per_step: ctx.metrics,
            cache_hits: ctx.cache_hits,
            total_duration_ms,
        },
        state_report,
        scoring,
    }
}
