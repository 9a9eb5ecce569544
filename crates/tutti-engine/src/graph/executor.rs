use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::future::{join_all, select_all, BoxFuture};
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use tutti_core::config::EngineConfig;
use tutti_core::ensemble::{
    Ensemble, ForeachStep, MapReduceStep, ParallelStep, Step, SwitchStep, TryStep, WaitFor,
    WhileStep,
};
use tutti_core::error::{Result, TuttiError};
use tutti_core::event::EventBus;
use tutti_core::state::StateManager;
use tutti_core::types::{EngineEvent, ExecutionOutput, RunId};

use super::node::{ExecutionGraph, NodeStatus};
use crate::context::ExecutionContext;
use crate::expr::{evaluate_condition, resolve_value, stringify};
use crate::registry::UnitRegistry;
use crate::runner::UnitRunner;

/// Executes nonlinear flows as a dependency graph.
///
/// The flow is compiled into nodes with explicit edges, then driven by
/// a frontier loop: all nodes whose dependencies have completed run
/// concurrently (bounded by `max_concurrency`), results settle in node
/// order, and the frontier is recomputed. A failed node halts further
/// advancement without cancelling already-running siblings; an empty
/// frontier with incomplete nodes is a deadlock.
#[derive(Clone)]
pub struct GraphExecutor {
    runner: UnitRunner,
}

impl GraphExecutor {
    pub fn new(
        registry: Arc<UnitRegistry>,
        event_bus: Arc<EventBus>,
        config: EngineConfig,
        env: HashMap<String, String>,
    ) -> Self {
        Self {
            runner: UnitRunner::new(registry, event_bus, config, env),
        }
    }

    pub(crate) fn from_runner(runner: UnitRunner) -> Self {
        Self { runner }
    }

    /// Execute a full ensemble through the graph driver.
    pub async fn execute(&self, ensemble: &Ensemble, input: Value) -> Result<ExecutionOutput> {
        let run_id = RunId::new();
        let started = Instant::now();

        self.runner.event_bus.publish(EngineEvent::ExecutionStarted {
            run_id: run_id.clone(),
            ensemble: ensemble.name.clone(),
        });
        info!(ensemble = %ensemble.name, run_id = %run_id, "Graph execution started");

        let state = ensemble
            .state
            .as_ref()
            .map(StateManager::new)
            .unwrap_or_else(StateManager::empty);
        let mut ctx = ExecutionContext::new(run_id.clone(), &ensemble.name, input, state);

        match self.run_graph(&ensemble.flow, &mut ctx).await {
            Ok(()) => {
                let output = crate::executor::build_execution_output(
                    ensemble,
                    ctx,
                    started.elapsed().as_millis() as u64,
                );
                self.runner
                    .event_bus
                    .publish(EngineEvent::ExecutionCompleted {
                        run_id,
                        ensemble: ensemble.name.clone(),
                        total_duration_ms: output.metrics.total_duration_ms,
                    });
                Ok(output)
            }
            Err(e) => {
                self.runner.event_bus.publish(EngineEvent::ExecutionFailed {
                    run_id,
                    ensemble: ensemble.name.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Drive a compiled graph to completion, deadlock, or first failure.
    pub(crate) async fn run_graph(
        &self,
        steps: &[Step],
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        let mut graph = ExecutionGraph::compile(steps)?;
        let max_concurrency = self.runner.config.engine.max_concurrency.max(1);

        loop {
            let frontier = graph.frontier();
            if frontier.is_empty() {
                if graph.all_completed() {
                    return Ok(());
                }
                let remaining = graph.remaining_ids();
                error!(?remaining, "Execution deadlock: empty frontier with incomplete nodes");
                return Err(TuttiError::Deadlock { remaining });
            }

            debug!(ready = frontier.len(), "Executing frontier");

            for chunk in frontier.chunks(max_concurrency) {
                for &i in chunk {
                    graph.nodes[i].status = NodeStatus::Running;
                    graph.nodes[i].started_at = Some(Utc::now());
                }

                let futures: Vec<_> = chunk
                    .iter()
                    .map(|&i| {
                        let step = graph.nodes[i].step.clone();
                        let id = graph.nodes[i].id.clone();
                        let child = ctx.fork();
                        async move {
                            let mut child = child;
                            let result = self.run_node(&step, &id, &mut child).await;
                            (i, result, child)
                        }
                    })
                    .collect();

                // Settle in node order: deterministic merge order makes
                // overlapping state commits last-committer-wins.
                let mut failure: Option<(String, TuttiError)> = None;
                for (i, result, child) in join_all(futures).await {
                    let node = &mut graph.nodes[i];
                    node.finished_at = Some(Utc::now());
                    match result {
                        Ok(value) => {
                            node.status = NodeStatus::Completed;
                            node.result = Some(value.clone());
                            let id = node.id.clone();
                            ctx.merge_child(child);
                            ctx.record_output(id, value);
                        }
                        Err(e) => {
                            node.status = NodeStatus::Failed;
                            node.error = Some(e.to_string());
                            error!(node = %node.id, error = %e, "Graph node failed");
                            if failure.is_none() {
                                failure = Some((node.id.clone(), e));
                            }
                        }
                    }
                }

                if let Some((node, cause)) = failure {
                    return Err(TuttiError::NodeFailed {
                        node,
                        message: cause.to_string(),
                    });
                }
            }
        }
    }

    /// Execute one node per its kind. Nested blocks recurse.
    pub(crate) fn run_node<'a>(
        &'a self,
        step: &'a Step,
        node_id: &'a str,
        ctx: &'a mut ExecutionContext,
    ) -> BoxFuture<'a, Result<Value>> {
        Box::pin(async move {
            match step {
                Step::Unit(unit) => self.runner.run_unit_step(unit, node_id, ctx).await,
                Step::Parallel(parallel) => self.run_parallel(parallel, node_id, ctx).await,
                Step::Branch(branch) => {
                    let scope = ctx.scope();
                    let steps = if evaluate_condition(&branch.condition, &scope) {
                        &branch.then_steps
                    } else {
                        &branch.else_steps
                    };
                    self.run_sequence(steps, ctx).await
                }
                Step::Foreach(foreach) => self.run_foreach(foreach, ctx).await,
                Step::Try(try_step) => self.run_try(try_step, ctx).await,
                Step::Switch(switch) => self.run_switch(switch, ctx).await,
                Step::While(while_step) => self.run_while(while_step, node_id, ctx).await,
                Step::MapReduce(mr) => self.run_map_reduce(mr, node_id, ctx).await,
            }
        })
    }

    /// Run steps in order against the same context, recording each
    /// result. Returns the last result (null for an empty list).
    async fn run_sequence(&self, steps: &[Step], ctx: &mut ExecutionContext) -> Result<Value> {
        let mut last = Value::Null;
        for (i, step) in steps.iter().enumerate() {
            let id = step.effective_id(i);
            let value = self.run_node(step, &id, ctx).await?;
            ctx.record_output(&id, value.clone());
            last = value;
        }
        Ok(last)
    }

    async fn run_parallel(
        &self,
        parallel: &ParallelStep,
        node_id: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<Value> {
        if parallel.steps.is_empty() {
            return Ok(Value::Null);
        }

        match parallel.wait_for {
            WaitFor::All => {
                let futures: Vec<_> = parallel
                    .steps
                    .iter()
                    .enumerate()
                    .map(|(i, child_step)| {
                        let step = child_step.clone();
                        let id = child_step.effective_id(i);
                        let child = ctx.fork();
                        async move {
                            let mut child = child;
                            let result = self.run_node(&step, &id, &mut child).await;
                            (id, result, child)
                        }
                    })
                    .collect();

                let mut results = Vec::with_capacity(parallel.steps.len());
                let mut first_err = None;
                for (id, result, child) in join_all(futures).await {
                    match result {
                        Ok(value) => {
                            ctx.merge_child(child);
                            ctx.record_output(&id, value.clone());
                            results.push(value);
                        }
                        Err(e) => {
                            warn!(child = %id, error = %e, "Parallel child failed");
                            if first_err.is_none() {
                                first_err = Some(e);
                            }
                        }
                    }
                }
                match first_err {
                    Some(e) => Err(e),
                    None => Ok(Value::Array(results)),
                }
            }
            WaitFor::Any => {
                // Children are spawned as tasks: the losers of the race
                // keep running detached rather than being cancelled.
                let handles: Vec<_> = parallel
                    .steps
                    .iter()
                    .enumerate()
                    .map(|(i, child_step)| {
                        let this = self.clone();
                        let step = child_step.clone();
                        let id = child_step.effective_id(i);
                        let child = ctx.fork();
                        tokio::spawn(async move {
                            let mut child = child;
                            let result = this.run_node(&step, &id, &mut child).await;
                            (id, result, child)
                        })
                    })
                    .collect();

                let (settled, _, _rest) = select_all(handles).await;
                match settled {
                    Ok((id, Ok(value), child)) => {
                        ctx.merge_child(child);
                        ctx.record_output(&id, value.clone());
                        Ok(value)
                    }
                    Ok((_, Err(e), _)) => Err(e),
                    Err(join_err) => Err(TuttiError::UnitExecution {
                        unit: node_id.to_string(),
                        message: format!("parallel child panicked: {}", join_err),
                    }),
                }
            }
        }
    }

    async fn run_foreach(
        &self,
        foreach: &ForeachStep,
        ctx: &mut ExecutionContext,
    ) -> Result<Value> {
        let results = self
            .run_items(
                &foreach.items,
                &foreach.step,
                foreach.max_concurrency,
                foreach.break_when.as_deref(),
                ctx,
            )
            .await?;
        Ok(Value::Array(results))
    }

    /// Batched per-item execution with ordered results. Shared by
    /// foreach and the map phase of map-reduce.
    async fn run_items(
        &self,
        items_expr: &str,
        step: &Step,
        max_concurrency: Option<usize>,
        break_when: Option<&str>,
        ctx: &mut ExecutionContext,
    ) -> Result<Vec<Value>> {
        let scope = ctx.scope();
        let items = match resolve_value(items_expr, &scope) {
            Value::Array(items) => items,
            other => {
                return Err(TuttiError::Config(format!(
                    "items expression '{}' must resolve to an array, got {}",
                    items_expr,
                    json_kind(&other)
                )))
            }
        };

        if items.is_empty() {
            return Ok(vec![]);
        }

        let batch_size = max_concurrency.unwrap_or(items.len()).max(1);
        let mut results = Vec::with_capacity(items.len());
        let mut offset = 0;

        for batch in items.chunks(batch_size) {
            let futures: Vec<_> = batch
                .iter()
                .enumerate()
                .map(|(j, item)| {
                    let index = offset + j;
                    let step = step.clone();
                    let id = step.effective_id(index);
                    let mut child = ctx.fork();
                    child.vars.insert("item".into(), item.clone());
                    child.vars.insert("index".into(), json!(index));
                    async move {
                        let result = self.run_node(&step, &id, &mut child).await;
                        if let Ok(ref value) = result {
                            child.record_output(&id, value.clone());
                        }
                        (result, child)
                    }
                })
                .collect();

            // Results keep input order regardless of completion order.
            for (result, child) in join_all(futures).await {
                let value = result?;
                ctx.merge_child(child);
                results.push(value);
            }
            offset += batch.len();

            if let Some(expr) = break_when {
                if evaluate_condition(expr, &ctx.scope()) {
                    debug!(expr, handled = results.len(), "Break condition met, stopping iteration");
                    break;
                }
            }
        }

        Ok(results)
    }

    async fn run_try(&self, try_step: &TryStep, ctx: &mut ExecutionContext) -> Result<Value> {
        let mut pending: Option<TuttiError> = None;
        let mut result = Value::Null;

        match self.run_sequence(&try_step.steps, ctx).await {
            Ok(value) => result = value,
            Err(e) => {
                if try_step.catch_steps.is_empty() {
                    pending = Some(e);
                } else {
                    warn!(error = %e, "Try block failed, running catch");
                    let mut child = ctx.fork_with_var(
                        "error",
                        json!({ "message": e.to_string(), "code": e.code() }),
                    );
                    let caught = self.run_sequence(&try_step.catch_steps, &mut child).await;
                    ctx.merge_child(child);
                    match caught {
                        Ok(value) => result = value,
                        Err(catch_err) => pending = Some(catch_err),
                    }
                }
            }
        }

        if !try_step.finally_steps.is_empty() {
            if let Err(finally_err) = self.run_sequence(&try_step.finally_steps, ctx).await {
                match pending {
                    // A pending failure always wins over a finally failure.
                    Some(_) => warn!(
                        error = %finally_err,
                        "Finally block failed while a failure was pending"
                    ),
                    None => pending = Some(finally_err),
                }
            }
        }

        match pending {
            Some(e) => Err(e),
            None => Ok(result),
        }
    }

    async fn run_switch(&self, switch: &SwitchStep, ctx: &mut ExecutionContext) -> Result<Value> {
        let scope = ctx.scope();
        let value = resolve_value(&switch.value, &scope);
        let key = stringify(&value);

        if let Some(steps) = switch.cases.get(&key) {
            debug!(case = %key, "Switch matched case");
            return self.run_sequence(steps, ctx).await;
        }
        if !switch.default_steps.is_empty() {
            debug!(value = %key, "Switch fell through to default");
            return self.run_sequence(&switch.default_steps, ctx).await;
        }
        // No match and no default: a null result, not an error.
        debug!(value = %key, "Switch matched nothing");
        Ok(Value::Null)
    }

    async fn run_while(
        &self,
        while_step: &WhileStep,
        node_id: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<Value> {
        let mut iterations = 0usize;
        let mut last = Value::Null;

        while evaluate_condition(&while_step.condition, &ctx.scope()) {
            if iterations >= while_step.max_iterations {
                return Err(TuttiError::MaxIterationsExceeded {
                    step: node_id.to_string(),
                    limit: while_step.max_iterations,
                });
            }
            last = self.run_sequence(&while_step.steps, ctx).await?;
            iterations += 1;
        }

        debug!(step = node_id, iterations, "While loop finished");
        Ok(last)
    }

    async fn run_map_reduce(
        &self,
        mr: &MapReduceStep,
        node_id: &str,
        ctx: &mut ExecutionContext,
    ) -> Result<Value> {
        let map_results = self
            .run_items(&mr.items, &mr.map_step, mr.max_concurrency, None, ctx)
            .await?;

        // The reduce step receives the full ordered map-results array.
        ctx.record_output(format!("{}-map", node_id), Value::Array(map_results));

        let reduce_id = format!("{}-reduce", node_id);
        let value = self.run_node(&mr.reduce_step, &reduce_id, ctx).await?;
        ctx.record_output(&reduce_id, value.clone());
        Ok(value)
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::FnUnit;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
    use std::time::Duration;
    use tutti_core::ensemble::{BranchStep, UnitStep};
    use tutti_core::types::UnitOutput;

    fn executor(units: Vec<FnUnit>) -> GraphExecutor {
        let mut registry = UnitRegistry::new();
        for unit in units {
            registry.register(Arc::new(unit));
        }
        GraphExecutor::new(
            Arc::new(registry),
            Arc::new(EventBus::default()),
            EngineConfig::default(),
            HashMap::new(),
        )
    }

    fn echo(name: &str) -> FnUnit {
        FnUnit::new(name, |ctx| Ok(UnitOutput::new(ctx.input)))
    }

    fn constant(name: &str, value: Value) -> FnUnit {
        FnUnit::new(name, move |_| Ok(UnitOutput::new(value.clone())))
    }

    #[tokio::test]
    async fn test_dependency_order() {
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let make = |name: &'static str, seen: Arc<std::sync::Mutex<Vec<&'static str>>>| {
            FnUnit::new(name, move |_| {
                seen.lock().unwrap().push(name);
                Ok(UnitOutput::new(json!(name)))
            })
        };

        let exec = executor(vec![
            make("a", Arc::clone(&seen)),
            make("b", Arc::clone(&seen)),
            make("c", Arc::clone(&seen)),
        ]);

        let ensemble = Ensemble::new("deps")
            .with_step(UnitStep::new("c").with_depends_on(vec!["b".into()]))
            .with_step(UnitStep::new("b").with_depends_on(vec!["a".into()]))
            .with_step(UnitStep::new("a"));

        let output = exec.execute(&ensemble, json!(null)).await.unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b", "c"]);
        assert_eq!(output.output, json!("c"));
    }

    #[tokio::test]
    async fn test_cycle_terminates_with_deadlock() {
        let exec = executor(vec![echo("a"), echo("b")]);
        let ensemble = Ensemble::new("cycle")
            .with_step(UnitStep::new("a").with_depends_on(vec!["b".into()]))
            .with_step(UnitStep::new("b").with_depends_on(vec!["a".into()]));

        let err = exec.execute(&ensemble, json!(null)).await.unwrap_err();
        match err {
            TuttiError::Deadlock { remaining } => {
                assert_eq!(remaining, vec!["a".to_string(), "b".to_string()]);
            }
            other => panic!("Expected Deadlock, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_node_aborts() {
        let exec = executor(vec![
            echo("good"),
            FnUnit::new("bad", |_| {
                Err(TuttiError::UnitExecution {
                    unit: "bad".into(),
                    message: "boom".into(),
                })
            }),
            echo("after"),
        ]);
        let ensemble = Ensemble::new("fail")
            .with_step(UnitStep::new("good"))
            .with_step(UnitStep::new("bad").with_depends_on(vec!["good".into()]))
            .with_step(UnitStep::new("after").with_depends_on(vec!["bad".into()]));

        let err = exec.execute(&ensemble, json!(null)).await.unwrap_err();
        match err {
            TuttiError::NodeFailed { node, message } => {
                assert_eq!(node, "bad");
                assert!(message.contains("boom"));
            }
            other => panic!("Expected NodeFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_parallel_all_collects_in_order() {
        let exec = executor(vec![
            FnUnit::new_async("slow", |_| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(30)).await;
                    Ok(UnitOutput::new(json!("slow")))
                })
            }),
            constant("fast", json!("fast")),
        ]);

        let ensemble = Ensemble::new("par").with_step(Step::Parallel(ParallelStep::new(vec![
            Step::unit("slow"),
            Step::unit("fast"),
        ])));

        let output = exec.execute(&ensemble, json!(null)).await.unwrap();
        // Input order, not completion order.
        assert_eq!(output.output, json!(["slow", "fast"]));
    }

    #[tokio::test]
    async fn test_parallel_any_returns_first_settled() {
        let exec = executor(vec![
            FnUnit::new_async("slow", |_| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(UnitOutput::new(json!("slow")))
                })
            }),
            constant("fast", json!("fast")),
        ]);

        let ensemble = Ensemble::new("race").with_step(Step::Parallel(
            ParallelStep::new(vec![Step::unit("slow"), Step::unit("fast")]).wait_for_any(),
        ));

        let output = exec.execute(&ensemble, json!(null)).await.unwrap();
        assert_eq!(output.output, json!("fast"));
    }

    #[tokio::test]
    async fn test_branch_then_else() {
        let exec = executor(vec![constant("yes", json!("yes")), constant("no", json!("no"))]);

        let branch = |cond: &str| {
            Ensemble::new("branch").with_step(Step::Branch(
                BranchStep::new(cond, vec![Step::unit("yes")])
                    .with_else(vec![Step::unit("no")]),
            ))
        };

        let output = exec
            .execute(&branch("context.input.go == true"), json!({"go": true}))
            .await
            .unwrap();
        assert_eq!(output.output, json!("yes"));

        let output = exec
            .execute(&branch("context.input.go == true"), json!({"go": false}))
            .await
            .unwrap();
        assert_eq!(output.output, json!("no"));
    }

    #[tokio::test]
    async fn test_branch_missing_else_is_empty() {
        let exec = executor(vec![constant("yes", json!("yes"))]);
        let ensemble = Ensemble::new("branch").with_step(Step::Branch(BranchStep::new(
            "context.input.go == true",
            vec![Step::unit("yes")],
        )));
        let output = exec.execute(&ensemble, json!({"go": false})).await.unwrap();
        assert_eq!(output.output, json!(null));
    }

    #[tokio::test]
    async fn test_foreach_batching_and_order() {
        let in_flight = Arc::new(AtomicU32::new(0));
        let max_seen = Arc::new(AtomicU32::new(0));
        let in_flight_c = Arc::clone(&in_flight);
        let max_seen_c = Arc::clone(&max_seen);

        let exec = executor(vec![FnUnit::new_async("double", move |uctx| {
            let in_flight = Arc::clone(&in_flight_c);
            let max_seen = Arc::clone(&max_seen_c);
            Box::pin(async move {
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                // Later items finish sooner, exercising order preservation.
                let n = uctx.input.as_i64().unwrap_or(0);
                tokio::time::sleep(Duration::from_millis(20 - (n as u64))).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok(UnitOutput::new(json!(n * 2)))
            })
        })]);

        let ensemble = Ensemble::new("each").with_step(Step::Foreach(
            ForeachStep::new("context.input.items", Step::unit("double"))
                .with_max_concurrency(2),
        ));

        let output = exec
            .execute(&ensemble, json!({"items": [1, 2, 3, 4, 5]}))
            .await
            .unwrap();
        assert_eq!(output.output, json!([2, 4, 6, 8, 10]));
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_foreach_non_array_items_is_error() {
        let exec = executor(vec![echo("noop")]);
        let ensemble = Ensemble::new("bad").with_step(Step::Foreach(ForeachStep::new(
            "context.input.not_a_list",
            Step::unit("noop"),
        )));
        let err = exec
            .execute(&ensemble, json!({"not_a_list": 42}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("array"));
    }

    #[tokio::test]
    async fn test_foreach_break_when() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_c = Arc::clone(&calls);
        let exec = executor(vec![FnUnit::new("count", move |uctx| {
            calls_c.fetch_add(1, Ordering::SeqCst);
            Ok(UnitOutput::new(uctx.input))
        })]);

        let ensemble = Ensemble::new("brk").with_step(Step::Foreach(
            ForeachStep::new("context.input.items", Step::unit("count"))
                .with_max_concurrency(1)
                .with_break_when("results.count == 2"),
        ));

        let output = exec
            .execute(&ensemble, json!({"items": [1, 2, 3, 4]}))
            .await
            .unwrap();
        // Stops after the batch where item 2 was handled.
        assert_eq!(output.output, json!([1, 2]));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_try_catch_receives_error() {
        let exec = executor(vec![
            FnUnit::new("explode", |_| {
                Err(TuttiError::UnitExecution {
                    unit: "explode".into(),
                    message: "kaboom".into(),
                })
            }),
            FnUnit::new("rescue", |uctx| {
                // The error is visible in previous outputs via the scope;
                // the unit's default input is the error context var.
                Ok(UnitOutput::new(uctx.input))
            }),
        ]);

        let ensemble = Ensemble::new("t").with_step(Step::Try(
            TryStep::new(vec![Step::unit("explode")]).with_catch(vec![Step::Unit(
                UnitStep::new("rescue").with_input(json!({"caught": "{{error.message}}"})),
            )]),
        ));

        let output = exec.execute(&ensemble, json!(null)).await.unwrap();
        assert_eq!(
            output.output,
            json!({"caught": "Unit execution failed: explode: kaboom"})
        );
    }

    #[tokio::test]
    async fn test_try_without_catch_rethrows() {
        let exec = executor(vec![FnUnit::new("explode", |_| {
            Err(TuttiError::UnitExecution {
                unit: "explode".into(),
                message: "kaboom".into(),
            })
        })]);
        let ensemble = Ensemble::new("t")
            .with_step(Step::Try(TryStep::new(vec![Step::unit("explode")])));
        assert!(exec.execute(&ensemble, json!(null)).await.is_err());
    }

    #[tokio::test]
    async fn test_finally_always_runs_and_never_suppresses() {
        let finally_ran = Arc::new(AtomicUsize::new(0));
        let finally_c = Arc::clone(&finally_ran);

        let exec = executor(vec![
            FnUnit::new("explode", |_| {
                Err(TuttiError::UnitExecution {
                    unit: "explode".into(),
                    message: "kaboom".into(),
                })
            }),
            FnUnit::new("cleanup", move |_| {
                finally_c.fetch_add(1, Ordering::SeqCst);
                Ok(UnitOutput::new(json!("cleaned")))
            }),
        ]);

        let ensemble = Ensemble::new("t").with_step(Step::Try(
            TryStep::new(vec![Step::unit("explode")])
                .with_finally(vec![Step::unit("cleanup")]),
        ));

        let err = exec.execute(&ensemble, json!(null)).await.unwrap_err();
        assert_eq!(finally_ran.load(Ordering::SeqCst), 1);
        assert!(err.to_string().contains("kaboom"));
    }

    #[tokio::test]
    async fn test_switch_cases_and_default() {
        let exec = executor(vec![
            constant("small", json!("small")),
            constant("big", json!("big")),
            constant("other", json!("other")),
        ]);

        let ensemble = Ensemble::new("sw").with_step(Step::Switch(
            SwitchStep::new("{{context.input.size}}")
                .with_case("s", vec![Step::unit("small")])
                .with_case("l", vec![Step::unit("big")])
                .with_default(vec![Step::unit("other")]),
        ));

        let out = exec.execute(&ensemble, json!({"size": "s"})).await.unwrap();
        assert_eq!(out.output, json!("small"));

        let out = exec.execute(&ensemble, json!({"size": "l"})).await.unwrap();
        assert_eq!(out.output, json!("big"));

        let out = exec.execute(&ensemble, json!({"size": "xl"})).await.unwrap();
        assert_eq!(out.output, json!("other"));
    }

    #[tokio::test]
    async fn test_switch_no_match_no_default_is_null() {
        let exec = executor(vec![constant("a", json!("a"))]);
        let ensemble = Ensemble::new("sw").with_step(Step::Switch(
            SwitchStep::new("{{context.input.k}}").with_case("a", vec![Step::unit("a")]),
        ));
        let output = exec.execute(&ensemble, json!({"k": "zzz"})).await.unwrap();
        assert_eq!(output.output, json!(null));
    }

    #[tokio::test]
    async fn test_while_runs_bounded_then_fatal() {
        let bodies = Arc::new(AtomicUsize::new(0));
        let bodies_c = Arc::clone(&bodies);
        let exec = executor(vec![FnUnit::new("body", move |_| {
            bodies_c.fetch_add(1, Ordering::SeqCst);
            Ok(UnitOutput::new(json!("tick")))
        })]);

        let ensemble = Ensemble::new("loop").with_step(Step::While(
            WhileStep::new("true", vec![Step::unit("body")]).with_max_iterations(3),
        ));

        let err = exec.execute(&ensemble, json!(null)).await.unwrap_err();
        // Exactly 3 bodies ran, then the bound is fatal.
        assert_eq!(bodies.load(Ordering::SeqCst), 3);
        assert!(err.to_string().contains("max iterations"));
    }

    #[tokio::test]
    async fn test_while_condition_over_results() {
        let exec = executor(vec![FnUnit::new("inc", |uctx| {
            let n = uctx
                .previous_outputs
                .get("inc")
                .and_then(Value::as_i64)
                .unwrap_or(0);
            Ok(UnitOutput::new(json!(n + 1)))
        })]);

        // Seed outside the loop so the condition has a result to read,
        // then iterate until the counter reaches 3.
        let ensemble = Ensemble::new("loop")
            .with_step(UnitStep::new("inc"))
            .with_step(Step::While(
                WhileStep::new("results.inc < 3", vec![Step::unit("inc")])
                    .with_max_iterations(10)
                    .with_depends_on(vec!["inc".into()]),
            ));

        let output = exec.execute(&ensemble, json!(null)).await.unwrap();
        assert_eq!(output.output, json!(3));
    }

    #[tokio::test]
    async fn test_map_reduce_ordered_results_to_reduce() {
        let exec = executor(vec![
            FnUnit::new("square", |uctx| {
                let n = uctx.input.as_i64().unwrap_or(0);
                Ok(UnitOutput::new(json!(n * n)))
            }),
            FnUnit::new("sum", |uctx| {
                let total: i64 = uctx
                    .input
                    .as_array()
                    .map(|a| a.iter().filter_map(Value::as_i64).sum())
                    .unwrap_or(0);
                Ok(UnitOutput::new(json!(total)))
            }),
        ]);

        let ensemble = Ensemble::new("mr").with_step(Step::MapReduce(MapReduceStep::new(
            "context.input.nums",
            Step::unit("square"),
            Step::unit("sum"),
        )));

        let output = exec
            .execute(&ensemble, json!({"nums": [1, 2, 3, 4]}))
            .await
            .unwrap();
        assert_eq!(output.output, json!(30));
    }

    #[tokio::test]
    async fn test_concurrent_branch_state_writes_merge() {
        let mut registry = UnitRegistry::new();
        registry.register(Arc::new(FnUnit::new("write-a", |uctx| {
            uctx.state_set("a", json!("A"))?;
            Ok(UnitOutput::new(json!(null)))
        })));
        registry.register(Arc::new(FnUnit::new("write-b", |uctx| {
            uctx.state_set("b", json!("B"))?;
            Ok(UnitOutput::new(json!(null)))
        })));
        let exec = GraphExecutor::new(
            Arc::new(registry),
            Arc::new(EventBus::default()),
            EngineConfig::default(),
            HashMap::new(),
        );

        let ensemble = Ensemble::new("state")
            .with_state(tutti_core::ensemble::StateConfig::default())
            .with_step(Step::Unit(
                UnitStep::new("write-a").with_state(tutti_core::ensemble::StateAccess::new(
                    vec![],
                    vec!["a".into()],
                )),
            ))
            .with_step(Step::Unit(
                UnitStep::new("write-b").with_state(tutti_core::ensemble::StateAccess::new(
                    vec![],
                    vec!["b".into()],
                )),
            ));

        let output = exec.execute(&ensemble, json!(null)).await.unwrap();
        let report = output.state_report.unwrap();
        // Both concurrent writes survived the merge.
        assert_eq!(report.patterns.get("a").unwrap().writes, 1);
        assert_eq!(report.patterns.get("b").unwrap().writes, 1);
    }
}
