use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use tutti_core::ensemble::{
    BranchStep, Ensemble, ForeachStep, ParallelStep, ScoringConfig, StateAccess, StateConfig,
    Step, UnitStep,
};
use tutti_core::error::Result;
use tutti_core::event::EventBus;
use tutti_core::traits::Score;
use tutti_core::types::{UnitContext, UnitOutput};
use tutti_engine::{EnsembleExecutor, FnEvaluator, FnUnit, SuspendStore, UnitRegistry};

fn unit(name: &str, f: impl Fn(UnitContext) -> Result<UnitOutput> + Send + Sync + 'static) -> FnUnit {
    FnUnit::new(name, f)
}

fn executor_with(registry: UnitRegistry) -> EnsembleExecutor {
    EnsembleExecutor::new(Arc::new(registry), Arc::new(EventBus::default()))
}

/// A research pipeline: fetch sources, extract one finding per source,
/// then write a summary that must pass a quality gate, accumulating
/// shared state along the way.
#[tokio::test]
async fn research_pipeline_end_to_end() {
    let mut registry = UnitRegistry::new();

    registry.register(Arc::new(unit("fetch-sources", |ctx| {
        let topic = ctx.input["topic"].as_str().unwrap_or("unknown");
        Ok(UnitOutput::new(json!({
            "topic": topic,
            "sources": ["paper-a", "paper-b", "paper-c"]
        })))
    })));

    registry.register(Arc::new(unit("extract", |ctx| {
        let source = ctx.input.as_str().unwrap_or("?");
        Ok(UnitOutput::new(json!(format!("finding from {}", source))))
    })));

    registry.register(Arc::new(unit("summarize", |ctx| {
        let findings = ctx.input.as_array().map(Vec::len).unwrap_or(0);
        ctx.state_set("summary_length", json!(findings))?;
        Ok(UnitOutput::new(json!({
            "summary": format!("{} findings condensed", findings)
        })))
    })));

    registry.register_evaluator(Arc::new(FnEvaluator::new("summary-judge", |output, _| {
        let good = output.data["summary"]
            .as_str()
            .is_some_and(|s| s.contains("condensed"));
        Ok(Score::new(if good { 0.9 } else { 0.2 }))
    })));

    let ensemble = Ensemble::new("research")
        .with_state(StateConfig {
            schema: None,
            initial: HashMap::from([("summary_length".to_string(), json!(0))]),
        })
        .with_step(UnitStep::new("fetch-sources"))
        .with_step(Step::Foreach(
            ForeachStep::new("{{results.fetch-sources.sources}}", Step::unit("extract"))
                .with_id("extract-all")
                .with_max_concurrency(2)
                .with_depends_on(vec!["fetch-sources".into()]),
        ))
        .with_step(Step::Unit(
            UnitStep::new("summarize")
                .with_input(json!("{{results.extract-all}}"))
                .with_state(StateAccess::new(vec![], vec!["summary_length".into()]))
                .with_scoring(ScoringConfig::new("summary-judge"))
                .with_depends_on(vec!["extract-all".into()]),
        ));

    let exec = executor_with(registry);
    let output = exec
        .execute(&ensemble, json!({"topic": "rust async"}))
        .await
        .unwrap();

    assert_eq!(output.output["summary"], json!("3 findings condensed"));

    // Scoring summary from the gated step.
    let scoring = output.scoring.unwrap();
    assert!(scoring.final_score > 0.8);
    assert!((scoring.pass_rate - 1.0).abs() < 1e-9);

    // State report shows the committed write.
    let report = output.state_report.unwrap();
    assert_eq!(report.patterns.get("summary_length").unwrap().writes, 1);

    // Per-step metrics cover the unit executions.
    let names: Vec<&str> = output
        .metrics
        .per_step
        .iter()
        .map(|m| m.name.as_str())
        .collect();
    assert!(names.contains(&"fetch-sources"));
    assert!(names.iter().any(|n| n.starts_with("summarize")));
    assert!(output.metrics.per_step.iter().all(|m| m.success));
}

/// Graph flow: two independent analyses fan out in parallel, a branch
/// picks the follow-up, and dependencies sequence the join.
#[tokio::test]
async fn graph_fan_out_and_branch() {
    let mut registry = UnitRegistry::new();
    registry.register(Arc::new(unit("sentiment", |_| {
        Ok(UnitOutput::new(json!({"sentiment": "positive"})))
    })));
    registry.register(Arc::new(unit("keywords", |_| {
        Ok(UnitOutput::new(json!({"keywords": ["fast", "safe"]})))
    })));
    registry.register(Arc::new(unit("celebrate", |_| {
        Ok(UnitOutput::new(json!("celebrated")))
    })));
    registry.register(Arc::new(unit("escalate", |_| {
        Ok(UnitOutput::new(json!("escalated")))
    })));

    let ensemble = Ensemble::new("analysis")
        .with_step(Step::Parallel(
            ParallelStep::new(vec![Step::unit("sentiment"), Step::unit("keywords")])
                .with_id("analyses"),
        ))
        .with_step(Step::Branch(
            BranchStep::new(
                r#"results.sentiment.sentiment == "positive""#,
                vec![Step::unit("celebrate")],
            )
            .with_else(vec![Step::unit("escalate")])
            .with_id("follow-up")
            .with_depends_on(vec!["analyses".into()]),
        ));

    let exec = executor_with(registry);
    let output = exec.execute(&ensemble, json!(null)).await.unwrap();
    assert_eq!(output.output, json!("celebrated"));
}

/// An approval gate: run half the flow, park the snapshot in the
/// SQLite store, reload it (as a fresh process would), and finish.
#[tokio::test]
async fn suspend_store_survives_restart() {
    let build_registry = || {
        let mut registry = UnitRegistry::new();
        registry.register(Arc::new(unit("prepare", |_| {
            Ok(UnitOutput::new(json!({"draft": "v1"})))
        })));
        registry.register(Arc::new(unit("publish", |ctx| {
            let draft = ctx.input["draft"].as_str().unwrap_or("?");
            Ok(UnitOutput::new(json!(format!("published {}", draft))))
        })));
        registry
    };

    let ensemble = Ensemble::new("release")
        .with_step(UnitStep::new("prepare"))
        .with_step(UnitStep::new("publish"));

    let dir = std::env::temp_dir().join(format!("tutti_it_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    let db_path = dir.join("suspend.db");

    // First "process": run until the approval gate, park the snapshot.
    {
        let exec = executor_with(build_registry());
        let suspended = exec.execute_until(&ensemble, json!(null), 1).await.unwrap();
        let store = SuspendStore::open(&db_path).unwrap();
        store.save(&suspended).unwrap();
    }

    // Second "process": load and finish the run.
    {
        let exec = executor_with(build_registry());
        let store = SuspendStore::open(&db_path).unwrap();
        let suspended = store.load_latest("release").unwrap().unwrap();
        assert_eq!(suspended.resume_from_step, 1);

        let output = exec.resume(&suspended).await.unwrap();
        assert_eq!(output.output, json!("published v1"));

        store.delete("release").unwrap();
        assert!(store.load_latest("release").unwrap().is_none());
    }
}

/// Notifier subscribers never affect the run: dropping the receiver
/// mid-run and lagging behind are both harmless.
#[tokio::test]
async fn events_are_best_effort() {
    let mut registry = UnitRegistry::new();
    registry.register(Arc::new(unit("step", |_| Ok(UnitOutput::new(json!(1))))));

    let bus = Arc::new(EventBus::new(2)); // tiny buffer, guaranteed lag
    let rx = bus.subscribe();
    drop(rx);

    let exec = EnsembleExecutor::new(Arc::new(registry), Arc::clone(&bus));
    let ensemble = Ensemble::new("quiet")
        .with_step(UnitStep::new("step"))
        .with_step(UnitStep::new("step").with_id("again"));

    // No subscriber, overflowing buffer: the run still succeeds.
    let output = exec.execute(&ensemble, json!(null)).await.unwrap();
    assert_eq!(output.output, json!(1));
}

/// Default input chaining across a two-step flow, per the contract:
/// a -> {x:1}; b has no mapping and receives {x:1}.
#[tokio::test]
async fn default_chaining_contract() {
    let mut registry = UnitRegistry::new();
    registry.register(Arc::new(unit("a", |_| Ok(UnitOutput::new(json!({"x": 1}))))));
    registry.register(Arc::new(unit("b", |ctx| {
        assert_eq!(ctx.input, json!({"x": 1}));
        Ok(UnitOutput::new(json!({"got": ctx.input})))
    })));

    let ensemble = Ensemble::new("chain")
        .with_step(UnitStep::new("a"))
        .with_step(UnitStep::new("b"));

    let exec = executor_with(registry);
    let output = exec.execute(&ensemble, json!("ignored")).await.unwrap();
    assert_eq!(output.output, json!({"got": {"x": 1}}));
}

/// Serde round-trip of a full ensemble definition, as an upstream
/// loader would produce it.
#[test]
fn ensemble_definition_roundtrip() {
    let definition = json!({
        "name": "from-json",
        "flow": [
            {"type": "unit", "unit": "fetch"},
            {"type": "foreach", "items": "{{results.fetch}}",
             "step": {"type": "unit", "unit": "work"}, "max_concurrency": 2},
            {"type": "while", "condition": "results.work != null",
             "steps": [{"type": "unit", "unit": "poll"}], "max_iterations": 5}
        ],
        "state": {"initial": {"count": 0}},
        "output": "{{results.fetch}}"
    });

    let ensemble: Ensemble = serde_json::from_value(definition).unwrap();
    assert_eq!(ensemble.name, "from-json");
    assert_eq!(ensemble.flow.len(), 3);
    assert!(!ensemble.is_linear());

    let back: Value = serde_json::to_value(&ensemble).unwrap();
    assert_eq!(back["flow"][2]["max_iterations"], json!(5));
}
