use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use tutti_core::error::{Result, TuttiError};
use tutti_core::traits::{EvalContext, Evaluator, ExecutableUnit, Score};
use tutti_core::types::{UnitContext, UnitOutput};

/// Registry mapping unit references to executable instances.
///
/// Constructed explicitly and passed by reference; the application
/// entry point owns its lifetime. Units register under their bare name
/// or under `name@version` for versioned lookups.
#[derive(Default)]
pub struct UnitRegistry {
    units: HashMap<String, Arc<dyn ExecutableUnit>>,
    evaluators: HashMap<String, Arc<dyn Evaluator>>,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a unit under its own name.
    pub fn register(&mut self, unit: Arc<dyn ExecutableUnit>) {
        let name = unit.name().to_string();
        debug!(unit = %name, "Registered executable unit");
        self.units.insert(name, unit);
    }

    /// Register a unit under `name@version`.
    pub fn register_versioned(&mut self, version: &str, unit: Arc<dyn ExecutableUnit>) {
        let key = format!("{}@{}", unit.name(), version);
        debug!(unit = %key, "Registered versioned executable unit");
        self.units.insert(key, unit);
    }

    /// Register an evaluator under its own name.
    pub fn register_evaluator(&mut self, evaluator: Arc<dyn Evaluator>) {
        let name = evaluator.name().to_string();
        debug!(evaluator = %name, "Registered evaluator");
        self.evaluators.insert(name, evaluator);
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Resolve a unit reference.
    ///
    /// Exact match first. A `name@version` reference falls back to the
    /// bare name; a bare reference falls back to the highest registered
    /// `name@version` entry.
    pub fn resolve(&self, reference: &str) -> Result<Arc<dyn ExecutableUnit>> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(TuttiError::UnitConfig("empty unit reference".into()));
        }

        if let Some(unit) = self.units.get(reference) {
            return Ok(Arc::clone(unit));
        }

        if let Some((name, version)) = reference.split_once('@') {
            if name.is_empty() || version.is_empty() {
                return Err(TuttiError::UnitConfig(format!(
                    "malformed unit reference '{}'",
                    reference
                )));
            }
            if let Some(unit) = self.units.get(name) {
                return Ok(Arc::clone(unit));
            }
        } else {
            // Bare name: latest registered version wins.
            let prefix = format!("{}@", reference);
            if let Some(key) = self
                .units
                .keys()
                .filter(|k| k.starts_with(&prefix))
                .max()
            {
                return Ok(Arc::clone(&self.units[key]));
            }
        }

        Err(TuttiError::UnitNotFound(reference.to_string()))
    }

    /// Resolve an evaluator by name.
    pub fn resolve_evaluator(&self, name: &str) -> Result<Arc<dyn Evaluator>> {
        self.evaluators
            .get(name)
            .map(Arc::clone)
            .ok_or_else(|| TuttiError::UnitNotFound(name.to_string()))
    }
}

impl std::fmt::Debug for UnitRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnitRegistry")
            .field("units", &self.units.len())
            .field("evaluators", &self.evaluators.len())
            .finish()
    }
}

type UnitFn =
    Box<dyn Fn(UnitContext) -> BoxFuture<'static, Result<UnitOutput>> + Send + Sync + 'static>;

/// Closure-backed executable unit, mainly for wiring and tests.
pub struct FnUnit {
    name: String,
    f: UnitFn,
}

impl FnUnit {
    /// Wrap a synchronous closure.
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(UnitContext) -> Result<UnitOutput> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(move |ctx| {
                let result = f(ctx);
                Box::pin(async move { result })
            }),
        }
    }

    /// Wrap a closure returning a boxed future.
    pub fn new_async<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(UnitContext) -> BoxFuture<'static, Result<UnitOutput>> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl ExecutableUnit for FnUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, ctx: UnitContext) -> BoxFuture<'_, Result<UnitOutput>> {
        (self.f)(ctx)
    }
}

type EvalFn = Box<dyn Fn(UnitOutput, EvalContext) -> Result<Score> + Send + Sync + 'static>;

/// Closure-backed evaluator, mainly for wiring and tests.
pub struct FnEvaluator {
    name: String,
    f: EvalFn,
}

impl FnEvaluator {
    pub fn new<F>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(UnitOutput, EvalContext) -> Result<Score> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            f: Box::new(f),
        }
    }
}

impl Evaluator for FnEvaluator {
    fn name(&self) -> &str {
        &self.name
    }

    fn evaluate(&self, output: UnitOutput, ctx: EvalContext) -> BoxFuture<'_, Result<Score>> {
        let result = (self.f)(output, ctx);
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tutti_core::types::{RunId, RunInfo};

    fn echo_unit(name: &str) -> Arc<dyn ExecutableUnit> {
        Arc::new(FnUnit::new(name, |ctx| Ok(UnitOutput::new(ctx.input))))
    }

    fn ctx() -> UnitContext {
        UnitContext::new(
            json!("hello"),
            RunInfo {
                run_id: RunId::new(),
                ensemble: "e".into(),
                step: "s".into(),
            },
        )
    }

    #[test]
    fn test_exact_resolution() {
        let mut registry = UnitRegistry::new();
        registry.register(echo_unit("fetch"));
        assert!(registry.resolve("fetch").is_ok());
        assert!(matches!(
            registry.resolve("missing"),
            Err(TuttiError::UnitNotFound(_))
        ));
    }

    #[test]
    fn test_versioned_reference_falls_back_to_bare_name() {
        let mut registry = UnitRegistry::new();
        registry.register(echo_unit("fetch"));
        let unit = registry.resolve("fetch@2.0").unwrap();
        assert_eq!(unit.name(), "fetch");
    }

    #[test]
    fn test_bare_reference_picks_latest_version() {
        let mut registry = UnitRegistry::new();
        registry.register_versioned("1.0", echo_unit("fetch"));
        registry.register_versioned("2.0", echo_unit("fetch"));
        assert!(registry.resolve("fetch").is_ok());
        assert!(registry.resolve("fetch@1.0").is_ok());
    }

    #[test]
    fn test_malformed_reference() {
        let registry = UnitRegistry::new();
        assert!(matches!(
            registry.resolve("@1.0"),
            Err(TuttiError::UnitConfig(_))
        ));
        assert!(matches!(
            registry.resolve(""),
            Err(TuttiError::UnitConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_fn_unit_executes() {
        let unit = FnUnit::new("echo", |ctx| Ok(UnitOutput::new(ctx.input)));
        let output = unit.execute(ctx()).await.unwrap();
        assert_eq!(output.data, json!("hello"));
    }

    #[test]
    fn test_evaluator_resolution() {
        let mut registry = UnitRegistry::new();
        registry.register_evaluator(Arc::new(FnEvaluator::new("judge", |_, _| {
            Ok(Score::new(1.0))
        })));
        assert!(registry.resolve_evaluator("judge").is_ok());
        assert!(registry.resolve_evaluator("absent").is_err());
    }
}
