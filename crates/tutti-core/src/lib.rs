pub mod config;
pub mod ensemble;
pub mod error;
pub mod event;
pub mod state;
pub mod traits;
pub mod types;

pub use config::EngineConfig;
pub use ensemble::{
    AggregateStrategy, Backoff, BranchStep, Ensemble, ForeachStep, MapReduceStep, OnFailure,
    ParallelStep, RetryPolicy, ScoringConfig, StateAccess, StateConfig, Step, SwitchStep,
    TimeoutPolicy, TryStep, UnitStep, WaitFor, WhileStep,
};
pub use error::{Result, TuttiError};
pub use event::EventBus;
pub use state::{AccessLogEntry, AccessOp, AccessReport, ScopedState, StateManager};
pub use traits::{EvalContext, Evaluator, ExecutableUnit, Score};
pub use types::*;
