use thiserror::Error;

#[derive(Debug, Error)]
pub enum TuttiError {
    // Unit resolution errors
    #[error("Executable unit not found: {0}")]
    UnitNotFound(String),

    #[error("Unit configuration error: {0}")]
    UnitConfig(String),

    // Unit execution errors
    #[error("Unit execution failed: {unit}: {message}")]
    UnitExecution { unit: String, message: String },

    #[error("Step '{step}' timed out after {timeout_ms}ms")]
    Timeout { step: String, timeout_ms: u64 },

    // Flow errors
    #[error("Ensemble '{ensemble}' failed at step '{step}': {message}")]
    EnsembleExecution {
        ensemble: String,
        step: String,
        message: String,
    },

    #[error("Graph node '{node}' failed: {message}")]
    NodeFailed { node: String, message: String },

    #[error("Execution deadlock: nodes {remaining:?} can never become ready")]
    Deadlock { remaining: Vec<String> },

    #[error("Step '{step}' exceeded max iterations ({limit})")]
    MaxIterationsExceeded { step: String, limit: usize },

    // State errors
    #[error("State access violation: '{owner}' may not {operation} key '{key}'")]
    StateAccess {
        owner: String,
        key: String,
        operation: String,
    },

    // Scoring errors
    #[error("Scoring error: {0}")]
    Scoring(String),

    // Expression errors
    #[error("Expression error: {0}")]
    Expression(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl TuttiError {
    /// Stable machine-readable code for this error, used by retry
    /// allow-lists (`retry_on`) and suspend snapshots.
    pub fn code(&self) -> &'static str {
        match self {
            Self::UnitNotFound(_) => "unit_not_found",
            Self::UnitConfig(_) => "unit_config",
            Self::UnitExecution { .. } => "unit_execution",
            Self::Timeout { .. } => "timeout",
            Self::EnsembleExecution { .. } => "ensemble_execution",
            Self::NodeFailed { .. } => "node_failed",
            Self::Deadlock { .. } => "deadlock",
            Self::MaxIterationsExceeded { .. } => "max_iterations_exceeded",
            Self::StateAccess { .. } => "state_access",
            Self::Scoring(_) => "scoring",
            Self::Expression(_) => "expression",
            Self::Config(_) => "config",
            Self::ConfigNotFound(_) => "config_not_found",
            Self::Database(_) => "database",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, TuttiError>;
