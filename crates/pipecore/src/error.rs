use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Target error: {0}")]
    Target(#[from] TargetError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Pattern error: {0}")]
    Pattern(#[from] PatternError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("No worker available: {0}")]
    WorkerUnavailable(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while validating the dependency graph, before any
/// unit of work runs.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Cyclic dependency: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Unknown target '{name}' referenced by '{referenced_by}'")]
    UnknownSymbol { name: String, referenced_by: String },

    #[error("Duplicate target name: {0}")]
    DuplicateTarget(String),

    #[error("Target not found: {0}")]
    TargetNotFound(String),
}

/// Errors raised by the pure shape resolver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PatternError {
    #[error("Length mismatch under map in '{pattern}': {}", counts.iter().map(|(n, c)| format!("{n}={c}")).collect::<Vec<_>>().join(", "))]
    LengthMismatch {
        pattern: String,
        counts: Vec<(String, usize)>,
    },

    #[error("Unknown symbol in pattern: {0}")]
    UnknownSymbol(String),

    #[error("Target '{target}' cannot be sliced: {reason}")]
    NotSliceable { target: String, reason: String },

    #[error("Group key '{key}' missing on element of '{target}'")]
    MissingGroupKey { target: String, key: String },
}

/// Runtime errors scoped to a single target or branch.
#[derive(Error, Debug, Clone)]
pub enum TargetError {
    #[error("Missing required input: {0}")]
    MissingInput(String),

    #[error("Invalid input type for '{field}': expected {expected}, got {actual}")]
    InvalidInputType {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Tracked file missing or unreadable: {0}")]
    StaleFile(String),

    #[error("Upstream failed: {0}")]
    UpstreamFailed(String),

    #[error("Timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Cancelled")]
    Cancelled,

    #[error("Storage failed: {0}")]
    Storage(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to persist '{name}': {reason}")]
    Persist { name: String, reason: String },

    #[error("Failed to retrieve '{location}': {reason}")]
    Retrieve { location: String, reason: String },

    #[error("Object not found at '{0}'")]
    Missing(String),

    #[error("Unsupported format tag: {0}")]
    UnsupportedFormat(String),
}
