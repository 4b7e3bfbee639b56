use crate::{events::EventEmitter, pattern::PatternSpec, TargetError, Value};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

/// How a target's value is sliced for branching and reassembled after.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Iteration {
    Vector,
    List,
    Group,
}

/// Where a unit of work (or its persisted read/write) happens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Locality {
    Main,
    Worker,
}

/// Whether a resolved value stays cached in the coordinator for the
/// whole run or is dropped once every dependent has consumed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Memory {
    Persistent,
    Transient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorPolicy {
    Stop,
    Continue,
}

/// Output format tag handed to the storage adapter. `File` marks a
/// target whose value is an ordered list of filesystem paths tracked
/// by content fingerprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    #[default]
    Json,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Stem,
    Pattern,
}

/// Declarative description of one computation step.
///
/// The `command` field is the opaque code/command text of the
/// computation, used only as fingerprint input; the executable side
/// lives in the [`Task`] registered alongside the descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub command: String,
    pub pattern: Option<PatternSpec>,
    pub format: Format,
    pub iteration: Iteration,
    /// Field name used to assign group keys under `Iteration::Group`.
    pub group_by: Option<String>,
    pub resources: HashMap<String, String>,
    pub deployment: Locality,
    pub memory: Memory,
    pub storage: Locality,
    pub retrieval: Locality,
    pub error_policy: ErrorPolicy,
    /// Value dependencies, pre-resolved by the authoring layer.
    pub deps: Vec<String>,
}

impl Target {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            pattern: None,
            format: Format::Json,
            iteration: Iteration::Vector,
            group_by: None,
            resources: HashMap::new(),
            deployment: Locality::Worker,
            memory: Memory::Persistent,
            storage: Locality::Main,
            retrieval: Locality::Main,
            error_policy: ErrorPolicy::Stop,
            deps: Vec::new(),
        }
    }

    pub fn kind(&self) -> TargetKind {
        if self.pattern.is_some() {
            TargetKind::Pattern
        } else {
            TargetKind::Stem
        }
    }

    pub fn with_deps<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deps = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_pattern(mut self, pattern: PatternSpec) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn with_iteration(mut self, iteration: Iteration) -> Self {
        self.iteration = iteration;
        self
    }

    pub fn with_group_by(mut self, key: impl Into<String>) -> Self {
        self.iteration = Iteration::Group;
        self.group_by = Some(key.into());
        self
    }

    pub fn with_resource(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.resources.insert(key.into(), value.into());
        self
    }

    pub fn with_deployment(mut self, locality: Locality) -> Self {
        self.deployment = locality;
        self
    }

    pub fn with_memory(mut self, memory: Memory) -> Self {
        self.memory = memory;
        self
    }

    pub fn with_storage(mut self, locality: Locality) -> Self {
        self.storage = locality;
        self
    }

    pub fn with_retrieval(mut self, locality: Locality) -> Self {
        self.retrieval = locality;
        self
    }

    pub fn with_error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Names referenced inside the pattern specification, if any.
    pub fn structural_deps(&self) -> Vec<String> {
        self.pattern
            .as_ref()
            .map(|p| p.leaves().into_iter().collect())
            .unwrap_or_default()
    }

    /// Value and structural dependencies, deduplicated, in declaration order.
    pub fn all_deps(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for dep in self.deps.iter().cloned().chain(self.structural_deps()) {
            if seen.insert(dep.clone()) {
                out.push(dep);
            }
        }
        out
    }
}

/// Core trait every executable computation implements
#[async_trait]
pub trait Task: Send + Sync {
    /// Execute the computation with resolved dependency values
    async fn execute(&self, ctx: TaskContext) -> Result<Value, TargetError>;
}

/// Execution context handed to each unit of work
#[derive(Clone)]
pub struct TaskContext {
    /// Target name, or branch name for a pattern branch
    pub unit: String,

    /// Resolved values of dependencies, keyed by target name.
    /// For a branch these are the slices it consumes.
    pub inputs: HashMap<String, Value>,

    /// Resource hints from the target descriptor
    pub resources: HashMap<String, String>,

    /// Event emitter for real-time updates
    pub events: EventEmitter,

    /// Cancellation token for graceful shutdown
    pub cancellation: tokio_util::sync::CancellationToken,
}

impl TaskContext {
    /// Get required input or return error
    pub fn require_input(&self, name: &str) -> Result<&Value, TargetError> {
        self.inputs
            .get(name)
            .ok_or_else(|| TargetError::MissingInput(name.to_string()))
    }

    /// Get input with default
    pub fn get_input_or(&self, name: &str, default: Value) -> Value {
        self.inputs.get(name).cloned().unwrap_or(default)
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = Result<Value, TargetError>> + Send>>;

/// Adapter wrapping an async closure as a [`Task`], so library users
/// can register plain Rust functions as computations.
pub struct FnTask {
    f: Box<dyn Fn(TaskContext) -> TaskFuture + Send + Sync>,
}

impl FnTask {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TargetError>> + Send + 'static,
    {
        Self {
            f: Box::new(move |ctx| Box::pin(f(ctx))),
        }
    }
}

#[async_trait]
impl Task for FnTask {
    async fn execute(&self, ctx: TaskContext) -> Result<Value, TargetError> {
        (self.f)(ctx).await
    }
}
