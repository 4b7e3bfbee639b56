use crate::executor::{PipelineExecutor, RunReport, WorkerMode};
use crate::graph::DependencyGraph;
use crate::meta::MetadataStore;
use crate::registry::PipelineRegistry;
use crate::store::{LocalFileStore, MemoryStore, StorageAdapter};
use pipecore::{EventBus, PipelineError, StorageError, Target, Task, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Main runtime for executing pipelines
pub struct PipelineRuntime {
    registry: PipelineRegistry,
    meta: MetadataStore,
    store: Arc<dyn StorageAdapter>,
    event_bus: Arc<EventBus>,
    config: RuntimeConfig,
}

impl PipelineRuntime {
    /// Create a new runtime with default settings: in-memory metadata
    /// and storage, persistent workers.
    pub fn new() -> Self {
        let config = RuntimeConfig::default();
        Self {
            registry: PipelineRegistry::new(),
            meta: MetadataStore::in_memory(),
            store: Arc::new(MemoryStore::new()),
            event_bus: Arc::new(EventBus::new(config.event_buffer_size)),
            config,
        }
    }

    /// Create a new runtime with custom configuration
    pub fn with_config(config: RuntimeConfig) -> Result<Self, PipelineError> {
        let meta = match &config.meta_path {
            Some(path) => MetadataStore::open(path)?,
            None => MetadataStore::in_memory(),
        };
        let store: Arc<dyn StorageAdapter> = match &config.storage_root {
            Some(root) => Arc::new(LocalFileStore::new(root.clone())),
            None => Arc::new(MemoryStore::new()),
        };
        let event_bus = Arc::new(EventBus::new(config.event_buffer_size));

        Ok(Self {
            registry: PipelineRegistry::new(),
            meta,
            store,
            event_bus,
            config,
        })
    }

    /// Swap in a custom storage adapter.
    pub fn with_store(mut self, store: Arc<dyn StorageAdapter>) -> Self {
        self.store = store;
        self
    }

    /// Register a target descriptor with its computation handle.
    pub fn register(&mut self, target: Target, task: Arc<dyn Task>) -> Result<(), PipelineError> {
        self.registry.register(target, task)?;
        Ok(())
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    /// Check the registered targets without running anything: every
    /// dependency must resolve and the graph must be acyclic.
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.registry.validate()?;
        DependencyGraph::build(&self.registry)?;
        Ok(())
    }

    /// Execute the pipeline: build the dependency graph, drive every
    /// unit to a terminal state, then flush metadata.
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        self.registry.validate()?;
        let graph = DependencyGraph::build(&self.registry)?;

        let executor = PipelineExecutor {
            max_parallel: self.config.max_parallel,
            worker_mode: self.config.worker_mode,
            unit_timeout: self.config.unit_timeout,
            cancel_grace: self.config.cancel_grace,
            run_seed: self.config.run_seed,
        };

        let result = executor
            .execute(
                &self.registry,
                &graph,
                &self.meta,
                Arc::clone(&self.store),
                &self.event_bus,
            )
            .await;

        // Failure records must survive the run that produced them.
        self.meta.flush()?;
        result
    }

    /// Fetch the current stored value of a target, if it has one.
    pub async fn load(&self, name: &str) -> Result<Value, PipelineError> {
        let record = self
            .meta
            .get(name)
            .ok_or_else(|| StorageError::Missing(name.to_string()))?;
        let location = record
            .location
            .ok_or_else(|| StorageError::Missing(name.to_string()))?;
        let format = self
            .registry
            .get(name)
            .map(|def| def.target.format)
            .unwrap_or_default();
        Ok(self.store.load(&location, format).await?)
    }

    pub fn metadata(&self) -> &MetadataStore {
        &self.meta
    }

    /// Subscribe to run events
    pub fn subscribe_events(&self) -> tokio::sync::broadcast::Receiver<pipecore::events::RunEvent> {
        self.event_bus.subscribe()
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }
}

impl Default for PipelineRuntime {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the runtime
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub max_parallel: usize,
    pub worker_mode: WorkerMode,
    pub unit_timeout: Option<Duration>,
    pub cancel_grace: Option<Duration>,
    /// Run-level seed mixed into every sample() selection
    pub run_seed: u64,
    /// Metadata persists here across runtimes when set
    pub meta_path: Option<PathBuf>,
    /// Values persist as JSON files under this root when set
    pub storage_root: Option<PathBuf>,
    pub event_buffer_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_parallel: 10,
            worker_mode: WorkerMode::Persistent,
            unit_timeout: None,
            cancel_grace: Some(Duration::from_secs(5)),
            run_seed: 0,
            meta_path: None,
            storage_root: None,
            event_buffer_size: 1000,
        }
    }
}
