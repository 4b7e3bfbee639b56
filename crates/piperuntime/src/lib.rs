//! Pipeline execution runtime
//!
//! This crate provides the engine that runs registered pipelines:
//! dependency graph construction, fingerprint-based skipping backed by
//! a metadata store, dynamic pattern expansion, and concurrent
//! execution over local worker pools.

mod executor;
mod graph;
mod meta;
mod registry;
mod runtime;
mod store;
mod worker;

pub use executor::{PipelineExecutor, RunReport, UnitStatus, WorkerMode};
pub use graph::DependencyGraph;
pub use meta::MetadataStore;
pub use registry::{PipelineRegistry, TargetDef};
pub use runtime::{PipelineRuntime, RuntimeConfig};
pub use store::{LocalFileStore, MemoryStore, StorageAdapter};
pub use worker::{
    result_channel, run_unit, PersistentPool, TransientPool, UnitOfWork, UnitResult, WorkerPool,
};
