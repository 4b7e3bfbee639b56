//! Core abstractions for the pipeline engine
//!
//! This crate provides the fundamental types and pure algorithms that
//! the runtime depends on: target descriptors, the dynamic value
//! type, the pattern-branching algebra and its shape resolver,
//! fingerprints and records, and the run-event bus. It contains no
//! scheduler.

mod error;
pub mod events;
pub mod pattern;
mod record;
mod target;
mod value;

pub use error::{GraphError, PatternError, PipelineError, StorageError, TargetError};
pub use events::{EventBus, EventEmitter, RunEvent, RunId, TaskEvent};
pub use pattern::{
    aggregate, arg_shape, branch_identity, branch_unit_name, resolve_pattern_shape,
    resolve_pattern_shape_seeded, slice_identity, take_slice, ArgShape, BranchShape, PatternSpec,
    SliceKey, SliceRef,
};
pub use record::{file_digest, value_digest, Fingerprint, Record, RecordOutcome};
pub use target::{
    ErrorPolicy, FnTask, Format, Iteration, Locality, Memory, Target, TargetKind, Task,
    TaskContext,
};
pub use value::Value;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;
