use pipecore::{GraphError, Target, Task};
use std::collections::HashMap;
use std::sync::Arc;

/// One registered target: its descriptor, its computation handle, and
/// its registration index (used for deterministic tie-breaks).
pub struct TargetDef {
    pub target: Target,
    pub task: Arc<dyn Task>,
    pub index: usize,
}

/// Ordered registry of validated target definitions.
///
/// The registry is the engine's only input surface: an external
/// authoring layer supplies descriptors with their declared
/// dependency sets already resolved. No expression syntax is parsed
/// here.
pub struct PipelineRegistry {
    targets: Vec<TargetDef>,
    by_name: HashMap<String, usize>,
}

impl PipelineRegistry {
    pub fn new() -> Self {
        Self {
            targets: Vec::new(),
            by_name: HashMap::new(),
        }
    }

    /// Register a target descriptor with its computation handle.
    pub fn register(&mut self, target: Target, task: Arc<dyn Task>) -> Result<(), GraphError> {
        if self.by_name.contains_key(&target.name) {
            return Err(GraphError::DuplicateTarget(target.name.clone()));
        }
        tracing::info!("Registering target: {}", target.name);
        let index = self.targets.len();
        self.by_name.insert(target.name.clone(), index);
        self.targets.push(TargetDef {
            target,
            task,
            index,
        });
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&TargetDef> {
        self.by_name.get(name).map(|&i| &self.targets[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TargetDef> {
        self.targets.iter()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Check that every declared dependency and every pattern-leaf
    /// name resolves to a registered target.
    pub fn validate(&self) -> Result<(), GraphError> {
        for def in &self.targets {
            for dep in def.target.all_deps() {
                if !self.by_name.contains_key(&dep) {
                    return Err(GraphError::UnknownSymbol {
                        name: dep,
                        referenced_by: def.target.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

impl Default for PipelineRegistry {
    fn default() -> Self {
        Self::new()
    }
}
