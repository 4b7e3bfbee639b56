use crate::registry::PipelineRegistry;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use pipecore::GraphError;
use std::collections::{HashMap, HashSet};

/// Validated dependency DAG over registered targets.
///
/// Edges point dependency → dependent. The topological order breaks
/// ties among unforced targets by registration order, so run order is
/// reproducible across identical registries.
#[derive(Debug)]
pub struct DependencyGraph {
    graph: DiGraph<String, ()>,
    index_of: HashMap<String, NodeIndex>,
    order: Vec<String>,
}

impl DependencyGraph {
    /// Build the graph from value and structural dependencies and
    /// validate acyclicity.
    pub fn build(registry: &PipelineRegistry) -> Result<Self, GraphError> {
        let mut graph = DiGraph::new();
        let mut index_of = HashMap::new();

        for def in registry.iter() {
            let idx = graph.add_node(def.target.name.clone());
            index_of.insert(def.target.name.clone(), idx);
        }

        for def in registry.iter() {
            let to = index_of[&def.target.name];
            for dep in def.target.all_deps() {
                let from = *index_of.get(&dep).ok_or_else(|| GraphError::UnknownSymbol {
                    name: dep.clone(),
                    referenced_by: def.target.name.clone(),
                })?;
                graph.update_edge(from, to, ());
            }
        }

        let order = stable_toposort(registry, &graph, &index_of)?;
        tracing::debug!("Dependency graph built: {} targets", order.len());

        Ok(Self {
            graph,
            index_of,
            order,
        })
    }

    /// Target names in topological order.
    pub fn order(&self) -> &[String] {
        &self.order
    }

    /// Direct dependencies of a target.
    pub fn dependencies(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Direct dependents of a target.
    pub fn dependents(&self, name: &str) -> Vec<String> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// All transitive dependents of a target.
    pub fn descendants(&self, name: &str) -> HashSet<String> {
        let mut out = HashSet::new();
        let Some(&start) = self.index_of.get(name) else {
            return out;
        };
        let mut stack = vec![start];
        while let Some(idx) = stack.pop() {
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                let next_name = &self.graph[next];
                if out.insert(next_name.clone()) {
                    stack.push(next);
                }
            }
        }
        out
    }

    /// Number of transitive dependents, used as scheduling priority:
    /// dispatching the unit that unlocks the most downstream work
    /// first tends to shorten the critical path.
    pub fn downstream_weight(&self, name: &str) -> usize {
        self.descendants(name).len()
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<String> {
        let Some(&idx) = self.index_of.get(name) else {
            return Vec::new();
        };
        self.graph
            .neighbors_directed(idx, direction)
            .map(|n| self.graph[n].clone())
            .collect()
    }
}

/// Kahn's algorithm with the ready set kept sorted by registration
/// index. Detects cycles and reports the full cycle path.
fn stable_toposort(
    registry: &PipelineRegistry,
    graph: &DiGraph<String, ()>,
    index_of: &HashMap<String, NodeIndex>,
) -> Result<Vec<String>, GraphError> {
    let mut indegree: HashMap<NodeIndex, usize> = index_of
        .values()
        .map(|&idx| {
            (
                idx,
                graph.neighbors_directed(idx, Direction::Incoming).count(),
            )
        })
        .collect();

    // Registration index per node for the tie-break.
    let reg_index: HashMap<NodeIndex, usize> = registry
        .iter()
        .map(|def| (index_of[&def.target.name], def.index))
        .collect();

    let mut ready: Vec<NodeIndex> = indegree
        .iter()
        .filter(|(_, &deg)| deg == 0)
        .map(|(&idx, _)| idx)
        .collect();
    ready.sort_by_key(|idx| std::cmp::Reverse(reg_index[idx]));

    let mut order = Vec::with_capacity(index_of.len());
    while let Some(idx) = ready.pop() {
        order.push(graph[idx].clone());
        for next in graph.neighbors_directed(idx, Direction::Outgoing) {
            let deg = indegree.get_mut(&next).unwrap();
            *deg -= 1;
            if *deg == 0 {
                ready.push(next);
                ready.sort_by_key(|i| std::cmp::Reverse(reg_index[i]));
            }
        }
    }

    if order.len() < index_of.len() {
        let remaining: HashSet<NodeIndex> = index_of
            .values()
            .copied()
            .filter(|idx| indegree[idx] > 0)
            .collect();
        return Err(GraphError::CyclicDependency {
            cycle: find_cycle(graph, &remaining),
        });
    }
    Ok(order)
}

/// Walk forward through nodes that still have unresolved dependencies
/// until one repeats, then cut the walk down to the cycle itself.
fn find_cycle(graph: &DiGraph<String, ()>, remaining: &HashSet<NodeIndex>) -> Vec<String> {
    let Some(&start) = remaining.iter().min_by_key(|idx| idx.index()) else {
        return Vec::new();
    };

    let mut path = vec![start];
    let mut seen: HashMap<NodeIndex, usize> = HashMap::from([(start, 0)]);
    let mut current = start;
    loop {
        let Some(next) = graph
            .neighbors_directed(current, Direction::Outgoing)
            .find(|n| remaining.contains(n))
        else {
            return path.iter().map(|&i| graph[i].clone()).collect();
        };
        if let Some(&at) = seen.get(&next) {
            let mut cycle: Vec<String> = path[at..].iter().map(|&i| graph[i].clone()).collect();
            cycle.push(graph[next].clone());
            return cycle;
        }
        seen.insert(next, path.len());
        path.push(next);
        current = next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipecore::{FnTask, Target, Task, Value};
    use std::sync::Arc;

    fn noop() -> Arc<dyn Task> {
        Arc::new(FnTask::new(|_ctx| async { Ok(Value::Null) }))
    }

    fn registry(specs: &[(&str, &[&str])]) -> PipelineRegistry {
        let mut registry = PipelineRegistry::new();
        for (name, deps) in specs {
            registry
                .register(
                    Target::new(*name, format!("{name}()")).with_deps(deps.iter().copied()),
                    noop(),
                )
                .unwrap();
        }
        registry
    }

    #[test]
    fn topological_order_respects_dependencies() {
        let registry = registry(&[
            ("plot", &["summary"]),
            ("summary", &["data"]),
            ("data", &[]),
        ]);
        let graph = DependencyGraph::build(&registry).unwrap();
        assert_eq!(graph.order(), ["data", "summary", "plot"]);
    }

    #[test]
    fn ties_break_by_registration_order() {
        let registry = registry(&[("c", &[]), ("a", &[]), ("b", &[])]);
        let graph = DependencyGraph::build(&registry).unwrap();
        assert_eq!(graph.order(), ["c", "a", "b"]);
    }

    #[test]
    fn cycle_is_reported_with_full_path() {
        let registry = registry(&[("a", &["c"]), ("b", &["a"]), ("c", &["b"])]);
        let err = DependencyGraph::build(&registry).unwrap_err();
        match err {
            GraphError::CyclicDependency { cycle } => {
                // Cycle path ends where it started.
                assert_eq!(cycle.first(), cycle.last());
                assert_eq!(cycle.len(), 4);
                for name in ["a", "b", "c"] {
                    assert!(cycle.contains(&name.to_string()), "{name} missing: {cycle:?}");
                }
            }
            other => panic!("expected CyclicDependency, got {other:?}"),
        }
    }

    #[test]
    fn descendants_are_transitive() {
        let registry = registry(&[
            ("data", &[]),
            ("fast", &["data"]),
            ("slow", &["data"]),
            ("plot", &["slow"]),
        ]);
        let graph = DependencyGraph::build(&registry).unwrap();
        let descendants = graph.descendants("data");
        assert_eq!(descendants.len(), 3);
        assert_eq!(graph.downstream_weight("slow"), 1);
        assert_eq!(graph.downstream_weight("fast"), 0);
    }
}
