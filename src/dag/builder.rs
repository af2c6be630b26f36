use petgraph::algo::toposort;
use tracing::debug;

use crate::error::{OrcaError, OrcaResult};
use crate::model::WindowType;
use crate::registry::RegistrySnapshot;

use super::ExecutionGraph;

/// Build the execution graph for every algorithm registered against `window_type`.
///
/// The result is empty when nothing is registered for the window type. Nodes
/// without dependencies start READY, everything else PENDING.
pub fn build_graph(
    window_type: &WindowType,
    snapshot: &RegistrySnapshot,
) -> OrcaResult<ExecutionGraph> {
    let algorithms = snapshot.algorithms_for_window_type(window_type);
    let mut graph = ExecutionGraph::default();

    for algorithm in algorithms.values() {
        graph.add_algorithm(algorithm.clone());
    }

    for (key, algorithm) in &algorithms {
        let Some(dependent) = graph.find(key) else {
            continue;
        };
        for dep in &algorithm.dependencies {
            let dep_key = dep.key();
            match graph.find(&dep_key) {
                Some(dependency) => graph.add_dependency(dependency, dependent),
                None if snapshot.declares(&dep_key) => {
                    return Err(OrcaError::UnsatisfiableDependency {
                        algorithm: key.clone(),
                        dependency: dep_key,
                        window_type: window_type.to_string(),
                    });
                }
                // registered once, since withdrawn by a re-registration
                None => return Err(OrcaError::MissingCapability(dep_key)),
            }
        }
    }

    if let Err(cycle) = toposort(&graph.graph, None) {
        let key = graph.node(cycle.node_id()).algorithm.key();
        return Err(OrcaError::CircularDependency(key));
    }

    graph.seed_roots();
    debug!(
        "Built graph for window type {} with {} node(s)",
        window_type,
        graph.len()
    );
    Ok(graph)
}
