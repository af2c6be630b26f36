use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

use crate::model::{Algorithm, AlgorithmKey, AlgorithmResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeState {
    Pending,
    Ready,
    Dispatched,
    Completed,
    Failed,
}

impl NodeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, NodeState::Completed | NodeState::Failed)
    }
}

/// One algorithm invocation for a window.
#[derive(Debug, Clone)]
pub struct ExecutionNode {
    pub algorithm: Algorithm,
    pub state: NodeState,
    /// The node's own result, once it has one.
    pub result: Option<AlgorithmResult>,
    /// Results of every dependency; filled when the node becomes ready.
    pub dependency_results: Vec<AlgorithmResult>,
    /// Why the node failed without producing a result of its own.
    pub failure: Option<String>,
}

impl ExecutionNode {
    fn pending(algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            state: NodeState::Pending,
            result: None,
            dependency_results: Vec::new(),
            failure: None,
        }
    }
}

/// State changes caused by recording one result.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Transition {
    pub ready: Vec<NodeIndex>,
    pub failed: Vec<NodeIndex>,
}

/// Arena DAG for one window: edges run from a dependency to its dependent.
#[derive(Debug, Clone, Default)]
pub struct ExecutionGraph {
    pub(crate) graph: DiGraph<ExecutionNode, ()>,
    pub(crate) index: HashMap<AlgorithmKey, NodeIndex>,
}

impl ExecutionGraph {
    pub(crate) fn add_algorithm(&mut self, algorithm: Algorithm) -> NodeIndex {
        let key = algorithm.key();
        let idx = self.graph.add_node(ExecutionNode::pending(algorithm));
        self.index.insert(key, idx);
        idx
    }

    pub(crate) fn add_dependency(&mut self, dependency: NodeIndex, dependent: NodeIndex) {
        self.graph.update_edge(dependency, dependent, ());
    }

    /// Mark every node without dependencies READY.
    pub(crate) fn seed_roots(&mut self) {
        let roots: Vec<NodeIndex> = self
            .graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .collect();
        for idx in roots {
            self.graph[idx].state = NodeState::Ready;
        }
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, idx: NodeIndex) -> &ExecutionNode {
        &self.graph[idx]
    }

    pub fn find(&self, key: &AlgorithmKey) -> Option<NodeIndex> {
        self.index.get(key).copied()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeIndex, &ExecutionNode)> {
        self.graph
            .node_indices()
            .map(move |idx| (idx, &self.graph[idx]))
    }

    pub fn dependencies(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(idx, Direction::Incoming)
            .collect()
    }

    pub fn ready_nodes(&self) -> Vec<NodeIndex> {
        self.nodes()
            .filter(|(_, n)| n.state == NodeState::Ready)
            .map(|(idx, _)| idx)
            .collect()
    }

    pub fn in_flight(&self) -> usize {
        self.nodes()
            .filter(|(_, n)| n.state == NodeState::Dispatched)
            .count()
    }

    /// No node is pending, ready or dispatched.
    pub fn is_terminal(&self) -> bool {
        self.nodes().all(|(_, n)| n.state.is_terminal())
    }

    /// READY → DISPATCHED. Returns false for any other starting state, which
    /// keeps dispatch at most once per node.
    pub fn mark_dispatched(&mut self, idx: NodeIndex) -> bool {
        let node = &mut self.graph[idx];
        if node.state != NodeState::Ready {
            return false;
        }
        node.state = NodeState::Dispatched;
        true
    }

    /// Record the result of a dispatched node and re-evaluate its dependents.
    ///
    /// Results for nodes that are not DISPATCHED are ignored.
    pub fn complete(&mut self, idx: NodeIndex, result: AlgorithmResult) -> Transition {
        let mut transition = Transition::default();
        if self.graph[idx].state != NodeState::Dispatched {
            return transition;
        }

        let succeeded = result.result.status.is_success();
        {
            let node = &mut self.graph[idx];
            node.state = if succeeded {
                NodeState::Completed
            } else {
                NodeState::Failed
            };
            node.result = Some(result);
        }

        if succeeded {
            let dependents: Vec<NodeIndex> = self
                .graph
                .neighbors_directed(idx, Direction::Outgoing)
                .collect();
            for dependent in dependents {
                if self.try_ready(dependent) {
                    transition.ready.push(dependent);
                }
            }
        } else {
            transition.failed = self.fail_descendants(idx);
        }

        transition
    }

    /// PENDING → READY when every dependency is COMPLETED; collects their results.
    fn try_ready(&mut self, idx: NodeIndex) -> bool {
        if self.graph[idx].state != NodeState::Pending {
            return false;
        }

        let mut results = Vec::new();
        for dep in self.dependencies(idx) {
            let dep_node = &self.graph[dep];
            match (&dep_node.state, &dep_node.result) {
                (NodeState::Completed, Some(result)) => results.push(result.clone()),
                _ => return false,
            }
        }

        let node = &mut self.graph[idx];
        node.dependency_results = results;
        node.state = NodeState::Ready;
        true
    }

    /// Fail every not-yet-dispatched descendant of `idx`, transitively.
    fn fail_descendants(&mut self, idx: NodeIndex) -> Vec<NodeIndex> {
        let origin = self.graph[idx].algorithm.key();
        let mut failed = Vec::new();
        let mut queue: VecDeque<NodeIndex> = self
            .graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect();

        while let Some(next) = queue.pop_front() {
            let node = &mut self.graph[next];
            if matches!(node.state, NodeState::Pending | NodeState::Ready) {
                node.state = NodeState::Failed;
                node.failure = Some(format!("dependency {origin} failed"));
                failed.push(next);
                queue.extend(self.graph.neighbors_directed(next, Direction::Outgoing));
            }
        }

        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AlgorithmOutput, ResultData, WindowType};

    fn algorithm(name: &str) -> Algorithm {
        Algorithm {
            name: name.to_string(),
            version: "1".to_string(),
            window_type: WindowType::new("t", "1"),
            dependencies: Vec::new(),
        }
    }

    fn result(name: &str, output: AlgorithmOutput) -> AlgorithmResult {
        AlgorithmResult {
            algorithm: algorithm(name).identity(),
            result: output,
        }
    }

    /// a -> b -> d, a -> c -> d
    fn diamond() -> (ExecutionGraph, [NodeIndex; 4]) {
        let mut graph = ExecutionGraph::default();
        let a = graph.add_algorithm(algorithm("a"));
        let b = graph.add_algorithm(algorithm("b"));
        let c = graph.add_algorithm(algorithm("c"));
        let d = graph.add_algorithm(algorithm("d"));
        graph.add_dependency(a, b);
        graph.add_dependency(a, c);
        graph.add_dependency(b, d);
        graph.add_dependency(c, d);
        graph.seed_roots();
        (graph, [a, b, c, d])
    }

    #[test]
    fn test_roots_start_ready() {
        let (graph, [a, b, c, d]) = diamond();
        assert_eq!(graph.ready_nodes(), vec![a]);
        for idx in [b, c, d] {
            assert_eq!(graph.node(idx).state, NodeState::Pending);
        }
    }

    #[test]
    fn test_dispatch_at_most_once() {
        let (mut graph, [a, b, ..]) = diamond();
        assert!(graph.mark_dispatched(a));
        assert!(!graph.mark_dispatched(a));
        assert!(!graph.mark_dispatched(b));
        assert_eq!(graph.in_flight(), 1);
    }

    #[test]
    fn test_join_waits_for_every_dependency() {
        let (mut graph, [a, b, c, d]) = diamond();
        graph.mark_dispatched(a);
        let t = graph.complete(a, result("a", AlgorithmOutput::succeeded(ResultData::SingleValue(1.0))));
        assert_eq!(t.ready.len(), 2);
        assert_eq!(graph.node(b).dependency_results.len(), 1);

        graph.mark_dispatched(b);
        graph.mark_dispatched(c);
        let t = graph.complete(b, result("b", AlgorithmOutput::succeeded(ResultData::SingleValue(2.0))));
        assert!(t.ready.is_empty());
        assert_eq!(graph.node(d).state, NodeState::Pending);

        let t = graph.complete(c, result("c", AlgorithmOutput::succeeded(ResultData::SingleValue(3.0))));
        assert_eq!(t.ready, vec![d]);
        assert_eq!(graph.node(d).dependency_results.len(), 2);
        assert!(!graph.is_terminal());
    }

    #[test]
    fn test_failure_propagates_to_all_descendants() {
        let (mut graph, [a, b, c, d]) = diamond();
        graph.mark_dispatched(a);
        let t = graph.complete(a, result("a", AlgorithmOutput::handled_failure()));
        assert_eq!(graph.node(a).state, NodeState::Failed);
        assert!(graph.node(a).result.is_some());
        assert_eq!(t.failed.len(), 3);
        for idx in [b, c, d] {
            assert_eq!(graph.node(idx).state, NodeState::Failed);
            assert!(graph.node(idx).result.is_none());
        }
        assert!(graph.is_terminal());
    }

    #[test]
    fn test_sibling_failure_leaves_dispatched_sibling_alone() {
        let (mut graph, [a, b, c, d]) = diamond();
        graph.mark_dispatched(a);
        graph.complete(a, result("a", AlgorithmOutput::succeeded(ResultData::SingleValue(1.0))));
        graph.mark_dispatched(b);
        graph.mark_dispatched(c);

        let t = graph.complete(b, result("b", AlgorithmOutput::unhandled_failure()));
        assert_eq!(t.failed, vec![d]);
        assert_eq!(graph.node(c).state, NodeState::Dispatched);

        graph.complete(c, result("c", AlgorithmOutput::succeeded(ResultData::SingleValue(1.0))));
        assert_eq!(graph.node(c).state, NodeState::Completed);
        assert_eq!(graph.node(d).state, NodeState::Failed);
        assert!(graph.is_terminal());
    }

    #[test]
    fn test_result_for_undispatched_node_is_ignored() {
        let (mut graph, [_, b, ..]) = diamond();
        let t = graph.complete(b, result("b", AlgorithmOutput::succeeded(ResultData::SingleValue(1.0))));
        assert_eq!(t, Transition::default());
        assert_eq!(graph.node(b).state, NodeState::Pending);
    }
}
