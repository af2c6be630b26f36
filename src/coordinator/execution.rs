use futures::StreamExt;
use petgraph::graph::NodeIndex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::dag::ExecutionGraph;
use crate::db::ResultSink;
use crate::dispatch::Dispatcher;
use crate::model::{AlgorithmResult, Window};
use crate::types::{ExecutionId, WindowId};

use super::window::{ExecutionReport, WindowState, WindowTable, node_outcomes};

/// Completion event sent by a dispatch task to the task owning the graph.
struct NodeEvent {
    node: NodeIndex,
    result: AlgorithmResult,
}

/// Drives one window's graph to a terminal state. The graph is owned here
/// and only here; dispatch tasks talk back over a channel.
pub(crate) struct WindowExecution {
    pub window_id: WindowId,
    pub window: Window,
    pub graph: ExecutionGraph,
    pub dispatcher: Dispatcher,
    pub sink: Arc<dyn ResultSink>,
    pub table: WindowTable,
}

impl WindowExecution {
    pub async fn run(mut self) -> ExecutionReport {
        let (tx, mut rx) = mpsc::unbounded_channel::<NodeEvent>();

        self.dispatch_ready(&tx);
        while !self.graph.is_terminal() {
            let Some(event) = rx.recv().await else {
                break;
            };
            self.record(event).await;
            self.dispatch_ready(&tx);
        }

        let succeeded = self
            .graph
            .nodes()
            .filter(|(_, n)| n.state == crate::dag::NodeState::Completed)
            .count();
        info!(
            "Window {} completed: {}/{} algorithm(s) succeeded",
            self.window_id,
            succeeded,
            self.graph.len()
        );

        self.table
            .set_nodes(&self.window_id, node_outcomes(&self.graph))
            .await;
        self.table
            .set_state(&self.window_id, WindowState::Completed, None)
            .await;

        ExecutionReport::from_graph(
            self.window_id,
            self.window,
            WindowState::Completed,
            &self.graph,
        )
    }

    /// Spawn one dispatch task per READY node.
    fn dispatch_ready(&mut self, tx: &mpsc::UnboundedSender<NodeEvent>) {
        for idx in self.graph.ready_nodes() {
            if !self.graph.mark_dispatched(idx) {
                continue;
            }

            let node = self.graph.node(idx);
            let exec_id = ExecutionId::generate();
            info!(
                "Dispatching {} for window {} (execution {})",
                node.algorithm.key(),
                self.window_id,
                exec_id
            );

            let mut results = self.dispatcher.dispatch(
                exec_id,
                self.window.clone(),
                vec![node.algorithm.clone()],
                node.dependency_results.clone(),
            );
            let tx = tx.clone();
            tokio::spawn(async move {
                while let Some(result) = results.next().await {
                    if tx.send(NodeEvent { node: idx, result }).is_err() {
                        break;
                    }
                }
            });
        }
    }

    async fn record(&mut self, event: NodeEvent) {
        let NodeEvent { node, result } = event;

        if let Err(e) = self.sink.record(&self.window_id, &self.window, &result).await {
            error!(
                "Failed to store result of {} for window {}: {}",
                result.key(),
                self.window_id,
                e
            );
        }

        let key = result.key();
        let status = result.result.status;
        let transition = self.graph.complete(node, result);

        if status.is_success() {
            debug!("{} completed for window {}", key, self.window_id);
        } else {
            warn!(
                "{} finished with {} for window {}",
                key,
                status.as_str(),
                self.window_id
            );
        }
        for failed in &transition.failed {
            warn!(
                "Skipping {} for window {}: dependency {} failed",
                self.graph.node(*failed).algorithm.key(),
                self.window_id,
                key
            );
        }

        self.table
            .set_nodes(&self.window_id, node_outcomes(&self.graph))
            .await;
    }
}
