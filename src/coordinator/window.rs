use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::dag::{ExecutionGraph, NodeState};
use crate::model::{AlgorithmKey, AlgorithmResult, ResultStatus, Window};
use crate::types::WindowId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WindowState {
    Received,
    GraphBuilt,
    Executing,
    Completed,
    TriggeringFailed,
}

impl WindowState {
    pub fn is_terminal(self) -> bool {
        matches!(self, WindowState::Completed | WindowState::TriggeringFailed)
    }
}

/// Where one algorithm of a window stands.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeOutcome {
    pub algorithm: AlgorithmKey,
    pub state: NodeState,
    pub status: Option<ResultStatus>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowRecord {
    pub id: WindowId,
    pub window: Window,
    pub state: WindowState,
    pub received_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub nodes: Vec<NodeOutcome>,
}

/// Final (or immediate) outcome of a triggered window.
#[derive(Debug, Clone)]
pub struct ExecutionReport {
    pub window_id: WindowId,
    pub window: Window,
    pub state: WindowState,
    pub error: Option<String>,
    pub nodes: Vec<NodeReport>,
}

#[derive(Debug, Clone)]
pub struct NodeReport {
    pub algorithm: AlgorithmKey,
    pub state: NodeState,
    pub result: Option<AlgorithmResult>,
    pub failure: Option<String>,
}

impl ExecutionReport {
    pub(crate) fn from_graph(
        window_id: WindowId,
        window: Window,
        state: WindowState,
        graph: &ExecutionGraph,
    ) -> Self {
        let mut nodes: Vec<NodeReport> = graph
            .nodes()
            .map(|(_, node)| NodeReport {
                algorithm: node.algorithm.key(),
                state: node.state,
                result: node.result.clone(),
                failure: node.failure.clone(),
            })
            .collect();
        nodes.sort_by(|a, b| a.algorithm.cmp(&b.algorithm));

        Self {
            window_id,
            window,
            state,
            error: None,
            nodes,
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| n.algorithm.name == name)
    }
}

pub(crate) fn node_outcomes(graph: &ExecutionGraph) -> Vec<NodeOutcome> {
    let mut outcomes: Vec<NodeOutcome> = graph
        .nodes()
        .map(|(_, node)| NodeOutcome {
            algorithm: node.algorithm.key(),
            state: node.state,
            status: node.result.as_ref().map(|r| r.result.status),
            reason: node.failure.clone(),
        })
        .collect();
    outcomes.sort_by(|a, b| a.algorithm.cmp(&b.algorithm));
    outcomes
}

struct TableInner {
    records: HashMap<WindowId, WindowRecord>,
    order: VecDeque<WindowId>,
}

/// Windows seen by the coordinator, newest last. Finished windows beyond
/// `capacity` are forgotten oldest first.
#[derive(Clone)]
pub struct WindowTable {
    inner: Arc<RwLock<TableInner>>,
    capacity: usize,
}

impl Default for WindowTable {
    fn default() -> Self {
        Self::new(10_000)
    }
}

impl WindowTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(TableInner {
                records: HashMap::new(),
                order: VecDeque::new(),
            })),
            capacity: capacity.max(1),
        }
    }

    pub async fn insert(&self, id: WindowId, window: Window) {
        let mut inner = self.inner.write().await;
        inner.records.insert(
            id.clone(),
            WindowRecord {
                id: id.clone(),
                window,
                state: WindowState::Received,
                received_at: Utc::now(),
                finished_at: None,
                error: None,
                nodes: Vec::new(),
            },
        );
        inner.order.push_back(id);

        // running windows are never evicted
        let mut excess = inner.records.len().saturating_sub(self.capacity);
        let mut kept = VecDeque::with_capacity(inner.order.len());
        while let Some(old) = inner.order.pop_front() {
            let finished = inner
                .records
                .get(&old)
                .is_some_and(|r| r.state.is_terminal());
            if excess > 0 && finished {
                inner.records.remove(&old);
                excess -= 1;
            } else {
                kept.push_back(old);
            }
        }
        inner.order = kept;
    }

    pub async fn set_state(&self, id: &WindowId, state: WindowState, error: Option<String>) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.records.get_mut(id) {
            record.state = state;
            if error.is_some() {
                record.error = error;
            }
            if state.is_terminal() {
                record.finished_at = Some(Utc::now());
            }
        }
    }

    pub async fn set_nodes(&self, id: &WindowId, nodes: Vec<NodeOutcome>) {
        let mut inner = self.inner.write().await;
        if let Some(record) = inner.records.get_mut(id) {
            record.nodes = nodes;
        }
    }

    pub async fn get(&self, id: &WindowId) -> Option<WindowRecord> {
        self.inner.read().await.records.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<WindowRecord> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.records.get(id).cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(from: u64) -> Window {
        Window {
            time_from: from,
            time_to: from + 1,
            window_type_name: "t".into(),
            window_type_version: "1".into(),
            origin: String::new(),
        }
    }

    #[tokio::test]
    async fn test_lifecycle_updates() {
        let table = WindowTable::default();
        let id = WindowId::new("w1");
        table.insert(id.clone(), window(0)).await;
        assert_eq!(table.get(&id).await.unwrap().state, WindowState::Received);

        table.set_state(&id, WindowState::Executing, None).await;
        assert!(table.get(&id).await.unwrap().finished_at.is_none());

        table
            .set_state(&id, WindowState::TriggeringFailed, Some("cycle".into()))
            .await;
        let record = table.get(&id).await.unwrap();
        assert_eq!(record.error.as_deref(), Some("cycle"));
        assert!(record.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_eviction_skips_running_windows() {
        let table = WindowTable::new(2);
        for (i, name) in ["running", "done-1", "done-2"].iter().enumerate() {
            let id = WindowId::new(*name);
            table.insert(id.clone(), window(i as u64)).await;
            if name.starts_with("done") {
                table.set_state(&id, WindowState::Completed, None).await;
            }
        }
        table.insert(WindowId::new("new"), window(9)).await;

        let ids: Vec<String> = table.list().await.into_iter().map(|r| r.id.into_inner()).collect();
        assert_eq!(ids, vec!["running", "new"]);
    }
}
