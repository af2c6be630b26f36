//! Window execution coordinator.
//!
//! Accepts windows, builds their execution graphs against the current
//! registry snapshot and runs each graph on its own task. `emit_window`
//! answers as soon as the graph is known; execution continues in the
//! background.

mod execution;
pub mod window;

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::dag::build_graph;
use crate::db::ResultSink;
use crate::dispatch::Dispatcher;
use crate::error::{OrcaError, OrcaResult};
use crate::model::{EmitStatus, Window, WindowEmitStatus};
use crate::registry::Registry;
use crate::types::WindowId;

use execution::WindowExecution;
use window::node_outcomes;
pub use window::{ExecutionReport, NodeOutcome, NodeReport, WindowRecord, WindowState, WindowTable};

enum HandleState {
    Finished(ExecutionReport),
    Running(JoinHandle<ExecutionReport>),
}

/// A triggered window. Dropping the handle does not stop execution.
pub struct ExecutionHandle {
    window_id: WindowId,
    status: EmitStatus,
    state: HandleState,
}

impl ExecutionHandle {
    pub fn window_id(&self) -> &WindowId {
        &self.window_id
    }

    pub fn status(&self) -> EmitStatus {
        self.status
    }

    /// Resolves once the window's graph is terminal.
    pub async fn wait(self) -> anyhow::Result<ExecutionReport> {
        match self.state {
            HandleState::Finished(report) => Ok(report),
            HandleState::Running(task) => Ok(task.await?),
        }
    }
}

pub struct Coordinator {
    registry: Arc<Registry>,
    dispatcher: Dispatcher,
    sink: Arc<dyn ResultSink>,
    windows: WindowTable,
}

impl Coordinator {
    pub fn new(registry: Arc<Registry>, dispatcher: Dispatcher, sink: Arc<dyn ResultSink>) -> Self {
        Self {
            registry,
            dispatcher,
            sink,
            windows: WindowTable::default(),
        }
    }

    /// Accept a window and start executing it.
    pub async fn emit_window(&self, window: Window) -> OrcaResult<WindowEmitStatus> {
        let handle = self.trigger(window).await?;
        Ok(WindowEmitStatus {
            status: handle.status(),
        })
    }

    /// Like [`Coordinator::emit_window`], but hands back the running execution.
    pub async fn trigger(&self, window: Window) -> OrcaResult<ExecutionHandle> {
        validate_window(&window)?;

        let window_id = WindowId::generate();
        let window_type = window.window_type();
        self.windows.insert(window_id.clone(), window.clone()).await;

        let snapshot = self.registry.snapshot().await;
        let graph = match build_graph(&window_type, &snapshot) {
            Ok(graph) => graph,
            Err(e) => {
                warn!("Triggering failed for window {} ({}): {}", window_id, window_type, e);
                self.windows
                    .set_state(&window_id, WindowState::TriggeringFailed, Some(e.to_string()))
                    .await;
                let report = ExecutionReport {
                    window_id: window_id.clone(),
                    window,
                    state: WindowState::TriggeringFailed,
                    error: Some(e.to_string()),
                    nodes: Vec::new(),
                };
                return Ok(ExecutionHandle {
                    window_id,
                    status: EmitStatus::TriggeringFailed,
                    state: HandleState::Finished(report),
                });
            }
        };
        self.windows
            .set_state(&window_id, WindowState::GraphBuilt, None)
            .await;

        if graph.is_empty() {
            info!("Window {} ({}) triggers no algorithms", window_id, window_type);
            self.windows
                .set_state(&window_id, WindowState::Completed, None)
                .await;
            let report =
                ExecutionReport::from_graph(window_id.clone(), window, WindowState::Completed, &graph);
            return Ok(ExecutionHandle {
                window_id,
                status: EmitStatus::NoTriggeredAlgorithms,
                state: HandleState::Finished(report),
            });
        }

        info!(
            "Window {} ({}, [{}, {})) triggered {} algorithm(s)",
            window_id,
            window_type,
            window.time_from,
            window.time_to,
            graph.len()
        );
        self.windows
            .set_state(&window_id, WindowState::Executing, None)
            .await;
        self.windows
            .set_nodes(&window_id, node_outcomes(&graph))
            .await;

        let execution = WindowExecution {
            window_id: window_id.clone(),
            window,
            graph,
            dispatcher: self.dispatcher.clone(),
            sink: self.sink.clone(),
            table: self.windows.clone(),
        };
        let task = tokio::spawn(execution.run());

        Ok(ExecutionHandle {
            window_id,
            status: EmitStatus::ProcessingTriggered,
            state: HandleState::Running(task),
        })
    }

    pub async fn read_windows(&self) -> Vec<WindowRecord> {
        self.windows.list().await
    }

    pub async fn read_window(&self, id: &WindowId) -> Option<WindowRecord> {
        self.windows.get(id).await
    }
}

pub fn validate_window(window: &Window) -> OrcaResult<()> {
    if window.window_type_name.trim().is_empty() {
        return Err(OrcaError::InvalidWindow("window type name is empty".to_string()));
    }
    if window.window_type_version.trim().is_empty() {
        return Err(OrcaError::InvalidWindow(
            "window type version is empty".to_string(),
        ));
    }
    if window.time_to > i64::MAX as u64 {
        return Err(OrcaError::InvalidWindow(format!(
            "time_to {} exceeds {}",
            window.time_to,
            i64::MAX
        )));
    }
    if window.time_from > window.time_to {
        return Err(OrcaError::InvalidWindow(format!(
            "time_from {} is after time_to {}",
            window.time_from, window.time_to
        )));
    }
    Ok(())
}
