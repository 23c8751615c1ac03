//! Editor-side state: the current workflow snapshot, the console buffer and
//! the busy flags.
//!
//! Every edit builds a new [`Workflow`] and swaps the `Arc`, so a snapshot
//! handed to a run never changes under it. Each new snapshot is also
//! published on a `watch` channel for live views.

use std::sync::Arc;

use tokio::sync::watch;

use super::graph::{self, Chain, GraphError};
use super::orchestrator::{ChainOutcome, InstallOutcome, Orchestrator, RunListener, RunSummary};
use super::{Edge, Node, Position, Workflow};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CanvasError {
    #[error("node already exists: {0}")]
    DuplicateNode(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("edge not found: {0}")]
    EdgeNotFound(String),

    #[error("edge {from} → {to} already exists")]
    DuplicateEdge { from: String, to: String },

    #[error("node {0} cannot connect to itself")]
    SelfLoop(String),

    #[error("edge {from} → {to} would create a cycle")]
    WouldCycle { from: String, to: String },

    #[error("a run is already in progress")]
    AlreadyRunning,

    #[error("an install is already in progress")]
    AlreadyInstalling,

    #[error(transparent)]
    Graph(#[from] GraphError),
}

type OutputTap = Box<dyn FnMut(&str) + Send>;

pub struct Canvas {
    workflow: Arc<Workflow>,
    revision: u64,
    output: String,
    /// Sees every chunk as it is appended, for live rendering.
    tap: Option<OutputTap>,
    snapshots: watch::Sender<Arc<Workflow>>,
    is_installing: bool,
    is_running: bool,
}

impl Default for Canvas {
    fn default() -> Self {
        Self::new(Workflow::default_template())
    }
}

impl Canvas {
    pub fn new(workflow: Workflow) -> Self {
        let workflow = Arc::new(workflow);
        let (snapshots, _) = watch::channel(Arc::clone(&workflow));
        Self {
            workflow,
            revision: 0,
            output: String::new(),
            tap: None,
            snapshots,
            is_installing: false,
            is_running: false,
        }
    }

    pub fn with_output_tap(mut self, tap: impl FnMut(&str) + Send + 'static) -> Self {
        self.tap = Some(Box::new(tap));
        self
    }

    pub fn snapshot(&self) -> Arc<Workflow> {
        Arc::clone(&self.workflow)
    }

    /// Receives every snapshot this canvas publishes, including the node
    /// running flags a run toggles.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Workflow>> {
        self.snapshots.subscribe()
    }

    /// Bumped on every edit.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn clear_output(&mut self) {
        self.output.clear();
    }

    pub fn is_running(&self) -> bool {
        self.is_running
    }

    pub fn is_installing(&self) -> bool {
        self.is_installing
    }

    fn edit<T>(
        &mut self,
        f: impl FnOnce(&mut Workflow) -> Result<T, CanvasError>,
    ) -> Result<T, CanvasError> {
        let mut next = Workflow::clone(&self.workflow);
        let value = f(&mut next)?;
        self.publish(next);
        Ok(value)
    }

    fn publish(&mut self, next: Workflow) {
        self.workflow = Arc::new(next);
        self.revision += 1;
        self.snapshots.send_replace(Arc::clone(&self.workflow));
    }

    pub fn add_node(&mut self, node: Node) -> Result<(), CanvasError> {
        self.edit(|wf| {
            if wf.node(&node.id).is_some() {
                return Err(CanvasError::DuplicateNode(node.id));
            }
            wf.nodes.push(node);
            Ok(())
        })
    }

    /// Removes the node and every edge touching it.
    pub fn delete_node(&mut self, node_id: &str) -> Result<Node, CanvasError> {
        self.edit(|wf| {
            let index = wf
                .nodes
                .iter()
                .position(|n| n.id == node_id)
                .ok_or_else(|| CanvasError::NodeNotFound(node_id.to_string()))?;
            wf.edges.retain(|e| e.source != node_id && e.target != node_id);
            Ok(wf.nodes.remove(index))
        })
    }

    pub fn connect(&mut self, source: &str, target: &str) -> Result<Edge, CanvasError> {
        self.edit(|wf| {
            for id in [source, target] {
                if wf.node(id).is_none() {
                    return Err(CanvasError::NodeNotFound(id.to_string()));
                }
            }
            if source == target {
                return Err(CanvasError::SelfLoop(source.to_string()));
            }
            if wf.edges.iter().any(|e| e.source == source && e.target == target) {
                return Err(CanvasError::DuplicateEdge {
                    from: source.to_string(),
                    to: target.to_string(),
                });
            }

            let mut edge = Edge::new(source, target);
            let base = edge.id.clone();
            let mut suffix = 1;
            while wf.edges.iter().any(|e| e.id == edge.id) {
                suffix += 1;
                edge.id = format!("{base}-{suffix}");
            }
            wf.edges.push(edge.clone());

            match graph::validate(wf) {
                Ok(()) => Ok(edge),
                Err(GraphError::CycleDetected { .. }) => Err(CanvasError::WouldCycle {
                    from: source.to_string(),
                    to: target.to_string(),
                }),
                Err(e) => Err(e.into()),
            }
        })
    }

    pub fn disconnect(&mut self, edge_id: &str) -> Result<Edge, CanvasError> {
        self.edit(|wf| {
            let index = wf
                .edges
                .iter()
                .position(|e| e.id == edge_id)
                .ok_or_else(|| CanvasError::EdgeNotFound(edge_id.to_string()))?;
            Ok(wf.edges.remove(index))
        })
    }

    pub fn reposition(&mut self, node_id: &str, position: Position) -> Result<(), CanvasError> {
        self.update_node(node_id, |node| node.position = position)
    }

    /// Apply `f` to a copy of the node. The id cannot be changed this way.
    pub fn update_node(
        &mut self,
        node_id: &str,
        f: impl FnOnce(&mut Node),
    ) -> Result<(), CanvasError> {
        self.edit(|wf| {
            let node = wf
                .nodes
                .iter_mut()
                .find(|n| n.id == node_id)
                .ok_or_else(|| CanvasError::NodeNotFound(node_id.to_string()))?;
            f(node);
            node.id = node_id.to_string();
            Ok(())
        })
    }

    /// Replace the whole graph. Stale running flags are cleared.
    pub fn load(&mut self, mut workflow: Workflow) {
        for node in &mut workflow.nodes {
            node.is_running = false;
        }
        self.publish(workflow);
    }

    pub fn reset(&mut self) {
        self.load(Workflow::default_template());
    }

    pub fn chains(&self) -> Result<Vec<Chain>, GraphError> {
        graph::plan(&self.workflow)
    }

    fn set_running(&mut self, chain: &Chain, running: bool) {
        let mut next = Workflow::clone(&self.workflow);
        for node in next.nodes.iter_mut().filter(|n| chain.contains(&n.id)) {
            node.is_running = running;
        }
        self.publish(next);
    }

    fn clear_running_nodes(&mut self) {
        if self.workflow.nodes.iter().any(|n| n.is_running) {
            let mut next = Workflow::clone(&self.workflow);
            for node in &mut next.nodes {
                node.is_running = false;
            }
            self.publish(next);
        }
    }

    /// Run the current snapshot, streaming into this canvas.
    ///
    /// Dropping the future mid-run leaves the canvas idle again.
    pub async fn run(&mut self, orchestrator: &Orchestrator) -> Result<RunSummary, CanvasError> {
        if self.is_running {
            return Err(CanvasError::AlreadyRunning);
        }
        let snapshot = self.snapshot();

        let mut busy = BusyGuard::new(self, Busy::Running);
        let result = orchestrator.run_workflow(&snapshot, &mut busy).await;
        drop(busy);

        Ok(result?)
    }

    pub async fn install(
        &mut self,
        orchestrator: &Orchestrator,
        package: &str,
    ) -> Result<InstallOutcome, CanvasError> {
        if self.is_installing {
            return Err(CanvasError::AlreadyInstalling);
        }

        let mut busy = BusyGuard::new(self, Busy::Installing);
        let outcome = orchestrator.install_dependency(package, &mut busy).await;
        drop(busy);

        Ok(outcome)
    }
}

enum Busy {
    Running,
    Installing,
}

/// Marks the canvas busy and clears the mark on drop, so a cancelled run
/// or install cannot leave it stuck. Forwards listener calls to the canvas.
struct BusyGuard<'a> {
    canvas: &'a mut Canvas,
    busy: Busy,
}

impl<'a> BusyGuard<'a> {
    fn new(canvas: &'a mut Canvas, busy: Busy) -> Self {
        match busy {
            Busy::Running => canvas.is_running = true,
            Busy::Installing => canvas.is_installing = true,
        }
        Self { canvas, busy }
    }
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        match self.busy {
            Busy::Running => {
                self.canvas.is_running = false;
                self.canvas.clear_running_nodes();
            }
            Busy::Installing => self.canvas.is_installing = false,
        }
    }
}

impl RunListener for BusyGuard<'_> {
    fn on_output(&mut self, chunk: &str) {
        self.canvas.on_output(chunk);
    }

    fn on_chain_start(&mut self, chain: &Chain) {
        self.canvas.on_chain_start(chain);
    }

    fn on_chain_complete(&mut self, chain: &Chain, outcome: &ChainOutcome) {
        self.canvas.on_chain_complete(chain, outcome);
    }
}

impl RunListener for Canvas {
    fn on_output(&mut self, chunk: &str) {
        self.output.push_str(chunk);
        if let Some(tap) = self.tap.as_mut() {
            tap(chunk);
        }
    }

    fn on_chain_start(&mut self, chain: &Chain) {
        self.set_running(chain, true);
    }

    fn on_chain_complete(&mut self, chain: &Chain, _outcome: &ChainOutcome) {
        self.set_running(chain, false);
    }
}
