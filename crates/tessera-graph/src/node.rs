use std::sync::Arc;

use tessera_core::types::NodeKind;

use crate::router::Barrier;
use crate::stage::Stage;

/// What the executor does when a branch reaches a node.
#[derive(Clone)]
pub enum NodeHandler {
    Stage(Arc<dyn Stage>),
    Barrier(Arc<Barrier>),
    Terminal,
}

/// A node in the execution graph.
///
/// `outputs` lists the fields the node is expected to populate. The executor
/// uses it to mark fields as failed when the stage errors, and to report
/// fields that were never populated at the end of a run.
#[derive(Clone)]
pub struct Node {
    /// Unique identifier for this node.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Fields this node writes into the shared state.
    pub outputs: Vec<String>,
    pub(crate) handler: NodeHandler,
}

impl Node {
    /// Create a stage node.
    pub fn stage(id: impl Into<String>, stage: impl Stage) -> Self {
        Self::with_handler(id, NodeHandler::Stage(Arc::new(stage)))
    }

    /// Create a stage node from a shared stage.
    pub fn shared_stage(id: impl Into<String>, stage: Arc<dyn Stage>) -> Self {
        Self::with_handler(id, NodeHandler::Stage(stage))
    }

    /// Create a terminal node. Reaching it ends the branch.
    pub fn terminal(id: impl Into<String>) -> Self {
        Self::with_handler(id, NodeHandler::Terminal)
    }

    pub(crate) fn barrier(id: impl Into<String>, barrier: Arc<Barrier>) -> Self {
        Self::with_handler(id, NodeHandler::Barrier(barrier))
    }

    fn with_handler(id: impl Into<String>, handler: NodeHandler) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            outputs: vec![],
            handler,
        }
    }

    /// Set the human-readable name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the output fields.
    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn kind(&self) -> NodeKind {
        match self.handler {
            NodeHandler::Stage(_) => NodeKind::Stage,
            NodeHandler::Barrier(_) => NodeKind::Barrier,
            NodeHandler::Terminal => NodeKind::Terminal,
        }
    }

    pub fn handler(&self) -> &NodeHandler {
        &self.handler
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("outputs", &self.outputs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::{stage_fn, StageOutput};

    #[test]
    fn test_node_builder() {
        let node = Node::stage("market", stage_fn(|_ctx| async { Ok(StageOutput::new()) }))
            .with_name("Market Analyst")
            .with_outputs(["market_report"]);

        assert_eq!(node.id, "market");
        assert_eq!(node.name, "Market Analyst");
        assert_eq!(node.outputs, vec!["market_report"]);
        assert_eq!(node.kind(), NodeKind::Stage);
    }

    #[test]
    fn test_terminal_and_barrier_kinds() {
        assert_eq!(Node::terminal("end").kind(), NodeKind::Terminal);
        let gate = Node::barrier("gate", Arc::new(Barrier::then(["a"], "b")));
        assert_eq!(gate.kind(), NodeKind::Barrier);
        assert_eq!(gate.name, "gate");
    }
}
