use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tessera_core::error::{Result, TesseraError};
use tessera_core::types::NodeKind;

use crate::edge::{ConditionalEdge, Edge};
use crate::node::Node;
use crate::router::{Barrier, Router};
use crate::stage::Stage;

/// Collects nodes and edges, then validates them into a `Graph`.
#[derive(Default)]
pub struct GraphBuilder {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    entry: Option<String>,
    accumulating: BTreeSet<String>,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Node) -> &mut Self {
        self.nodes.push(node);
        self
    }

    /// Register a stage node with the fields it writes.
    pub fn add_stage<I, S>(&mut self, id: impl Into<String>, stage: impl Stage, outputs: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.add_node(Node::stage(id, stage).with_outputs(outputs))
    }

    /// Register a barrier node. Its routing decisions are limited to `allowed`.
    pub fn add_barrier<I, S>(&mut self, id: impl Into<String>, barrier: Barrier, allowed: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        let barrier = Arc::new(barrier);
        self.nodes.push(Node::barrier(id.clone(), barrier.clone()));
        self.edges.push(Edge::conditional(id, barrier, allowed));
        self
    }

    pub fn add_terminal(&mut self, id: impl Into<String>) -> &mut Self {
        self.add_node(Node::terminal(id))
    }

    /// Register a static edge.
    pub fn add_edge(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push(Edge::always(from, to));
        self
    }

    /// Register a router-owned edge with every target it may return.
    pub fn add_conditional_edges<I, S>(
        &mut self,
        from: impl Into<String>,
        router: impl Router,
        allowed: I,
    ) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.edges.push(Edge::conditional(from, Arc::new(router), allowed));
        self
    }

    pub fn set_entry(&mut self, id: impl Into<String>) -> &mut Self {
        self.entry = Some(id.into());
        self
    }

    /// Declare a field whose writes accumulate instead of sticking.
    pub fn accumulate(&mut self, field: impl Into<String>) -> &mut Self {
        self.accumulating.insert(field.into());
        self
    }

    /// Validate and freeze the graph.
    pub fn build(self) -> Result<Graph> {
        let mut nodes: HashMap<String, Node> = HashMap::new();
        let mut order = Vec::with_capacity(self.nodes.len());
        for node in self.nodes {
            if nodes.contains_key(&node.id) {
                return Err(TesseraError::DuplicateNode(node.id));
            }
            order.push(node.id.clone());
            nodes.insert(node.id.clone(), node);
        }

        let entry = self.entry.ok_or(TesseraError::MissingEntry)?;
        if !nodes.contains_key(&entry) {
            return Err(TesseraError::UnknownNode(entry));
        }

        let mut static_out: HashMap<String, Vec<String>> = HashMap::new();
        let mut conditional_out: HashMap<String, ConditionalEdge> = HashMap::new();
        // Which declaration owns each conditional target.
        let mut conditional_owner: HashMap<String, String> = HashMap::new();
        let mut static_targets: HashMap<String, String> = HashMap::new();

        for edge in self.edges {
            let from = edge.from().to_string();
            let Some(source) = nodes.get(&from) else {
                return Err(TesseraError::UnknownNode(from));
            };
            if source.kind() == NodeKind::Terminal {
                return Err(TesseraError::InvalidGraph(format!(
                    "terminal node '{}' cannot have outgoing edges",
                    from
                )));
            }
            for target in edge.targets() {
                if !nodes.contains_key(target) {
                    return Err(TesseraError::UnknownNode(target.to_string()));
                }
            }

            match edge {
                Edge::Static { from, to } => {
                    if source.kind() == NodeKind::Barrier {
                        return Err(TesseraError::InvalidGraph(format!(
                            "barrier '{}' routes through its own decision, not static edges",
                            from
                        )));
                    }
                    if let Some(owner) = conditional_owner.get(&to) {
                        return Err(TesseraError::AmbiguousInEdge {
                            target: to,
                            first: owner.clone(),
                            second: from,
                        });
                    }
                    static_targets.entry(to.clone()).or_insert_with(|| from.clone());
                    static_out.entry(from).or_default().push(to);
                }
                Edge::Conditional(cond) => {
                    if conditional_out.contains_key(&cond.from) {
                        return Err(TesseraError::InvalidGraph(format!(
                            "node '{}' has more than one conditional edge",
                            cond.from
                        )));
                    }
                    for target in &cond.allowed {
                        let previous = conditional_owner
                            .get(target)
                            .or_else(|| static_targets.get(target));
                        if let Some(first) = previous {
                            return Err(TesseraError::AmbiguousInEdge {
                                target: target.clone(),
                                first: first.clone(),
                                second: cond.from.clone(),
                            });
                        }
                        conditional_owner.insert(target.clone(), cond.from.clone());
                    }
                    conditional_out.insert(cond.from.clone(), cond);
                }
            }
        }

        for from in static_out.keys() {
            if conditional_out.contains_key(from) {
                return Err(TesseraError::InvalidGraph(format!(
                    "node '{}' mixes static and conditional outgoing edges",
                    from
                )));
            }
        }
        for id in &order {
            if nodes[id].kind() == NodeKind::Barrier && !conditional_out.contains_key(id) {
                return Err(TesseraError::InvalidGraph(format!(
                    "barrier '{}' has no routing decision",
                    id
                )));
            }
        }

        let graph = Graph {
            nodes,
            order,
            static_out,
            conditional_out,
            entry,
            accumulating: self.accumulating,
        };
        graph.check_acyclic()?;
        Ok(graph)
    }
}

/// Where a branch goes after leaving a node.
pub enum Successors<'a> {
    /// No outgoing edges; the branch ends.
    None,
    Static(&'a [String]),
    Conditional(&'a ConditionalEdge),
}

/// A validated, immutable execution graph.
pub struct Graph {
    nodes: HashMap<String, Node>,
    order: Vec<String>,
    static_out: HashMap<String, Vec<String>>,
    conditional_out: HashMap<String, ConditionalEdge>,
    entry: String,
    accumulating: BTreeSet<String>,
}

impl Graph {
    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Nodes in declaration order.
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.order.iter().map(|id| &self.nodes[id])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn accumulating_fields(&self) -> &BTreeSet<String> {
        &self.accumulating
    }

    pub fn successors(&self, id: &str) -> Successors<'_> {
        if let Some(cond) = self.conditional_out.get(id) {
            return Successors::Conditional(cond);
        }
        match self.static_out.get(id) {
            Some(targets) if !targets.is_empty() => Successors::Static(targets),
            _ => Successors::None,
        }
    }

    /// Every declared output field of every stage node.
    pub fn declared_outputs(&self) -> Vec<&str> {
        self.nodes()
            .flat_map(|n| n.outputs.iter().map(|s| s.as_str()))
            .collect()
    }

    /// One line per node: kind, id and possible successors.
    pub fn describe(&self) -> Vec<String> {
        self.nodes()
            .map(|node| {
                let next = match self.successors(&node.id) {
                    Successors::None => "(end)".to_string(),
                    Successors::Static(targets) => targets.join(", "),
                    Successors::Conditional(cond) => format!(
                        "? {}",
                        cond.allowed.iter().cloned().collect::<Vec<_>>().join(" | ")
                    ),
                };
                format!("{:<8} {} -> {}", format!("{:?}", node.kind()), node.id, next)
            })
            .collect()
    }

    fn neighbours(&self, id: &str) -> Vec<&str> {
        match self.successors(id) {
            Successors::None => vec![],
            Successors::Static(targets) => targets.iter().map(|s| s.as_str()).collect(),
            Successors::Conditional(cond) => cond.allowed.iter().map(|s| s.as_str()).collect(),
        }
    }

    /// Reject cycles over static edges and declared conditional targets.
    fn check_acyclic(&self) -> Result<()> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Visiting,
            Done,
        }

        let mut marks: HashMap<&str, Mark> = HashMap::new();
        for start in &self.order {
            if marks.contains_key(start.as_str()) {
                continue;
            }
            // Iterative DFS: (node, next neighbour index).
            let mut stack: Vec<(&str, usize)> = vec![(start.as_str(), 0)];
            marks.insert(start.as_str(), Mark::Visiting);
            while let Some((id, idx)) = stack.pop() {
                let next = self.neighbours(id);
                if idx < next.len() {
                    stack.push((id, idx + 1));
                    let child = next[idx];
                    match marks.get(child) {
                        Some(Mark::Visiting) => return Err(TesseraError::Cycle(child.to_string())),
                        Some(Mark::Done) => {}
                        None => {
                            marks.insert(child, Mark::Visiting);
                            stack.push((child, 0));
                        }
                    }
                } else {
                    marks.insert(id, Mark::Done);
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::router_fn;
    use crate::stage::{stage_fn, StageOutput};
    use crate::state::SharedState;
    use tessera_core::types::RouteDecision;

    fn noop() -> impl Stage {
        stage_fn(|_ctx| async { Ok(StageOutput::new()) })
    }

    #[test]
    fn test_graph_construction() {
        let mut b = GraphBuilder::new();
        b.add_stage("research", noop(), ["findings"])
            .add_stage("write", noop(), ["draft"])
            .add_terminal("end")
            .add_edge("research", "write")
            .add_edge("write", "end")
            .set_entry("research");
        let graph = b.build().unwrap();

        assert_eq!(graph.entry(), "research");
        assert_eq!(graph.len(), 3);
        assert_eq!(graph.declared_outputs(), vec!["findings", "draft"]);
        assert!(matches!(graph.successors("end"), Successors::None));
        assert_eq!(graph.describe().len(), 3);
    }

    #[test]
    fn test_missing_entry() {
        let mut b = GraphBuilder::new();
        b.add_stage("a", noop(), Vec::<String>::new());
        assert!(matches!(b.build(), Err(TesseraError::MissingEntry)));
    }

    #[test]
    fn test_duplicate_node() {
        let mut b = GraphBuilder::new();
        b.add_terminal("a").add_terminal("a").set_entry("a");
        assert!(matches!(b.build(), Err(TesseraError::DuplicateNode(id)) if id == "a"));
    }

    #[test]
    fn test_unknown_edge_target() {
        let mut b = GraphBuilder::new();
        b.add_stage("a", noop(), Vec::<String>::new())
            .add_edge("a", "ghost")
            .set_entry("a");
        assert!(matches!(b.build(), Err(TesseraError::UnknownNode(id)) if id == "ghost"));
    }

    #[test]
    fn test_cycle_rejected() {
        let mut b = GraphBuilder::new();
        b.add_stage("a", noop(), Vec::<String>::new())
            .add_stage("b", noop(), Vec::<String>::new())
            .add_edge("a", "b")
            .add_conditional_edges(
                "b",
                router_fn(|_: &SharedState| RouteDecision::single("a")),
                ["a"],
            )
            .set_entry("a");
        assert!(matches!(b.build(), Err(TesseraError::Cycle(_))));
    }

    #[test]
    fn test_conditional_target_needs_single_declaration() {
        let mut b = GraphBuilder::new();
        b.add_stage("screen", noop(), Vec::<String>::new())
            .add_stage("main", noop(), Vec::<String>::new())
            .add_stage("report", noop(), Vec::<String>::new())
            .add_conditional_edges(
                "screen",
                router_fn(|_: &SharedState| RouteDecision::single("report")),
                ["main", "report"],
            )
            .add_edge("main", "report")
            .set_entry("screen");
        assert!(matches!(
            b.build(),
            Err(TesseraError::AmbiguousInEdge { target, .. }) if target == "report"
        ));
    }

    #[test]
    fn test_split_targets_reconverge() {
        let mut b = GraphBuilder::new();
        b.add_stage("screen", noop(), Vec::<String>::new())
            .add_stage("main", noop(), Vec::<String>::new())
            .add_stage("report", noop(), Vec::<String>::new())
            .add_stage("report_bypass", noop(), Vec::<String>::new())
            .add_stage("publish", noop(), Vec::<String>::new())
            .add_conditional_edges(
                "screen",
                router_fn(|_: &SharedState| RouteDecision::single("main")),
                ["main", "report_bypass"],
            )
            .add_edge("main", "report")
            .add_edge("report", "publish")
            .add_edge("report_bypass", "publish")
            .set_entry("screen");
        assert!(b.build().is_ok());
    }

    #[test]
    fn test_mixed_outgoing_edges_rejected() {
        let mut b = GraphBuilder::new();
        b.add_stage("a", noop(), Vec::<String>::new())
            .add_stage("b", noop(), Vec::<String>::new())
            .add_stage("c", noop(), Vec::<String>::new())
            .add_edge("a", "b")
            .add_conditional_edges(
                "a",
                router_fn(|_: &SharedState| RouteDecision::single("c")),
                ["c"],
            )
            .set_entry("a");
        assert!(matches!(b.build(), Err(TesseraError::InvalidGraph(_))));
    }

    #[test]
    fn test_barrier_registers_its_edge() {
        let mut b = GraphBuilder::new();
        b.add_stage("a", noop(), ["x"])
            .add_barrier("gate", Barrier::then(["x"], "end"), ["end"])
            .add_terminal("end")
            .add_edge("a", "gate")
            .set_entry("a");
        let graph = b.build().unwrap();
        assert!(matches!(graph.successors("gate"), Successors::Conditional(_)));
        assert_eq!(graph.node("gate").unwrap().kind(), NodeKind::Barrier);
    }
}
