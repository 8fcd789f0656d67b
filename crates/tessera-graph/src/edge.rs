use std::collections::BTreeSet;
use std::sync::Arc;

use tessera_core::error::{Result, TesseraError};
use tessera_core::types::RouteDecision;

use crate::router::Router;
use crate::state::SharedState;

/// A dynamic edge owned by a router.
///
/// `allowed` is declared when the graph is built; a runtime decision naming
/// any other node is a misconfiguration.
#[derive(Clone)]
pub struct ConditionalEdge {
    /// Source node id.
    pub from: String,
    pub router: Arc<dyn Router>,
    /// Every node the router may return.
    pub allowed: BTreeSet<String>,
}

impl ConditionalEdge {
    /// Evaluate the router and check the decision against `allowed`.
    pub fn decide(&self, state: &SharedState) -> Result<RouteDecision> {
        let decision = self.router.route(state);
        if let Some(target) = decision
            .targets()
            .into_iter()
            .find(|t| !self.allowed.contains(*t))
        {
            return Err(TesseraError::UndeclaredTarget {
                from: self.from.clone(),
                target: target.to_string(),
            });
        }
        Ok(decision)
    }
}

impl std::fmt::Debug for ConditionalEdge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConditionalEdge")
            .field("from", &self.from)
            .field("allowed", &self.allowed)
            .finish()
    }
}

/// An edge connecting nodes in the execution graph.
#[derive(Debug, Clone)]
pub enum Edge {
    /// Always traversed after `from` completes.
    Static { from: String, to: String },
    /// Traversed wherever the router decides.
    Conditional(ConditionalEdge),
}

impl Edge {
    /// Create an unconditional edge.
    pub fn always(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self::Static {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Create a router-owned edge with its declared targets.
    pub fn conditional<I, S>(from: impl Into<String>, router: Arc<dyn Router>, allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Conditional(ConditionalEdge {
            from: from.into(),
            router,
            allowed: allowed.into_iter().map(Into::into).collect(),
        })
    }

    /// Source node id.
    pub fn from(&self) -> &str {
        match self {
            Self::Static { from, .. } => from,
            Self::Conditional(c) => &c.from,
        }
    }

    /// Every node this edge may lead to.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Self::Static { to, .. } => vec![to.as_str()],
            Self::Conditional(c) => c.allowed.iter().map(|s| s.as_str()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::router_fn;
    use serde_json::json;

    #[test]
    fn test_edge_builders() {
        let e = Edge::always("a", "b");
        assert_eq!(e.from(), "a");
        assert_eq!(e.targets(), vec!["b"]);

        let router = Arc::new(router_fn(|_: &SharedState| RouteDecision::single("c")));
        let e = Edge::conditional("a", router, ["c", "d"]);
        assert_eq!(e.targets(), vec!["c", "d"]);
    }

    #[test]
    fn test_decide_accepts_declared_targets() {
        let edge = ConditionalEdge {
            from: "screen".into(),
            router: Arc::new(router_fn(|s: &SharedState| {
                if s.get_str("verdict") == Some("reject") {
                    RouteDecision::single("bypass")
                } else {
                    RouteDecision::fan_out(["x", "y"])
                }
            })),
            allowed: ["bypass", "x", "y"].into_iter().map(String::from).collect(),
        };

        let state = SharedState::from_map([("verdict", json!("reject"))]);
        assert_eq!(edge.decide(&state).unwrap(), RouteDecision::single("bypass"));
        assert_eq!(
            edge.decide(&SharedState::new()).unwrap(),
            RouteDecision::fan_out(["x", "y"])
        );
    }

    #[test]
    fn test_decide_rejects_undeclared_target() {
        let edge = ConditionalEdge {
            from: "screen".into(),
            router: Arc::new(router_fn(|_: &SharedState| RouteDecision::single("elsewhere"))),
            allowed: ["bypass"].into_iter().map(String::from).collect(),
        };
        let err = edge.decide(&SharedState::new()).unwrap_err();
        assert!(matches!(err, TesseraError::UndeclaredTarget { ref target, .. } if target == "elsewhere"));
        assert!(err.is_misconfiguration());
    }
}
