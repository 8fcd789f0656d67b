use tessera_core::types::RouteDecision;

use crate::state::SharedState;

/// Pure routing function over the shared state.
///
/// Routers are re-evaluated every time a branch reaches them, so they must
/// not have side effects.
pub trait Router: Send + Sync + 'static {
    fn route(&self, state: &SharedState) -> RouteDecision;
}

/// Router backed by a closure.
pub struct FnRouter<F> {
    f: F,
}

/// Wrap a closure as a `Router`.
pub fn router_fn<F>(f: F) -> FnRouter<F>
where
    F: Fn(&SharedState) -> RouteDecision + Send + Sync + 'static,
{
    FnRouter { f }
}

impl<F> Router for FnRouter<F>
where
    F: Fn(&SharedState) -> RouteDecision + Send + Sync + 'static,
{
    fn route(&self, state: &SharedState) -> RouteDecision {
        (self.f)(state)
    }
}

/// Router that always continues at the same node.
pub struct Goto(pub String);

impl Router for Goto {
    fn route(&self, _state: &SharedState) -> RouteDecision {
        RouteDecision::Single(self.0.clone())
    }
}

/// Fan-in gate: a router that lets a branch past only once every required
/// field is settled.
///
/// Each arriving branch polls the barrier. Arrivals that see an incomplete
/// state get `Halt` and end quietly; the arrival that sees every required
/// field settled gets the inner router's decision.
pub struct Barrier {
    required: Vec<String>,
    decide: Box<dyn Router>,
}

impl Barrier {
    pub fn new<I, S>(required: I, decide: impl Router) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
            decide: Box::new(decide),
        }
    }

    /// Barrier that continues at a single node once satisfied.
    pub fn then<I, S>(required: I, target: impl Into<String>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(required, Goto(target.into()))
    }

    pub fn required(&self) -> &[String] {
        &self.required
    }

    pub fn is_satisfied(&self, state: &SharedState) -> bool {
        self.required.iter().all(|f| state.is_settled(f))
    }

    /// Required fields still missing, in declaration order.
    pub fn missing<'a>(&'a self, state: &SharedState) -> Vec<&'a str> {
        state.unsettled(&self.required)
    }
}

impl Router for Barrier {
    fn route(&self, state: &SharedState) -> RouteDecision {
        if !self.is_satisfied(state) {
            return RouteDecision::Halt;
        }
        self.decide.route(state)
    }
}
