use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use tessera_core::error::Result;
use tessera_core::types::{ActionRequest, ActionResult, BranchToken, OperatingMode};

use crate::action::ActionExecutor;
use crate::state::{FieldUpdate, SharedState, StatePatch};
use crate::store::RunHandle;

/// A unit of work in the graph.
///
/// A stage reads the state view it was launched with, may request actions
/// and wait for their results, and returns field updates. It never writes
/// the shared state directly; the executor merges the returned output.
pub trait Stage: Send + Sync + 'static {
    fn execute(&self, ctx: StageContext) -> BoxFuture<'_, Result<StageOutput>>;
}

/// Everything a running stage can see and do.
#[derive(Clone)]
pub struct StageContext {
    stage_id: String,
    branch: BranchToken,
    state: Arc<SharedState>,
    store: RunHandle,
    actions: ActionExecutor,
    mode: OperatingMode,
}

impl StageContext {
    pub fn new(
        stage_id: impl Into<String>,
        branch: BranchToken,
        state: SharedState,
        store: RunHandle,
        actions: ActionExecutor,
        mode: OperatingMode,
    ) -> Self {
        Self {
            stage_id: stage_id.into(),
            branch,
            state: Arc::new(state),
            store,
            actions,
            mode,
        }
    }

    /// Node id of the running stage; also its producer tag in the event log.
    pub fn stage_id(&self) -> &str {
        &self.stage_id
    }

    pub fn branch(&self) -> BranchToken {
        self.branch
    }

    /// State as of the moment this stage started.
    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn mode(&self) -> OperatingMode {
        self.mode
    }

    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.state.get(field)
    }

    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.state.get_str(field)
    }

    /// Append an action request event tagged with this stage's id.
    pub async fn request_actions(&self, actions: Vec<ActionRequest>) -> Result<u64> {
        self.store.request_actions(&self.stage_id, actions).await
    }

    /// Execute this stage's newest pending request among `recognized` actions.
    pub async fn run_actions<S: AsRef<str>>(&self, recognized: &[S]) -> Result<Vec<ActionResult>> {
        self.actions
            .execute(&self.stage_id, recognized, &self.store)
            .await
    }

    /// Every action result recorded for this stage so far.
    pub async fn own_results(&self) -> Result<Vec<ActionResult>> {
        self.store.results_for(&self.stage_id).await
    }
}

/// Field updates produced by one stage run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    updates: Vec<FieldUpdate>,
}

impl StageOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a field to a complete value.
    pub fn set(mut self, field: impl Into<String>, value: serde_json::Value) -> Self {
        self.updates.push(FieldUpdate::complete(field, value));
        self
    }

    /// Set a field to a value the stage could not fully vouch for.
    pub fn set_degraded(
        mut self,
        field: impl Into<String>,
        value: serde_json::Value,
        reason: impl Into<String>,
    ) -> Self {
        self.updates.push(FieldUpdate::degraded(field, value, reason));
        self
    }

    pub fn push(&mut self, update: FieldUpdate) {
        self.updates.push(update);
    }

    pub fn updates(&self) -> &[FieldUpdate] {
        &self.updates
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn into_patch(self, producer: impl Into<String>) -> StatePatch {
        StatePatch {
            producer: producer.into(),
            updates: self.updates,
        }
    }
}

/// Stage backed by an async closure.
pub struct FnStage<F> {
    f: F,
}

/// Wrap an async closure as a `Stage`.
pub fn stage_fn<F, Fut>(f: F) -> FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StageOutput>> + Send + 'static,
{
    FnStage { f }
}

impl<F, Fut> Stage for FnStage<F>
where
    F: Fn(StageContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<StageOutput>> + Send + 'static,
{
    fn execute(&self, ctx: StageContext) -> BoxFuture<'_, Result<StageOutput>> {
        Box::pin((self.f)(ctx))
    }
}
