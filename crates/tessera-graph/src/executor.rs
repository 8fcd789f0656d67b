use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info};

use tessera_core::config::EngineConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::event::EventBus;
use tessera_core::types::{BranchToken, Event, GraphEvent, OperatingMode, RouteDecision, RunId};

use crate::action::{ActionExecutor, ActionRegistry};
use crate::builder::{Graph, Successors};
use crate::node::NodeHandler;
use crate::stage::{Stage, StageContext, StageOutput};
use crate::state::{FieldUpdate, SharedState, StatePatch};
use crate::store::{RunHandle, RunStore};

/// Per-run execution settings.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub mode: OperatingMode,
    /// Upper bound on stages running at the same time.
    pub max_concurrency: usize,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mode: OperatingMode::Standard,
            max_concurrency: 8,
        }
    }
}

impl From<&EngineConfig> for RunOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            mode: config.mode,
            max_concurrency: config.max_concurrency,
        }
    }
}

/// Result of executing a single stage.
#[derive(Debug, Clone, Serialize)]
pub struct NodeResult {
    /// Which node was executed.
    pub node_id: String,
    pub branch: BranchToken,
    /// Whether the stage returned normally.
    pub succeeded: bool,
    /// Execution time in milliseconds.
    pub elapsed_ms: u64,
    /// Fields merged from this stage.
    pub fields: Vec<String>,
    /// Writes ignored because another producer got there first.
    pub rejected: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// How a branch ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "node", rename_all = "snake_case")]
pub enum BranchOutcome {
    Running,
    /// Reached a terminal node.
    Terminal(String),
    /// Polled a barrier that was not ready (or had already fired).
    HaltedAtBarrier(String),
    /// Left a node with no successor, or its router halted.
    Ended(String),
    /// Split into child branches at this node.
    Forked(String),
}

/// Lineage and outcome of one branch token.
#[derive(Debug, Clone, Serialize)]
pub struct BranchRecord {
    pub token: BranchToken,
    pub parent: Option<BranchToken>,
    /// Nodes visited by this branch, in order.
    pub path: Vec<String>,
    pub outcome: BranchOutcome,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: RunId,
    /// Final state snapshot.
    pub state: SharedState,
    /// Full event log, in append order.
    pub events: Vec<Event>,
    /// Per-stage results in completion order.
    pub node_results: Vec<NodeResult>,
    pub branches: Vec<BranchRecord>,
    /// Declared outputs of stages that ran but never wrote them.
    pub missing: Vec<String>,
    /// Fields written with a degraded or failed marker.
    pub degraded: Vec<String>,
    pub total_elapsed_ms: u64,
}

impl RunOutcome {
    /// True when every stage succeeded and every declared field is complete.
    pub fn is_clean(&self) -> bool {
        self.node_results.iter().all(|r| r.succeeded)
            && self.missing.is_empty()
            && self.degraded.is_empty()
    }

    pub fn failed_nodes(&self) -> Vec<&str> {
        self.node_results
            .iter()
            .filter(|r| !r.succeeded)
            .map(|r| r.node_id.as_str())
            .collect()
    }

    /// How many times a node ran across all branches.
    pub fn runs_of(&self, node_id: &str) -> usize {
        self.node_results
            .iter()
            .filter(|r| r.node_id == node_id)
            .count()
    }

    /// Branches that ended at the given barrier.
    pub fn halted_at(&self, barrier: &str) -> usize {
        self.branches
            .iter()
            .filter(|b| matches!(&b.outcome, BranchOutcome::HaltedAtBarrier(n) if n == barrier))
            .count()
    }
}

struct WorkItem {
    node_id: String,
    branch: BranchToken,
}

struct StageCompletion {
    node_id: String,
    branch: BranchToken,
    result: Result<StageOutput>,
    elapsed_ms: u64,
}

/// Mutable bookkeeping owned by the scheduler loop.
#[derive(Default)]
struct RunState {
    queue: VecDeque<WorkItem>,
    branches: BTreeMap<BranchToken, BranchRecord>,
    next_token: u64,
    fired: HashSet<String>,
    node_results: Vec<NodeResult>,
    /// Stage tasks in flight, so a task lost to a join error is still
    /// recorded against its node and branch.
    tasks: HashMap<task::Id, (String, BranchToken, Instant)>,
}

impl RunState {
    fn new_branch(&mut self, parent: Option<BranchToken>) -> BranchToken {
        let token = BranchToken(self.next_token);
        self.next_token += 1;
        self.branches.insert(
            token,
            BranchRecord {
                token,
                parent,
                path: vec![],
                outcome: BranchOutcome::Running,
            },
        );
        token
    }

    fn visit(&mut self, branch: BranchToken, node_id: &str) {
        if let Some(record) = self.branches.get_mut(&branch) {
            record.path.push(node_id.to_string());
        }
    }

    fn end(&mut self, branch: BranchToken, outcome: BranchOutcome) {
        if let Some(record) = self.branches.get_mut(&branch) {
            record.outcome = outcome;
        }
    }

    /// Continue `branch` at `targets`: in place for one, forked for several.
    fn follow(&mut self, from: &str, branch: BranchToken, targets: Vec<String>) {
        match targets.len() {
            0 => self.end(branch, BranchOutcome::Ended(from.to_string())),
            1 => self
                .queue
                .extend(targets.into_iter().map(|node_id| WorkItem { node_id, branch })),
            _ => {
                self.end(branch, BranchOutcome::Forked(from.to_string()));
                for node_id in targets {
                    let child = self.new_branch(Some(branch));
                    self.queue.push_back(WorkItem {
                        node_id,
                        branch: child,
                    });
                }
            }
        }
    }
}

/// Executes a validated graph.
///
/// Starting from the entry node, the executor keeps a queue of
/// `(node, branch)` work items. Stages are launched as concurrent tasks;
/// when one completes, its output is merged through the run store and its
/// successors are enqueued. Routers and barriers are evaluated inline by the
/// scheduler right after the merge that led to them, so every decision sees
/// a state no other merge is racing with. The run ends when the queue is
/// empty and no stage is in flight.
pub struct GraphExecutor {
    graph: Arc<Graph>,
    actions: ActionExecutor,
    options: RunOptions,
    event_bus: Option<Arc<EventBus>>,
}

impl GraphExecutor {
    pub fn new(graph: Graph) -> Self {
        Self {
            graph: Arc::new(graph),
            actions: ActionExecutor::default(),
            options: RunOptions::default(),
            event_bus: None,
        }
    }

    /// Actions stages may request during the run.
    pub fn with_actions(mut self, registry: ActionRegistry) -> Self {
        self.actions = ActionExecutor::new(registry);
        self
    }

    pub fn with_options(mut self, options: RunOptions) -> Self {
        self.options = options;
        self
    }

    /// Publish progress events to `bus`.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    fn publish(&self, event: GraphEvent) {
        if let Some(bus) = &self.event_bus {
            bus.publish(event);
        }
    }

    /// Execute the graph from its entry node with the given initial state.
    ///
    /// Stage failures, degraded values and halted branches are reported in
    /// the returned `RunOutcome`. Only a misconfigured graph (such as a
    /// router returning an undeclared target) produces an `Err`.
    pub async fn run(&self, initial: SharedState) -> Result<RunOutcome> {
        self.run_with_id(RunId::new(), initial).await
    }

    /// Same as `run`, with a caller-chosen run id.
    pub async fn run_with_id(&self, run_id: RunId, mut initial: SharedState) -> Result<RunOutcome> {
        let start = Instant::now();
        for field in self.graph.accumulating_fields() {
            initial.declare_accumulating(field.clone());
        }

        let store = RunStore::new(initial).spawn();
        let permits = Arc::new(Semaphore::new(self.options.max_concurrency.max(1)));
        let mut run = RunState::default();
        let mut in_flight: JoinSet<StageCompletion> = JoinSet::new();

        info!(
            run_id = %run_id,
            entry = %self.graph.entry(),
            nodes = self.graph.len(),
            mode = ?self.options.mode,
            "Starting graph run"
        );
        self.publish(GraphEvent::RunStarted {
            run_id: run_id.clone(),
            entry: self.graph.entry().to_string(),
        });

        let root = run.new_branch(None);
        run.queue.push_back(WorkItem {
            node_id: self.graph.entry().to_string(),
            branch: root,
        });

        if let Err(e) = self.drive(&store, &permits, &mut run, &mut in_flight).await {
            error!(run_id = %run_id, error = %e, "Graph run aborted");
            in_flight.abort_all();
            let _ = store.finish().await;
            return Err(e);
        }

        let (state, log) = store.finish().await?;

        let degraded: Vec<String> = state
            .degraded_fields()
            .into_iter()
            .map(|(field, _)| field.to_string())
            .collect();
        let ran: HashSet<&str> = run.node_results.iter().map(|r| r.node_id.as_str()).collect();
        let mut missing: Vec<String> = Vec::new();
        for node in self.graph.nodes().filter(|n| ran.contains(n.id.as_str())) {
            for field in &node.outputs {
                if !state.is_settled(field) && !missing.contains(field) {
                    missing.push(field.clone());
                }
            }
        }

        let total_elapsed_ms = start.elapsed().as_millis() as u64;
        let branches: Vec<BranchRecord> = run.branches.into_values().collect();

        info!(
            run_id = %run_id,
            stages = run.node_results.len(),
            branches = branches.len(),
            missing = missing.len(),
            degraded = degraded.len(),
            total_elapsed_ms,
            "Graph run complete"
        );
        self.publish(GraphEvent::RunComplete {
            run_id: run_id.clone(),
            branches: branches.len(),
            elapsed_ms: total_elapsed_ms,
        });

        Ok(RunOutcome {
            run_id,
            state,
            events: log.into_events(),
            node_results: run.node_results,
            branches,
            missing,
            degraded,
            total_elapsed_ms,
        })
    }

    async fn drive(
        &self,
        store: &RunHandle,
        permits: &Arc<Semaphore>,
        run: &mut RunState,
        in_flight: &mut JoinSet<StageCompletion>,
    ) -> Result<()> {
        loop {
            while let Some(item) = run.queue.pop_front() {
                self.dispatch(item, store, permits, run, in_flight).await?;
            }

            let Some(joined) = in_flight.join_next_with_id().await else {
                break;
            };
            let completion = match joined {
                Ok((id, completion)) => {
                    run.tasks.remove(&id);
                    completion
                }
                Err(e) => {
                    let Some((node_id, branch, started)) = run.tasks.remove(&e.id()) else {
                        error!(error = %e, "Untracked stage task did not complete");
                        continue;
                    };
                    error!(node_id = %node_id, branch = %branch, error = %e, "Stage task did not complete");
                    let message = if e.is_panic() {
                        panic_message(&*e.into_panic())
                    } else {
                        e.to_string()
                    };
                    StageCompletion {
                        node_id,
                        branch,
                        result: Err(TesseraError::StagePanicked(message)),
                        elapsed_ms: started.elapsed().as_millis() as u64,
                    }
                }
            };
            self.complete(completion, store, run).await?;
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        item: WorkItem,
        store: &RunHandle,
        permits: &Arc<Semaphore>,
        run: &mut RunState,
        in_flight: &mut JoinSet<StageCompletion>,
    ) -> Result<()> {
        let node = self
            .graph
            .node(&item.node_id)
            .ok_or_else(|| TesseraError::UnknownNode(item.node_id.clone()))?;
        run.visit(item.branch, &node.id);

        match node.handler() {
            NodeHandler::Terminal => {
                debug!(node_id = %node.id, branch = %item.branch, "Branch reached terminal node");
                run.end(item.branch, BranchOutcome::Terminal(node.id.clone()));
            }
            NodeHandler::Stage(stage) => {
                self.launch(stage.clone(), &node.id, item.branch, store, permits, run, in_flight);
            }
            NodeHandler::Barrier(barrier) => {
                if run.fired.contains(&node.id) {
                    debug!(node_id = %node.id, branch = %item.branch, "Barrier already passed, ending late branch");
                    self.halt(run, &node.id, item.branch);
                    return Ok(());
                }

                let Successors::Conditional(edge) = self.graph.successors(&node.id) else {
                    return Err(TesseraError::InvalidGraph(format!(
                        "barrier '{}' has no routing decision",
                        node.id
                    )));
                };
                let snapshot = store.snapshot().await?;
                let decision = edge.decide(&snapshot)?;

                if decision.is_halt() {
                    debug!(
                        node_id = %node.id,
                        branch = %item.branch,
                        missing = ?barrier.missing(&snapshot),
                        "Barrier incomplete, ending branch"
                    );
                    self.halt(run, &node.id, item.branch);
                } else {
                    info!(node_id = %node.id, branch = %item.branch, decision = ?decision, "Barrier passed");
                    run.fired.insert(node.id.clone());
                    self.route(run, &node.id, item.branch, decision);
                }
            }
        }
        Ok(())
    }

    fn halt(&self, run: &mut RunState, node_id: &str, branch: BranchToken) {
        self.publish(GraphEvent::BranchHalted {
            node_id: node_id.to_string(),
            branch,
        });
        run.end(branch, BranchOutcome::HaltedAtBarrier(node_id.to_string()));
    }

    fn route(&self, run: &mut RunState, from: &str, branch: BranchToken, decision: RouteDecision) {
        self.publish(GraphEvent::RouteDecided {
            node_id: from.to_string(),
            branch,
            decision: decision.clone(),
        });
        let targets = decision
            .targets()
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>();
        run.follow(from, branch, targets);
    }

    #[allow(clippy::too_many_arguments)]
    fn launch(
        &self,
        stage: Arc<dyn Stage>,
        node_id: &str,
        branch: BranchToken,
        store: &RunHandle,
        permits: &Arc<Semaphore>,
        run: &mut RunState,
        in_flight: &mut JoinSet<StageCompletion>,
    ) {
        debug!(node_id = %node_id, branch = %branch, "Launching stage");
        self.publish(GraphEvent::StageStarted {
            node_id: node_id.to_string(),
            branch,
        });

        let node_id = node_id.to_string();
        let tracked = node_id.clone();
        let store = store.clone();
        let actions = self.actions.clone();
        let mode = self.options.mode;
        let permits = permits.clone();

        let handle = in_flight.spawn(async move {
            // The semaphore is never closed, so acquisition only waits.
            let _permit = permits.acquire_owned().await.ok();
            let started = Instant::now();

            let result = match store.snapshot().await {
                Ok(state) => {
                    let ctx = StageContext::new(node_id.clone(), branch, state, store, actions, mode);
                    // Calling `execute` inside the guarded future also catches
                    // panics raised before a stage builds its future.
                    AssertUnwindSafe(async move { stage.execute(ctx).await })
                        .catch_unwind()
                        .await
                        .unwrap_or_else(|panic| {
                            Err(TesseraError::StagePanicked(panic_message(&*panic)))
                        })
                }
                Err(e) => Err(e),
            };

            StageCompletion {
                node_id,
                branch,
                result,
                elapsed_ms: started.elapsed().as_millis() as u64,
            }
        });
        run.tasks.insert(handle.id(), (tracked, branch, Instant::now()));
    }

    async fn complete(
        &self,
        completion: StageCompletion,
        store: &RunHandle,
        run: &mut RunState,
    ) -> Result<()> {
        let StageCompletion {
            node_id,
            branch,
            result,
            elapsed_ms,
        } = completion;
        let node = self
            .graph
            .node(&node_id)
            .ok_or_else(|| TesseraError::UnknownNode(node_id.clone()))?;

        match result {
            Ok(output) => {
                let report = store.apply(output.into_patch(&node_id)).await?;
                if !report.rejected.is_empty() {
                    debug!(node_id = %node_id, rejected = ?report.rejected, "Fields already written by another stage");
                }
                debug!(node_id = %node_id, branch = %branch, elapsed_ms, fields = ?report.applied, "Stage complete");
                self.publish(GraphEvent::StageCompleted {
                    node_id: node_id.clone(),
                    branch,
                    elapsed_ms,
                    fields: report.applied.clone(),
                });
                run.node_results.push(NodeResult {
                    node_id: node_id.clone(),
                    branch,
                    succeeded: true,
                    elapsed_ms,
                    fields: report.applied,
                    rejected: report.rejected,
                    error: None,
                });
            }
            Err(e) => {
                let message = e.to_string();
                error!(node_id = %node_id, branch = %branch, error = %message, "Stage failed");
                let updates = node
                    .outputs
                    .iter()
                    .map(|field| FieldUpdate::failed(field.clone(), message.clone()))
                    .collect();
                let report = store
                    .apply(StatePatch {
                        producer: node_id.clone(),
                        updates,
                    })
                    .await?;
                self.publish(GraphEvent::StageFailed {
                    node_id: node_id.clone(),
                    branch,
                    error: message.clone(),
                });
                run.node_results.push(NodeResult {
                    node_id: node_id.clone(),
                    branch,
                    succeeded: false,
                    elapsed_ms,
                    fields: report.applied,
                    rejected: report.rejected,
                    error: Some(message),
                });
            }
        }

        self.advance(&node_id, branch, store, run).await
    }

    /// Enqueue whatever follows a completed stage.
    async fn advance(
        &self,
        node_id: &str,
        branch: BranchToken,
        store: &RunHandle,
        run: &mut RunState,
    ) -> Result<()> {
        match self.graph.successors(node_id) {
            Successors::None => {
                debug!(node_id = %node_id, branch = %branch, "No outgoing edges, branch complete");
                run.end(branch, BranchOutcome::Ended(node_id.to_string()));
            }
            Successors::Static(targets) => {
                run.follow(node_id, branch, targets.to_vec());
            }
            Successors::Conditional(edge) => {
                let snapshot = store.snapshot().await?;
                let decision = edge.decide(&snapshot)?;
                debug!(node_id = %node_id, branch = %branch, decision = ?decision, "Router decided");
                self.route(run, node_id, branch, decision);
            }
        }
        Ok(())
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "stage panicked".to_string()
    }
}
