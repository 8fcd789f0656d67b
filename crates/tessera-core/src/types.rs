use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::str::FromStr for RunId {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s))
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one independently scheduled branch of a run.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct BranchToken(pub u64);

impl std::fmt::Display for BranchToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// What a node is, fixed when the graph is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Stage,
    Barrier,
    Terminal,
}

/// Decision returned by a router or barrier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "target", rename_all = "snake_case")]
pub enum RouteDecision {
    /// End the calling branch.
    Halt,
    /// Continue the calling branch at one node.
    Single(String),
    /// Split into one independent branch per node.
    FanOut(Vec<String>),
}

impl RouteDecision {
    pub fn single(id: impl Into<String>) -> Self {
        Self::Single(id.into())
    }

    pub fn fan_out<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::FanOut(ids.into_iter().map(Into::into).collect())
    }

    /// Node ids this decision continues at. Empty for `Halt`.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Self::Halt => vec![],
            Self::Single(id) => vec![id.as_str()],
            Self::FanOut(ids) => ids.iter().map(|s| s.as_str()).collect(),
        }
    }

    /// An empty fan-out ends the branch just like `Halt`.
    pub fn is_halt(&self) -> bool {
        match self {
            Self::Halt => true,
            Self::Single(_) => false,
            Self::FanOut(ids) => ids.is_empty(),
        }
    }
}

/// A side-effect request emitted by a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionRequest {
    pub id: String,
    pub action_name: String,
    #[serde(default)]
    pub args: serde_json::Map<String, serde_json::Value>,
}

impl ActionRequest {
    pub fn new(action_name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            action_name: action_name.into(),
            args: serde_json::Map::new(),
        }
    }

    /// Add one argument.
    pub fn with_arg(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.args.insert(key.into(), value);
        self
    }
}

/// Payload or error produced by executing one action request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ActionOutcome {
    Payload(serde_json::Value),
    Error(String),
}

/// Result of one action request, tagged with the producer of the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub action_request_id: String,
    pub producer_tag: String,
    pub action_name: String,
    pub outcome: ActionOutcome,
}

impl ActionResult {
    pub fn payload(&self) -> Option<&serde_json::Value> {
        match &self.outcome {
            ActionOutcome::Payload(v) => Some(v),
            ActionOutcome::Error(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self.outcome, ActionOutcome::Error(_))
    }
}

/// Body of an event log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ActionsRequested { actions: Vec<ActionRequest> },
    ActionCompleted { result: ActionResult },
}

/// Append-only log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: u64,
    pub producer_tag: String,
    pub payload: EventPayload,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    /// Requested actions carried by this event (empty for result entries).
    pub fn requested_actions(&self) -> &[ActionRequest] {
        match &self.payload {
            EventPayload::ActionsRequested { actions } => actions,
            EventPayload::ActionCompleted { .. } => &[],
        }
    }

    pub fn action_result(&self) -> Option<&ActionResult> {
        match &self.payload {
            EventPayload::ActionCompleted { result } => Some(result),
            EventPayload::ActionsRequested { .. } => None,
        }
    }
}

/// Completion marker recorded alongside every written field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FieldStatus {
    Complete,
    /// Written, but with a value the producer could not fully vouch for.
    Degraded { reason: String },
    /// The producing stage failed; the value is a placeholder.
    Failed { error: String },
}

impl FieldStatus {
    pub fn is_complete(&self) -> bool {
        matches!(self, Self::Complete)
    }
}

/// Declared operating mode of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    #[default]
    Standard,
    /// Low-latency / low-cost mode. Disables capability fallback retries.
    LowLatency,
}

impl OperatingMode {
    pub fn forbids_retry(&self) -> bool {
        matches!(self, Self::LowLatency)
    }
}

/// Extended-effort parameter for capabilities whose version supports it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EffortLevel {
    Low,
    #[default]
    Medium,
    High,
}

/// Input handed to an external capability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilityRequest {
    /// Stage on whose behalf the capability is invoked.
    pub stage_id: String,
    pub context: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extended_effort: Option<EffortLevel>,
}

/// Output of an external capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityResponse {
    /// Name of the capability that produced this response.
    pub capability: String,
    pub content: serde_json::Value,
}

/// Executor progress event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum GraphEvent {
    /// Run started at the entry node.
    RunStarted { run_id: RunId, entry: String },
    /// A stage was launched on a branch.
    StageStarted { node_id: String, branch: BranchToken },
    /// A stage finished and its fields were merged.
    StageCompleted {
        node_id: String,
        branch: BranchToken,
        elapsed_ms: u64,
        fields: Vec<String>,
    },
    /// A stage failed; its declared outputs were marked failed.
    StageFailed {
        node_id: String,
        branch: BranchToken,
        error: String,
    },
    /// A router or barrier produced a decision.
    RouteDecided {
        node_id: String,
        branch: BranchToken,
        decision: RouteDecision,
    },
    /// A branch ended at a barrier whose required fields were not settled.
    BranchHalted { node_id: String, branch: BranchToken },
    /// The work queue drained.
    RunComplete {
        run_id: RunId,
        branches: usize,
        elapsed_ms: u64,
    },
}
