pub mod action;
pub mod builder;
pub mod capability_stage;
pub mod edge;
pub mod executor;
pub mod log;
pub mod node;
pub mod round_loop;
pub mod router;
pub mod run_log;
pub mod stage;
pub mod state;
pub mod store;

pub use action::{ActionExecutor, ActionRegistry};
pub use builder::{Graph, GraphBuilder, Successors};
pub use capability_stage::{AcceptAll, CapabilityStage, RequiredFields, ResponseValidator, VersionPredicate};
pub use edge::{ConditionalEdge, Edge};
pub use executor::{BranchOutcome, BranchRecord, GraphExecutor, NodeResult, RunOptions, RunOutcome};
pub use log::EventLog;
pub use node::{Node, NodeHandler};
pub use round_loop::{RoundLoop, RoundRole, RoundTurn};
pub use router::{router_fn, Barrier, FnRouter, Goto, Router};
pub use run_log::RunLogger;
pub use stage::{stage_fn, FnStage, Stage, StageContext, StageOutput};
pub use state::{ApplyReport, FieldEntry, FieldUpdate, SharedState, StatePatch, WriteMode, INPUT_PRODUCER};
pub use store::{RunHandle, RunStore};
