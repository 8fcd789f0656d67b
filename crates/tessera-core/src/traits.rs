use futures::future::BoxFuture;

use crate::error::Result;
use crate::types::*;

/// External capability: the opaque computation behind a stage.
///
/// The embedding application decides what a capability does (typically a
/// call to a generative-text service). The executor only sees the request
/// context going in and the response coming out.
pub trait Capability: Send + Sync + 'static {
    /// Capability name (used in logs and responses).
    fn name(&self) -> &str;

    /// Version string checked by capability-version predicates.
    fn version(&self) -> &str {
        "1"
    }

    /// Whether this capability can currently be invoked.
    fn is_available(&self) -> bool {
        true
    }

    /// Invoke the capability once.
    fn invoke(&self, request: CapabilityRequest) -> BoxFuture<'_, Result<CapabilityResponse>>;
}

/// Action: a named side effect a stage can request through the event log.
pub trait Action: Send + Sync + 'static {
    /// Action name (matched against `ActionRequest::action_name`).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str {
        ""
    }

    /// Execute the action with the request's arguments.
    fn execute(
        &self,
        args: serde_json::Map<String, serde_json::Value>,
    ) -> BoxFuture<'_, Result<serde_json::Value>>;

    /// Timeout in seconds for this action.
    fn timeout_secs(&self) -> u64 {
        30
    }
}
