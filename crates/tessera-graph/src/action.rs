use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::Action;
use tessera_core::types::{ActionOutcome, ActionRequest, ActionResult};

use crate::store::RunHandle;

/// Registry of available actions.
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self {
            actions: HashMap::new(),
        }
    }

    /// Register an action.
    pub fn register(&mut self, action: impl Action) {
        let name = action.name().to_string();
        self.actions.insert(name, Arc::new(action));
    }

    /// Unregister an action by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.actions.remove(name).is_some()
    }

    /// Get an action by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Action>> {
        self.actions.get(name).cloned()
    }

    /// List all registered actions.
    pub fn list(&self) -> Vec<&str> {
        self.actions.keys().map(|s| s.as_str()).collect()
    }

    /// Execute one request against the registered action of the same name.
    pub async fn execute(&self, request: &ActionRequest) -> Result<serde_json::Value> {
        let action = self
            .get(&request.action_name)
            .ok_or_else(|| TesseraError::ActionNotFound(request.action_name.clone()))?;

        let timeout = std::time::Duration::from_secs(action.timeout_secs());

        match tokio::time::timeout(timeout, action.execute(request.args.clone())).await {
            Ok(result) => result,
            Err(_) => Err(TesseraError::ActionTimeout {
                action: request.action_name.clone(),
                timeout_secs: action.timeout_secs(),
            }),
        }
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes a stage's own pending action requests from the run's event log.
#[derive(Clone)]
pub struct ActionExecutor {
    registry: Arc<ActionRegistry>,
}

impl ActionExecutor {
    pub fn new(registry: ActionRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    /// Run the newest request event produced by `stage_id` that names any of
    /// the `recognized` actions.
    ///
    /// Requests already answered in the log are not re-executed; their stored
    /// results are returned instead. New results are appended to the log
    /// under the event's producer tag. Finding nothing is not an error, and
    /// neither is a recognized request that nothing answers: the stage gets
    /// fewer results than it asked for and a warning is logged.
    pub async fn execute<S: AsRef<str>>(
        &self,
        stage_id: &str,
        recognized: &[S],
        log: &RunHandle,
    ) -> Result<Vec<ActionResult>> {
        let recognized: Vec<String> = recognized.iter().map(|s| s.as_ref().to_string()).collect();

        let Some(event) = log.latest_request(stage_id, recognized.clone()).await? else {
            debug!(stage = %stage_id, ?recognized, "No pending action request for stage");
            return Ok(vec![]);
        };

        let requested = event.requested_actions();
        let mut results = Vec::with_capacity(requested.len());
        let mut fresh = Vec::new();

        for request in requested {
            if !recognized.iter().any(|name| *name == request.action_name) {
                debug!(
                    stage = %stage_id,
                    action = %request.action_name,
                    "Skipping request this executor does not recognize"
                );
                continue;
            }

            if let Some(existing) = log.existing_result(&request.id).await? {
                results.push(existing);
                continue;
            }

            if self.registry.get(&request.action_name).is_none() {
                warn!(
                    stage = %stage_id,
                    action = %request.action_name,
                    "Recognized action has no registered handler, no result produced"
                );
                continue;
            }

            let outcome = match self.registry.execute(request).await {
                Ok(payload) => ActionOutcome::Payload(payload),
                Err(e) => {
                    warn!(stage = %stage_id, action = %request.action_name, error = %e, "Action failed");
                    ActionOutcome::Error(e.to_string())
                }
            };
            let result = ActionResult {
                action_request_id: request.id.clone(),
                producer_tag: event.producer_tag.clone(),
                action_name: request.action_name.clone(),
                outcome,
            };
            fresh.push(result.clone());
            results.push(result);
        }

        if !fresh.is_empty() {
            log.record_results(fresh).await?;
        }

        if results.len() != requested.len() {
            warn!(
                stage = %stage_id,
                event_id = event.id,
                requested = requested.len(),
                produced = results.len(),
                "Action result count does not match request count"
            );
        }

        Ok(results)
    }
}

impl Default for ActionExecutor {
    fn default() -> Self {
        Self::new(ActionRegistry::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SharedState;
    use crate::store::RunStore;
    use serde_json::json;
    use std::io;
    use std::sync::Mutex;
    use tessera_test_utils::MockAction;

    /// Collects formatted log lines for assertions.
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn executor() -> ActionExecutor {
        let mut registry = ActionRegistry::new();
        registry.register(MockAction::new("fetch_news"));
        ActionExecutor::new(registry)
    }

    #[tokio::test]
    async fn test_newer_sibling_request_is_ignored() {
        let log = RunStore::new(SharedState::new()).spawn();
        log.request_actions(
            "news",
            vec![ActionRequest::new("fetch_news").with_arg("q", json!("mine"))],
        )
        .await
        .unwrap();
        log.request_actions(
            "social",
            vec![ActionRequest::new("fetch_news").with_arg("q", json!("theirs"))],
        )
        .await
        .unwrap();

        let results = executor().execute("news", &["fetch_news"], &log).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].producer_tag, "news");
        assert_eq!(results[0].payload().unwrap()["args"]["q"], "mine");

        // The sibling's request is still pending and untouched.
        assert!(log.results_for("social").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_count_mismatch_is_not_fatal() {
        let log = RunStore::new(SharedState::new()).spawn();
        log.request_actions(
            "news",
            vec![ActionRequest::new("fetch_news"), ActionRequest::new("summarize")],
        )
        .await
        .unwrap();

        let results = executor().execute("news", &["fetch_news"], &log).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(log.results_for("news").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_dropped_result_logs_count_mismatch() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::WARN)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let log = RunStore::new(SharedState::new()).spawn();
        log.request_actions(
            "news",
            vec![ActionRequest::new("fetch_news"), ActionRequest::new("fetch_prices")],
        )
        .await
        .unwrap();

        // Both are recognized, only one has a handler.
        let results = executor()
            .execute("news", &["fetch_news", "fetch_prices"], &log)
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].action_name, "fetch_news");
        let text = logs.text();
        assert!(text.contains("Action result count does not match request count"), "{}", text);
        assert!(text.contains("requested=2"), "{}", text);
        assert!(text.contains("produced=1"), "{}", text);
    }

    #[tokio::test]
    async fn test_no_request_returns_empty() {
        let log = RunStore::new(SharedState::new()).spawn();
        let results = executor().execute("news", &["fetch_news"], &log).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_registry_unknown_action() {
        let registry = ActionRegistry::new();
        let err = registry
            .execute(&ActionRequest::new("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, TesseraError::ActionNotFound(name) if name == "missing"));
    }

    #[test]
    fn test_registry_register_and_unregister() {
        let mut registry = ActionRegistry::new();
        registry.register(MockAction::new("fetch_news"));
        assert_eq!(registry.list(), vec!["fetch_news"]);
        assert!(registry.unregister("fetch_news"));
        assert!(registry.get("fetch_news").is_none());
    }
}
