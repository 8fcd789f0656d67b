//! Scripted mocks for exercising graphs without real capabilities.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::{Action, Capability};
use tessera_core::types::{CapabilityRequest, CapabilityResponse};

enum Scripted {
    Respond(Value),
    Fail(String),
}

/// Capability that replays a script of responses.
///
/// Scripted entries are consumed in order; once the script runs out, the
/// default response (if any) is returned, otherwise the call fails.
pub struct MockCapability {
    name: String,
    version: String,
    available: bool,
    script: Mutex<VecDeque<Scripted>>,
    default: Option<Value>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    requests: Mutex<Vec<CapabilityRequest>>,
}

impl MockCapability {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            version: "1".to_string(),
            available: true,
            script: Mutex::new(VecDeque::new()),
            default: None,
            delay: None,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Respond with `content` on every unscripted call.
    pub fn always(mut self, content: Value) -> Self {
        self.default = Some(content);
        self
    }

    /// Queue one successful response.
    pub fn respond(self, content: Value) -> Self {
        self.push(Scripted::Respond(content));
        self
    }

    /// Queue one failure.
    pub fn fail(self, message: &str) -> Self {
        self.push(Scripted::Fail(message.to_string()));
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = version.to_string();
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    fn push(&self, entry: Scripted) {
        self.script.lock().unwrap().push_back(entry);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<CapabilityRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    pub fn requests(&self) -> Vec<CapabilityRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Capability for MockCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn version(&self) -> &str {
        &self.version
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn invoke(&self, request: CapabilityRequest) -> BoxFuture<'_, Result<CapabilityResponse>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.requests.lock().unwrap().push(request);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let next = self.script.lock().unwrap().pop_front();
            let content = match next {
                Some(Scripted::Respond(content)) => content,
                Some(Scripted::Fail(message)) => {
                    return Err(TesseraError::capability(&self.name, message))
                }
                None => self
                    .default
                    .clone()
                    .ok_or_else(|| TesseraError::capability(&self.name, "script exhausted"))?,
            };
            Ok(CapabilityResponse {
                capability: self.name.clone(),
                content,
            })
        })
    }
}

/// Action that records its calls and returns a fixed payload.
///
/// Without an explicit payload it echoes `{"action": name, "args": args}`.
pub struct MockAction {
    name: String,
    payload: Option<Value>,
    failure: Option<String>,
    delay: Option<Duration>,
    timeout_secs: u64,
    calls: Mutex<Vec<Map<String, Value>>>,
}

impl MockAction {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            payload: None,
            failure: None,
            delay: None,
            timeout_secs: 30,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn returning(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Arguments of every call, in call order.
    pub fn calls(&self) -> Vec<Map<String, Value>> {
        self.calls.lock().unwrap().clone()
    }
}

impl Action for MockAction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Scripted test action"
    }

    fn timeout_secs(&self) -> u64 {
        self.timeout_secs
    }

    fn execute(&self, args: Map<String, Value>) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push(args.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(message) = &self.failure {
                return Err(TesseraError::ActionExecution {
                    action: self.name.clone(),
                    message: message.clone(),
                });
            }
            Ok(self
                .payload
                .clone()
                .unwrap_or_else(|| json!({ "action": self.name, "args": args })))
        })
    }
}

/// Shares one mock between a registry and the test that inspects it.
pub struct SharedAction(pub std::sync::Arc<MockAction>);

impl Action for SharedAction {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn timeout_secs(&self) -> u64 {
        self.0.timeout_secs()
    }

    fn execute(&self, args: Map<String, Value>) -> BoxFuture<'_, Result<Value>> {
        self.0.execute(args)
    }
}

/// Shares one capability mock between a stage and the test that inspects it.
pub struct SharedCapability(pub std::sync::Arc<MockCapability>);

impl Capability for SharedCapability {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn version(&self) -> &str {
        self.0.version()
    }

    fn is_available(&self) -> bool {
        self.0.is_available()
    }

    fn invoke(&self, request: CapabilityRequest) -> BoxFuture<'_, Result<CapabilityResponse>> {
        self.0.invoke(request)
    }
}
