use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use tessera_core::error::Result;
use tessera_core::traits::Capability;
use tessera_core::types::{CapabilityRequest, CapabilityResponse, EffortLevel};

use crate::stage::{Stage, StageContext, StageOutput};

/// Structural check applied to a capability response.
pub trait ResponseValidator: Send + Sync + 'static {
    /// `Err` carries a short description of what is wrong.
    fn validate(&self, response: &CapabilityResponse) -> std::result::Result<(), String>;
}

/// Accepts every response.
pub struct AcceptAll;

impl ResponseValidator for AcceptAll {
    fn validate(&self, _response: &CapabilityResponse) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// Requires the response content to be an object with every listed key
/// present and non-null.
pub struct RequiredFields(pub Vec<String>);

impl RequiredFields {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(fields.into_iter().map(Into::into).collect())
    }
}

impl ResponseValidator for RequiredFields {
    fn validate(&self, response: &CapabilityResponse) -> std::result::Result<(), String> {
        let Some(object) = response.content.as_object() else {
            return Err("response is not a structured object".to_string());
        };
        let missing: Vec<&str> = self
            .0
            .iter()
            .filter(|f| object.get(f.as_str()).map_or(true, Value::is_null))
            .map(|f| f.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(format!("missing fields: {}", missing.join(", ")))
        }
    }
}

/// Decides from a capability's version string whether it accepts the
/// extended-effort parameter.
pub type VersionPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Stage that wraps one external capability invocation with
/// validate-then-fallback escalation.
///
/// The primary capability is invoked once. If its response fails the
/// validator, retry is allowed, and a fallback is configured and available,
/// the fallback is invoked once and its response used instead. Otherwise
/// the primary response is surfaced as is. Low-latency runs never retry.
///
/// The stage itself never fails: an unusable response is written to the
/// output field with a degraded marker.
pub struct CapabilityStage {
    primary: Arc<dyn Capability>,
    fallback: Option<Arc<dyn Capability>>,
    allow_retry: bool,
    validator: Box<dyn ResponseValidator>,
    supports_effort: Option<VersionPredicate>,
    effort: EffortLevel,
    inputs: Vec<String>,
    instructions: String,
    output_field: String,
}

impl CapabilityStage {
    pub fn new(primary: Arc<dyn Capability>, output_field: impl Into<String>) -> Self {
        Self {
            primary,
            fallback: None,
            allow_retry: true,
            validator: Box::new(AcceptAll),
            supports_effort: None,
            effort: EffortLevel::default(),
            inputs: vec![],
            instructions: String::new(),
            output_field: output_field.into(),
        }
    }

    pub fn with_fallback(mut self, fallback: Arc<dyn Capability>) -> Self {
        self.fallback = Some(fallback);
        self
    }

    pub fn with_allow_retry(mut self, allow: bool) -> Self {
        self.allow_retry = allow;
        self
    }

    pub fn with_validator(mut self, validator: impl ResponseValidator) -> Self {
        self.validator = Box::new(validator);
        self
    }

    /// Forward `effort` to capabilities whose version satisfies `predicate`.
    pub fn with_extended_effort(mut self, effort: EffortLevel, predicate: VersionPredicate) -> Self {
        self.effort = effort;
        self.supports_effort = Some(predicate);
        self
    }

    /// State fields copied into the request context.
    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }

    pub fn output_field(&self) -> &str {
        &self.output_field
    }

    fn request_for(&self, capability: &dyn Capability, ctx: &StageContext) -> CapabilityRequest {
        let mut inputs = Map::new();
        for field in &self.inputs {
            if let Some(value) = ctx.get(field) {
                inputs.insert(field.clone(), value.clone());
            }
        }
        let extended_effort = self
            .supports_effort
            .as_ref()
            .filter(|supports| supports(capability.version()))
            .map(|_| self.effort);

        CapabilityRequest {
            stage_id: ctx.stage_id().to_string(),
            context: json!({
                "instructions": self.instructions,
                "inputs": inputs,
            }),
            extended_effort,
        }
    }

    async fn invoke(&self, capability: &dyn Capability, ctx: &StageContext) -> Attempt {
        let request = self.request_for(capability, ctx);
        match capability.invoke(request).await {
            Ok(response) => match self.validator.validate(&response) {
                Ok(()) => Attempt::Valid(response),
                Err(problem) => Attempt::Invalid(response, problem),
            },
            Err(e) => Attempt::Failed(e.to_string()),
        }
    }
}

enum Attempt {
    Valid(CapabilityResponse),
    Invalid(CapabilityResponse, String),
    Failed(String),
}

impl Attempt {
    fn into_output(self, field: &str) -> StageOutput {
        match self {
            Self::Valid(response) => StageOutput::new().set(field, response.content),
            Self::Invalid(response, problem) => {
                StageOutput::new().set_degraded(field, response.content, problem)
            }
            Self::Failed(error) => StageOutput::new().set_degraded(field, Value::Null, error),
        }
    }
}

impl Stage for CapabilityStage {
    fn execute(&self, ctx: StageContext) -> BoxFuture<'_, Result<StageOutput>> {
        Box::pin(async move {
            let primary = self.invoke(self.primary.as_ref(), &ctx).await;
            let problem = match &primary {
                Attempt::Valid(_) => None,
                Attempt::Invalid(_, problem) | Attempt::Failed(problem) => Some(problem.clone()),
            };
            let Some(problem) = problem else {
                return Ok(primary.into_output(&self.output_field));
            };

            let allow_retry = self.allow_retry && !ctx.mode().forbids_retry();
            let fallback = self.fallback.as_ref().filter(|f| f.is_available());

            let Some(fallback) = fallback.filter(|_| allow_retry) else {
                debug!(
                    stage = %ctx.stage_id(),
                    allow_retry,
                    has_fallback = self.fallback.is_some(),
                    problem = %problem,
                    "Surfacing primary response"
                );
                return Ok(primary.into_output(&self.output_field));
            };

            warn!(
                stage = %ctx.stage_id(),
                primary = %self.primary.name(),
                fallback = %fallback.name(),
                problem = %problem,
                "Primary response unusable, invoking fallback"
            );
            match self.invoke(fallback.as_ref(), &ctx).await {
                Attempt::Failed(error) => {
                    warn!(
                        stage = %ctx.stage_id(),
                        fallback = %fallback.name(),
                        error = %error,
                        "Fallback failed, keeping primary response"
                    );
                    Ok(primary.into_output(&self.output_field))
                }
                attempt => {
                    info!(stage = %ctx.stage_id(), fallback = %fallback.name(), "Fell back to alternative capability");
                    Ok(attempt.into_output(&self.output_field))
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionExecutor;
    use crate::state::SharedState;
    use crate::store::RunStore;
    use tessera_core::types::{BranchToken, FieldStatus, OperatingMode};
    use tessera_test_utils::{MockCapability, SharedCapability};

    fn ctx(mode: OperatingMode) -> StageContext {
        let state = SharedState::from_map([("ticker", json!("NVDA"))]);
        let store = RunStore::new(state.clone()).spawn();
        StageContext::new("analyst", BranchToken(0), state, store, ActionExecutor::default(), mode)
    }

    fn shared(mock: MockCapability) -> (Arc<MockCapability>, Arc<dyn Capability>) {
        let mock = Arc::new(mock);
        (mock.clone(), Arc::new(SharedCapability(mock)))
    }

    #[tokio::test]
    async fn test_valid_primary_skips_fallback() {
        let (_, primary) = shared(MockCapability::new("primary").always(json!({"signal": "buy"})));
        let (fb, fallback) = shared(MockCapability::new("fallback").always(json!({"signal": "sell"})));
        let stage = CapabilityStage::new(primary, "decision")
            .with_fallback(fallback)
            .with_validator(RequiredFields::new(["signal"]));

        let out = stage.execute(ctx(OperatingMode::Standard)).await.unwrap();
        assert_eq!(out.updates()[0].value, json!({"signal": "buy"}));
        assert!(out.updates()[0].status.is_complete());
        assert_eq!(fb.call_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_primary_escalates_to_fallback() {
        let (_, primary) = shared(MockCapability::new("primary").always(json!("free text")));
        let (fb, fallback) = shared(MockCapability::new("fallback").always(json!({"signal": "sell"})));
        let stage = CapabilityStage::new(primary, "decision")
            .with_fallback(fallback)
            .with_validator(RequiredFields::new(["signal"]));

        let out = stage.execute(ctx(OperatingMode::Standard)).await.unwrap();
        assert_eq!(out.updates()[0].value, json!({"signal": "sell"}));
        assert!(out.updates()[0].status.is_complete());
        assert_eq!(fb.call_count(), 1);
    }

    #[tokio::test]
    async fn test_low_latency_forbids_fallback() {
        let (_, primary) = shared(MockCapability::new("primary").always(json!("free text")));
        let (fb, fallback) = shared(MockCapability::new("fallback").always(json!({"signal": "sell"})));
        let stage = CapabilityStage::new(primary, "decision")
            .with_fallback(fallback)
            .with_allow_retry(true)
            .with_validator(RequiredFields::new(["signal"]));

        let out = stage.execute(ctx(OperatingMode::LowLatency)).await.unwrap();
        assert_eq!(out.updates()[0].value, json!("free text"));
        assert!(matches!(out.updates()[0].status, FieldStatus::Degraded { .. }));
        assert_eq!(fb.call_count(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_fallback_is_skipped() {
        let (_, primary) = shared(MockCapability::new("primary").fail("rate limited"));
        let (fb, fallback) = shared(
            MockCapability::new("fallback")
                .always(json!({"signal": "sell"}))
                .unavailable(),
        );
        let stage = CapabilityStage::new(primary, "decision").with_fallback(fallback);

        let out = stage.execute(ctx(OperatingMode::Standard)).await.unwrap();
        assert_eq!(out.updates()[0].value, Value::Null);
        assert!(matches!(&out.updates()[0].status, FieldStatus::Degraded { reason } if reason.contains("rate limited")));
        assert_eq!(fb.call_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_fallback_keeps_primary_response() {
        let (_, primary) = shared(MockCapability::new("primary").always(json!({"note": "partial"})));
        let (_, fallback) = shared(MockCapability::new("fallback").fail("down"));
        let stage = CapabilityStage::new(primary, "decision")
            .with_fallback(fallback)
            .with_validator(RequiredFields::new(["signal"]));

        let out = stage.execute(ctx(OperatingMode::Standard)).await.unwrap();
        assert_eq!(out.updates()[0].value, json!({"note": "partial"}));
        assert!(!out.updates()[0].status.is_complete());
    }

    #[tokio::test]
    async fn test_effort_forwarded_by_version() {
        let (old, primary) = shared(MockCapability::new("primary").with_version("1.0").always(json!("x")));
        let (new, fallback) = shared(MockCapability::new("fallback").with_version("2.1").always(json!("y")));
        let predicate: VersionPredicate = Arc::new(|v: &str| v.starts_with('2'));
        let stage = CapabilityStage::new(primary, "out")
            .with_fallback(fallback)
            .with_validator(RequiredFields::new(["never"]))
            .with_extended_effort(EffortLevel::High, predicate)
            .with_inputs(["ticker"]);

        stage.execute(ctx(OperatingMode::Standard)).await.unwrap();
        let first = old.last_request().unwrap();
        assert_eq!(first.extended_effort, None);
        assert_eq!(first.context["inputs"]["ticker"], "NVDA");
        assert_eq!(new.last_request().unwrap().extended_effort, Some(EffortLevel::High));
    }

    #[test]
    fn test_required_fields_validator() {
        let v = RequiredFields::new(["a", "b"]);
        let ok = CapabilityResponse { capability: "c".into(), content: json!({"a": 1, "b": ""}) };
        let missing = CapabilityResponse { capability: "c".into(), content: json!({"a": 1, "b": null}) };
        let text = CapabilityResponse { capability: "c".into(), content: json!("hi") };
        assert!(v.validate(&ok).is_ok());
        assert_eq!(v.validate(&missing).unwrap_err(), "missing fields: b");
        assert!(v.validate(&text).is_err());
    }
}
