//! The bundled research pipeline.
//!
//! screen ─┬─> market/news/fundamentals analysts ─> analysts.gate ─> debate
//!         │     ─> research_manager ─> trader ─> risk ─> portfolio_manager
//!         │     ─> report ─> publish ─> end
//!         └─> report_bypass ─> publish

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};
use tracing::debug;

use tessera_core::config::PipelineConfig;
use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::Capability;
use tessera_core::types::{ActionRequest, CapabilityRequest, EffortLevel, RouteDecision};
use tessera_graph::{
    router_fn, stage_fn, Barrier, CapabilityStage, Graph, GraphBuilder, RequiredFields,
    RoundLoop, RoundRole, RoundTurn, SharedState, Stage, StageContext, StageOutput,
};

use crate::offline::FETCH_DATA;

/// Analyst node ids, their data topics and report fields.
pub const ANALYSTS: [(&str, &str, &str); 3] = [
    ("market_analyst", "prices", "market_report"),
    ("news_analyst", "headlines", "news_report"),
    ("fundamentals_analyst", "financials", "fundamentals_report"),
];

const ANALYST_GATE: &str = "analysts.gate";

/// Model tiers wired into the pipeline.
#[derive(Clone)]
pub struct Models {
    pub quick: Arc<dyn Capability>,
    pub deep: Arc<dyn Capability>,
}

/// Initial state for one run.
pub fn inputs(
    ticker: &str,
    trade_date: &str,
    debate_rounds: usize,
    risk_rounds: usize,
) -> SharedState {
    SharedState::from_map([
        ("ticker", json!(ticker)),
        ("trade_date", json!(trade_date)),
        ("max_debate_rounds", json!(debate_rounds)),
        ("max_risk_rounds", json!(risk_rounds)),
    ])
}

pub fn debate_loop(config: &PipelineConfig, models: &Models) -> RoundLoop {
    let reports: Vec<String> = ANALYSTS.iter().map(|(_, _, f)| f.to_string()).collect();
    RoundLoop::new(
        "debate",
        vec![
            ModelRole::new("bull", "Argue for taking a long position.", &models.quick, &reports),
            ModelRole::new("bear", "Argue against taking a long position.", &models.quick, &reports),
        ],
    )
    .max_rounds(config.round_ceiling)
    .rounds_from("max_debate_rounds")
    .exit_to("research_manager")
}

pub fn risk_loop(config: &PipelineConfig, models: &Models) -> RoundLoop {
    let plan = vec!["trade_plan".to_string()];
    RoundLoop::new(
        "risk",
        vec![
            ModelRole::new("aggressive", "Push for upside.", &models.quick, &plan),
            ModelRole::new("conservative", "Protect capital.", &models.quick, &plan),
            ModelRole::new("neutral", "Weigh both sides.", &models.quick, &plan),
        ],
    )
    .max_rounds(config.round_ceiling)
    .rounds_from("max_risk_rounds")
    .exit_to("portfolio_manager")
}

/// Build the full pipeline graph.
pub fn build(config: &PipelineConfig, models: &Models) -> Result<Graph> {
    let debate = debate_loop(config, models);
    let risk = risk_loop(config, models);
    let mut b = GraphBuilder::new();

    b.add_stage("screen", stage_fn(screen), ["screening"]);
    let mut screen_targets: Vec<&str> = ANALYSTS.iter().map(|(node, _, _)| *node).collect();
    screen_targets.push("report_bypass");
    b.add_conditional_edges("screen", router_fn(route_screening), screen_targets);

    for (node, topic, field) in ANALYSTS {
        b.add_stage(node, Analyst::new(topic, field, &models.quick), [field])
            .add_edge(node, ANALYST_GATE);
    }
    let reports = ANALYSTS.iter().map(|(_, _, field)| *field);
    let start_debate = debate.entry_decision();
    b.add_barrier(
        ANALYST_GATE,
        Barrier::new(reports, router_fn(move |_| start_debate.clone())),
        debate.entry_nodes(),
    );
    debate.install(&mut b)?;

    let mut manager_inputs: Vec<String> = vec!["ticker".into(), debate.history_text_field()];
    manager_inputs.extend(ANALYSTS.iter().map(|(_, _, f)| f.to_string()));
    b.add_stage(
        "research_manager",
        CapabilityStage::new(models.quick.clone(), "investment_plan")
            .with_fallback(models.deep.clone())
            .with_validator(RequiredFields::new(["recommendation", "rationale"]))
            .with_inputs(manager_inputs)
            .with_instructions("Judge the debate and state a recommendation with rationale."),
        ["investment_plan"],
    )
    .add_edge("research_manager", "trader");

    b.add_stage(
        "trader",
        CapabilityStage::new(models.quick.clone(), "trade_plan")
            .with_fallback(models.deep.clone())
            .with_validator(RequiredFields::new(["action", "size"]))
            .with_extended_effort(EffortLevel::High, Arc::new(|v: &str| v.starts_with('2')))
            .with_inputs(["ticker", "trade_date", "investment_plan"])
            .with_instructions("Turn the investment plan into a concrete trade."),
        ["trade_plan"],
    );
    for node in risk.entry_nodes() {
        b.add_edge("trader", node);
    }
    risk.install(&mut b)?;

    b.add_stage(
        "portfolio_manager",
        CapabilityStage::new(models.quick.clone(), "final_decision")
            .with_fallback(models.deep.clone())
            .with_validator(RequiredFields::new(["decision"]))
            .with_inputs([
                "ticker".to_string(),
                "investment_plan".to_string(),
                "trade_plan".to_string(),
                risk.history_text_field(),
            ])
            .with_instructions("Make the final call."),
        ["final_decision"],
    )
    .add_edge("portfolio_manager", "report");

    b.add_stage("report", stage_fn(report), ["report"])
        .add_stage("report_bypass", stage_fn(report_bypass), ["report"])
        .add_stage("publish", stage_fn(publish), ["published"])
        .add_terminal("end")
        .add_edge("report", "publish")
        .add_edge("report_bypass", "publish")
        .add_edge("publish", "end")
        .set_entry("screen");

    b.build()
}

/// Reject tickers that cannot be looked up.
async fn screen(ctx: StageContext) -> Result<StageOutput> {
    let ticker = ctx.get_str("ticker").unwrap_or_default();
    let valid = (1..=5).contains(&ticker.len()) && ticker.chars().all(|c| c.is_ascii_uppercase());
    let screening = if valid {
        json!({ "verdict": "pass" })
    } else {
        json!({ "verdict": "reject", "reason": format!("'{}' is not a listed symbol", ticker) })
    };
    Ok(StageOutput::new().set("screening", screening))
}

fn route_screening(state: &SharedState) -> RouteDecision {
    match state.get("screening").and_then(|s| s["verdict"].as_str()) {
        Some("pass") => RouteDecision::fan_out(ANALYSTS.iter().map(|(node, _, _)| *node)),
        _ => RouteDecision::single("report_bypass"),
    }
}

/// Fetches data for one topic and asks the model for a report.
struct Analyst {
    topic: &'static str,
    field: &'static str,
    model: Arc<dyn Capability>,
}

impl Analyst {
    fn new(topic: &'static str, field: &'static str, model: &Arc<dyn Capability>) -> Self {
        Self {
            topic,
            field,
            model: model.clone(),
        }
    }
}

impl Stage for Analyst {
    fn execute(&self, ctx: StageContext) -> BoxFuture<'_, Result<StageOutput>> {
        Box::pin(async move {
            let ticker = ctx.get_str("ticker").unwrap_or_default().to_string();
            ctx.request_actions(vec![ActionRequest::new(FETCH_DATA)
                .with_arg("ticker", json!(ticker))
                .with_arg("topic", json!(self.topic))])
                .await?;
            let data: Vec<Value> = ctx
                .run_actions(&[FETCH_DATA])
                .await?
                .iter()
                .filter_map(|r| r.payload().cloned())
                .collect();
            debug!(stage = %ctx.stage_id(), topic = self.topic, points = data.len(), "Fetched data");

            let response = self
                .model
                .invoke(CapabilityRequest {
                    stage_id: ctx.stage_id().to_string(),
                    context: json!({
                        "instructions": format!("Summarize the {} for {}.", self.topic, ticker),
                        "inputs": { "ticker": ticker, "data": data },
                    }),
                    extended_effort: None,
                })
                .await?;
            Ok(StageOutput::new().set(self.field, response.content))
        })
    }
}

/// Round participant backed by a model.
struct ModelRole {
    name: &'static str,
    stance: &'static str,
    model: Arc<dyn Capability>,
    inputs: Vec<String>,
}

impl ModelRole {
    fn new(
        name: &'static str,
        stance: &'static str,
        model: &Arc<dyn Capability>,
        inputs: &[String],
    ) -> Arc<dyn RoundRole> {
        Arc::new(Self {
            name,
            stance,
            model: model.clone(),
            inputs: inputs.to_vec(),
        })
    }
}

impl RoundRole for ModelRole {
    fn name(&self) -> &str {
        self.name
    }

    fn contribute(&self, turn: RoundTurn, ctx: StageContext) -> BoxFuture<'_, Result<String>> {
        Box::pin(async move {
            let mut inputs = Map::new();
            if let Some(ticker) = ctx.get("ticker") {
                inputs.insert("ticker".into(), ticker.clone());
            }
            for field in &self.inputs {
                if let Some(value) = ctx.get(field) {
                    inputs.insert(field.clone(), value.clone());
                }
            }
            let response = self
                .model
                .invoke(CapabilityRequest {
                    stage_id: ctx.stage_id().to_string(),
                    context: json!({
                        "instructions": self.stance,
                        "round": turn.round,
                        "prior_context": turn.prior_context,
                        "inputs": inputs,
                    }),
                    extended_effort: None,
                })
                .await?;
            Ok(match response.content {
                Value::String(text) => text,
                other => other.to_string(),
            })
        })
    }
}

async fn report(ctx: StageContext) -> Result<StageOutput> {
    let ticker = ctx.get_str("ticker").unwrap_or_default();
    let decision = ctx
        .get("final_decision")
        .and_then(|d| d["decision"].as_str())
        .unwrap_or("UNDECIDED");

    let mut lines = vec![format!("{}: {}", ticker, decision)];
    for field in ["investment_plan", "trade_plan"] {
        if let Some(value) = ctx.get(field).filter(|v| !v.is_null()) {
            lines.push(format!("{}: {}", field, value));
        }
    }
    let degraded: Vec<&str> = ctx
        .state()
        .degraded_fields()
        .into_iter()
        .map(|(field, _)| field)
        .collect();
    if !degraded.is_empty() {
        lines.push(format!("degraded: {}", degraded.join(", ")));
    }
    Ok(StageOutput::new().set("report", json!(lines.join("\n"))))
}

async fn report_bypass(ctx: StageContext) -> Result<StageOutput> {
    let reason = ctx
        .get("screening")
        .and_then(|s| s["reason"].as_str())
        .ok_or_else(|| TesseraError::stage(ctx.stage_id(), "screening verdict has no reason"))?;
    Ok(StageOutput::new().set("report", json!(format!("skipped: {}", reason))))
}

async fn publish(ctx: StageContext) -> Result<StageOutput> {
    let report = ctx
        .get_str("report")
        .ok_or_else(|| TesseraError::stage(ctx.stage_id(), "nothing to publish"))?;
    Ok(StageOutput::new().set(
        "published",
        json!({
            "ticker": ctx.get_str("ticker"),
            "report": report,
            "published_at": chrono::Utc::now().to_rfc3339(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::offline::{data_actions, OfflineModel};
    use tessera_core::config::EngineConfig;
    use tessera_core::types::{FieldStatus, OperatingMode};
    use tessera_graph::{GraphExecutor, RunOptions};

    fn models() -> Models {
        Models {
            quick: Arc::new(OfflineModel::fast()),
            deep: Arc::new(OfflineModel::deep()),
        }
    }

    fn executor(mode: OperatingMode) -> GraphExecutor {
        let graph = build(&PipelineConfig::default(), &models()).unwrap();
        let engine = EngineConfig {
            mode,
            ..EngineConfig::default()
        };
        GraphExecutor::new(graph)
            .with_actions(data_actions())
            .with_options(RunOptions::from(&engine))
    }

    #[tokio::test]
    async fn test_full_run_publishes_a_decision() {
        let outcome = executor(OperatingMode::Standard)
            .run(inputs("NVDA", "2026-10-19", 2, 1))
            .await
            .unwrap();

        assert!(outcome.is_clean(), "missing {:?}", outcome.missing);
        assert_eq!(outcome.runs_of("analysts.gate"), 1);
        assert_eq!(outcome.halted_at("analysts.gate"), 2);
        assert_eq!(outcome.runs_of("publish"), 1);
        assert_eq!(outcome.state.get("debate.argument_count"), Some(&json!(4)));
        assert_eq!(outcome.state.get("risk.argument_count"), Some(&json!(3)));
        // The quick tier omits the size, so the trader escalates to the deep tier.
        assert_eq!(outcome.state.get("trade_plan").unwrap()["effort"], "high");
        assert!(outcome.state.get("published").unwrap()["report"]
            .as_str()
            .unwrap()
            .starts_with("NVDA: "));
    }

    #[tokio::test]
    async fn test_low_latency_run_degrades_trade_plan() {
        let outcome = executor(OperatingMode::LowLatency)
            .run(inputs("NVDA", "2026-10-19", 1, 1))
            .await
            .unwrap();

        assert!(matches!(
            outcome.state.status("trade_plan"),
            Some(FieldStatus::Degraded { .. })
        ));
        assert_eq!(outcome.degraded, vec!["trade_plan"]);
        assert!(outcome.state.get_str("report").unwrap().contains("degraded: trade_plan"));
    }

    #[tokio::test]
    async fn test_rejected_ticker_takes_bypass() {
        let outcome = executor(OperatingMode::Standard)
            .run(inputs("not-a-ticker", "2026-10-19", 1, 1))
            .await
            .unwrap();

        assert_eq!(outcome.runs_of("market_analyst"), 0);
        assert_eq!(outcome.runs_of("report_bypass"), 1);
        assert_eq!(outcome.runs_of("publish"), 1);
        assert!(outcome
            .state
            .get_str("report")
            .unwrap()
            .starts_with("skipped: "));
    }

    #[test]
    fn test_graph_has_every_round_unrolled() {
        let graph = build(&PipelineConfig::default(), &models()).unwrap();
        for node in ["debate.r3.bear", "risk.final.after_r3", "analysts.gate", "end"] {
            assert!(graph.node(node).is_some(), "missing node {}", node);
        }
    }
}
