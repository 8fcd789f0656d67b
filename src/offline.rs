//! Deterministic stand-ins for the model and data services the pipeline
//! talks to, so the binary runs without network access.

use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Map, Value};

use tessera_core::error::{Result, TesseraError};
use tessera_core::traits::{Action, Capability};
use tessera_core::types::{CapabilityRequest, CapabilityResponse};
use tessera_graph::ActionRegistry;

/// Name of the data action every analyst requests.
pub const FETCH_DATA: &str = "fetch_data";

/// Stable pseudo-signal in `-50..50` derived from a seed string.
pub fn signal(seed: &str) -> i64 {
    let h = seed
        .bytes()
        .fold(17u64, |acc, b| acc.wrapping_mul(31).wrapping_add(b as u64));
    (h % 100) as i64 - 50
}

/// Offline text model.
///
/// The fast tier answers trade proposals without a position size, which
/// fails structural validation and exercises fallback escalation. The deep
/// tier always answers in full and reports a version that accepts the
/// extended-effort parameter.
pub struct OfflineModel {
    name: &'static str,
    version: &'static str,
    thorough: bool,
}

impl OfflineModel {
    pub fn fast() -> Self {
        Self {
            name: "offline-fast",
            version: "1.4",
            thorough: false,
        }
    }

    pub fn deep() -> Self {
        Self {
            name: "offline-deep",
            version: "2.0",
            thorough: true,
        }
    }

    fn answer(&self, task: &str, ticker: &str, request: &CapabilityRequest) -> Value {
        let net = signal(ticker);
        let stance = match net {
            n if n > 10 => "buy",
            n if n < -10 => "sell",
            _ => "hold",
        };

        let mut content = match task {
            "market_analyst" | "news_analyst" | "fundamentals_analyst" => {
                let s = signal(&format!("{}:{}", ticker, task));
                let points = request.context["inputs"]["data"]
                    .as_array()
                    .map_or(0, |d| d.len());
                json!({
                    "summary": format!("{} reads {} at {:+} from {} data points", task, ticker, s, points),
                    "signal": s,
                })
            }
            "research_manager" => json!({
                "recommendation": stance,
                "rationale": format!("Debate leans {} on {} (net {:+})", stance, ticker, net),
            }),
            "trader" if self.thorough => json!({
                "action": stance,
                "size": (net.unsigned_abs() * 10).max(10),
            }),
            "trader" => json!({ "action": stance }),
            "portfolio_manager" => json!({
                "decision": stance.to_uppercase(),
                "confidence": (50 + net.abs()) as f64 / 100.0,
            }),
            role => {
                let round = request.context["round"].as_u64().unwrap_or(1);
                return json!(format!(
                    "{} on {} (round {}): position {:+} looks {}",
                    role,
                    ticker,
                    round,
                    signal(&format!("{}:{}:{}", ticker, role, round)),
                    if self.thorough { "well supported" } else { "plausible" }
                ));
            }
        };

        if let (Some(effort), Some(object)) = (request.extended_effort, content.as_object_mut()) {
            object.insert("effort".into(), json!(effort));
        }
        content
    }
}

impl Capability for OfflineModel {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> &str {
        self.version
    }

    fn invoke(&self, request: CapabilityRequest) -> BoxFuture<'_, Result<CapabilityResponse>> {
        Box::pin(async move {
            let ticker = request.context["inputs"]["ticker"]
                .as_str()
                .ok_or_else(|| TesseraError::capability(self.name, "request has no ticker"))?
                .to_string();
            let task = request
                .stage_id
                .rsplit('.')
                .next()
                .unwrap_or(&request.stage_id)
                .to_string();

            // Simulated latency varies per task so branches finish out of order.
            let pause = 5 + signal(&task).unsigned_abs() % 20;
            tokio::time::sleep(Duration::from_millis(pause)).await;

            Ok(CapabilityResponse {
                capability: self.name.to_string(),
                content: self.answer(&task, &ticker, &request),
            })
        })
    }
}

/// Synthetic market data feed.
pub struct DataFeed;

impl Action for DataFeed {
    fn name(&self) -> &str {
        FETCH_DATA
    }

    fn description(&self) -> &str {
        "Fetch synthetic market data for a ticker and topic"
    }

    fn timeout_secs(&self) -> u64 {
        5
    }

    fn execute(&self, args: Map<String, Value>) -> BoxFuture<'_, Result<Value>> {
        Box::pin(async move {
            let ticker = args.get("ticker").and_then(Value::as_str).unwrap_or_default();
            let topic = args.get("topic").and_then(Value::as_str).unwrap_or_default();
            if ticker.is_empty() || topic.is_empty() {
                return Err(TesseraError::ActionExecution {
                    action: FETCH_DATA.to_string(),
                    message: "ticker and topic are required".to_string(),
                });
            }
            let points: Vec<i64> = (0..4)
                .map(|i| signal(&format!("{}:{}:{}", ticker, topic, i)))
                .collect();
            Ok(json!({ "ticker": ticker, "topic": topic, "points": points }))
        })
    }
}

pub fn data_actions() -> ActionRegistry {
    let mut registry = ActionRegistry::new();
    registry.register(DataFeed);
    registry
}
