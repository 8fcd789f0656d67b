use std::time::Duration;

use serde_json::json;

use tessera_graph::{stage_fn, GraphBuilder, GraphExecutor, SharedState, Stage, StageContext, StageOutput};

fn racer(value: &'static str, delay_ms: u64) -> impl Stage {
    stage_fn(move |_ctx: StageContext| async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        Ok(StageOutput::new()
            .set("quote", json!(value))
            .set("log", json!(value)))
    })
}

#[tokio::test]
async fn slow_duplicate_does_not_clobber_first_write() {
    let mut b = GraphBuilder::new();
    b.add_stage("start", stage_fn(|_| async { Ok(StageOutput::new()) }), Vec::<String>::new())
        .add_stage("fast", racer("fast", 0), ["quote"])
        .add_stage("slow", racer("slow", 40), ["quote"])
        .add_edge("start", "fast")
        .add_edge("start", "slow")
        .accumulate("log")
        .set_entry("start");

    let outcome = GraphExecutor::new(b.build().unwrap())
        .run(SharedState::new())
        .await
        .unwrap();

    assert_eq!(outcome.state.get_str("quote"), Some("fast"));
    assert_eq!(outcome.state.entry("quote").unwrap().writer, "fast");
    assert_eq!(outcome.state.get("log"), Some(&json!(["fast", "slow"])));

    let slow = outcome
        .node_results
        .iter()
        .find(|r| r.node_id == "slow")
        .unwrap();
    assert_eq!(slow.rejected, vec!["quote"]);
    assert_eq!(slow.fields, vec!["log"]);
}

#[tokio::test]
async fn initial_inputs_are_write_once_too() {
    let mut b = GraphBuilder::new();
    b.add_stage("overwrite", racer("late", 0), ["quote"]).set_entry("overwrite");

    let outcome = GraphExecutor::new(b.build().unwrap())
        .run(SharedState::from_map([("quote", json!("given"))]))
        .await
        .unwrap();

    assert_eq!(outcome.state.get_str("quote"), Some("given"));
    assert_eq!(outcome.node_results[0].rejected, vec!["quote"]);
}
