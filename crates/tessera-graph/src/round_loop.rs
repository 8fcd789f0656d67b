use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::json;
use tracing::{debug, warn};

use tessera_core::error::{Result, TesseraError};
use tessera_core::types::RouteDecision;

use crate::builder::GraphBuilder;
use crate::router::{Barrier, Router};
use crate::stage::{Stage, StageContext, StageOutput};
use crate::state::{FieldUpdate, SharedState};

/// One side of a round-based exchange.
pub trait RoundRole: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Produce this role's argument for one round.
    fn contribute(&self, turn: RoundTurn, ctx: StageContext) -> BoxFuture<'_, Result<String>>;
}

/// What a role sees when it is asked to contribute.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundTurn {
    /// 1-based round number.
    pub round: usize,
    pub role: String,
    /// Combined text of every earlier round; empty in round 1.
    pub prior_context: String,
}

/// Bounded repeated fan-out/fan-in between two or more roles.
///
/// Rounds are unrolled into the graph up to a static ceiling. Every round
/// runs all roles in parallel, gates on a barrier, then syncs their
/// contributions into a combined context in role order. After the sync a
/// router either fans out the next round or jumps to that round's final
/// sync node, which assembles the full history. The effective number of
/// rounds can be read from a state field at run time and is capped by the
/// ceiling.
///
/// Node ids are `{name}.r{k}.{role}`, `{name}.r{k}.gate`, `{name}.r{k}.sync`
/// and `{name}.final.after_r{k}`.
pub struct RoundLoop {
    name: String,
    roles: Vec<Arc<dyn RoundRole>>,
    ceiling: usize,
    rounds_field: Option<String>,
    exit: Option<String>,
}

impl RoundLoop {
    pub fn new(name: impl Into<String>, roles: Vec<Arc<dyn RoundRole>>) -> Self {
        Self {
            name: name.into(),
            roles,
            ceiling: 1,
            rounds_field: None,
            exit: None,
        }
    }

    /// Number of rounds unrolled into the graph.
    pub fn max_rounds(mut self, ceiling: usize) -> Self {
        self.ceiling = ceiling;
        self
    }

    /// Read the effective round count from `field` at run time.
    pub fn rounds_from(mut self, field: impl Into<String>) -> Self {
        self.rounds_field = Some(field.into());
        self
    }

    /// Node every final sync continues at.
    pub fn exit_to(mut self, node: impl Into<String>) -> Self {
        self.exit = Some(node.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn role_names(&self) -> Vec<String> {
        self.roles.iter().map(|r| r.name().to_string()).collect()
    }

    pub fn role_node(&self, round: usize, role: &str) -> String {
        format!("{}.r{}.{}", self.name, round, role)
    }

    pub fn gate_node(&self, round: usize) -> String {
        format!("{}.r{}.gate", self.name, round)
    }

    pub fn sync_node(&self, round: usize) -> String {
        format!("{}.r{}.sync", self.name, round)
    }

    pub fn final_node(&self, round: usize) -> String {
        format!("{}.final.after_r{}", self.name, round)
    }

    /// Field holding one role's contribution for one round.
    pub fn contribution_field(&self, round: usize, role: &str) -> String {
        self.role_node(round, role)
    }

    /// Field holding the combined text of rounds `1..=round`.
    pub fn context_field(&self, round: usize) -> String {
        format!("{}.r{}.context", self.name, round)
    }

    pub fn history_field(&self) -> String {
        format!("{}.history", self.name)
    }

    pub fn history_text_field(&self) -> String {
        format!("{}.history_text", self.name)
    }

    pub fn argument_count_field(&self) -> String {
        format!("{}.argument_count", self.name)
    }

    pub fn rounds_completed_field(&self) -> String {
        format!("{}.rounds_completed", self.name)
    }

    /// Accumulating field every successful contribution is appended to.
    pub fn transcript_field(&self) -> String {
        format!("{}.transcript", self.name)
    }

    /// Round-1 role nodes; wire the upstream edge(s) to these.
    pub fn entry_nodes(&self) -> Vec<String> {
        self.roles.iter().map(|r| self.role_node(1, r.name())).collect()
    }

    /// Decision that starts the loop from a router.
    pub fn entry_decision(&self) -> RouteDecision {
        RouteDecision::FanOut(self.entry_nodes())
    }

    /// Unroll the loop into `builder`.
    pub fn install(&self, builder: &mut GraphBuilder) -> Result<()> {
        if self.roles.len() < 2 {
            return Err(TesseraError::InvalidGraph(format!(
                "round loop '{}' needs at least two roles",
                self.name
            )));
        }
        if self.ceiling == 0 {
            return Err(TesseraError::InvalidGraph(format!(
                "round loop '{}' must allow at least one round",
                self.name
            )));
        }

        let role_names = self.role_names();
        builder.accumulate(self.transcript_field());

        for round in 1..=self.ceiling {
            let fields: Vec<String> = role_names
                .iter()
                .map(|role| self.contribution_field(round, role))
                .collect();

            for role in &self.roles {
                let node = self.role_node(round, role.name());
                builder
                    .add_stage(
                        node.clone(),
                        RoleStage {
                            role: role.clone(),
                            round,
                            field: self.contribution_field(round, role.name()),
                            prior_field: (round > 1).then(|| self.context_field(round - 1)),
                            transcript_field: self.transcript_field(),
                        },
                        [self.contribution_field(round, role.name())],
                    )
                    .add_edge(node, self.gate_node(round));
            }

            builder.add_barrier(
                self.gate_node(round),
                Barrier::then(fields.clone(), self.sync_node(round)),
                [self.sync_node(round)],
            );

            builder.add_stage(
                self.sync_node(round),
                SyncStage {
                    round,
                    roles: role_names.clone(),
                    fields,
                    prior_field: (round > 1).then(|| self.context_field(round - 1)),
                    context_field: self.context_field(round),
                },
                [self.context_field(round)],
            );

            if round < self.ceiling {
                let next: Vec<String> = role_names
                    .iter()
                    .map(|role| self.role_node(round + 1, role))
                    .collect();
                let mut allowed = next.clone();
                allowed.push(self.final_node(round));
                builder.add_conditional_edges(
                    self.sync_node(round),
                    RoundRouter {
                        round,
                        ceiling: self.ceiling,
                        rounds_field: self.rounds_field.clone(),
                        next,
                        finish: self.final_node(round),
                    },
                    allowed,
                );
            } else {
                builder.add_edge(self.sync_node(round), self.final_node(round));
            }

            builder.add_stage(
                self.final_node(round),
                FinalSync {
                    rounds: round,
                    roles: role_names.clone(),
                    fields: (1..=round)
                        .map(|k| {
                            role_names
                                .iter()
                                .map(|role| self.contribution_field(k, role))
                                .collect()
                        })
                        .collect(),
                    history_field: self.history_field(),
                    history_text_field: self.history_text_field(),
                    argument_count_field: self.argument_count_field(),
                    rounds_completed_field: self.rounds_completed_field(),
                },
                [
                    self.history_field(),
                    self.history_text_field(),
                    self.argument_count_field(),
                    self.rounds_completed_field(),
                ],
            );
            if let Some(exit) = &self.exit {
                builder.add_edge(self.final_node(round), exit.clone());
            }
        }
        Ok(())
    }
}

/// Runs one role for one round. Never fails: an error from the role is
/// written as an empty degraded contribution.
struct RoleStage {
    role: Arc<dyn RoundRole>,
    round: usize,
    field: String,
    prior_field: Option<String>,
    transcript_field: String,
}

impl Stage for RoleStage {
    fn execute(&self, ctx: StageContext) -> BoxFuture<'_, Result<StageOutput>> {
        Box::pin(async move {
            let turn = RoundTurn {
                round: self.round,
                role: self.role.name().to_string(),
                prior_context: self
                    .prior_field
                    .as_deref()
                    .and_then(|f| ctx.get_str(f))
                    .unwrap_or_default()
                    .to_string(),
            };

            match self.role.contribute(turn, ctx.clone()).await {
                Ok(argument) => {
                    let mut out = StageOutput::new().set(self.field.clone(), json!(argument));
                    out.push(FieldUpdate::complete(
                        self.transcript_field.clone(),
                        json!({ "round": self.round, "role": self.role.name(), "argument": argument }),
                    ));
                    Ok(out)
                }
                Err(e) => {
                    warn!(
                        stage = %ctx.stage_id(),
                        round = self.round,
                        error = %e,
                        "Role failed, contributing an empty argument"
                    );
                    Ok(StageOutput::new().set_degraded(self.field.clone(), json!(""), e.to_string()))
                }
            }
        })
    }
}

/// Combines one round's contributions, in role order, with earlier rounds.
struct SyncStage {
    round: usize,
    roles: Vec<String>,
    fields: Vec<String>,
    prior_field: Option<String>,
    context_field: String,
}

impl Stage for SyncStage {
    fn execute(&self, ctx: StageContext) -> BoxFuture<'_, Result<StageOutput>> {
        Box::pin(async move {
            let mut lines: Vec<String> = self
                .prior_field
                .as_deref()
                .and_then(|f| ctx.get_str(f))
                .filter(|prior| !prior.is_empty())
                .map(|prior| vec![prior.to_string()])
                .unwrap_or_default();
            for (role, field) in self.roles.iter().zip(&self.fields) {
                lines.push(format_line(self.round, role, ctx.get_str(field).unwrap_or_default()));
            }
            Ok(StageOutput::new().set(self.context_field.clone(), json!(lines.join("\n"))))
        })
    }
}

/// Chooses between the next round and this round's final sync.
struct RoundRouter {
    round: usize,
    ceiling: usize,
    rounds_field: Option<String>,
    next: Vec<String>,
    finish: String,
}

impl RoundRouter {
    fn effective_rounds(&self, state: &SharedState) -> usize {
        let requested = self
            .rounds_field
            .as_deref()
            .and_then(|f| state.get(f))
            .and_then(|v| v.as_u64())
            .map(|n| n as usize)
            .unwrap_or(self.ceiling);
        requested.clamp(1, self.ceiling)
    }
}

impl Router for RoundRouter {
    fn route(&self, state: &SharedState) -> RouteDecision {
        let rounds = self.effective_rounds(state);
        if self.round < rounds {
            debug!(round = self.round, rounds, "Starting next round");
            RouteDecision::FanOut(self.next.clone())
        } else {
            RouteDecision::Single(self.finish.clone())
        }
    }
}

/// Assembles every completed round into the loop's history fields.
struct FinalSync {
    rounds: usize,
    roles: Vec<String>,
    /// Contribution fields per round, in role order.
    fields: Vec<Vec<String>>,
    history_field: String,
    history_text_field: String,
    argument_count_field: String,
    rounds_completed_field: String,
}

impl Stage for FinalSync {
    fn execute(&self, ctx: StageContext) -> BoxFuture<'_, Result<StageOutput>> {
        Box::pin(async move {
            let mut history = Vec::new();
            let mut lines = Vec::new();
            for (index, round_fields) in self.fields.iter().enumerate() {
                let round = index + 1;
                for (role, field) in self.roles.iter().zip(round_fields) {
                    let argument = ctx.get_str(field).unwrap_or_default();
                    lines.push(format_line(round, role, argument));
                    history.push(json!({ "round": round, "role": role, "argument": argument }));
                }
            }

            Ok(StageOutput::new()
                .set(self.argument_count_field.clone(), json!(history.len()))
                .set(self.history_field.clone(), json!(history))
                .set(self.history_text_field.clone(), json!(lines.join("\n")))
                .set(self.rounds_completed_field.clone(), json!(self.rounds)))
        })
    }
}

fn format_line(round: usize, role: &str, argument: &str) -> String {
    format!("[round {}] {}: {}", round, role, argument)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::Successors;
    use crate::executor::GraphExecutor;

    struct Echo(&'static str);

    impl RoundRole for Echo {
        fn name(&self) -> &str {
            self.0
        }

        fn contribute(&self, turn: RoundTurn, _ctx: StageContext) -> BoxFuture<'_, Result<String>> {
            Box::pin(async move { Ok(format!("{} says {}", self.0, turn.round)) })
        }
    }

    struct Broken;

    impl RoundRole for Broken {
        fn name(&self) -> &str {
            "broken"
        }

        fn contribute(&self, _turn: RoundTurn, ctx: StageContext) -> BoxFuture<'_, Result<String>> {
            Box::pin(async move { Err(TesseraError::stage(ctx.stage_id(), "no argument")) })
        }
    }

    fn debate(ceiling: usize) -> RoundLoop {
        RoundLoop::new(
            "debate",
            vec![
                Arc::new(Echo("bull")) as Arc<dyn RoundRole>,
                Arc::new(Echo("bear")) as Arc<dyn RoundRole>,
            ],
        )
        .max_rounds(ceiling)
        .rounds_from("rounds")
        .exit_to("end")
    }

    async fn run_debate(lp: &RoundLoop, rounds: u64) -> SharedState {
        let mut b = GraphBuilder::new();
        b.add_stage(
            "start",
            crate::stage::stage_fn(|_ctx| async { Ok(StageOutput::new()) }),
            Vec::<String>::new(),
        );
        for node in lp.entry_nodes() {
            b.add_edge("start", node);
        }
        b.add_terminal("end").set_entry("start");
        lp.install(&mut b).unwrap();
        GraphExecutor::new(b.build().unwrap())
            .run(SharedState::from_map([("rounds", json!(rounds))]))
            .await
            .unwrap()
            .state
    }

    #[test]
    fn test_node_naming() {
        let lp = debate(2);
        assert_eq!(lp.entry_nodes(), vec!["debate.r1.bull", "debate.r1.bear"]);
        assert_eq!(lp.gate_node(2), "debate.r2.gate");
        assert_eq!(lp.final_node(1), "debate.final.after_r1");
        assert_eq!(
            lp.entry_decision(),
            RouteDecision::fan_out(["debate.r1.bull", "debate.r1.bear"])
        );
    }

    #[test]
    fn test_install_unrolls_rounds() {
        let lp = debate(3);
        let mut b = GraphBuilder::new();
        b.add_terminal("end");
        lp.install(&mut b).unwrap();
        b.set_entry("debate.r1.bull");
        let graph = b.build().unwrap();

        // 3 rounds x (2 roles + gate + sync + final)
        assert_eq!(graph.len(), 1 + 3 * 5);
        assert!(matches!(graph.successors("debate.r1.sync"), Successors::Conditional(_)));
        assert!(matches!(graph.successors("debate.r3.sync"), Successors::Static(_)));
        assert!(graph.accumulating_fields().contains("debate.transcript"));
    }

    #[test]
    fn test_install_rejects_single_role() {
        let lp = RoundLoop::new("solo", vec![Arc::new(Echo("only")) as Arc<dyn RoundRole>]);
        let mut b = GraphBuilder::new();
        assert!(matches!(lp.install(&mut b), Err(TesseraError::InvalidGraph(_))));
    }

    #[test]
    fn test_effective_rounds_capped_by_ceiling() {
        let router = RoundRouter {
            round: 1,
            ceiling: 2,
            rounds_field: Some("rounds".into()),
            next: vec!["r2.a".into()],
            finish: "final".into(),
        };
        let many = SharedState::from_map([("rounds", json!(9))]);
        assert_eq!(router.effective_rounds(&many), 2);
        let zero = SharedState::from_map([("rounds", json!(0))]);
        assert_eq!(router.route(&zero), RouteDecision::single("final"));
        assert_eq!(router.effective_rounds(&SharedState::new()), 2);
    }

    #[tokio::test]
    async fn test_single_round_history() {
        let lp = debate(3);
        let state = run_debate(&lp, 1).await;

        let history = state.get("debate.history").unwrap().as_array().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(state.get("debate.argument_count"), Some(&json!(2)));
        assert_eq!(state.get("debate.rounds_completed"), Some(&json!(1)));
        assert!(state.get("debate.r2.bull").is_none());
    }

    #[tokio::test]
    async fn test_two_round_history_in_role_order() {
        let lp = debate(3);
        let state = run_debate(&lp, 2).await;

        assert_eq!(state.get("debate.argument_count"), Some(&json!(4)));
        assert_eq!(
            state.get_str("debate.history_text"),
            Some(
                "[round 1] bull: bull says 1\n[round 1] bear: bear says 1\n\
                 [round 2] bull: bull says 2\n[round 2] bear: bear says 2"
            )
        );
        let transcript = state.get("debate.transcript").unwrap().as_array().unwrap();
        assert_eq!(transcript.len(), 4);
    }

    #[tokio::test]
    async fn test_failed_role_contributes_degraded_empty_argument() {
        let lp = RoundLoop::new(
            "risk",
            vec![
                Arc::new(Echo("safe")) as Arc<dyn RoundRole>,
                Arc::new(Broken) as Arc<dyn RoundRole>,
            ],
        )
        .exit_to("end");
        let mut b = GraphBuilder::new();
        b.add_terminal("end");
        lp.install(&mut b).unwrap();
        b.add_stage(
            "start",
            crate::stage::stage_fn(|_ctx| async { Ok(StageOutput::new()) }),
            Vec::<String>::new(),
        );
        for node in lp.entry_nodes() {
            b.add_edge("start", node);
        }
        b.set_entry("start");
        let outcome = GraphExecutor::new(b.build().unwrap())
            .run(SharedState::new())
            .await
            .unwrap();

        assert_eq!(outcome.state.get("risk.argument_count"), Some(&json!(2)));
        assert_eq!(outcome.state.get_str("risk.r1.broken"), Some(""));
        assert!(!outcome.state.is_complete("risk.r1.broken"));
        assert_eq!(outcome.degraded, vec!["risk.r1.broken"]);
    }
}
