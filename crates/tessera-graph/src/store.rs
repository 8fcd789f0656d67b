//! Run store actor.
//!
//! The shared state and the event log of one run live inside a single task.
//! Every mutation (field merge, request append, result append) arrives as a
//! command on one channel and is applied in arrival order, so concurrent
//! stages never interleave partial writes and never lock anything.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use tessera_core::error::{Result, TesseraError};
use tessera_core::types::{ActionRequest, ActionResult, Event};

use crate::log::EventLog;
use crate::state::{ApplyReport, SharedState, StatePatch};

const COMMAND_BUFFER: usize = 256;

enum Command {
    Apply {
        patch: StatePatch,
        reply: oneshot::Sender<ApplyReport>,
    },
    Snapshot {
        reply: oneshot::Sender<SharedState>,
    },
    RequestActions {
        producer: String,
        actions: Vec<ActionRequest>,
        reply: oneshot::Sender<u64>,
    },
    LatestRequest {
        producer: String,
        recognized: Vec<String>,
        reply: oneshot::Sender<Option<Event>>,
    },
    ExistingResult {
        request_id: String,
        reply: oneshot::Sender<Option<ActionResult>>,
    },
    RecordResults {
        results: Vec<ActionResult>,
        reply: oneshot::Sender<()>,
    },
    ResultsFor {
        producer: String,
        reply: oneshot::Sender<Vec<ActionResult>>,
    },
    Finish {
        reply: oneshot::Sender<(SharedState, EventLog)>,
    },
}

/// Owner of one run's state and event log.
pub struct RunStore {
    state: SharedState,
    log: EventLog,
}

impl RunStore {
    pub fn new(state: SharedState) -> Self {
        Self {
            state,
            log: EventLog::new(),
        }
    }

    /// Move the store into its own task and return a handle to it.
    pub fn spawn(self) -> RunHandle {
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        tokio::spawn(self.serve(rx));
        RunHandle { tx }
    }

    async fn serve(mut self, mut rx: mpsc::Receiver<Command>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Apply { patch, reply } => {
                    let report = self.state.apply(&patch);
                    let _ = reply.send(report);
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.state.clone());
                }
                Command::RequestActions {
                    producer,
                    actions,
                    reply,
                } => {
                    let id = self.log.request_actions(&producer, actions);
                    let _ = reply.send(id);
                }
                Command::LatestRequest {
                    producer,
                    recognized,
                    reply,
                } => {
                    let event = self.log.latest_request(&producer, &recognized).cloned();
                    let _ = reply.send(event);
                }
                Command::ExistingResult { request_id, reply } => {
                    let _ = reply.send(self.log.result_for_request(&request_id).cloned());
                }
                Command::RecordResults { results, reply } => {
                    for result in results {
                        self.log.record_result(result);
                    }
                    let _ = reply.send(());
                }
                Command::ResultsFor { producer, reply } => {
                    let results = self
                        .log
                        .results_for(&producer)
                        .into_iter()
                        .cloned()
                        .collect();
                    let _ = reply.send(results);
                }
                Command::Finish { reply } => {
                    let _ = reply.send((self.state, self.log));
                    debug!("Run store finished");
                    return;
                }
            }
        }
        debug!("All run handles dropped, run store stopping");
    }
}

/// Cloneable handle to a running `RunStore`.
#[derive(Clone)]
pub struct RunHandle {
    tx: mpsc::Sender<Command>,
}

impl RunHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| TesseraError::StoreClosed)?;
        rx.await.map_err(|_| TesseraError::StoreClosed)
    }

    /// Merge a stage's field updates.
    pub async fn apply(&self, patch: StatePatch) -> Result<ApplyReport> {
        self.call(|reply| Command::Apply { patch, reply }).await
    }

    /// Copy of the current state.
    pub async fn snapshot(&self) -> Result<SharedState> {
        self.call(|reply| Command::Snapshot { reply }).await
    }

    pub async fn request_actions(
        &self,
        producer: impl Into<String>,
        actions: Vec<ActionRequest>,
    ) -> Result<u64> {
        let producer = producer.into();
        self.call(|reply| Command::RequestActions {
            producer,
            actions,
            reply,
        })
        .await
    }

    pub async fn latest_request(
        &self,
        producer: impl Into<String>,
        recognized: Vec<String>,
    ) -> Result<Option<Event>> {
        let producer = producer.into();
        self.call(|reply| Command::LatestRequest {
            producer,
            recognized,
            reply,
        })
        .await
    }

    pub async fn existing_result(&self, request_id: impl Into<String>) -> Result<Option<ActionResult>> {
        let request_id = request_id.into();
        self.call(|reply| Command::ExistingResult { request_id, reply })
            .await
    }

    pub async fn record_results(&self, results: Vec<ActionResult>) -> Result<()> {
        self.call(|reply| Command::RecordResults { results, reply })
            .await
    }

    pub async fn results_for(&self, producer: impl Into<String>) -> Result<Vec<ActionResult>> {
        let producer = producer.into();
        self.call(|reply| Command::ResultsFor { producer, reply })
            .await
    }

    /// Stop the store and take back the final state and log.
    pub async fn finish(&self) -> Result<(SharedState, EventLog)> {
        self.call(|reply| Command::Finish { reply }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FieldUpdate;
    use serde_json::json;

    #[tokio::test]
    async fn test_concurrent_writers_serialize() {
        let handle = RunStore::new(SharedState::new()).spawn();

        let mut tasks = Vec::new();
        for i in 0..16 {
            let h = handle.clone();
            tasks.push(tokio::spawn(async move {
                h.apply(StatePatch {
                    producer: format!("w{}", i),
                    updates: vec![
                        FieldUpdate::complete("shared", json!(i)),
                        FieldUpdate::complete(format!("own_{}", i), json!(i)),
                    ],
                })
                .await
                .unwrap()
            }));
        }
        let reports = futures::future::join_all(tasks).await;
        let accepted = reports
            .into_iter()
            .map(|r| r.unwrap())
            .filter(|r| r.rejected.is_empty())
            .count();

        let (state, _) = handle.finish().await.unwrap();
        assert_eq!(accepted, 1);
        assert_eq!(state.len(), 17);
        let writer = &state.entry("shared").unwrap().writer;
        let own = format!("own_{}", &writer[1..]);
        assert!(state.is_settled(&own));
    }

    #[tokio::test]
    async fn test_finish_closes_store() {
        let handle = RunStore::new(SharedState::new()).spawn();
        handle.finish().await.unwrap();
        assert!(matches!(
            handle.snapshot().await,
            Err(TesseraError::StoreClosed)
        ));
    }

    #[tokio::test]
    async fn test_request_and_result_round_trip_through_handle() {
        let handle = RunStore::new(SharedState::new()).spawn();
        let req = ActionRequest::new("fetch-news");
        handle.request_actions("news", vec![req.clone()]).await.unwrap();

        let found = handle
            .latest_request("news", vec!["fetch-news".into()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.requested_actions()[0].id, req.id);
        assert!(handle.existing_result(&req.id).await.unwrap().is_none());
    }
}
