use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tessera_core::event::EventBus;
use tessera_core::types::{BranchToken, GraphEvent, RunId};

/// JSONL run logger.
///
/// Subscribes to the executor's `EventBus` and appends one JSON object per
/// line to `{log_dir}/{run_id}/{timestamp}.jsonl`. Lines already written
/// survive a crash mid-run.
///
/// `level` controls verbosity: 1 = run summary, 2 = per stage,
/// 3 = per routing decision.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

#[derive(Debug, Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    branch: Option<BranchToken>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and write in a background task.
    ///
    /// Subscribing before the run starts guarantees the `run_started` line
    /// is captured. The task returns the log file path once it stops.
    pub fn spawn(
        self,
        event_bus: &EventBus,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> JoinHandle<Option<PathBuf>> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, run_id, cancel))
    }

    /// Write entries until cancellation, `RunComplete`, or the bus closing.
    pub async fn run(
        self,
        mut rx: broadcast::Receiver<GraphEvent>,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        let run_dir = self.log_dir.join(&run_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, path = %run_dir.display(), "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));
        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), level = self.level, "Run logger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Run logger cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => event,
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Run logger lagged, skipped events");
                        continue;
                    }
                    Err(RecvError::Closed) => {
                        debug!("Event bus closed, run logger stopping");
                        break;
                    }
                },
            };

            if let Some(entry) = self.entry_for(&run_id, &event) {
                match serde_json::to_string(&entry) {
                    Ok(line) => {
                        if let Err(e) = writer.write_all(format!("{}\n", line).as_bytes()).await {
                            error!(error = %e, "Failed to write log entry");
                            break;
                        }
                        if let Err(e) = writer.flush().await {
                            error!(error = %e, "Failed to flush log");
                        }
                    }
                    Err(e) => error!(error = %e, "Failed to serialize log entry"),
                }
            }

            if matches!(event, GraphEvent::RunComplete { .. }) {
                break;
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "Run logger finished");
        Some(log_path)
    }

    /// Map an event to a log line, or `None` when filtered out by level.
    fn entry_for(&self, run_id: &RunId, event: &GraphEvent) -> Option<LogEntry> {
        let (min_level, event_type, node_id, branch, detail) = match event {
            GraphEvent::RunStarted { entry, .. } => {
                (1, "run_started", None, None, Some(json!({ "entry": entry })))
            }
            GraphEvent::RunComplete {
                branches,
                elapsed_ms,
                ..
            } => (
                1,
                "run_complete",
                None,
                None,
                Some(json!({ "branches": branches, "elapsed_ms": elapsed_ms })),
            ),
            // Failures are part of the summary.
            GraphEvent::StageFailed {
                node_id,
                branch,
                error,
            } => (
                1,
                "stage_failed",
                Some(node_id),
                Some(*branch),
                Some(json!({ "error": error })),
            ),
            GraphEvent::StageStarted { node_id, branch } => {
                (2, "stage_started", Some(node_id), Some(*branch), None)
            }
            GraphEvent::StageCompleted {
                node_id,
                branch,
                elapsed_ms,
                fields,
            } => (
                2,
                "stage_completed",
                Some(node_id),
                Some(*branch),
                Some(json!({ "elapsed_ms": elapsed_ms, "fields": fields })),
            ),
            GraphEvent::RouteDecided {
                node_id,
                branch,
                decision,
            } => (
                3,
                "route_decided",
                Some(node_id),
                Some(*branch),
                Some(json!({ "decision": decision })),
            ),
            GraphEvent::BranchHalted { node_id, branch } => {
                (3, "branch_halted", Some(node_id), Some(*branch), None)
            }
        };

        if self.level < min_level {
            return None;
        }
        Some(LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: run_id.0.clone(),
            event_type,
            node_id: node_id.cloned(),
            branch,
            detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::types::RouteDecision;

    fn run_id() -> RunId {
        RunId::from("run-1")
    }

    #[test]
    fn test_entry_skips_empty_fields() {
        let logger = RunLogger::new(PathBuf::from("/tmp"), 2);
        let entry = logger
            .entry_for(
                &run_id(),
                &GraphEvent::StageStarted {
                    node_id: "screen".into(),
                    branch: BranchToken(3),
                },
            )
            .unwrap();
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"event_type\":\"stage_started\""));
        assert!(line.contains("\"branch\":3"));
        assert!(!line.contains("detail"));
    }

    #[test]
    fn test_level_filtering() {
        let started = GraphEvent::StageStarted {
            node_id: "a".into(),
            branch: BranchToken(0),
        };
        let routed = GraphEvent::RouteDecided {
            node_id: "a".into(),
            branch: BranchToken(0),
            decision: RouteDecision::Halt,
        };
        let failed = GraphEvent::StageFailed {
            node_id: "a".into(),
            branch: BranchToken(0),
            error: "boom".into(),
        };

        let summary = RunLogger::new(PathBuf::from("/tmp"), 1);
        assert!(summary.entry_for(&run_id(), &failed).is_some());
        assert!(summary.entry_for(&run_id(), &started).is_none());
        assert!(summary.entry_for(&run_id(), &routed).is_none());

        let stages = RunLogger::new(PathBuf::from("/tmp"), 2);
        assert!(stages.entry_for(&run_id(), &started).is_some());
        assert!(stages.entry_for(&run_id(), &routed).is_none());

        let verbose = RunLogger::new(PathBuf::from("/tmp"), 3);
        assert!(verbose.entry_for(&run_id(), &routed).is_some());
    }

    #[tokio::test]
    async fn test_writes_jsonl_until_run_complete() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let handle = RunLogger::new(dir.path().to_path_buf(), 1).spawn(
            &bus,
            run_id(),
            CancellationToken::new(),
        );

        bus.publish(GraphEvent::RunStarted {
            run_id: run_id(),
            entry: "screen".into(),
        });
        bus.publish(GraphEvent::StageStarted {
            node_id: "screen".into(),
            branch: BranchToken(0),
        });
        bus.publish(GraphEvent::RunComplete {
            run_id: run_id(),
            branches: 1,
            elapsed_ms: 5,
        });

        let path = handle.await.unwrap().unwrap();
        assert!(path.starts_with(dir.path().join("run-1")));
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("run_started"));
        assert!(lines[1].contains("run_complete"));
    }

    #[tokio::test]
    async fn test_cancellation_stops_logger() {
        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new(16);
        let cancel = CancellationToken::new();
        let handle = RunLogger::new(dir.path().to_path_buf(), 3).spawn(&bus, run_id(), cancel.clone());
        cancel.cancel();
        assert!(handle.await.unwrap().is_some());
    }
}
