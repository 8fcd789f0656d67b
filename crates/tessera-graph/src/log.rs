use std::collections::HashMap;

use chrono::Utc;

use tessera_core::types::{ActionRequest, ActionResult, Event, EventPayload};

/// Append-only, provenance-tagged event log.
///
/// Besides the ordered entries, the log keeps a per-producer index so the
/// most recent events of one stage are found without scanning siblings, and
/// a request-id index so answered requests can be recognized.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Vec<Event>,
    by_producer: HashMap<String, Vec<usize>>,
    results_by_request: HashMap<String, usize>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn append(&mut self, producer_tag: &str, payload: EventPayload) -> u64 {
        let idx = self.events.len();
        if let EventPayload::ActionCompleted { result } = &payload {
            self.results_by_request
                .insert(result.action_request_id.clone(), idx);
        }
        self.events.push(Event {
            id: idx as u64,
            producer_tag: producer_tag.to_string(),
            payload,
            timestamp: Utc::now(),
        });
        self.by_producer
            .entry(producer_tag.to_string())
            .or_default()
            .push(idx);
        idx as u64
    }

    /// Record a batch of action requests emitted by a stage.
    pub fn request_actions(&mut self, producer_tag: &str, actions: Vec<ActionRequest>) -> u64 {
        self.append(producer_tag, EventPayload::ActionsRequested { actions })
    }

    /// Record an action result under the producer tag it carries.
    pub fn record_result(&mut self, result: ActionResult) -> u64 {
        let producer = result.producer_tag.clone();
        self.append(&producer, EventPayload::ActionCompleted { result })
    }

    /// Most recent event of any kind appended by `producer_tag`.
    pub fn latest_for(&self, producer_tag: &str) -> Option<&Event> {
        self.by_producer
            .get(producer_tag)
            .and_then(|idxs| idxs.last())
            .map(|&i| &self.events[i])
    }

    /// Newest request event by `producer_tag` that asks for at least one of
    /// the `recognized` actions.
    ///
    /// Only the producer's own entries are inspected, so a more recent
    /// same-named request from a sibling stage is never selected.
    pub fn latest_request<S: AsRef<str>>(
        &self,
        producer_tag: &str,
        recognized: &[S],
    ) -> Option<&Event> {
        let idxs = self.by_producer.get(producer_tag)?;
        idxs.iter().rev().map(|&i| &self.events[i]).find(|event| {
            event.requested_actions().iter().any(|req| {
                recognized
                    .iter()
                    .any(|name| name.as_ref() == req.action_name)
            })
        })
    }

    /// Result already recorded for a request id, if any.
    pub fn result_for_request(&self, request_id: &str) -> Option<&ActionResult> {
        self.results_by_request
            .get(request_id)
            .and_then(|&i| self.events[i].action_result())
    }

    /// All results recorded under `producer_tag`, oldest first.
    pub fn results_for(&self, producer_tag: &str) -> Vec<&ActionResult> {
        self.by_producer
            .get(producer_tag)
            .map(|idxs| {
                idxs.iter()
                    .filter_map(|&i| self.events[i].action_result())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::types::ActionOutcome;

    fn result_for(req: &ActionRequest, producer: &str) -> ActionResult {
        ActionResult {
            action_request_id: req.id.clone(),
            producer_tag: producer.into(),
            action_name: req.action_name.clone(),
            outcome: ActionOutcome::Payload(serde_json::json!("ok")),
        }
    }

    #[test]
    fn test_latest_request_ignores_sibling_producers() {
        let mut log = EventLog::new();
        let mine = ActionRequest::new("fetch-news");
        log.request_actions("market", vec![mine.clone()]);
        // A sibling asks for the same action more recently.
        log.request_actions("news", vec![ActionRequest::new("fetch-news")]);

        let found = log.latest_request("market", &["fetch-news"]).unwrap();
        assert_eq!(found.producer_tag, "market");
        assert_eq!(found.requested_actions()[0].id, mine.id);
    }

    #[test]
    fn test_latest_request_requires_recognized_action() {
        let mut log = EventLog::new();
        let older = ActionRequest::new("fetch-prices");
        log.request_actions("market", vec![older.clone()]);
        log.request_actions("market", vec![ActionRequest::new("send-email")]);

        let found = log.latest_request("market", &["fetch-prices"]).unwrap();
        assert_eq!(found.requested_actions()[0].id, older.id);
        assert!(log.latest_request("market", &["unknown"]).is_none());
        assert!(log.latest_request("nobody", &["fetch-prices"]).is_none());
    }

    #[test]
    fn test_results_indexed_by_producer_and_request() {
        let mut log = EventLog::new();
        let req = ActionRequest::new("fetch-news");
        log.request_actions("news", vec![req.clone()]);
        log.record_result(result_for(&req, "news"));

        assert_eq!(log.results_for("news").len(), 1);
        assert!(log.results_for("market").is_empty());
        assert!(log.result_for_request(&req.id).is_some());
        assert_eq!(log.latest_for("news").unwrap().id, 1);
        assert_eq!(log.len(), 2);
    }
}
