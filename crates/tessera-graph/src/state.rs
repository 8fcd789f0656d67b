use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::debug;

use tessera_core::types::FieldStatus;

/// Producer tag recorded for fields supplied in the initial state.
pub const INPUT_PRODUCER: &str = "input";

/// How later writes to an already written field are treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// First successful write sticks; later writes are no-ops.
    #[default]
    Once,
    /// Every write is appended to a JSON array.
    Accumulate,
}

/// One written field with its completion marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldEntry {
    pub value: serde_json::Value,
    pub status: FieldStatus,
    /// Store version at which the field was last written.
    pub version: u64,
    /// Producer tag of the last writer.
    pub writer: String,
}

/// A single field write submitted by a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdate {
    pub field: String,
    pub value: serde_json::Value,
    pub status: FieldStatus,
}

impl FieldUpdate {
    pub fn complete(field: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            field: field.into(),
            value,
            status: FieldStatus::Complete,
        }
    }

    pub fn degraded(
        field: impl Into<String>,
        value: serde_json::Value,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            value,
            status: FieldStatus::Degraded {
                reason: reason.into(),
            },
        }
    }

    pub fn failed(field: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            value: serde_json::Value::Null,
            status: FieldStatus::Failed {
                error: error.into(),
            },
        }
    }
}

/// All updates one stage completion contributes, applied atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    pub producer: String,
    pub updates: Vec<FieldUpdate>,
}

/// What happened to each update of an applied patch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub applied: Vec<String>,
    /// Updates dropped because the field was already written.
    pub rejected: Vec<String>,
}

/// Versioned key/value store shared by every stage of a run.
///
/// Fields are written once unless declared accumulating. Each written field
/// carries a `FieldStatus`, so "settled" means "some producer finished with
/// this field", independent of whether the value is empty.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedState {
    fields: BTreeMap<String, FieldEntry>,
    accumulating: BTreeSet<String>,
    version: u64,
}

impl SharedState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a state from initial inputs. Inputs count as written.
    pub fn from_map<I, K>(inputs: I) -> Self
    where
        I: IntoIterator<Item = (K, serde_json::Value)>,
        K: Into<String>,
    {
        let mut state = Self::new();
        let updates = inputs
            .into_iter()
            .map(|(k, v)| FieldUpdate::complete(k, v))
            .collect();
        state.apply(&StatePatch {
            producer: INPUT_PRODUCER.to_string(),
            updates,
        });
        state
    }

    /// Declare a field whose writes accumulate instead of sticking.
    pub fn declare_accumulating(&mut self, field: impl Into<String>) {
        self.accumulating.insert(field.into());
    }

    pub fn write_mode(&self, field: &str) -> WriteMode {
        if self.accumulating.contains(field) {
            WriteMode::Accumulate
        } else {
            WriteMode::Once
        }
    }

    /// Get a value by field name.
    pub fn get(&self, field: &str) -> Option<&serde_json::Value> {
        self.fields.get(field).map(|e| &e.value)
    }

    /// Get a value as a string, if it's a string.
    pub fn get_str(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(|v| v.as_str())
    }

    pub fn entry(&self, field: &str) -> Option<&FieldEntry> {
        self.fields.get(field)
    }

    pub fn status(&self, field: &str) -> Option<&FieldStatus> {
        self.fields.get(field).map(|e| &e.status)
    }

    /// Whether a producer has finished with this field (in any status).
    pub fn is_settled(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    pub fn is_complete(&self, field: &str) -> bool {
        self.status(field).is_some_and(FieldStatus::is_complete)
    }

    /// Required fields that are not yet settled, in the order given.
    pub fn unsettled<'a, S: AsRef<str>>(&self, required: &'a [S]) -> Vec<&'a str> {
        required
            .iter()
            .map(|f| f.as_ref())
            .filter(|f| !self.is_settled(f))
            .collect()
    }

    /// Fields whose status is anything other than complete.
    pub fn degraded_fields(&self) -> Vec<(&str, &FieldStatus)> {
        self.fields
            .iter()
            .filter(|(_, e)| !e.status.is_complete())
            .map(|(k, e)| (k.as_str(), &e.status))
            .collect()
    }

    /// Number of applied writes so far.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldEntry)> {
        self.fields.iter().map(|(k, e)| (k.as_str(), e))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Apply every update of a patch in order.
    ///
    /// Write-once fields that already hold a value are left untouched and the
    /// update is reported as rejected. A field holding only a `Failed` marker
    /// still accepts its first successful (complete or degraded) write.
    ///
    /// Accumulating fields append. Failure markers are never appended to
    /// them: they are reported as rejected and the accumulated values and
    /// status stay as they were.
    pub fn apply(&mut self, patch: &StatePatch) -> ApplyReport {
        let mut report = ApplyReport::default();

        for update in &patch.updates {
            let is_failure = matches!(update.status, FieldStatus::Failed { .. });
            match self.write_mode(&update.field) {
                WriteMode::Once => {
                    let replaces_failure = !is_failure
                        && matches!(
                            self.status(&update.field),
                            Some(FieldStatus::Failed { .. })
                        );
                    if let Some(existing) = self
                        .fields
                        .get(&update.field)
                        .filter(|_| !replaces_failure)
                    {
                        debug!(
                            field = %update.field,
                            producer = %patch.producer,
                            first_writer = %existing.writer,
                            "Field already written, ignoring later write"
                        );
                        report.rejected.push(update.field.clone());
                        continue;
                    }
                    self.version += 1;
                    self.fields.insert(
                        update.field.clone(),
                        FieldEntry {
                            value: update.value.clone(),
                            status: update.status.clone(),
                            version: self.version,
                            writer: patch.producer.clone(),
                        },
                    );
                }
                WriteMode::Accumulate if is_failure => {
                    debug!(
                        field = %update.field,
                        producer = %patch.producer,
                        "Not appending failure marker to accumulating field"
                    );
                    report.rejected.push(update.field.clone());
                    continue;
                }
                WriteMode::Accumulate => {
                    self.version += 1;
                    let version = self.version;
                    let entry = self
                        .fields
                        .entry(update.field.clone())
                        .or_insert_with(|| FieldEntry {
                            value: serde_json::Value::Array(vec![]),
                            status: FieldStatus::Complete,
                            version,
                            writer: patch.producer.clone(),
                        });
                    match &mut entry.value {
                        serde_json::Value::Array(items) => items.push(update.value.clone()),
                        other => {
                            let prior = other.take();
                            *other = serde_json::Value::Array(vec![prior, update.value.clone()]);
                        }
                    }
                    entry.status = update.status.clone();
                    entry.version = version;
                    entry.writer = patch.producer.clone();
                }
            }
            report.applied.push(update.field.clone());
        }

        report
    }

    /// Plain `field -> value` JSON object.
    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .fields
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}
