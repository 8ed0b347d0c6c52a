//! Aggregate builder
//!
//! Turns a [`FetchReport`] into one FHIR `collection` bundle. Entries appear in
//! query-declaration order, then in source order within a type. Every entry
//! carries its `resourceType` and a `fullUrl` of the form `Type/id`.
//!
//! The payload contains nothing derived from the clock or from the run, so the
//! same fetched data always serializes to the same bytes.

use healthflow_common::NewAggregate;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::fetcher::{FetchReport, FetchResult};

/// Assembled aggregate plus build statistics
#[derive(Debug, Clone)]
pub struct BuiltAggregate {
    pub aggregate: NewAggregate,
    pub entry_count: usize,
    /// Sub-records dropped as malformed
    pub dropped: usize,
}

/// Builds patient bundles from fetched sub-records
#[derive(Debug, Clone)]
pub struct AggregateBuilder {
    aggregate_type: String,
}

impl AggregateBuilder {
    pub fn new(aggregate_type: impl Into<String>) -> Self {
        Self {
            aggregate_type: aggregate_type.into(),
        }
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    /// Build and fingerprint the aggregate for `report.entity_key`
    ///
    /// Never fails: empty and failed outcomes are skipped, malformed records
    /// are dropped with a warning.
    pub fn build(&self, report: &FetchReport) -> BuiltAggregate {
        let mut entries = Vec::new();
        let mut dropped = 0;

        for outcome in &report.outcomes {
            let FetchResult::Records { records } = &outcome.result else {
                continue;
            };

            for (index, record) in records.iter().enumerate() {
                match stamp_record(&outcome.record_type, index + 1, record) {
                    Ok(entry) => entries.push(entry),
                    Err(reason) => {
                        dropped += 1;
                        warn!(
                            entity_key = %report.entity_key,
                            record_type = %outcome.record_type,
                            position = index + 1,
                            reason = %reason,
                            "Dropping malformed sub-record"
                        );
                    },
                }
            }
        }

        let entry_count = entries.len();
        let bundle = json!({
            "resourceType": "Bundle",
            "id": format!("patient-bundle-{}", report.entity_key),
            "type": "collection",
            "total": entry_count,
            "entry": entries,
        });

        // Value's Display is compact JSON with sorted object keys
        let payload = bundle.to_string();
        let aggregate = NewAggregate::new(&report.entity_key, &self.aggregate_type, payload);

        debug!(
            entity_key = %report.entity_key,
            entries = entry_count,
            dropped,
            fingerprint = %aggregate.fingerprint,
            "Built aggregate"
        );

        BuiltAggregate {
            aggregate,
            entry_count,
            dropped,
        }
    }
}

/// Wrap one sub-record as a bundle entry, assigning a local id when absent
fn stamp_record(record_type: &str, position: usize, record: &Value) -> Result<Value, String> {
    let Value::Object(fields) = record else {
        return Err(format!("expected a JSON object, got {}", json_kind(record)));
    };
    let mut resource: Map<String, Value> = fields.clone();

    match resource.get("resourceType") {
        None | Some(Value::Null) => {
            resource.insert("resourceType".to_string(), Value::String(record_type.to_string()));
        },
        Some(Value::String(tag)) if tag == record_type => {},
        Some(other) => {
            return Err(format!("resourceType {} does not match {}", other, record_type));
        },
    }

    let id = match resource.get("id") {
        None | Some(Value::Null) => {
            let local = format!("{}-{}", record_type.to_lowercase(), position);
            resource.insert("id".to_string(), Value::String(local.clone()));
            local
        },
        Some(Value::String(id)) if !id.is_empty() => id.clone(),
        Some(other) => return Err(format!("unusable id {}", other)),
    };

    Ok(json!({
        "fullUrl": format!("{}/{}", record_type, id),
        "resource": Value::Object(resource),
    }))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
