// ============================================================================
// RESPONSE TRANSFORMS
// ============================================================================
// Each appliance endpoint answers with its own JSON shape. A `Transform`
// flattens one response body into `MetricRecord`s: a raw key, a raw string
// value and an optional scope that becomes the channel name's prefix.
// ============================================================================

use serde_json::{Map, Value as JsonValue};
use tracing::{debug, warn};

use crate::error::{FetchError, FetchResult};
use crate::identifier::normalize;
use crate::value::{Coerced, Coercer, TypedValue};

/// One observation as received from the appliance.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricRecord {
    /// Channel name scope (`<scope>:<Name>`), if any
    pub scope: Option<String>,
    pub key: String,
    pub raw: String,
}

/// A record after normalization and coercion.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedMetric {
    /// Channel name relative to the group prefix
    pub channel: String,
    /// The (possibly unit-rewritten) key, kept as the slot doc string
    pub doc: String,
    pub value: TypedValue,
}

impl MetricRecord {
    pub fn new(scope: Option<String>, key: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            scope,
            key: key.into(),
            raw: raw.into(),
        }
    }

    /// Coerce the value, then derive the channel name from the final key.
    pub fn resolve(&self, coercer: &Coercer) -> ResolvedMetric {
        let Coerced { key, value } = coercer.coerce(&self.key, &self.raw);
        let name = normalize(&key);
        let channel = match &self.scope {
            Some(scope) => format!("{}:{}", scope, name),
            None => name,
        };
        ResolvedMetric {
            channel,
            doc: key,
            value,
        }
    }
}

/// The JSON shapes served by the appliance management API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    /// `[{"instance": "a0", "key": "value", ...}, ...]`
    InstanceList,
    /// `[{"name": ..., "value": ..., "source": ...}, ...]`
    DetailedMetrics,
    /// `[{"name": <tier>, "key": "value", ...}, ...]`
    StorageMetrics,
    /// `[{"label": ..., "data": [[millis, value], ...]}, ...]`
    ProcessMetrics,
}

impl Transform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transform::InstanceList => "instance-list",
            Transform::DetailedMetrics => "detailed-metrics",
            Transform::StorageMetrics => "storage-metrics",
            Transform::ProcessMetrics => "process-metrics",
        }
    }

    /// Flatten a response body fetched from `url`.
    pub fn apply(&self, url: &str, body: &str) -> FetchResult<Vec<MetricRecord>> {
        let parsed: JsonValue =
            serde_json::from_str(body).map_err(|e| FetchError::payload(url, e.to_string()))?;
        let items = parsed
            .as_array()
            .ok_or_else(|| FetchError::payload(url, "expected a JSON array"))?;

        let mut records = Vec::new();
        for item in items {
            let Some(object) = item.as_object() else {
                warn!(target: "archstats::transform", url = %url, item = %item, "Skipping non-object entry");
                continue;
            };
            match self {
                Transform::InstanceList => instance_entry(url, object, &mut records),
                Transform::DetailedMetrics => detailed_entry(url, object, &mut records),
                Transform::StorageMetrics => storage_entry(url, object, &mut records),
                Transform::ProcessMetrics => process_entry(url, object, &mut records),
            }
        }
        Ok(records)
    }

    /// Instance names listed by an instance-list body.
    pub fn instances(url: &str, body: &str) -> FetchResult<Vec<String>> {
        let parsed: JsonValue =
            serde_json::from_str(body).map_err(|e| FetchError::payload(url, e.to_string()))?;
        let items = parsed
            .as_array()
            .ok_or_else(|| FetchError::payload(url, "expected a JSON array"))?;
        Ok(items
            .iter()
            .filter_map(|item| item.get("instance").and_then(JsonValue::as_str))
            .map(str::to_string)
            .collect())
    }
}

fn instance_entry(url: &str, object: &Map<String, JsonValue>, out: &mut Vec<MetricRecord>) {
    let Some(instance) = object.get("instance").and_then(JsonValue::as_str) else {
        warn!(target: "archstats::transform", url = %url, "Instance entry without 'instance' field");
        return;
    };
    for (key, value) in object {
        if let Some(raw) = raw_string(url, key, value) {
            out.push(MetricRecord::new(Some(instance.to_string()), key.clone(), raw));
        }
    }
}

fn detailed_entry(url: &str, object: &Map<String, JsonValue>, out: &mut Vec<MetricRecord>) {
    let (Some(name), Some(value)) = (object.get("name").and_then(JsonValue::as_str), object.get("value")) else {
        warn!(target: "archstats::transform", url = %url, "Detailed metric without name/value");
        return;
    };
    if let Some(raw) = raw_string(url, name, value) {
        out.push(MetricRecord::new(None, name, raw));
    }
}

fn storage_entry(url: &str, object: &Map<String, JsonValue>, out: &mut Vec<MetricRecord>) {
    let Some(tier) = object.get("name").and_then(JsonValue::as_str) else {
        warn!(target: "archstats::transform", url = %url, "Storage entry without 'name' field");
        return;
    };
    let scope = normalize(tier);
    for (key, value) in object.iter().filter(|(k, _)| k.as_str() != "name") {
        if let Some(raw) = raw_string(url, key, value) {
            out.push(MetricRecord::new(Some(scope.clone()), key.clone(), raw));
        }
    }
}

fn process_entry(url: &str, object: &Map<String, JsonValue>, out: &mut Vec<MetricRecord>) {
    let Some(label) = object.get("label").and_then(JsonValue::as_str) else {
        warn!(target: "archstats::transform", url = %url, "Process series without 'label' field");
        return;
    };
    let last = object
        .get("data")
        .and_then(JsonValue::as_array)
        .and_then(|samples| samples.last())
        .and_then(JsonValue::as_array)
        .and_then(|sample| sample.get(1));
    match last {
        Some(value) => {
            if let Some(raw) = raw_string(url, label, value) {
                out.push(MetricRecord::new(None, label, raw));
            }
        }
        None => debug!(target: "archstats::transform", url = %url, label = %label, "Process series has no samples"),
    }
}

/// Scalar JSON as the string the appliance would have sent.
fn raw_string(url: &str, key: &str, value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Bool(true) => Some("True".to_string()),
        JsonValue::Bool(false) => Some("False".to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Null => None,
        JsonValue::Array(_) | JsonValue::Object(_) => {
            warn!(target: "archstats::transform", url = %url, key = %key, "Skipping nested value");
            None
        }
    }
}
