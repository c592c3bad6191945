//! Events produced by metricsets and the envelope published downstream.

use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;

use super::error::FetchError;

/// A single result produced by a metricset fetch.
///
/// Metricsets fill in whatever they know; the scheduler completes the rest
/// (timestamp, elapsed time, namespace) when enveloping it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Event {
    /// Time the data was observed. Defaults to the envelope time.
    pub timestamp: Option<OffsetDateTime>,
    /// Fields placed under the metricset namespace.
    pub metricset_fields: Map<String, Value>,
    /// Fields shared by every metricset of the module, placed under the module key.
    pub module_fields: Option<Map<String, Value>>,
    /// Overrides the registration namespace for this event only.
    pub namespace: Option<String>,
    /// Overrides the measured fetch duration.
    pub took: Option<Duration>,
    /// Error message for error-bearing events.
    pub error: Option<String>,
}

impl Event {
    /// Builds an error-bearing event out of a fetch error.
    pub fn from_error(err: &FetchError) -> Self {
        Self {
            error: Some(err.to_string()),
            ..Default::default()
        }
    }

    pub fn with_module_fields(mut self, fields: Map<String, Value>) -> Self {
        self.module_fields = Some(fields);
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Envelopes the event with the metadata of the metricset that produced it.
    pub fn into_beat_event(self, origin: &EventOrigin<'_>, elapsed: Duration) -> BeatEvent {
        let dataset = self
            .namespace
            .clone()
            .or_else(|| origin.namespace.map(str::to_string))
            .unwrap_or_else(|| format!("{}.{}", origin.module, origin.metricset));

        let mut fields = Map::new();
        if let Some(module_fields) = self.module_fields {
            merge_into(&mut fields, origin.module, Value::Object(module_fields));
        }
        if !self.metricset_fields.is_empty() {
            merge_into(&mut fields, &dataset, Value::Object(self.metricset_fields));
        }

        BeatEvent {
            timestamp: self.timestamp.unwrap_or_else(OffsetDateTime::now_utc),
            event: EventMeta {
                module: origin.module.to_string(),
                dataset,
                duration_ns: saturating_u64(self.took.unwrap_or(elapsed).as_nanos()),
            },
            metricset: MetricSetMeta {
                name: origin.metricset.to_string(),
                period_ms: saturating_u64(origin.period.as_millis()),
            },
            service: (!origin.host.is_empty()).then(|| ServiceMeta {
                address: origin.host.to_string(),
            }),
            error: self.error.map(|message| ErrorMeta { message }),
            fields,
        }
    }
}

impl From<Map<String, Value>> for Event {
    fn from(metricset_fields: Map<String, Value>) -> Self {
        Self {
            metricset_fields,
            ..Default::default()
        }
    }
}

/// Where an event came from, used while enveloping it.
#[derive(Debug, Clone, Copy)]
pub struct EventOrigin<'a> {
    pub module: &'a str,
    pub metricset: &'a str,
    pub host: &'a str,
    pub period: Duration,
    /// Registration-level namespace override.
    pub namespace: Option<&'a str>,
}

/// The envelope written to the output channel and handed to publishers.
#[derive(Debug, Clone, Serialize)]
pub struct BeatEvent {
    #[serde(rename = "@timestamp", with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub event: EventMeta,
    pub metricset: MetricSetMeta,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorMeta>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl BeatEvent {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn host(&self) -> Option<&str> {
        self.service.as_ref().map(|s| s.address.as_str())
    }

    /// Looks up a dotted path (`redis.info.clients`) in the event fields.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.fields.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventMeta {
    pub module: String,
    pub dataset: String,
    #[serde(rename = "duration")]
    pub duration_ns: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricSetMeta {
    pub name: String,
    #[serde(rename = "period")]
    pub period_ms: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceMeta {
    pub address: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorMeta {
    pub message: String,
}

/// Deep-merges `value` at the dotted `path` of `target`, creating
/// intermediate objects and merging with objects already present.
fn merge_into(target: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some(last) = segments.pop() else {
        return;
    };

    let mut current = target;
    for segment in segments {
        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = match slot {
            Value::Object(map) => map,
            _ => return,
        };
    }

    insert_or_merge(current, last.to_string(), value);
}

fn insert_or_merge(target: &mut Map<String, Value>, key: String, value: Value) {
    match value {
        Value::Object(incoming) => match target.get_mut(&key) {
            Some(Value::Object(existing)) => merge_maps(existing, incoming),
            _ => {
                target.insert(key, Value::Object(incoming));
            }
        },
        value => {
            target.insert(key, value);
        }
    }
}

fn saturating_u64(value: u128) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}

fn merge_maps(target: &mut Map<String, Value>, incoming: Map<String, Value>) {
    for (key, value) in incoming {
        insert_or_merge(target, key, value);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn origin<'a>(namespace: Option<&'a str>) -> EventOrigin<'a> {
        EventOrigin {
            module: "redis",
            metricset: "info",
            host: "localhost:6379",
            period: Duration::from_secs(10),
            namespace,
        }
    }

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_default_dataset_nests_fields() {
        let event = Event::from(map(json!({"clients": 4})))
            .with_module_fields(map(json!({"version": "7.2"})));

        let beat = event.into_beat_event(&origin(None), Duration::from_millis(3));

        assert_eq!(beat.event.dataset, "redis.info");
        assert_eq!(beat.event.duration_ns, 3_000_000);
        assert_eq!(beat.metricset.period_ms, 10_000);
        assert_eq!(beat.host(), Some("localhost:6379"));
        assert_eq!(beat.get_path("redis.info.clients"), Some(&json!(4)));
        assert_eq!(beat.get_path("redis.version"), Some(&json!("7.2")));
        assert!(!beat.is_error());
    }

    #[test]
    fn test_event_namespace_overrides_registration() {
        let beat = Event::from(map(json!({"a": 1})))
            .with_namespace("custom.ns")
            .into_beat_event(&origin(Some("registered.ns")), Duration::ZERO);
        assert_eq!(beat.event.dataset, "custom.ns");
        assert_eq!(beat.get_path("custom.ns.a"), Some(&json!(1)));

        let beat = Event::from(map(json!({"a": 1})))
            .into_beat_event(&origin(Some("registered.ns")), Duration::ZERO);
        assert_eq!(beat.get_path("registered.ns.a"), Some(&json!(1)));
    }

    #[test]
    fn test_error_event_serialization() {
        let err: FetchError = "connection refused".into();
        let beat = Event::from_error(&err).into_beat_event(&origin(None), Duration::ZERO);

        assert!(beat.is_error());
        let json = serde_json::to_value(&beat).unwrap();
        assert_eq!(json["error"]["message"], "connection refused");
        assert_eq!(json["event"]["module"], "redis");
        assert_eq!(json["metricset"]["name"], "info");
        assert!(json.get("@timestamp").is_some());
        assert!(json.get("redis").is_none());
    }

    #[test]
    fn test_oversized_durations_saturate() {
        let mut o = origin(None);
        o.period = Duration::MAX;
        let mut event = Event::default();
        event.took = Some(Duration::MAX);

        let beat = event.into_beat_event(&o, Duration::ZERO);
        assert_eq!(beat.event.duration_ns, u64::MAX);
        assert_eq!(beat.metricset.period_ms, u64::MAX);
    }

    #[test]
    fn test_empty_host_has_no_service() {
        let mut o = origin(None);
        o.host = "";
        let beat = Event::default().into_beat_event(&o, Duration::ZERO);
        assert!(beat.service.is_none());
    }
}
