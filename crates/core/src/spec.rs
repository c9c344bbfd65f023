//! User-declared function intent, as loaded from the service description.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use crate::error::SpecError;

/// A numeric-or-string quantity as written by users (`memorySize: 128`,
/// `memorySize: 128Gi`, `cpu: 0.5`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Int(v) => write!(f, "{}", v),
            Quantity::Float(v) => write!(f, "{}", v),
            Quantity::Text(s) => f.write_str(s),
        }
    }
}

impl From<i64> for Quantity { fn from(v: i64) -> Self { Quantity::Int(v) } }
impl From<&str> for Quantity { fn from(v: &str) -> Self { Quantity::Text(v.to_string()) } }

/// Raw event entry as declared by the user. Converted into [`Event`] before use.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventSpec {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

impl EventSpec {
    pub fn http(path: Option<&str>, hostname: Option<&str>) -> Self {
        Self { kind: "http".into(), path: path.map(str::to_string), hostname: hostname.map(str::to_string), ..Default::default() }
    }
    pub fn trigger(topic: &str) -> Self {
        Self { kind: "trigger".into(), topic: Some(topic.to_string()), ..Default::default() }
    }
    pub fn schedule(schedule: &str) -> Self {
        Self { kind: "schedule".into(), schedule: Some(schedule.to_string()), ..Default::default() }
    }
}

/// A validated event: one variant per kind, carrying only its required fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Http { path: String, hostname: Option<String> },
    Trigger { topic: String },
    Schedule { schedule: String },
}

impl Event {
    /// Implicit event for functions that declare none.
    pub fn default_http() -> Self { Event::Http { path: "/".into(), hostname: None } }

    pub fn from_spec(function: &str, e: &EventSpec) -> Result<Self, SpecError> {
        let non_empty = |v: &Option<String>| v.as_deref().map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
        match e.kind.as_str() {
            "http" => Ok(Event::Http {
                path: e.path.clone().unwrap_or_else(|| "/".into()),
                hostname: non_empty(&e.hostname),
            }),
            "trigger" => non_empty(&e.topic)
                .map(|topic| Event::Trigger { topic })
                .ok_or_else(|| SpecError::TopicRequired { function: function.to_string() }),
            "schedule" => non_empty(&e.schedule)
                .map(|schedule| Event::Schedule { schedule })
                .ok_or_else(|| SpecError::ScheduleRequired { function: function.to_string() }),
            other => Err(SpecError::UnsupportedEvent { function: function.to_string(), kind: other.to_string() }),
        }
    }

    /// Function `type` recorded in the manifest.
    pub fn function_type(&self) -> &'static str {
        match self {
            Event::Http { .. } => "HTTP",
            Event::Trigger { .. } => "PubSub",
            Event::Schedule { .. } => "Scheduled",
        }
    }
}

/// One function as declared by the user. Immutable for the duration of a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    pub id: String,
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub deps: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, Json>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    /// Either a mapping (`NAME: value`) or a list of `{name, value|valueFrom}` entries.
    #[serde(default)]
    pub environment: Option<Json>,
    #[serde(default)]
    pub memory_size: Option<Quantity>,
    #[serde(default)]
    pub cpu: Option<Quantity>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub affinity: Option<Json>,
    #[serde(default)]
    pub tolerations: Option<Json>,
    #[serde(default)]
    pub events: Vec<EventSpec>,
}

impl FunctionSpec {
    pub fn new(id: &str, handler: &str) -> Self {
        Self { id: id.to_string(), handler: Some(handler.to_string()), ..Default::default() }
    }

    /// The single effective event of this function; none declared means a
    /// root-path HTTP event.
    pub fn event(&self) -> Result<Event, SpecError> {
        match self.events.as_slice() {
            [] => Ok(Event::default_http()),
            [e] => Event::from_spec(&self.id, e),
            many => Err(SpecError::MultipleEvents { function: self.id.clone(), count: many.len() }),
        }
    }

    pub fn has_handler(&self) -> bool {
        self.handler.as_deref().map(|h| !h.is_empty()).unwrap_or(false)
    }
}

/// Provider-level defaults applied under every function of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderDefaults {
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub runtime: Option<String>,
    #[serde(default)]
    pub memory_size: Option<Quantity>,
    #[serde(default)]
    pub cpu: Option<Quantity>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub environment: Option<Json>,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub affinity: Option<Json>,
    #[serde(default)]
    pub tolerations: Option<Json>,
}

fn default_namespace() -> String { "default".to_string() }
fn default_content_type() -> String { "text".to_string() }

impl Default for ProviderDefaults {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            runtime: None,
            memory_size: None,
            cpu: None,
            timeout: None,
            environment: None,
            content_type: default_content_type(),
            affinity: None,
            tolerations: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_events_means_root_http() {
        let f = FunctionSpec::new("hello", "f.hello");
        assert_eq!(f.event().unwrap(), Event::Http { path: "/".into(), hostname: None });
    }

    #[test]
    fn trigger_without_topic_is_rejected() {
        let mut f = FunctionSpec::new("t", "f.t");
        f.events.push(EventSpec { kind: "trigger".into(), topic: Some("  ".into()), ..Default::default() });
        assert_eq!(f.event().unwrap_err(), SpecError::TopicRequired { function: "t".into() });
    }

    #[test]
    fn unknown_and_multiple_events_are_rejected() {
        let mut f = FunctionSpec::new("x", "f.x");
        f.events.push(EventSpec { kind: "s3".into(), ..Default::default() });
        assert!(matches!(f.event(), Err(SpecError::UnsupportedEvent { ref kind, .. }) if kind == "s3"));
        f.events = vec![EventSpec::http(None, None), EventSpec::schedule("* * * * *")];
        assert!(matches!(f.event(), Err(SpecError::MultipleEvents { count: 2, .. })));
    }

    #[test]
    fn function_spec_deserializes_camel_case() {
        let f: FunctionSpec = serde_json::from_value(serde_json::json!({
            "id": "hello",
            "handler": "handler.hello",
            "memorySize": 128,
            "cpu": "500m",
            "events": [{ "type": "http", "path": "/hello" }]
        }))
        .unwrap();
        assert_eq!(f.memory_size, Some(Quantity::Int(128)));
        assert_eq!(f.cpu.as_ref().map(|c| c.to_string()).as_deref(), Some("500m"));
        assert_eq!(f.event().unwrap(), Event::Http { path: "/hello".into(), hostname: None });
    }
}
