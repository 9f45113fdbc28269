//! Log event record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An application event queued for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    /// Assigned by the store on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub processed: bool,
    /// Peer address or component that produced the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

impl LogEvent {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            id: None,
            event_type: event_type.into(),
            payload,
            created_at: Utc::now(),
            processed: false,
            source: None,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_minimal() {
        let event: LogEvent = serde_json::from_str(r#"{"event_type":"user.login"}"#).unwrap();
        assert_eq!(event.event_type, "user.login");
        assert_eq!(event.payload, Value::Null);
        assert!(event.id.is_none());
        assert!(!event.processed);
    }

    #[test]
    fn test_serialize_skips_unset_fields() {
        let event = LogEvent::new("tcp.receive", serde_json::json!({"bytes": 4}));
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("id").is_none());
        assert!(json.get("source").is_none());
        assert_eq!(json["payload"]["bytes"], 4);
    }
}
