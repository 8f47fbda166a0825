//! Device events decoded from broker messages.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{Message, Value};

const ENQUEUED_TIME: &str = "iothub-enqueuedtime";
const DEVICE_ID: &str = "iothub-connection-device-id";
const GENERATION_ID: &str = "iothub-connection-auth-generation-id";
const AUTH_METHOD: &str = "iothub-connection-auth-method";
const MESSAGE_SOURCE: &str = "iothub-message-source";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionAuthMethod {
    pub scope: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub issuer: String,
}

/// A device-to-cloud message with the hub's annotations pulled out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub to: Option<String>,
    pub user_id: Option<String>,
    pub expiry_time: Option<DateTime<Utc>>,
    pub enqueued_time: Option<DateTime<Utc>>,
    pub connection_device_id: Option<String>,
    pub connection_device_generation_id: Option<String>,
    pub connection_auth_method: Option<ConnectionAuthMethod>,
    pub message_source: Option<String>,
    pub payload: Vec<u8>,
    /// Remaining annotations and application properties, stringified.
    pub properties: BTreeMap<String, String>,
}

impl From<&Message> for Event {
    fn from(msg: &Message) -> Self {
        let props = &msg.properties;
        let mut event = Event {
            message_id: props.message_id.clone(),
            correlation_id: props.correlation_id.clone(),
            to: props.to.clone(),
            user_id: props
                .user_id
                .as_deref()
                .map(|id| String::from_utf8_lossy(id).into_owned()),
            expiry_time: props.absolute_expiry_time,
            payload: msg.data().to_vec(),
            ..Default::default()
        };

        for (key, value) in &msg.annotations {
            match key.as_str() {
                ENQUEUED_TIME => event.enqueued_time = value.as_timestamp(),
                DEVICE_ID => event.connection_device_id = Some(value.to_string()),
                GENERATION_ID => event.connection_device_generation_id = Some(value.to_string()),
                AUTH_METHOD => match value.as_str().map(serde_json::from_str::<ConnectionAuthMethod>) {
                    Some(Ok(method)) => event.connection_auth_method = Some(method),
                    _ => {
                        tracing::debug!(value = %value, "unparsable auth method annotation");
                        event.properties.insert(key.clone(), value.to_string());
                    }
                },
                MESSAGE_SOURCE => event.message_source = Some(value.to_string()),
                _ => {
                    event.properties.insert(key.clone(), value.to_string());
                }
            }
        }

        for (key, value) in &msg.application_properties {
            let text = match value {
                Value::String(s) => s.clone(),
                _ => String::new(),
            };
            event.properties.insert(key.clone(), text);
        }
        event
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn annotated() -> Message {
        let mut msg = Message::with_data(br#"{"temperature":21.5}"#.to_vec())
            .application_property("alert", "high")
            .application_property("count", 3);
        msg.properties.message_id = Some("m-1".into());
        msg.properties.user_id = Some(b"device-user".to_vec());
        let enqueued = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        let annotations = [
            (ENQUEUED_TIME, Value::Timestamp(enqueued)),
            (DEVICE_ID, Value::from("dev-1")),
            (GENERATION_ID, Value::from("637000000000000000")),
            (
                AUTH_METHOD,
                Value::from(r#"{"scope":"device","type":"sas","issuer":"iothub"}"#),
            ),
            (MESSAGE_SOURCE, Value::from("Telemetry")),
            ("x-opt-sequence-number", Value::Long(42)),
        ];
        for (k, v) in annotations {
            msg.annotations.insert(k.to_string(), v);
        }
        msg
    }

    #[test]
    fn decodes_hub_annotations() {
        let event = Event::from(&annotated());
        assert_eq!(event.message_id.as_deref(), Some("m-1"));
        assert_eq!(event.user_id.as_deref(), Some("device-user"));
        assert_eq!(
            event.enqueued_time,
            Utc.timestamp_opt(1_700_000_000, 0).single()
        );
        assert_eq!(event.connection_device_id.as_deref(), Some("dev-1"));
        assert_eq!(
            event.connection_device_generation_id.as_deref(),
            Some("637000000000000000")
        );
        assert_eq!(
            event.connection_auth_method,
            Some(ConnectionAuthMethod {
                scope: "device".into(),
                kind: "sas".into(),
                issuer: "iothub".into(),
            })
        );
        assert_eq!(event.message_source.as_deref(), Some("Telemetry"));
        assert_eq!(event.payload, br#"{"temperature":21.5}"#);
    }

    #[test]
    fn stringifies_remaining_properties() {
        let event = Event::from(&annotated());
        assert_eq!(event.properties["x-opt-sequence-number"], "42");
        assert_eq!(event.properties["alert"], "high");
        // Non-string application properties are kept as empty strings.
        assert_eq!(event.properties["count"], "");
        assert!(!event.properties.contains_key(DEVICE_ID));
    }

    #[test]
    fn unparsable_auth_method_falls_back_to_properties() {
        let mut msg = Message::default();
        msg.annotations
            .insert(AUTH_METHOD.to_string(), Value::from("not json"));
        let event = Event::from(&msg);
        assert!(event.connection_auth_method.is_none());
        assert_eq!(event.properties[AUTH_METHOD], "not json");
    }
}
