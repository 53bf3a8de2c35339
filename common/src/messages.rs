// common/src/messages.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Envelope for every message on the control WebSocket channel.
///
/// Wire shape: `{"type": ..., "timestamp": ..., "data": ...}` plus the
/// optional `operationId` / `clientId` correlation fields. The `type` and
/// `data` keys come from the flattened payload union.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebSocketMessage {
    #[serde(flatten)]
    pub payload: MessagePayload,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Tagged payload union for the control channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum MessagePayload {
    /// A biometric operation began on the device
    OperationStart(OperationStarted),
    /// A biometric operation finished (either way)
    OperationComplete(OperationOutcome),
    /// A log line worth showing on the control page
    LogUpdate(LogEntry),
    /// Device/app state snapshot; the app owns the shape
    StateSync(Value),
    /// A configuration change was applied
    ConfigUpdate(ConfigChange),
    /// First message every connection receives after the handshake
    ConnectionEstablished(ConnectionGreeting),
    /// Application-level liveness probe from the page
    Ping,
    /// Application-level liveness reply
    Pong,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationStarted {
    pub operation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationOutcome {
    pub operation: String,
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub level: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigChange {
    pub config_type: String,
    pub config: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionGreeting {
    pub connection_id: String,
    pub server_time: DateTime<Utc>,
}

impl WebSocketMessage {
    pub fn new(payload: MessagePayload) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            operation_id: None,
            client_id: None,
        }
    }

    pub fn with_operation_id(mut self, operation_id: impl Into<String>) -> Self {
        self.operation_id = Some(operation_id.into());
        self
    }

    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    /// The state-sync notice broadcast right before the server goes away.
    pub fn server_shutdown() -> Self {
        Self::new(MessagePayload::StateSync(
            serde_json::json!({ "reason": "server-shutdown" }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_established_wire_shape() {
        let msg = WebSocketMessage::new(MessagePayload::ConnectionEstablished(
            ConnectionGreeting {
                connection_id: "abc-123".to_string(),
                server_time: Utc::now(),
            },
        ));

        let value: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "connection-established");
        assert_eq!(value["data"]["connectionId"], "abc-123");
        assert!(value["data"]["serverTime"].is_string());
        assert!(value["timestamp"].is_string());
        assert!(value.get("operationId").is_none());
        assert!(value.get("clientId").is_none());
    }

    #[test]
    fn operation_ids_are_camel_case_when_present() {
        let msg = WebSocketMessage::new(MessagePayload::OperationStart(OperationStarted {
            operation: "enrollment".to_string(),
        }))
        .with_operation_id("op-1");

        let value: Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "operation-start");
        assert_eq!(value["data"]["operation"], "enrollment");
        assert_eq!(value["operationId"], "op-1");
    }

    #[test]
    fn bare_ping_parses_without_timestamp_or_data() {
        let msg: WebSocketMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg.payload, MessagePayload::Ping));
    }

    #[test]
    fn operation_complete_round_trips() {
        let msg = WebSocketMessage::new(MessagePayload::OperationComplete(OperationOutcome {
            operation: "validation".to_string(),
            success: false,
            message: "sensor unavailable".to_string(),
        }));

        let text = serde_json::to_string(&msg).unwrap();
        let parsed: WebSocketMessage = serde_json::from_str(&text).unwrap();
        match parsed.payload {
            MessagePayload::OperationComplete(outcome) => {
                assert_eq!(outcome.operation, "validation");
                assert!(!outcome.success);
                assert_eq!(outcome.message, "sensor unavailable");
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
