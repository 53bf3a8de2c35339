// control-server/src/bridge.rs
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Failure raised by the app side of the Bridge. Displays the underlying
/// message verbatim; API handlers surface it unaltered in the 500 body.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct BridgeError {
    pub message: String,
}

impl BridgeError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Result of a biometric operation, mirrored directly into the API
/// response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub success: bool,
    pub message: String,
    /// Operation-specific payload; serialized as `null` when absent
    pub data: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl BridgeResponse {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
            timestamp: Utc::now(),
        }
    }

    pub fn ok_with_data(message: impl Into<String>, data: Value) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
            timestamp: Utc::now(),
        }
    }

    /// Completed-but-unsuccessful outcome (user cancelled, no match).
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            data: None,
            timestamp: Utc::now(),
        }
    }
}

/// What a biometric test harness reports about the device right now.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStateSnapshot {
    pub biometrics_available: bool,
    pub biometry_type: String,
    pub keys_enrolled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// The app-side collaborator every API route drives. Injected at server
/// construction; the server never reaches into the app any other way.
#[async_trait]
pub trait ControlBridge: Send + Sync {
    /// Run biometric enrollment with the supplied options.
    async fn execute_enrollment(&self, config: Value) -> Result<BridgeResponse, BridgeError>;

    /// Run biometric validation (signature round trip) with the supplied
    /// options.
    async fn execute_validation(&self, config: Value) -> Result<BridgeResponse, BridgeError>;

    /// Remove the enrolled keypair.
    async fn delete_keys(&self) -> Result<BridgeResponse, BridgeError>;

    /// Snapshot the current device/app state.
    async fn get_app_state(&self) -> Result<AppStateSnapshot, BridgeError>;

    /// Apply a configuration change of the given type.
    async fn update_configuration(&self, config_type: &str, config: Value)
        -> Result<(), BridgeError>;
}
