// control-server/src/main.rs
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::time::sleep;

use common::{setup_tracing, ControlConfig};
use control_server::bridge::{AppStateSnapshot, BridgeError, BridgeResponse, ControlBridge};
use control_server::error::ServerError;
use control_server::server::ControlServer;

/// Stand-in Bridge so the server runs on its own for manual driving.
/// The real app injects its native biometric bridge instead.
struct SimulatedBridge {
    keys_enrolled: AtomicBool,
    prompt_config: Mutex<Value>,
}

impl SimulatedBridge {
    fn new() -> Self {
        Self {
            keys_enrolled: AtomicBool::new(false),
            prompt_config: Mutex::new(Value::Null),
        }
    }
}

#[async_trait]
impl ControlBridge for SimulatedBridge {
    async fn execute_enrollment(&self, _config: Value) -> Result<BridgeResponse, BridgeError> {
        // pretend the sensor prompt takes a moment
        sleep(Duration::from_millis(400)).await;
        self.keys_enrolled.store(true, Ordering::Relaxed);
        Ok(BridgeResponse::ok_with_data(
            "Enrollment successful",
            serde_json::json!({ "keyAlias": "biometric-test-key" }),
        ))
    }

    async fn execute_validation(&self, _config: Value) -> Result<BridgeResponse, BridgeError> {
        if !self.keys_enrolled.load(Ordering::Relaxed) {
            return Err(BridgeError::new("No keys enrolled; run enrollment first"));
        }
        sleep(Duration::from_millis(400)).await;
        Ok(BridgeResponse::ok("Validation successful"))
    }

    async fn delete_keys(&self) -> Result<BridgeResponse, BridgeError> {
        self.keys_enrolled.store(false, Ordering::Relaxed);
        Ok(BridgeResponse::ok("Keys deleted"))
    }

    async fn get_app_state(&self) -> Result<AppStateSnapshot, BridgeError> {
        Ok(AppStateSnapshot {
            biometrics_available: true,
            biometry_type: "fingerprint".to_string(),
            keys_enrolled: self.keys_enrolled.load(Ordering::Relaxed),
            last_error: None,
        })
    }

    async fn update_configuration(
        &self,
        config_type: &str,
        config: Value,
    ) -> Result<(), BridgeError> {
        tracing::info!("Simulated bridge storing {} configuration", config_type);
        *self.prompt_config.lock().unwrap() = config;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    // Setup tracing
    setup_tracing();

    // Load configuration
    let config = ControlConfig::from_env();

    let server = ControlServer::new(config, Arc::new(SimulatedBridge::new()));
    server.start().await?;
    tracing::info!("Control server running; press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    server.stop().await?;
    Ok(())
}
