// control-server/tests/common/mod.rs
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use common::ControlConfig;
use control_server::bridge::{AppStateSnapshot, BridgeError, BridgeResponse, ControlBridge};
use control_server::server::ControlServer;

/// Scriptable Bridge standing in for the app side: records every call
/// and the config each operation received, tracks enrollment state, and
/// fails on demand.
pub struct MockBridge {
    calls: Mutex<Vec<String>>,
    configs: Mutex<Vec<Value>>,
    fail_with: Mutex<Option<String>>,
    keys_enrolled: AtomicBool,
}

impl MockBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            configs: Mutex::new(Vec::new()),
            fail_with: Mutex::new(None),
            keys_enrolled: AtomicBool::new(false),
        })
    }

    /// Make every subsequent Bridge call fail with this message.
    pub fn fail_with(&self, message: &str) {
        *self.fail_with.lock().unwrap() = Some(message.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    /// Configs delivered to enroll/validate, in call order.
    pub fn configs(&self) -> Vec<Value> {
        self.configs.lock().unwrap().clone()
    }

    fn record(&self, call: impl Into<String>) -> Result<(), BridgeError> {
        self.calls.lock().unwrap().push(call.into());
        match self.fail_with.lock().unwrap().as_ref() {
            Some(message) => Err(BridgeError::new(message.clone())),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ControlBridge for MockBridge {
    async fn execute_enrollment(&self, config: Value) -> Result<BridgeResponse, BridgeError> {
        self.configs.lock().unwrap().push(config);
        self.record("enroll")?;
        self.keys_enrolled.store(true, Ordering::Relaxed);
        Ok(BridgeResponse::ok("Enrollment successful"))
    }

    async fn execute_validation(&self, config: Value) -> Result<BridgeResponse, BridgeError> {
        self.configs.lock().unwrap().push(config);
        self.record("validate")?;
        Ok(BridgeResponse::ok("Validation successful"))
    }

    async fn delete_keys(&self) -> Result<BridgeResponse, BridgeError> {
        self.record("delete-keys")?;
        self.keys_enrolled.store(false, Ordering::Relaxed);
        Ok(BridgeResponse::ok("Keys deleted"))
    }

    async fn get_app_state(&self) -> Result<AppStateSnapshot, BridgeError> {
        self.record("state")?;
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
        _config: Value,
    ) -> Result<(), BridgeError> {
        self.record(format!("config:{}", config_type))
    }
}

/// A control server bound to an ephemeral port, plus everything a test
/// needs to talk to it.
pub struct TestServer {
    pub server: Arc<ControlServer>,
    pub addr: SocketAddr,
    pub bridge: Arc<MockBridge>,
    pub password: String,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn basic_header(&self) -> String {
        format!("Basic {}", base64::encode(format!("admin:{}", self.password)))
    }
}

pub async fn spawn_server() -> TestServer {
    let bridge = MockBridge::new();
    let config = ControlConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        ..ControlConfig::default()
    };
    let server = Arc::new(ControlServer::new(config, bridge.clone()));
    let addr = server.start().await.expect("server failed to start");
    let password = server
        .credentials()
        .expect("running server has credentials")
        .password;
    TestServer {
        server,
        addr,
        bridge,
        password,
    }
}
