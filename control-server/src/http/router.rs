// control-server/src/http/router.rs
use std::sync::Arc;

use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use common::{
    ConfigChange, LogEntry, MessagePayload, OperationOutcome, OperationStarted, WebSocketMessage,
};

use crate::auth::{AuthVerdict, Authenticator};
use crate::bridge::{BridgeError, BridgeResponse, ControlBridge};
use crate::error::ServerError;
use crate::http::page::CONTROL_PAGE;
use crate::http::request::{parse_json_body, HttpRequest};
use crate::http::response::{api_body, HttpResponse};
use crate::ws::manager::WebSocketManager;

/// What the connection task should do with a parsed request.
pub enum RouteAction {
    /// Write this response and close
    Respond(HttpResponse),
    /// Perform the WebSocket handshake and hand the socket over
    Upgrade,
}

enum OperationKind {
    Enrollment,
    Validation,
    DeleteKeys,
}

impl OperationKind {
    fn name(&self) -> &'static str {
        match self {
            OperationKind::Enrollment => "enrollment",
            OperationKind::Validation => "validation",
            OperationKind::DeleteKeys => "delete-keys",
        }
    }

    async fn execute(
        &self,
        bridge: &Arc<dyn ControlBridge>,
        config: Value,
    ) -> Result<BridgeResponse, BridgeError> {
        match self {
            OperationKind::Enrollment => bridge.execute_enrollment(config).await,
            OperationKind::Validation => bridge.execute_validation(config).await,
            OperationKind::DeleteKeys => bridge.delete_keys().await,
        }
    }
}

/// Maps authenticated requests to handlers. Pure request-to-response
/// logic; socket I/O stays in the server loop.
pub struct Router {
    authenticator: Arc<Authenticator>,
    bridge: Arc<dyn ControlBridge>,
    manager: Arc<WebSocketManager>,
}

impl Router {
    pub fn new(
        authenticator: Arc<Authenticator>,
        bridge: Arc<dyn ControlBridge>,
        manager: Arc<WebSocketManager>,
    ) -> Self {
        Self {
            authenticator,
            bridge,
            manager,
        }
    }

    /// Authentication happens here, before any route logic, for every
    /// request including upgrades.
    pub async fn route(&self, request: &HttpRequest) -> RouteAction {
        let verdict = self.authenticator.check(request.header("authorization"));
        if !verdict.is_valid {
            return RouteAction::Respond(verdict_response(verdict));
        }

        if is_upgrade_request(request) {
            return RouteAction::Upgrade;
        }

        let response = match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/") => HttpResponse::html(CONTROL_PAGE),
            ("POST", "/api/enroll") => {
                self.run_operation(OperationKind::Enrollment, request).await
            }
            ("POST", "/api/validate") => {
                self.run_operation(OperationKind::Validation, request).await
            }
            ("POST", "/api/delete-keys") => {
                self.run_operation(OperationKind::DeleteKeys, request).await
            }
            ("GET", "/api/state") => self.handle_state().await,
            ("POST", "/api/config") => self.handle_config(request).await,
            _ => HttpResponse::not_found(),
        };
        RouteAction::Respond(response)
    }

    async fn run_operation(&self, kind: OperationKind, request: &HttpRequest) -> HttpResponse {
        let body = match parse_json_body(&request.body) {
            Ok(body) => body,
            Err(e) => return HttpResponse::error_json(400, "Bad Request", &e.to_string()),
        };
        // The Bridge gets the config member, not the request envelope
        let config = body.get("config").cloned().unwrap_or(Value::Null);

        let operation_id = Uuid::new_v4().to_string();
        info!("Starting {} operation {}", kind.name(), operation_id);
        self.manager
            .broadcast(
                WebSocketMessage::new(MessagePayload::OperationStart(OperationStarted {
                    operation: kind.name().to_string(),
                }))
                .with_operation_id(operation_id.clone()),
            )
            .await;

        match kind.execute(&self.bridge, config).await {
            Ok(response) => {
                self.manager
                    .broadcast(
                        WebSocketMessage::new(MessagePayload::OperationComplete(
                            OperationOutcome {
                                operation: kind.name().to_string(),
                                success: response.success,
                                message: response.message.clone(),
                            },
                        ))
                        .with_operation_id(operation_id),
                    )
                    .await;

                match serde_json::to_value(&response) {
                    Ok(value) => HttpResponse::ok_json(&value),
                    Err(e) => {
                        HttpResponse::error_json(500, "Internal Server Error", &e.to_string())
                    }
                }
            }
            Err(e) => {
                warn!("{} operation failed: {}", kind.name(), e);
                self.manager
                    .broadcast(
                        WebSocketMessage::new(MessagePayload::OperationComplete(
                            OperationOutcome {
                                operation: kind.name().to_string(),
                                success: false,
                                message: e.to_string(),
                            },
                        ))
                        .with_operation_id(operation_id),
                    )
                    .await;
                self.manager
                    .broadcast(WebSocketMessage::new(MessagePayload::LogUpdate(LogEntry {
                        level: "error".to_string(),
                        message: e.to_string(),
                    })))
                    .await;

                // The raised message goes back verbatim; this surface is a
                // debugging tool and hides nothing from its operator
                HttpResponse::error_json(500, "Internal Server Error", &e.to_string())
            }
        }
    }

    async fn handle_state(&self) -> HttpResponse {
        match self.bridge.get_app_state().await {
            Ok(snapshot) => match serde_json::to_value(&snapshot) {
                Ok(data) => HttpResponse::ok_json(&api_body(true, "State retrieved", data)),
                Err(e) => HttpResponse::error_json(500, "Internal Server Error", &e.to_string()),
            },
            Err(e) => HttpResponse::error_json(500, "Internal Server Error", &e.to_string()),
        }
    }

    async fn handle_config(&self, request: &HttpRequest) -> HttpResponse {
        let body = match parse_json_body(&request.body) {
            Ok(body) => body,
            Err(e) => return HttpResponse::error_json(400, "Bad Request", &e.to_string()),
        };

        let config_type = match body.get("type").and_then(Value::as_str) {
            Some(config_type) => config_type.to_string(),
            None => {
                return HttpResponse::error_json(
                    400,
                    "Bad Request",
                    &ServerError::MissingConfigType.to_string(),
                )
            }
        };
        let config = body.get("config").cloned().unwrap_or(Value::Null);

        match self
            .bridge
            .update_configuration(&config_type, config.clone())
            .await
        {
            Ok(()) => {
                info!("Applied {} configuration update", config_type);
                self.manager
                    .broadcast(WebSocketMessage::new(MessagePayload::ConfigUpdate(
                        ConfigChange {
                            config_type,
                            config,
                        },
                    )))
                    .await;
                HttpResponse::ok_json(&api_body(true, "Configuration updated", Value::Null))
            }
            Err(e) => HttpResponse::error_json(500, "Internal Server Error", &e.to_string()),
        }
    }
}

/// Upgrade requests are recognized by path or by the Upgrade header, so
/// nonstandard clients hitting a different path still reach the
/// handshake.
fn is_upgrade_request(request: &HttpRequest) -> bool {
    if request.route_path() == "/ws" {
        return true;
    }
    request
        .header("upgrade")
        .map(|value| value.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false)
}

fn verdict_response(verdict: AuthVerdict) -> HttpResponse {
    let mut response = HttpResponse::new(verdict.status_code, verdict.status_text.as_str())
        .with_header("Content-Type", "application/json")
        .with_body(verdict.body.into_bytes());
    for (name, value) in verdict.headers {
        response = response.with_header(name, value);
    }
    response
}
