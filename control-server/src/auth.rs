// control-server/src/auth.rs
use std::sync::RwLock;

use rand::Rng;
use tracing::{debug, warn};

use crate::http::response::api_body;

const AUTH_USERNAME: &str = "admin";
const AUTH_REALM: &str = "Web Control";

/// The per-run credential pair. Generated fresh on every server start,
/// cleared on stop, never persisted anywhere.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
}

/// Outcome of checking one request's Authorization header. Carries
/// everything the responder needs; holds no server state.
#[derive(Debug, Clone)]
pub struct AuthVerdict {
    pub is_valid: bool,
    pub status_code: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl AuthVerdict {
    fn allowed() -> Self {
        Self {
            is_valid: true,
            status_code: 200,
            status_text: "OK".to_string(),
            headers: Vec::new(),
            body: String::new(),
        }
    }

    fn denied(status_code: u16, status_text: &str, message: &str) -> Self {
        let mut headers = Vec::new();
        if status_code == 401 {
            headers.push((
                "WWW-Authenticate".to_string(),
                format!("Basic realm=\"{}\"", AUTH_REALM),
            ));
        }
        Self {
            is_valid: false,
            status_code,
            status_text: status_text.to_string(),
            headers,
            body: api_body(false, message, serde_json::Value::Null).to_string(),
        }
    }
}

/// Basic-Authentication gate sitting in front of every route.
///
/// Credentials live behind an `RwLock<Option<_>>` so issue/clear swap the
/// whole pair atomically; a concurrent check sees the old pair or none,
/// never a torn mix.
pub struct Authenticator {
    credentials: RwLock<Option<AuthCredentials>>,
}

impl Default for Authenticator {
    fn default() -> Self {
        Self::new()
    }
}

impl Authenticator {
    pub fn new() -> Self {
        Self {
            credentials: RwLock::new(None),
        }
    }

    /// Generate a fresh 6-digit numeric password.
    pub fn generate_password() -> String {
        format!("{:06}", rand::thread_rng().gen_range(0..1_000_000))
    }

    /// Install a fresh credential pair, returning a copy for display.
    pub fn issue_credentials(&self) -> AuthCredentials {
        let credentials = AuthCredentials {
            username: AUTH_USERNAME.to_string(),
            password: Self::generate_password(),
        };
        *self.credentials.write().unwrap() = Some(credentials.clone());
        credentials
    }

    /// Drop the active credentials; every subsequent check fails.
    pub fn clear_credentials(&self) {
        *self.credentials.write().unwrap() = None;
    }

    /// Copy of the active credentials, if the server is running.
    pub fn credentials(&self) -> Option<AuthCredentials> {
        self.credentials.read().unwrap().clone()
    }

    /// Check one request's Authorization header value.
    pub fn check(&self, authorization: Option<&str>) -> AuthVerdict {
        let expected = match self.credentials() {
            Some(credentials) => credentials,
            None => {
                warn!("Authentication check with no credentials configured");
                return AuthVerdict::denied(
                    500,
                    "Internal Server Error",
                    "No credentials configured",
                );
            }
        };

        let header = match authorization {
            Some(header) => header,
            None => {
                debug!("Request without Authorization header");
                return AuthVerdict::denied(401, "Unauthorized", "Authentication required");
            }
        };

        let encoded = match header.strip_prefix("Basic ") {
            Some(encoded) => encoded,
            None => {
                warn!("Authorization header with unsupported scheme");
                return AuthVerdict::denied(401, "Unauthorized", "Invalid authorization header");
            }
        };

        let decoded = base64::decode(encoded)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok());
        let decoded = match decoded {
            Some(decoded) if decoded.matches(':').count() == 1 => decoded,
            _ => {
                warn!("Malformed Basic authorization payload");
                return AuthVerdict::denied(401, "Unauthorized", "Invalid authorization header");
            }
        };

        let (username, password) = match decoded.split_once(':') {
            Some(pair) => pair,
            None => {
                return AuthVerdict::denied(401, "Unauthorized", "Invalid authorization header")
            }
        };

        // Compare both fields and combine without short-circuiting so the
        // rejection path does not reveal which field was wrong
        let username_ok = constant_time_eq(username.as_bytes(), expected.username.as_bytes());
        let password_ok = constant_time_eq(password.as_bytes(), expected.password.as_bytes());
        if username_ok & password_ok {
            AuthVerdict::allowed()
        } else {
            warn!("Rejected request with invalid credentials");
            AuthVerdict::denied(401, "Unauthorized", "Invalid credentials")
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
