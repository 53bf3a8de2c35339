// control-server/src/error.rs
use thiserror::Error;

/// Errors surfaced by the control server itself (not by the Bridge).
///
/// Per-connection transport and frame-codec failures have their own types
/// next to the code that raises them; they are isolated to the connection
/// that hit them and never reach this level.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Upgrade request arrived without the handshake nonce
    #[error("Missing Sec-WebSocket-Key header")]
    MissingWebSocketKey,

    /// Request body was present but not valid JSON
    #[error("Invalid JSON in request body")]
    InvalidJsonBody,

    /// Configuration update arrived without a `type` discriminator
    #[error("Missing configuration type")]
    MissingConfigType,

    /// `start()` called while a listener is already up
    #[error("server is already running")]
    AlreadyRunning,

    /// `stop()` or an accessor called with no listener up
    #[error("server is not running")]
    NotRunning,

    /// Connection manager is not accepting registrations
    #[error("connection manager is not active")]
    ManagerInactive,

    /// Manager is mid-shutdown; upgrades are refused until it finishes
    #[error("Server is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
