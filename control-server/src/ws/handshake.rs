// control-server/src/ws/handshake.rs
use sha1::{Digest, Sha1};

use crate::error::ServerError;
use crate::http::request::HttpRequest;
use crate::http::response::HttpResponse;

/// Fixed GUID every WebSocket server concatenates onto the client nonce
/// (RFC 6455 section 1.3).
const WS_ACCEPT_GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Derive the `Sec-WebSocket-Accept` value for a client nonce.
pub fn derive_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_ACCEPT_GUID);
    base64::encode(hasher.finalize())
}

/// Build the 101 response for an upgrade request. The request must carry
/// the handshake nonce; its absence is the one upgrade failure that
/// propagates as an error instead of a plain response.
pub fn upgrade_response(request: &HttpRequest) -> Result<HttpResponse, ServerError> {
    let key = request
        .header("sec-websocket-key")
        .ok_or(ServerError::MissingWebSocketKey)?;

    Ok(HttpResponse::new(101, "Switching Protocols")
        .with_header("Upgrade", "websocket")
        .with_header("Connection", "Upgrade")
        .with_header("Sec-WebSocket-Accept", derive_accept_key(key)))
}
