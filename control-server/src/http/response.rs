// control-server/src/http/response.rs
use chrono::Utc;
use serde_json::Value;

/// An outgoing HTTP response, rendered into a single buffer so every
/// request is answered with exactly one socket write.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status_code: u16,
    pub status_text: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

/// Canonical API envelope shared by every JSON route.
pub fn api_body(success: bool, message: &str, data: Value) -> Value {
    serde_json::json!({
        "success": success,
        "message": message,
        "data": data,
        "timestamp": Utc::now().to_rfc3339(),
    })
}

impl HttpResponse {
    pub fn new(status_code: u16, status_text: impl Into<String>) -> Self {
        Self {
            status_code,
            status_text: status_text.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    /// 200 with an HTML body.
    pub fn html(markup: &str) -> Self {
        Self::new(200, "OK")
            .with_header("Content-Type", "text/html; charset=utf-8")
            .with_body(markup.as_bytes().to_vec())
    }

    /// Arbitrary-status JSON response.
    pub fn json(status_code: u16, status_text: &str, value: &Value) -> Self {
        Self::new(status_code, status_text)
            .with_header("Content-Type", "application/json")
            .with_body(value.to_string().into_bytes())
    }

    /// 200 JSON response.
    pub fn ok_json(value: &Value) -> Self {
        Self::json(200, "OK", value)
    }

    /// JSON error in the canonical envelope (`data` is null).
    pub fn error_json(status_code: u16, status_text: &str, message: &str) -> Self {
        Self::json(status_code, status_text, &api_body(false, message, Value::Null))
    }

    pub fn not_found() -> Self {
        Self::error_json(404, "Not Found", "Not found")
    }

    /// Render into the single write buffer. `Content-Length` and
    /// `Connection: close` are filled in unless the caller set them (the
    /// 101 upgrade response manages its own connection semantics).
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut head = format!("HTTP/1.1 {} {}\r\n", self.status_code, self.status_text);
        for (name, value) in &self.headers {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }

        let has = |name: &str| {
            self.headers
                .iter()
                .any(|(n, _)| n.eq_ignore_ascii_case(name))
        };
        if self.status_code != 101 && !has("content-length") {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        if !has("connection") {
            head.push_str("Connection: close\r\n");
        }
        head.push_str("\r\n");

        let mut bytes = head.into_bytes();
        bytes.extend_from_slice(&self.body);
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_fills_length_and_close() {
        let bytes = HttpResponse::ok_json(&serde_json::json!({"ok": true})).to_bytes();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.ends_with("\r\n\r\n{\"ok\":true}"));
    }

    #[test]
    fn upgrade_response_keeps_its_own_connection_header() {
        let bytes = HttpResponse::new(101, "Switching Protocols")
            .with_header("Upgrade", "websocket")
            .with_header("Connection", "Upgrade")
            .to_bytes();
        let text = String::from_utf8(bytes).unwrap();

        assert!(text.contains("Connection: Upgrade\r\n"));
        assert!(!text.contains("Connection: close"));
        assert!(!text.contains("Content-Length"));
    }

    #[test]
    fn error_envelope_shape() {
        let res = HttpResponse::error_json(500, "Internal Server Error", "sensor offline");
        let text = String::from_utf8(res.to_bytes()).unwrap();
        let body = text.split("\r\n\r\n").nth(1).unwrap();
        let value: Value = serde_json::from_str(body).unwrap();

        assert_eq!(value["success"], false);
        assert_eq!(value["message"], "sensor offline");
        assert!(value["data"].is_null());
        assert!(value["timestamp"].is_string());
    }
}
