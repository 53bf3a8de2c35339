// control-server/src/http/request.rs
use std::collections::HashMap;

use serde_json::Value;

use crate::error::ServerError;

/// Accepted request verbs; anything else fails parsing outright.
const ALLOWED_METHODS: [&str; 5] = ["GET", "POST", "PUT", "PATCH", "DELETE"];

/// A parsed plain-HTTP request. Immutable once built.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    /// Path exactly as sent, query string included
    pub path: String,
    pub version: String,
    /// Header names lowercased, values verbatim (outer whitespace trimmed)
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl HttpRequest {
    /// Case-insensitive header lookup (keys are stored lowercased).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Path with any query string stripped.
    pub fn route_path(&self) -> &str {
        match self.path.split_once('?') {
            Some((path, _)) => path,
            None => &self.path,
        }
    }

    /// Value of a query parameter, if the path carries one.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        let (_, query) = self.path.split_once('?')?;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }
}

/// Parse a raw HTTP/1.1 request. Any structural problem yields `None`;
/// callers answer those with a generic 400 rather than echoing details.
pub fn parse_http_request(raw: &str) -> Option<HttpRequest> {
    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw, ""));
    let mut lines = head.split("\r\n");

    let request_line = lines.next()?;
    let parts: Vec<&str> = request_line.split(' ').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return None;
    }

    let method = parts[0];
    if !ALLOWED_METHODS.contains(&method) {
        return None;
    }

    let version = parts[2];
    if !is_valid_http_version(version) {
        return None;
    }

    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        // Tolerate junk header lines; only well-formed "name: value" pairs count
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let name = name.trim().to_lowercase();
        if name.is_empty() {
            continue;
        }
        headers.insert(name, value.trim().to_string());
    }

    Some(HttpRequest {
        method: method.to_string(),
        path: parts[1].to_string(),
        version: version.to_string(),
        headers,
        body: body.to_string(),
    })
}

fn is_valid_http_version(version: &str) -> bool {
    let Some(rest) = version.strip_prefix("HTTP/") else {
        return false;
    };
    let Some((major, minor)) = rest.split_once('.') else {
        return false;
    };
    !major.is_empty()
        && !minor.is_empty()
        && major.chars().all(|c| c.is_ascii_digit())
        && minor.chars().all(|c| c.is_ascii_digit())
}

/// Parse a request body as JSON. An absent body is treated as an empty
/// object; anything else must parse, and the caller only ever sees the
/// fixed message (parser internals stay out of responses).
pub fn parse_json_body(raw: &str) -> Result<Value, ServerError> {
    if raw.is_empty() {
        return Ok(serde_json::json!({}));
    }
    serde_json::from_str(raw).map_err(|_| ServerError::InvalidJsonBody)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_with_headers_and_body() {
        let raw = "POST /api/enroll HTTP/1.1\r\nHost: localhost:8080\r\nContent-Type: application/json\r\n\r\n{\"reason\":\"test\"}";
        let req = parse_http_request(raw).unwrap();

        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/api/enroll");
        assert_eq!(req.version, "HTTP/1.1");
        assert_eq!(req.header("host"), Some("localhost:8080"));
        assert_eq!(req.header("Content-Type"), Some("application/json"));
        assert_eq!(req.body, "{\"reason\":\"test\"}");
    }

    #[test]
    fn header_names_fold_to_lowercase() {
        let raw = "GET / HTTP/1.1\r\nUPGRADE: websocket\r\nSec-WebSocket-Key: abc\r\n\r\n";
        let req = parse_http_request(raw).unwrap();

        assert_eq!(req.header("upgrade"), Some("websocket"));
        assert_eq!(req.header("sec-websocket-key"), Some("abc"));
    }

    #[test]
    fn malformed_requests_yield_none() {
        let cases = [
            "",
            "GET",
            "GET /",
            "GET / HTTP/1.1 extra\r\n\r\n",
            "FETCH /x HTTP/1.1\r\n\r\n",
            "GET / HTTP/1.x\r\n\r\n",
            "GET / HTP/1.1\r\n\r\n",
            "GET / HTTP/11\r\n\r\n",
            "GET  / HTTP/1.1\r\n\r\n",
            "get / HTTP/1.1\r\n\r\n",
        ];
        for raw in cases {
            assert!(parse_http_request(raw).is_none(), "accepted: {:?}", raw);
        }
    }

    #[test]
    fn junk_header_lines_are_skipped() {
        let raw = "GET / HTTP/1.1\r\nthis line has no colon\r\n: empty-name\r\nx-ok: yes\r\n\r\n";
        let req = parse_http_request(raw).unwrap();

        assert_eq!(req.headers.len(), 1);
        assert_eq!(req.header("x-ok"), Some("yes"));
    }

    #[test]
    fn body_absent_means_empty_string() {
        let req = parse_http_request("GET /api/state HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(req.body, "");
    }

    #[test]
    fn query_strings_stay_on_path() {
        let req = parse_http_request("GET /ws?clientId=abc&x=1 HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(req.path, "/ws?clientId=abc&x=1");
        assert_eq!(req.route_path(), "/ws");
        assert_eq!(req.query_param("clientId"), Some("abc"));
        assert_eq!(req.query_param("missing"), None);
    }

    #[test]
    fn empty_body_parses_to_empty_object() {
        let value = parse_json_body("").unwrap();
        assert_eq!(value, serde_json::json!({}));
    }

    #[test]
    fn invalid_json_body_maps_to_fixed_message() {
        let err = parse_json_body("{not json").unwrap_err();
        assert_eq!(err.to_string(), "Invalid JSON in request body");
    }

    #[test]
    fn valid_json_body_passes_through() {
        let value = parse_json_body("{\"promptTitle\":\"Verify\"}").unwrap();
        assert_eq!(value["promptTitle"], "Verify");
    }
}
