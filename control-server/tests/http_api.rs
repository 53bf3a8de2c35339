// control-server/tests/http_api.rs
mod common;

use serde_json::{json, Value};

#[tokio::test]
async fn control_page_requires_credentials() -> Result<(), Box<dyn std::error::Error>> {
    let ts = common::spawn_server().await;
    let client = reqwest::Client::new();

    // 1. No credentials at all
    let response = client.get(ts.url("/")).send().await?;
    assert_eq!(response.status(), 401);
    let challenge = response
        .headers()
        .get("WWW-Authenticate")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert_eq!(challenge, "Basic realm=\"Web Control\"");
    let body: Value = response.json().await?;
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Authentication required");

    // 2. Wrong password
    let response = client
        .get(ts.url("/"))
        .basic_auth("admin", Some("000000"))
        .send()
        .await?;
    // A fresh password has a one in a million chance of being 000000,
    // so tolerate both outcomes but require the challenge on rejection.
    if ts.password != "000000" {
        assert_eq!(response.status(), 401);
        let body: Value = response.json().await?;
        assert_eq!(body["message"], "Invalid credentials");
    }

    // 3. The real credentials
    let response = client
        .get(ts.url("/"))
        .basic_auth("admin", Some(&ts.password))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let page = response.text().await?;
    assert!(page.contains("Biometric Control"));

    ts.server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn enrollment_round_trip() -> Result<(), Box<dyn std::error::Error>> {
    let ts = common::spawn_server().await;
    let client = reqwest::Client::new();

    // 1. State starts with no keys
    let response = client
        .get(ts.url("/api/state"))
        .basic_auth("admin", Some(&ts.password))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["keysEnrolled"], false);

    // 2. Enroll
    let response = client
        .post(ts.url("/api/enroll"))
        .basic_auth("admin", Some(&ts.password))
        .json(&json!({ "config": { "url": "https://x", "method": "POST" } }))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await?;
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Enrollment successful");
    assert!(body["data"].is_null());
    assert!(body["timestamp"].is_string());

    // 3. State now reflects the enrollment
    let response = client
        .get(ts.url("/api/state"))
        .basic_auth("admin", Some(&ts.password))
        .send()
        .await?;
    let body: Value = response.json().await?;
    assert_eq!(body["data"]["keysEnrolled"], true);

    assert_eq!(ts.bridge.calls(), vec!["state", "enroll", "state"]);
    // The Bridge saw the inner config object, not the request envelope
    assert_eq!(
        ts.bridge.configs(),
        vec![json!({ "url": "https://x", "method": "POST" })]
    );

    ts.server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn bridge_failure_surfaces_verbatim() -> Result<(), Box<dyn std::error::Error>> {
    let ts = common::spawn_server().await;
    ts.bridge.fail_with("Sensor lockout: too many attempts");
    let client = reqwest::Client::new();

    let response = client
        .post(ts.url("/api/validate"))
        .basic_auth("admin", Some(&ts.password))
        .json(&json!({}))
        .send()
        .await?;
    assert_eq!(response.status(), 500);
    let body: Value = response.json().await?;
    assert_eq!(body["success"], false);
    assert_eq!(body["message"], "Sensor lockout: too many attempts");

    ts.server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn malformed_json_body_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let ts = common::spawn_server().await;
    let client = reqwest::Client::new();

    let response = client
        .post(ts.url("/api/enroll"))
        .basic_auth("admin", Some(&ts.password))
        .header("Content-Type", "application/json")
        .body("{not json")
        .send()
        .await?;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await?;
    assert_eq!(body["message"], "Invalid JSON in request body");

    // The Bridge never saw the request
    assert!(ts.bridge.calls().is_empty());

    ts.server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn configuration_updates_require_a_type() -> Result<(), Box<dyn std::error::Error>> {
    let ts = common::spawn_server().await;
    let client = reqwest::Client::new();

    // 1. Missing type field
    let response = client
        .post(ts.url("/api/config"))
        .basic_auth("admin", Some(&ts.password))
        .json(&json!({ "config": { "promptTitle": "Hi" } }))
        .send()
        .await?;
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await?;
    assert_eq!(body["message"], "Missing configuration type");

    // 2. Well formed update
    let response = client
        .post(ts.url("/api/config"))
        .basic_auth("admin", Some(&ts.password))
        .json(&json!({ "type": "prompt", "config": { "promptTitle": "Hi" } }))
        .send()
        .await?;
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await?;
    assert_eq!(body["success"], true);
    assert_eq!(ts.bridge.calls(), vec!["config:prompt"]);

    ts.server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn unknown_routes_are_not_found() -> Result<(), Box<dyn std::error::Error>> {
    let ts = common::spawn_server().await;
    let client = reqwest::Client::new();

    for (method, path) in [
        ("GET", "/api/enroll"),
        ("POST", "/api/state"),
        ("GET", "/missing"),
        ("GET", "/api/state?verbose=1"),
    ] {
        let request = match method {
            "GET" => client.get(ts.url(path)),
            _ => client.post(ts.url(path)),
        };
        let response = request
            .basic_auth("admin", Some(&ts.password))
            .send()
            .await?;
        assert_eq!(response.status(), 404, "{} {}", method, path);
    }

    ts.server.stop().await?;
    Ok(())
}

#[tokio::test]
async fn stopping_revokes_credentials_and_port() -> Result<(), Box<dyn std::error::Error>> {
    let ts = common::spawn_server().await;
    assert!(ts.server.is_running());
    assert!(ts.server.credentials().is_some());

    ts.server.stop().await?;

    assert!(!ts.server.is_running());
    assert!(ts.server.credentials().is_none());
    assert!(ts.server.local_addr().is_none());

    // The listener is gone, so new connections are refused
    let client = reqwest::Client::new();
    let result = client.get(ts.url("/")).send().await;
    assert!(result.is_err());

    // A second stop reports the server as not running
    assert!(ts.server.stop().await.is_err());
    Ok(())
}

#[tokio::test]
async fn server_restarts_with_fresh_credentials() -> Result<(), Box<dyn std::error::Error>> {
    let ts = common::spawn_server().await;
    assert!(ts.server.start().await.is_err());

    ts.server.stop().await?;
    let addr = ts.server.start().await?;
    let password = ts.server.credentials().map(|c| c.password).unwrap_or_default();
    assert_eq!(password.len(), 6);

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/api/state", addr))
        .basic_auth("admin", Some(&password))
        .send()
        .await?;
    assert_eq!(response.status(), 200);

    ts.server.stop().await?;
    Ok(())
}
