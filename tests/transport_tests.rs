use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use corefleet::transport::{
    AgentTransport, ApplyStage, HttpAgentTransport, TemplateRequest, TransportError,
};

const TOKEN: &str = "agent-secret";

#[derive(Default)]
struct FakeAgent {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    templates: Mutex<Vec<TemplateRequest>>,
    fail_reload: AtomicBool,
    slow_status: AtomicBool,
}

type Shared = Arc<FakeAgent>;

fn authorized(headers: &HeaderMap) -> Result<(), StatusCode> {
    let expected = format!("Bearer {}", TOKEN);
    match headers.get("authorization").and_then(|v| v.to_str().ok()) {
        Some(value) if value == expected => Ok(()),
        _ => Err(StatusCode::UNAUTHORIZED),
    }
}

async fn list_files(State(agent): State<Shared>, headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    authorized(&headers)?;
    let files = agent.files.lock().unwrap();
    let listing: Vec<Value> = files
        .iter()
        .map(|(name, body)| {
            json!({
                "filename": name,
                "modified_at": "2024-05-01T10:00:00Z",
                "size": body.len(),
                "hash": "abc123",
            })
        })
        .collect();
    Ok(Json(Value::Array(listing)))
}

async fn list_inbounds(headers: HeaderMap) -> Result<Json<Value>, StatusCode> {
    authorized(&headers)?;
    Ok(Json(json!([
        {"tag": "vless-in", "protocol": "vless", "port": 443, "filename": "xray-main.json"}
    ])))
}

async fn read_file(
    State(agent): State<Shared>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<Vec<u8>, StatusCode> {
    authorized(&headers)?;
    agent
        .files
        .lock()
        .unwrap()
        .get(&name)
        .cloned()
        .ok_or(StatusCode::NOT_FOUND)
}

async fn write_file(
    State(agent): State<Shared>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    authorized(&headers).map_err(|s| (s, String::new()))?;
    if serde_json::from_slice::<Value>(&body).is_err() {
        return Err((StatusCode::BAD_REQUEST, "invalid json".to_string()));
    }
    agent.files.lock().unwrap().insert(name, body.to_vec());
    Ok(StatusCode::OK)
}

async fn remove_file(
    State(agent): State<Shared>,
    Path(name): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, StatusCode> {
    authorized(&headers)?;
    agent.files.lock().unwrap().remove(&name);
    Ok(StatusCode::OK)
}

async fn write_template(
    State(agent): State<Shared>,
    headers: HeaderMap,
    Json(request): Json<TemplateRequest>,
) -> Result<StatusCode, StatusCode> {
    authorized(&headers)?;
    agent.templates.lock().unwrap().push(request);
    Ok(StatusCode::OK)
}

async fn status(State(agent): State<Shared>) -> Json<Value> {
    if agent.slow_status.load(Ordering::SeqCst) {
        tokio::time::sleep(Duration::from_secs(2)).await;
    }
    Json(json!({"running": true}))
}

async fn reload(State(agent): State<Shared>) -> Result<StatusCode, (StatusCode, String)> {
    if agent.fail_reload.load(Ordering::SeqCst) {
        return Err((StatusCode::INTERNAL_SERVER_ERROR, "core exited".to_string()));
    }
    Ok(StatusCode::OK)
}

async fn spawn_agent() -> (Shared, String) {
    let agent: Shared = Arc::new(FakeAgent::default());
    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/api/v1/protocols", get(list_files))
        .route("/api/v1/protocols/inbounds", get(list_inbounds))
        .route("/api/v1/protocols/template", post(write_template))
        .route(
            "/api/v1/protocols/:filename",
            get(read_file).post(write_file).delete(remove_file),
        )
        .route("/api/v1/service/status", get(status))
        .route("/api/v1/service/reload", post(reload))
        .with_state(agent.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (agent, address)
}

fn client(address: &str, timeout: Duration) -> HttpAgentTransport {
    HttpAgentTransport::new(address, TOKEN.to_string(), timeout).unwrap()
}

#[tokio::test]
async fn test_config_round_trip_over_http() {
    let (agent, address) = spawn_agent().await;
    let transport = client(&address, Duration::from_secs(5));

    assert!(transport.health().await.unwrap());

    let body = serde_json::to_vec(&json!({"inbounds": []})).unwrap();
    transport.apply_config("xray-main.json", &body).await.unwrap();
    assert_eq!(
        agent.files.lock().unwrap().get("xray-main.json").unwrap(),
        &body
    );

    let listed = transport.list_configs().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].filename, "xray-main.json");

    assert_eq!(transport.get_config("xray-main.json").await.unwrap(), body);

    let inbounds = transport.list_inbounds().await.unwrap();
    assert_eq!(inbounds[0].port, 443);

    assert!(transport.service_status().await.unwrap().running);

    transport.delete_config("xray-main.json").await.unwrap();
    assert!(agent.files.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_template_request_carries_variables() {
    let (agent, address) = spawn_agent().await;
    let transport = client(&address, Duration::from_secs(5));

    let mut variables = serde_json::Map::new();
    variables.insert("port".to_string(), json!(8443));
    let request = TemplateRequest {
        filename: "xray-tpl.json".to_string(),
        template: "vless-reality".to_string(),
        content: json!({"inbounds": [{"protocol": "vless", "port": "{{port}}"}]}),
        variables,
    };
    transport.write_template(&request).await.unwrap();

    let seen = agent.templates.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].filename, "xray-tpl.json");
    assert_eq!(seen[0].variables["port"], 8443);
}

#[tokio::test]
async fn test_non_success_status_is_rejected_with_body() {
    let (_, address) = spawn_agent().await;
    let transport = client(&address, Duration::from_secs(5));

    match transport.get_config("missing.json").await {
        Err(TransportError::Rejected { status, .. }) => assert_eq!(status, 404),
        other => panic!("expected rejection, got {:?}", other),
    }

    match transport.write_config("bad.json", b"not json").await {
        Err(TransportError::Rejected { status, body }) => {
            assert_eq!(status, 400);
            assert_eq!(body, "invalid json");
        }
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_wrong_token_is_rejected() {
    let (_, address) = spawn_agent().await;
    let transport = HttpAgentTransport::new(&address, "wrong".to_string(), Duration::from_secs(5)).unwrap();

    match transport.list_configs().await {
        Err(TransportError::Rejected { status, .. }) => assert_eq!(status, 401),
        other => panic!("expected rejection, got {:?}", other),
    }
}

#[tokio::test]
async fn test_reload_failure_is_observable_after_write() {
    let (agent, address) = spawn_agent().await;
    agent.fail_reload.store(true, Ordering::SeqCst);
    let transport = client(&address, Duration::from_secs(5));

    let err = transport
        .apply_config("xray-main.json", b"{}")
        .await
        .unwrap_err();
    assert_eq!(err.stage, ApplyStage::Reload);
    assert!(agent.files.lock().unwrap().contains_key("xray-main.json"));
}

#[tokio::test]
async fn test_slow_agent_times_out() {
    let (agent, address) = spawn_agent().await;
    agent.slow_status.store(true, Ordering::SeqCst);
    let transport = client(&address, Duration::from_millis(200));

    let err = transport.service_status().await.unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)));
    assert!(err.is_unreachable());
}

#[tokio::test]
async fn test_closed_port_is_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);

    let transport = client(&address, Duration::from_secs(2));
    assert!(matches!(
        transport.health().await,
        Err(TransportError::Unreachable(_))
    ));
}
