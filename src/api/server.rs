use anyhow::Result;
use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use log::{info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;

use crate::api::error::ApiError;
use crate::api::handlers;
use crate::config::Config;
use crate::convert::ConverterRegistry;
use crate::error::Error;
use crate::forwarding::ForwardingRuleStore;
use crate::orchestrator::{CoreOrchestrator, SwitchAuditLog};
use crate::registry::AgentRegistry;
use crate::storage::Storage;
use crate::transport::TransportFactory;

#[derive(Clone)]
pub struct AppState {
    pub registry: AgentRegistry,
    pub rules: ForwardingRuleStore,
    pub orchestrator: CoreOrchestrator,
    pub audit: SwitchAuditLog,
    /// Required as a bearer token on admin routes when set
    pub admin_token: Option<String>,
}

impl AppState {
    pub fn new(
        storage: Arc<dyn Storage>,
        transports: Arc<dyn TransportFactory>,
        config: &Config,
    ) -> Self {
        Self {
            registry: AgentRegistry::new(storage.clone(), config.heartbeat_timeout()),
            rules: ForwardingRuleStore::new(storage.clone()),
            orchestrator: CoreOrchestrator::new(
                storage.clone(),
                transports,
                Arc::new(ConverterRegistry::new()),
                config.orchestrator(),
            ),
            audit: SwitchAuditLog::new(storage),
            admin_token: config.admin_token.clone(),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    let admin = Router::new()
        .route(
            "/agent-hosts",
            get(handlers::list_hosts).post(handlers::create_host),
        )
        .route(
            "/agent-hosts/:id",
            get(handlers::get_host)
                .put(handlers::update_host)
                .delete(handlers::delete_host),
        )
        .route(
            "/agent-hosts/:id/forwarding/rules",
            get(handlers::list_rules).post(handlers::create_rule),
        )
        .route(
            "/agent-hosts/:id/forwarding/rules/:rule_id",
            get(handlers::get_rule)
                .put(handlers::update_rule)
                .delete(handlers::delete_rule),
        )
        .route("/agent-hosts/:id/forwarding/version", get(handlers::rule_version))
        .route("/agent-hosts/:id/forwarding/logs", get(handlers::rule_logs))
        .route(
            "/agent-hosts/:id/core-instances",
            get(handlers::list_instances).post(handlers::create_instance),
        )
        .route(
            "/agent-hosts/:id/core-instances/:instance_id",
            get(handlers::get_instance).delete(handlers::delete_instance),
        )
        .route(
            "/agent-hosts/:id/core-switch",
            get(handlers::active_switch).post(handlers::switch_core),
        )
        .route("/agent-hosts/:id/core-convert", post(handlers::convert_config))
        .route("/agent-hosts/:id/core-switch-logs", get(handlers::switch_logs))
        .route(
            "/config-templates",
            get(handlers::list_templates).post(handlers::create_template),
        )
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin));

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/agent/heartbeat", post(handlers::agent_heartbeat))
        .route("/agent/metrics", post(handlers::agent_metrics).put(handlers::agent_metrics))
        .route("/agent/forwarding", get(handlers::agent_forwarding))
        .merge(admin)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn require_admin(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let Some(expected) = state.admin_token.as_deref() else {
        return next.run(request).await;
    };

    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    if presented == Some(expected) {
        next.run(request).await
    } else {
        ApiError(Error::InvalidToken).into_response()
    }
}

/// Serve until ctrl-c, running the liveness sweep alongside.
pub async fn serve(state: AppState, port: u16, sweep_interval: Duration) -> Result<()> {
    let shutdown = CancellationToken::new();
    let sweeper = state
        .registry
        .spawn_sweeper(sweep_interval, shutdown.clone());

    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("corefleet control plane listening on port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!("Liveness sweeper ended abnormally: {}", e);
    }
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Shutdown requested"),
            Err(e) => {
                warn!("Could not listen for ctrl-c: {}", e);
                shutdown.cancelled().await;
            }
        },
        _ = shutdown.cancelled() => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use crate::storage::memory::InMemoryStore;
    use crate::transport::HttpTransportFactory;

    fn create_test_app_with(config: Config) -> (Router, Arc<InMemoryStore>) {
        let storage = Arc::new(InMemoryStore::new());
        let transports = Arc::new(HttpTransportFactory::new(Duration::from_secs(2)));
        let state = AppState::new(storage.clone() as Arc<dyn Storage>, transports, &config);
        (create_router(state), storage)
    }

    fn create_test_app() -> (Router, Arc<InMemoryStore>) {
        create_test_app_with(Config::default())
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json");
        let body = match body {
            Some(json) => Body::from(json.to_string()),
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();

        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    async fn create_host(app: &Router) -> (String, String) {
        let (status, json) = send(
            app,
            "POST",
            "/agent-hosts",
            Some(json!({"name": "edge-1", "address": "http://127.0.0.1:1"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        (
            json["id"].as_str().unwrap().to_string(),
            json["token"].as_str().unwrap().to_string(),
        )
    }

    fn rule(port: u16) -> Value {
        json!({
            "name": format!("relay-{}", port),
            "protocol": "tcp",
            "listen_port": port,
            "target_address": "10.1.0.2",
            "target_port": 8080,
            "enabled": true,
            "priority": 0,
            "remark": "",
        })
    }

    #[tokio::test]
    async fn test_health_check() {
        let (app, _) = create_test_app();
        let (status, json) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "healthy");
    }

    #[tokio::test]
    async fn test_host_crud_hides_token() {
        let (app, _) = create_test_app();
        let (id, token) = create_host(&app).await;
        assert_eq!(token.len(), 64);

        let (status, json) = send(&app, "GET", &format!("/agent-hosts/{}", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.get("token").is_none());
        assert_eq!(json["status"], "offline");

        let (status, json) = send(
            &app,
            "PUT",
            &format!("/agent-hosts/{}", id),
            Some(json!({"name": "edge-renamed"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["name"], "edge-renamed");

        let (status, _) = send(&app, "DELETE", &format!("/agent-hosts/{}", id), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, json) = send(&app, "GET", &format!("/agent-hosts/{}", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(json["error"], "not_found");
    }

    #[tokio::test]
    async fn test_rule_endpoints_and_port_conflict() {
        let (app, _) = create_test_app();
        let (id, _) = create_host(&app).await;
        let rules = format!("/agent-hosts/{}/forwarding/rules", id);

        let (status, json) = send(&app, "POST", &rules, Some(rule(443))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["version"], 1);

        let (status, json) = send(&app, "POST", &rules, Some(rule(443))).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(json["error"], "port_conflict");

        let (status, json) = send(&app, "POST", &rules, Some(rule(0))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_input");

        let (status, json) = send(
            &app,
            "GET",
            &format!("/agent-hosts/{}/forwarding/version", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["version"], 1);

        let (status, json) = send(&app, "GET", &rules, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["rules"].as_array().unwrap().len(), 1);

        let (status, json) = send(
            &app,
            "GET",
            &format!("/agent-hosts/{}/forwarding/logs?limit=10", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 1);
        assert_eq!(json["items"][0]["action"], "create");
    }

    #[tokio::test]
    async fn test_agent_endpoints_require_token() {
        let (app, _) = create_test_app();
        let (id, token) = create_host(&app).await;

        let (status, json) = send(&app, "POST", "/agent/heartbeat?token=nope", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["error"], "invalid_token");

        let (status, json) =
            send(&app, "POST", &format!("/agent/heartbeat?token={}", token), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["host_id"], id.as_str());

        let (_, json) = send(&app, "GET", &format!("/agent-hosts/{}", id), None).await;
        assert_eq!(json["status"], "online");

        let (status, json) = send(
            &app,
            "GET",
            &format!("/agent/forwarding?token={}&version=0", token),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["changed"], false);
        assert!(json.get("rules").is_none());
    }

    #[tokio::test]
    async fn test_convert_endpoint() {
        let (app, _) = create_test_app();
        let (id, _) = create_host(&app).await;
        let uri = format!("/agent-hosts/{}/core-convert", id);

        let (status, json) = send(
            &app,
            "POST",
            &uri,
            Some(json!({
                "source_core": "xray",
                "target_core": "sing-box",
                "config": {"inbounds": [{"tag": "in", "protocol": "vless", "port": 443}]},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["document"]["inbounds"][0]["listen_port"], 443);

        let (status, json) = send(
            &app,
            "POST",
            &uri,
            Some(json!({"source_core": "xray", "target_core": "hysteria", "config": {}})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(json["error"], "invalid_input");
    }

    #[tokio::test]
    async fn test_create_instance_unreachable_agent_leaves_nothing() {
        let (app, _) = create_test_app();
        let (id, _) = create_host(&app).await;
        let uri = format!("/agent-hosts/{}/core-instances", id);

        let (status, json) = send(
            &app,
            "POST",
            &uri,
            Some(json!({
                "instance_id": "main",
                "core_type": "xray",
                "config": {"inbounds": [{"protocol": "vless", "port": 443}]},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert_eq!(json["error"], "agent_unreachable");

        let (status, json) = send(&app, "GET", &uri, None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_instance_and_active_switch_lookup() {
        use crate::types::{CoreInstance, CoreType, HostId, InstanceConfig, SwitchLog};

        let (app, storage) = create_test_app();
        let (id, _) = create_host(&app).await;
        let host_id: HostId = id.parse().unwrap();

        let (status, json) = send(&app, "GET", &format!("/agent-hosts/{}/core-switch", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(json.is_null());

        let instance = CoreInstance::new(
            host_id,
            "main".to_string(),
            CoreType::Xray,
            InstanceConfig::Document {
                document: json!({"inbounds": [{"protocol": "vless", "port": 443}]}),
            },
            vec![443],
        );
        storage.insert_instance(&instance).await.unwrap();
        storage
            .claim_switch(&SwitchLog::claim(
                host_id,
                "sw-1".to_string(),
                "main".to_string(),
                "sb-main".to_string(),
                CoreType::SingBox,
                true,
            ))
            .await
            .unwrap();

        let (status, json) = send(
            &app,
            "GET",
            &format!("/agent-hosts/{}/core-instances/main", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["instance_id"], "main");
        assert_eq!(json["listen_ports"], json!([443]));

        let (status, _) = send(
            &app,
            "GET",
            &format!("/agent-hosts/{}/core-instances/missing", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, json) = send(&app, "GET", &format!("/agent-hosts/{}/core-switch", id), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["switch_id"], "sw-1");
        assert_eq!(json["status"], "in_progress");
    }

    #[tokio::test]
    async fn test_switch_logs_reject_unknown_status() {
        let (app, _) = create_test_app();
        let (id, _) = create_host(&app).await;

        let (status, json) = send(
            &app,
            "GET",
            &format!("/agent-hosts/{}/core-switch-logs", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["total"], 0);

        let (status, _) = send(
            &app,
            "GET",
            &format!("/agent-hosts/{}/core-switch-logs?status=done", id),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_admin_token_guards_admin_routes_only() {
        let config = Config {
            admin_token: Some("s3cret".to_string()),
            ..Config::default()
        };
        let (app, _) = create_test_app_with(config);

        let (status, _) = send(&app, "GET", "/agent-hosts", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .uri("/agent-hosts")
                    .header("authorization", "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (status, _) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_templates() {
        let (app, _) = create_test_app();
        let (status, json) = send(
            &app,
            "POST",
            "/config-templates",
            Some(json!({
                "name": "vless-reality",
                "core_type": "xray",
                "document": {"inbounds": [{"protocol": "vless", "port": "{{port}}"}]},
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(json["core_type"], "xray");

        let (status, json) = send(&app, "GET", "/config-templates", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);
    }
}
