//! HTTP surface of the kernel
//!
//! Read side: `/health`, `/state`, `/entities`, `/fan`.
//! Write side: fan mode, curve parameters, fixed speed, and an agent reinstall request.
//!
//! When an API key is configured every route except `/health` requires a matching
//! `x-api-key` header. Writes go through `FanControlWriter`; nothing here touches the bus
//! or the appliance directly.

use crate::catalog::{EntityDescriptor, EntityRegistry};
use crate::control::{ControlError, FanControlWriter, FanView, ModeRequest};
use crate::coordinator::{Command, ReconciledState};
use crate::discovery::Shared;
use crate::health::{BusHealth, KernelHealth};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};
use unas_core::{CurveParam, FanCurveConfig};

#[derive(Clone)]
pub struct AppState {
    pub control: FanControlWriter,
    pub state_rx: watch::Receiver<ReconciledState>,
    pub registry: Shared<EntityRegistry>,
    pub commands: mpsc::Sender<Command>,
    pub health: BusHealth,
    pub api_key: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/state", get(get_state))
        .route("/entities", get(list_entities))
        .route("/fan", get(get_fan))
        .route("/fan/mode", put(put_fan_mode))
        .route("/fan/curve/{param}", put(put_curve_param))
        .route("/fan/speed", put(put_fan_speed))
        .route("/agent/reinstall", post(reinstall_agent))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);
    if !ok {
        warn!("Rejected {} {}: bad or missing x-api-key", req.method(), req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            e if e.is_validation() => StatusCode::UNPROCESSABLE_ENTITY,
            ControlError::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_GATEWAY,
        };
        (status, Json(json!({ "ok": false, "error": self.to_string() }))).into_response()
    }
}

// GET /health
async fn get_health(State(app): State<AppState>) -> Json<KernelHealth> {
    Json(app.health.report())
}

// GET /state
async fn get_state(State(app): State<AppState>) -> Json<ReconciledState> {
    Json(app.state_rx.borrow().clone())
}

// GET /entities
async fn list_entities(State(app): State<AppState>) -> Json<Vec<EntityDescriptor>> {
    Json(app.registry.lock().list())
}

// GET /fan
async fn get_fan(State(app): State<AppState>) -> Json<FanView> {
    Json(app.control.view())
}

// PUT /fan/mode  {"mode": "fixed_speed", "pwm": 150}
async fn put_fan_mode(
    State(app): State<AppState>,
    Json(request): Json<ModeRequest>,
) -> Result<Json<serde_json::Value>, ControlError> {
    let mode = app.control.set_mode(request).await?;
    Ok(Json(json!({ "ok": true, "fan_mode": mode })))
}

#[derive(Deserialize)]
struct CurveValue {
    value: i64,
}

// PUT /fan/curve/{param}  {"value": 45}
async fn put_curve_param(
    State(app): State<AppState>,
    Path(param): Path<String>,
    Json(body): Json<CurveValue>,
) -> Result<Json<FanCurveConfig>, Response> {
    let param: CurveParam = param.parse().map_err(|_| StatusCode::NOT_FOUND.into_response())?;
    let curve = app.control.set_curve_param(param, body.value).await.map_err(IntoResponse::into_response)?;
    Ok(Json(curve))
}

#[derive(Deserialize)]
struct SpeedPercent {
    percent: f64,
}

// PUT /fan/speed  {"percent": 60}
async fn put_fan_speed(
    State(app): State<AppState>,
    Json(body): Json<SpeedPercent>,
) -> Result<Json<serde_json::Value>, ControlError> {
    let pwm = app.control.set_speed_percent(body.percent).await?;
    Ok(Json(json!({ "ok": true, "pwm": pwm, "percent": body.percent })))
}

// POST /agent/reinstall
async fn reinstall_agent(State(app): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    match app.commands.send(Command::Redeploy).await {
        Ok(()) => {
            info!("Agent reinstall requested");
            (StatusCode::ACCEPTED, Json(json!({ "ok": true, "msg": "reinstall scheduled" })))
        }
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "ok": false, "msg": "coordinator is not running" })),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::StateCache;
    use crate::catalog::system_entities;
    use crate::discovery::new_shared;
    use axum::body::Body;
    use std::sync::Arc;
    use tower::ServiceExt;
    use unas_core::{Bus, Liveness, RemoteShell, Topics};
    use unas_devkit::{MockBus, ScriptedShell};

    const KEY: &str = "s3cret";

    struct Fixture {
        bus: MockBus,
        cache: StateCache,
        topics: Topics,
        commands: mpsc::Receiver<Command>,
        app: Router,
    }

    fn fixture(api_key: Option<&str>) -> Fixture {
        let bus = MockBus::new();
        let shell = ScriptedShell::new();
        shell.set_service("fan_control", true);
        let cache = StateCache::new();
        let topics = Topics::new("unas");
        let shared_bus: Arc<dyn Bus> = Arc::new(bus.clone());
        let shared_shell: Arc<dyn RemoteShell> = Arc::new(shell);
        let control = FanControlWriter::new(shared_bus, shared_shell, cache.clone(), topics.clone());
        let registry = new_shared(EntityRegistry::new());
        registry.lock().extend(system_entities());
        let (_state_tx, state_rx) = watch::channel(ReconciledState::default());
        let (tx, commands) = mpsc::channel(4);
        let health = BusHealth::new();
        health.mark_connected();

        let app = router(AppState {
            control,
            state_rx,
            registry,
            commands: tx,
            health,
            api_key: api_key.map(str::to_string),
        });
        Fixture { bus, cache, topics, commands, app }
    }

    fn online(cache: &StateCache) {
        cache.set_liveness(Liveness::Online);
        cache.put("cpu_temp", "48");
        cache.put("fan_speed", "128");
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<serde_json::Value>) -> (StatusCode, serde_json::Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri).header("x-api-key", KEY);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    #[tokio::test]
    async fn test_api_key_guards_everything_but_health() {
        let f = fixture(Some(KEY));
        let anonymous = |uri: &str| axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap();

        let response = f.app.clone().oneshot(anonymous("/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let response = f.app.clone().oneshot(anonymous("/state")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let (status, state) = send(&f.app, "GET", "/state", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(state["phase"], "uninitialized");
    }

    #[tokio::test]
    async fn test_open_api_without_key() {
        let f = fixture(None);
        let response = f.app.clone().oneshot(axum::http::Request::builder().uri("/entities").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_health_and_entities() {
        let f = fixture(Some(KEY));
        let (status, health) = send(&f.app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["mqtt_status"], "connected");

        let (_, entities) = send(&f.app, "GET", "/entities", None).await;
        let entities = entities.as_array().unwrap();
        assert_eq!(entities.len(), system_entities().len());
        assert!(entities.iter().any(|e| e["key"] == "cpu_temp" && e["device_class"] == "temperature"));
    }

    #[tokio::test]
    async fn test_curve_write_publishes_retained() {
        let f = fixture(Some(KEY));
        online(&f.cache);
        let (status, curve) = send(&f.app, "PUT", "/fan/curve/min_temp", Some(json!({ "value": 45 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(curve["min_temp"], 45);
        assert_eq!(f.bus.retained(&f.topics.fan_curve(CurveParam::MinTemp)).as_deref(), Some("45"));
    }

    #[tokio::test]
    async fn test_curve_write_errors() {
        let f = fixture(Some(KEY));
        let (status, _) = send(&f.app, "PUT", "/fan/curve/min_temp", Some(json!({ "value": 45 }))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        online(&f.cache);
        let (status, _) = send(&f.app, "PUT", "/fan/curve/max_rpm", Some(json!({ "value": 45 }))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = send(&f.app, "PUT", "/fan/curve/max_temp", Some(json!({ "value": 80 }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["ok"], false);
        assert!(f.bus.published().is_empty());

        f.bus.set_connected(false);
        let (status, _) = send(&f.app, "PUT", "/fan/curve/max_temp", Some(json!({ "value": 55 }))).await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_mode_then_speed() {
        let f = fixture(Some(KEY));
        online(&f.cache);

        let (status, _) = send(&f.app, "PUT", "/fan/speed", Some(json!({ "percent": 60 }))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

        let (status, body) = send(&f.app, "PUT", "/fan/mode", Some(json!({ "mode": "fixed_speed" }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["fan_mode"], json!({ "mode": "fixed_speed", "pwm": 128 }));
        assert_eq!(f.bus.retained(&f.topics.fan_mode()).as_deref(), Some("128"));

        // the agent echoes the retained mode back
        f.cache.put_control("fan_mode", "128");
        let (status, body) = send(&f.app, "PUT", "/fan/speed", Some(json!({ "percent": 80 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["pwm"], 204);
        assert_eq!(f.bus.retained(&f.topics.fan_mode()).as_deref(), Some("204"));

        let (_, fan) = send(&f.app, "GET", "/fan", None).await;
        assert_eq!(fan["available"], true);
        assert_eq!(fan["speed_pwm"], 128);
    }

    #[tokio::test]
    async fn test_reinstall_is_queued() {
        let mut f = fixture(Some(KEY));
        let (status, _) = send(&f.app, "POST", "/agent/reinstall", None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(f.commands.recv().await, Some(Command::Redeploy));

        drop(f.commands);
        let (status, _) = send(&f.app, "POST", "/agent/reinstall", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
