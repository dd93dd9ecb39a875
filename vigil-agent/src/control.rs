//! Control API
//!
//! Operators and ground tooling talk to the agent over HTTP. Handlers never
//! touch the session: they enqueue a `ControlCommand` that the acquisition
//! cycle applies between frames, or read the published status snapshot.
//!
//! Every route except `/health` requires the `x-api-key` header to match
//! `VIGIL_API_KEY`.

use crate::agent::ControlCommand;
use crate::notify::AlertMessage;
use crate::state::{RecentAlerts, Shared, StatusSnapshot};
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::sync::mpsc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct ControlState {
    pub status: Shared<StatusSnapshot>,
    pub alerts: Shared<RecentAlerts>,
    pub commands: mpsc::Sender<ControlCommand>,
    /// Unset means every protected route is refused
    pub api_key: Option<String>,
}

impl ControlState {
    pub fn api_key_from_env() -> Option<String> {
        std::env::var("VIGIL_API_KEY").ok().filter(|k| !k.is_empty())
    }
}

#[derive(Debug, Deserialize)]
pub struct ThresholdRequest {
    pub area: u32,
}

async fn require_api_key(State(app): State<ControlState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref() else {
        warn!("SECURITY: VIGIL_API_KEY not set - control access denied");
        return Err(StatusCode::UNAUTHORIZED);
    };

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);

    if !ok {
        warn!("Rejected control request to {}", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/status", get(get_status))
        .route("/alerts", get(get_alerts))
        .route("/monitoring/start", post(start_monitoring))
        .route("/monitoring/stop", post(stop_monitoring))
        .route("/detection/threshold", post(set_threshold))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(state, require_api_key))
}

/// Serve the control API until the listener fails
pub async fn serve(addr: SocketAddr, state: ControlState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Control API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state)).await
}

fn enqueue(app: &ControlState, command: ControlCommand) -> Result<(StatusCode, Json<Value>), StatusCode> {
    match app.commands.try_send(command) {
        Ok(()) => Ok((StatusCode::ACCEPTED, Json(json!({ "queued": command.to_string() })))),
        Err(mpsc::error::TrySendError::Full(_)) => Err(StatusCode::TOO_MANY_REQUESTS),
        Err(mpsc::error::TrySendError::Closed(_)) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

// GET /status
async fn get_status(State(app): State<ControlState>) -> Json<StatusSnapshot> {
    Json(app.status.lock().clone())
}

// GET /alerts (newest last)
async fn get_alerts(State(app): State<ControlState>) -> Json<Vec<AlertMessage>> {
    Json(app.alerts.lock().to_vec())
}

// POST /monitoring/start
async fn start_monitoring(State(app): State<ControlState>) -> Result<(StatusCode, Json<Value>), StatusCode> {
    enqueue(&app, ControlCommand::Start)
}

// POST /monitoring/stop
async fn stop_monitoring(State(app): State<ControlState>) -> Result<(StatusCode, Json<Value>), StatusCode> {
    enqueue(&app, ControlCommand::Stop)
}

// POST /detection/threshold {"area": 800}
async fn set_threshold(
    State(app): State<ControlState>,
    Json(req): Json<ThresholdRequest>,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    if req.area == 0 {
        return Err(StatusCode::UNPROCESSABLE_ENTITY);
    }
    enqueue(&app, ControlCommand::SetAreaThreshold(req.area))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::new_state;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn state(api_key: Option<&str>) -> (ControlState, mpsc::Receiver<ControlCommand>) {
        let (tx, rx) = mpsc::channel(4);
        let state = ControlState {
            status: new_state(StatusSnapshot::new("drone-7", 500)),
            alerts: new_state(RecentAlerts::new(10)),
            commands: tx,
            api_key: api_key.map(String::from),
        };
        (state, rx)
    }

    fn request(method: &str, uri: &str, key: Option<&str>, body: Option<&str>) -> HttpRequest<Body> {
        let mut builder = HttpRequest::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header("x-api-key", key);
        }
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_health_is_open() {
        let (state, _rx) = state(None);
        let response = router(state).oneshot(request("GET", "/health", None, None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_api_key_required() {
        let (state, _rx) = state(Some("secret"));
        let app = router(state);

        let missing = app.clone().oneshot(request("GET", "/status", None, None)).await.unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);
        let wrong = app.clone().oneshot(request("GET", "/status", Some("nope"), None)).await.unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        let ok = app.oneshot(request("GET", "/status", Some("secret"), None)).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unset_key_denies_everything_but_health() {
        let (state, _rx) = state(None);
        let response = router(state)
            .oneshot(request("POST", "/monitoring/start", Some(""), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_commands_are_enqueued() {
        let (state, mut rx) = state(Some("k"));
        let app = router(state);

        let start = app.clone().oneshot(request("POST", "/monitoring/start", Some("k"), None)).await.unwrap();
        assert_eq!(start.status(), StatusCode::ACCEPTED);
        let threshold = app
            .clone()
            .oneshot(request("POST", "/detection/threshold", Some("k"), Some(r#"{"area": 800}"#)))
            .await
            .unwrap();
        assert_eq!(threshold.status(), StatusCode::ACCEPTED);
        let stop = app.oneshot(request("POST", "/monitoring/stop", Some("k"), None)).await.unwrap();
        assert_eq!(stop.status(), StatusCode::ACCEPTED);

        assert_eq!(rx.recv().await, Some(ControlCommand::Start));
        assert_eq!(rx.recv().await, Some(ControlCommand::SetAreaThreshold(800)));
        assert_eq!(rx.recv().await, Some(ControlCommand::Stop));
    }

    #[tokio::test]
    async fn test_zero_threshold_rejected() {
        let (state, mut rx) = state(Some("k"));
        let response = router(state)
            .oneshot(request("POST", "/detection/threshold", Some("k"), Some(r#"{"area": 0}"#)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_status_body() {
        let (state, _rx) = state(Some("k"));
        let response = router(state).oneshot(request("GET", "/status", Some("k"), None)).await.unwrap();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let status: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(status["agent_id"], "drone-7");
        assert_eq!(status["state"], "idle");
        assert_eq!(status["area_threshold"], 500);
    }
}
