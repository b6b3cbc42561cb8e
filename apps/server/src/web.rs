use crate::SharedEngine;
use anyhow::{Context, Result};
use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use heating_engine::{CalibrationOutcome, ConfigError, EngineStatus};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;

#[derive(Clone)]
pub struct WebState {
    pub engine: SharedEngine,
    pub last_calibration: Arc<RwLock<Option<CalibrationOutcome>>>,
}

impl WebState {
    pub fn new(engine: SharedEngine) -> Self {
        WebState {
            engine,
            last_calibration: Arc::new(RwLock::new(None)),
        }
    }
}

#[derive(Serialize)]
pub struct StatusResponse {
    #[serde(flatten)]
    pub status: EngineStatus,
    pub last_calibration: Option<CalibrationOutcome>,
}

#[derive(Deserialize)]
pub struct TargetRequest {
    target: f64,
}

fn failure(code: StatusCode, error: impl ToString) -> Response {
    (
        code,
        axum::Json(json!({
            "success": false,
            "error": error.to_string()
        })),
    )
        .into_response()
}

fn config_failure(e: ConfigError) -> Response {
    let code = match e {
        ConfigError::UnknownZone(_) => StatusCode::NOT_FOUND,
        ConfigError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::BAD_REQUEST,
    };
    failure(code, e)
}

pub fn router(state: WebState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/learning/:zone", get(get_learning))
        .route("/api/calibrate", post(start_calibration))
        .route("/api/zones/:zone/target", post(set_target))
        .route("/api/zones/:zone/resume", post(resume_zone))
        .layer(ServiceBuilder::new().layer(CompressionLayer::new()))
        .with_state(state)
}

pub async fn create_web_server(addr: &str, state: WebState) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding web server {}", addr))?;
    info!("web server on http://{}", addr);
    axum::serve(listener, router(state)).await.context("web server")
}

async fn get_status(State(state): State<WebState>) -> axum::Json<StatusResponse> {
    let status = state.engine.lock().await.status(Utc::now());
    let last_calibration = state.last_calibration.read().await.clone();
    axum::Json(StatusResponse {
        status,
        last_calibration,
    })
}

async fn get_learning(State(state): State<WebState>, Path(zone): Path<String>) -> Response {
    let learning = state.engine.lock().await.learning_stats(&zone).await;
    match learning {
        Ok(Some(stats)) => axum::Json(stats).into_response(),
        Ok(None) => failure(StatusCode::NOT_FOUND, format!("zone {} not found", zone)),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e),
    }
}

/// Calibration runs for minutes, so it is started in the background.
/// Control cycles keep running meanwhile and leave the boiler alone.
async fn start_calibration(State(state): State<WebState>) -> Response {
    let calibrator = {
        let engine = state.engine.lock().await;
        if engine.boiler_gate().is_held() {
            return failure(StatusCode::CONFLICT, "calibration already running");
        }
        engine.calibrator()
    };

    tokio::spawn(async move {
        let outcome = calibrator.calibrate().await;
        info!("calibration finished: {:?}", outcome);
        if let Some(opv) = outcome.value() {
            if let Err(e) = state.engine.lock().await.set_overshoot_protection(Some(opv)).await {
                warn!("could not persist overshoot protection value: {}", e);
            }
        }
        *state.last_calibration.write().await = Some(outcome);
    });

    (StatusCode::ACCEPTED, axum::Json(json!({ "success": true }))).into_response()
}

async fn set_target(
    State(state): State<WebState>,
    Path(zone): Path<String>,
    Json(request): Json<TargetRequest>,
) -> Response {
    let result = state.engine.lock().await.set_zone_target(&zone, request.target).await;
    match result {
        Ok(effective) => axum::Json(json!({
            "success": true,
            "effective_target": effective
        }))
        .into_response(),
        Err(e) => config_failure(e),
    }
}

async fn resume_zone(State(state): State<WebState>, Path(zone): Path<String>) -> Response {
    let result = state.engine.lock().await.clear_manual_override(&zone).await;
    match result {
        Ok(()) => axum::Json(json!({ "success": true })).into_response(),
        Err(e) => config_failure(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use heating_engine::interfaces::{NoWeather, SystemClock};
    use heating_engine::{
        CachedRegistry, Collaborators, GlobalConfig, HeatingCycleEngine, JsonFileStore,
        JsonLinesEventStore, Zone,
    };
    use serde_json::Value;
    use tokio::sync::Mutex;
    use tower::ServiceExt;

    fn state(name: &str) -> anyhow::Result<WebState> {
        let dir = std::env::temp_dir().join(format!("heating-web-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        let registry = Arc::new(CachedRegistry::new(
            Arc::new(SystemClock),
            chrono::Duration::seconds(180),
            None,
        ));
        let mut config = GlobalConfig::default();
        config.boiler.flow_sensor = Some("sensor.flow".into());
        let engine = HeatingCycleEngine::new(
            vec![Zone::new("lounge", "Lounge")],
            config,
            Collaborators {
                registry,
                bus: Arc::new(crate::relay::UdpRelayBus::new(4210, None)),
                config_store: Arc::new(JsonFileStore::new(&dir)),
                event_store: Arc::new(JsonLinesEventStore::new(dir.join("events"))),
                weather: Arc::new(NoWeather),
            },
            Utc::now(),
        )?;
        Ok(WebState::new(Arc::new(Mutex::new(engine))))
    }

    async fn call(
        state: &WebState,
        method: &str,
        uri: &str,
        body: Option<Value>,
    ) -> anyhow::Result<(StatusCode, Value)> {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(match body {
                Some(v) => Body::from(serde_json::to_vec(&v)?),
                None => Body::empty(),
            })?;
        let response = router(state.clone()).oneshot(request).await?;
        let code = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await?;
        Ok((code, serde_json::from_slice(&bytes)?))
    }

    #[tokio::test]
    async fn status_lists_zones() -> anyhow::Result<()> {
        let state = state("status")?;
        let (code, body) = call(&state, "GET", "/api/status", None).await?;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["zones"][0]["id"], "lounge");
        assert_eq!(body["zones"][0]["state"], "unset");
        assert!(body["last_calibration"].is_null());
        Ok(())
    }

    #[tokio::test]
    async fn target_changes_are_validated() -> anyhow::Result<()> {
        let state = state("target")?;
        let target = |t: f64| Some(json!({ "target": t }));
        let (code, body) = call(&state, "POST", "/api/zones/lounge/target", target(21.5)).await?;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["effective_target"], 21.5);
        assert_eq!(state.engine.lock().await.zone("lounge").unwrap().target_temperature, 21.5);

        let (code, _) = call(&state, "POST", "/api/zones/cellar/target", target(21.5)).await?;
        assert_eq!(code, StatusCode::NOT_FOUND);
        let (code, body) = call(&state, "POST", "/api/zones/lounge/target", target(60.0)).await?;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
        Ok(())
    }

    #[tokio::test]
    async fn learning_and_resume() -> anyhow::Result<()> {
        let state = state("learning")?;
        let (code, body) = call(&state, "GET", "/api/learning/lounge", None).await?;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["sample_count"], 0);
        assert_eq!(body["ready"], false);
        let (code, _) = call(&state, "GET", "/api/learning/cellar", None).await?;
        assert_eq!(code, StatusCode::NOT_FOUND);

        let (code, body) = call(&state, "POST", "/api/zones/lounge/resume", None).await?;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(body["success"], true);
        Ok(())
    }

    #[tokio::test]
    async fn calibration_is_exclusive() -> anyhow::Result<()> {
        let state = state("calibrate")?;
        let gate = state.engine.lock().await.boiler_gate();
        let guard = gate.acquire().await;
        let (code, _) = call(&state, "POST", "/api/calibrate", None).await?;
        assert_eq!(code, StatusCode::CONFLICT);
        drop(guard);
        Ok(())
    }
}
