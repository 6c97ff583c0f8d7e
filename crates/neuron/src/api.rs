// SPDX-License-Identifier: PolyForm-Shield-1.0

//! HTTP management API.

use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use model_runtime::CachedModel;
use protocol::{DeployRequest, ModelRecord, ModelStatus};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::allocator::GpuLoad;
use crate::error::SupervisorError;
use crate::supervisor::{AvailableModel, ModelView, Supervisor};

const DEFAULT_LOG_LINES: usize = 100;
const MAX_LOG_LINES: usize = 10_000;

impl IntoResponse for SupervisorError {
    fn into_response(self) -> Response {
        let status = match &self {
            SupervisorError::NotFound(_) => StatusCode::NOT_FOUND,
            SupervisorError::AlreadyActive { .. }
            | SupervisorError::AttemptInFlight(_)
            | SupervisorError::PortInUse { .. }
            | SupervisorError::InvalidTransition { .. } => StatusCode::CONFLICT,
            SupervisorError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            SupervisorError::PortsExhausted(_)
            | SupervisorError::RuntimeUnavailable(_)
            | SupervisorError::Telemetry(_) => StatusCode::SERVICE_UNAVAILABLE,
            SupervisorError::LaunchFailed(_) => StatusCode::BAD_GATEWAY,
            SupervisorError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            warn!("neuron::api: {self}");
        }

        let body = serde_json::json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, SupervisorError>;

#[derive(Debug, Deserialize)]
struct LogsQuery {
    lines: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    pub abbr: String,
    pub logs: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub runtime: bool,
    pub running_models: usize,
}

pub fn router(supervisor: Supervisor) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/gpu-stats", get(gpu_stats))
        .route("/available-models", get(available_models))
        .route("/cached-models", get(cached_models))
        .route("/models", get(list_models))
        .route("/models/deploy", post(deploy))
        .route("/models/:abbr", get(get_model).delete(delete_model))
        .route("/models/:abbr/stop", post(stop_model))
        .route("/models/:abbr/start", post(start_model))
        .route("/models/:abbr/logs", get(model_logs))
        .with_state(supervisor)
}

async fn health(State(supervisor): State<Supervisor>) -> ApiResult<Json<HealthResponse>> {
    let runtime = supervisor.runtime_healthy().await;
    let running_models = supervisor
        .registry()
        .list_with_status(ModelStatus::Running)
        .await
        .map_err(SupervisorError::from)?
        .len();
    Ok(Json(HealthResponse {
        status: if runtime { "ok" } else { "degraded" }.to_string(),
        runtime,
        running_models,
    }))
}

async fn gpu_stats(State(supervisor): State<Supervisor>) -> ApiResult<Json<Vec<GpuLoad>>> {
    Ok(Json(supervisor.gpu_report().await?))
}

async fn available_models(State(supervisor): State<Supervisor>) -> Json<Vec<AvailableModel>> {
    Json(supervisor.available_models().await)
}

async fn cached_models(State(supervisor): State<Supervisor>) -> Json<Vec<CachedModel>> {
    Json(supervisor.cached_models().await)
}

async fn list_models(State(supervisor): State<Supervisor>) -> ApiResult<Json<Vec<ModelView>>> {
    Ok(Json(supervisor.list_views().await?))
}

async fn deploy(
    State(supervisor): State<Supervisor>,
    Json(request): Json<DeployRequest>,
) -> ApiResult<(StatusCode, Json<ModelRecord>)> {
    let record = supervisor.deploy(request).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn get_model(
    State(supervisor): State<Supervisor>,
    Path(abbr): Path<String>,
) -> ApiResult<Json<ModelRecord>> {
    Ok(Json(supervisor.get(&abbr).await?))
}

async fn delete_model(
    State(supervisor): State<Supervisor>,
    Path(abbr): Path<String>,
) -> ApiResult<StatusCode> {
    supervisor.delete(&abbr).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stop_model(
    State(supervisor): State<Supervisor>,
    Path(abbr): Path<String>,
) -> ApiResult<Json<ModelRecord>> {
    Ok(Json(supervisor.stop(&abbr).await?))
}

async fn start_model(
    State(supervisor): State<Supervisor>,
    Path(abbr): Path<String>,
) -> ApiResult<(StatusCode, Json<ModelRecord>)> {
    let record = supervisor.restart(&abbr).await?;
    Ok((StatusCode::ACCEPTED, Json(record)))
}

async fn model_logs(
    State(supervisor): State<Supervisor>,
    Path(abbr): Path<String>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<LogsResponse>> {
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES).clamp(1, MAX_LOG_LINES);
    let logs = supervisor.logs(&abbr, lines).await?;
    Ok(Json(LogsResponse { abbr, logs }))
}

/// Serve the management API until `shutdown` resolves.
pub async fn serve<F>(addr: SocketAddr, supervisor: Supervisor, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind management api on {addr}"))?;
    info!("neuron::api: listening on {}", listener.local_addr()?);

    axum::serve(listener, router(supervisor))
        .with_graceful_shutdown(shutdown)
        .await
        .context("management api server failed")?;
    info!("neuron::api: stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{record, scratch_dir, FakeProbe, FakeTelemetry, Harness};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request};
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    async fn call(app: &Router, method: Method, uri: &str, body: Option<&str>) -> (StatusCode, Vec<u8>) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header("content-type", "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };
        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, bytes.to_vec())
    }

    fn decode<T: DeserializeOwned>(bytes: &[u8]) -> T {
        serde_json::from_slice(bytes).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn deploy_then_inspect() {
        let h = Harness::new(FakeProbe::never());
        let app = router(h.supervisor.clone());

        let (status, body) = call(
            &app,
            Method::POST,
            "/models/deploy",
            Some(r#"{"name":"microsoft/Phi-3-mini-4k-instruct","abbr":"phi","type":"llm"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let deployed: ModelRecord = decode(&body);
        assert_eq!(deployed.status, ModelStatus::Deploying);
        assert_eq!(deployed.port, 8100);

        let (status, body) = call(&app, Method::GET, "/models/phi", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decode::<ModelRecord>(&body).abbr, "phi");

        let (status, body) = call(&app, Method::GET, "/models", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decode::<Vec<ModelRecord>>(&body).len(), 1);

        let (status, _) = call(
            &app,
            Method::POST,
            "/models/deploy",
            Some(r#"{"name":"microsoft/Phi-3-mini-4k-instruct","abbr":"phi","type":"llm"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn errors_map_to_status_codes() {
        let h = Harness::with_telemetry(FakeProbe::never(), FakeTelemetry::failing());
        h.registry
            .put(&record("idle", 8100, ModelStatus::Stopped))
            .await
            .unwrap();
        let app = router(h.supervisor.clone());

        let (status, body) = call(&app, Method::GET, "/models/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let error: serde_json::Value = decode(&body);
        assert_eq!(error["code"], 404);
        assert_eq!(error["error"], "model nope not found");

        let (status, _) = call(&app, Method::POST, "/models/idle/stop", None).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(
            &app,
            Method::POST,
            "/models/deploy",
            Some(r#"{"name":"x","abbr":"Bad Abbr","type":"llm"}"#),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&app, Method::GET, "/gpu-stats", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test(start_paused = true)]
    async fn logs_health_and_delete() {
        let h = Harness::new(FakeProbe::never());
        let app = router(h.supervisor.clone());
        h.supervisor
            .deploy(DeployRequest::new("phi", "org/phi", protocol::ModelType::Llm))
            .await
            .unwrap();
        h.runtime
            .set_logs(&Harness::container("phi"), "INFO: loading weights");

        let (status, body) = call(&app, Method::GET, "/models/phi/logs?lines=20", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(decode::<LogsResponse>(&body).logs, "INFO: loading weights");

        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = decode(&body);
        assert_eq!(health.status, "ok");
        assert_eq!(health.running_models, 0);

        let (status, body) = call(&app, Method::GET, "/gpu-stats", None).await;
        assert_eq!(status, StatusCode::OK);
        let gpus: Vec<serde_json::Value> = decode(&body);
        assert_eq!(gpus.len(), 2);
        // gpu 1 reports less memory in use.
        assert_eq!(gpus[1]["models"], serde_json::json!(["phi"]));
        for key in ["name", "memory_total_mb", "memory_free_mb", "utilization_percent", "temperature_celsius"] {
            assert!(!gpus[1][key].is_null(), "missing {key}");
        }

        let (status, _) = call(&app, Method::DELETE, "/models/phi", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        let (status, _) = call(&app, Method::GET, "/models/phi", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn degraded_health_when_runtime_is_down() {
        let h = Harness::new(FakeProbe::never());
        h.runtime.set_unreachable(true);
        let app = router(h.supervisor.clone());

        let (status, body) = call(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        let health: HealthResponse = decode(&body);
        assert_eq!(health.status, "degraded");
        assert!(!health.runtime);
    }

    #[tokio::test]
    async fn catalog_and_cache_listings() {
        let cache = scratch_dir("api-hub");
        let snapshot = cache.join("huggingface/hub/models--BAAI--bge-m3/snapshots/main");
        std::fs::create_dir_all(&snapshot).unwrap();
        std::fs::write(snapshot.join("config.json"), "{}").unwrap();
        let host_cache = cache.clone();
        let h = Harness::configured(FakeProbe::never(), move |settings| {
            settings.worker.host_cache_dir = host_cache;
            settings.catalog = serde_json::from_str(
                r#"{"predefined_models": [{"name": "BAAI/bge-m3", "abbr": "bge", "type": "embedding"}]}"#,
            )
            .unwrap();
        });
        let app = router(h.supervisor.clone());

        let (status, body) = call(&app, Method::GET, "/available-models", None).await;
        assert_eq!(status, StatusCode::OK);
        let available: Vec<serde_json::Value> = decode(&body);
        assert_eq!(available.len(), 1);
        assert_eq!(available[0]["abbr"], "bge");
        assert_eq!(available[0]["type"], "embedding");
        assert_eq!(available[0]["cached"], true);

        let (status, body) = call(&app, Method::GET, "/cached-models", None).await;
        assert_eq!(status, StatusCode::OK);
        let cached: Vec<CachedModel> = decode(&body);
        assert_eq!(cached.len(), 1);
        assert_eq!(cached[0].name, "BAAI/bge-m3");

        std::fs::remove_dir_all(&cache).unwrap();
    }
}
