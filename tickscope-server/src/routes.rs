//! HTTP API.
//!
//! Thin wrappers over [`Store`]; every failure is a JSON `{ "error": ... }`
//! body with a status derived from the core error.

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tickscope_core::derive::JobRequest;
use tickscope_core::{DerivationGroup, Error, SeriesRequest, SourceRequest, Store};
use tokio_util::sync::CancellationToken;

/// Largest accepted capture or plugin upload.
const MAX_UPLOAD_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    /// Cancelled when the process is shutting down
    pub shutdown: CancellationToken,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/captures", get(list_captures).delete(clear_captures))
        .route("/api/captures/upload", post(upload_capture))
        .route("/api/captures/load", post(load_capture))
        .route("/api/captures/:id", delete(remove_capture))
        .route("/api/captures/:id/series", get(series_query).post(series_batch))
        .route("/api/live", get(list_live))
        .route("/api/live/start", post(start_live))
        .route("/api/live/stop", post(stop_live))
        .route("/api/plugins", get(list_plugins).post(upload_plugin))
        .route("/api/plugins/:id", delete(delete_plugin))
        .route("/api/plugins/:id/source", get(plugin_source))
        .route("/api/groups", get(list_groups).post(define_group))
        .route("/api/jobs", get(list_jobs).post(start_job))
        .route("/api/jobs/:output/stop", post(stop_job))
        .route("/ws", get(crate::ws::handler))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(state)
}

/// A core error rendered as an HTTP response.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::CaptureNotFound(_) | Error::PluginNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidRequest(_)
            | Error::Protocol(_)
            | Error::PluginInvalid { .. }
            | Error::Json(_) => StatusCode::BAD_REQUEST,
            Error::SourceUnavailable { .. } | Error::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::warn!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn health(State(state): State<AppState>) -> Json<Value> {
    let status = state.store.status().await;
    Json(json!({ "status": "ok", "store": status }))
}

// ============================================
// Captures
// ============================================

async fn list_captures(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "captures": state.store.list_captures() }))
}

async fn clear_captures(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    state.store.clear_state().await?;
    Ok(Json(json!({ "cleared": true })))
}

#[derive(Debug, Deserialize)]
struct UploadQuery {
    name: Option<String>,
}

async fn upload_capture(
    State(state): State<AppState>,
    Query(query): Query<UploadQuery>,
    body: Bytes,
) -> ApiResult<Response> {
    let outcome = state
        .store
        .upload_capture(&body, query.name.as_deref())
        .await?;
    let status = if outcome.deduplicated {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    Ok((status, Json(outcome)).into_response())
}

async fn load_capture(
    State(state): State<AppState>,
    Json(request): Json<SourceRequest>,
) -> ApiResult<Response> {
    let summary = state.store.load_capture(request).await?;
    Ok((StatusCode::CREATED, Json(summary)).into_response())
}

async fn remove_capture(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.store.remove_capture(&id).await? {
        return Err(Error::CaptureNotFound(id).into());
    }
    Ok(Json(json!({ "capture_id": id, "removed": true })))
}

#[derive(Debug, Deserialize)]
struct SeriesQuery {
    path: String,
    #[serde(default)]
    prefer_cache: Option<bool>,
}

async fn series_query(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<SeriesQuery>,
) -> ApiResult<Response> {
    let request = SeriesRequest {
        capture_id: id,
        paths: vec![query.path],
        path: None,
        prefer_cache: query.prefer_cache.unwrap_or(true),
    };
    Ok(Json(state.store.series(&request).await?).into_response())
}

async fn series_batch(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut request): Json<SeriesRequest>,
) -> ApiResult<Response> {
    request.capture_id = id;
    Ok(Json(state.store.series(&request).await?).into_response())
}

// ============================================
// Live streams
// ============================================

async fn list_live(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "streams": state.store.list_live().await }))
}

async fn start_live(
    State(state): State<AppState>,
    Json(request): Json<SourceRequest>,
) -> ApiResult<Response> {
    let summary = state.store.start_live(request).await?;
    Ok((StatusCode::CREATED, Json(summary)).into_response())
}

#[derive(Debug, Deserialize)]
struct StopLive {
    capture_id: String,
}

async fn stop_live(
    State(state): State<AppState>,
    Json(request): Json<StopLive>,
) -> ApiResult<Json<Value>> {
    let stopped = state.store.stop_live(&request.capture_id).await?;
    Ok(Json(json!({ "capture_id": request.capture_id, "stopped": stopped })))
}

// ============================================
// Plugins
// ============================================

async fn list_plugins(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "plugins": state.store.plugins().list()? })))
}

/// Invalid manifests are stored but answered with `400` and the record.
async fn upload_plugin(State(state): State<AppState>, body: Bytes) -> ApiResult<Response> {
    let record = state.store.plugins().upload(&body)?;
    let status = if record.valid {
        StatusCode::CREATED
    } else {
        StatusCode::BAD_REQUEST
    };
    let error = record.validation_error.clone();
    Ok((status, Json(json!({ "plugin": record, "error": error }))).into_response())
}

async fn plugin_source(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Response> {
    let source = state.store.plugins().source(&id)?;
    Ok((
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        source,
    )
        .into_response())
}

async fn delete_plugin(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    if !state.store.plugins().delete(&id)? {
        return Err(Error::PluginNotFound(id).into());
    }
    Ok(Json(json!({ "plugin_id": id, "deleted": true })))
}

// ============================================
// Derivations
// ============================================

async fn list_groups(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "groups": state.store.jobs().groups() }))
}

async fn define_group(
    State(state): State<AppState>,
    Json(group): Json<DerivationGroup>,
) -> ApiResult<Json<Value>> {
    Ok(Json(json!({ "group": state.store.jobs().define_group(group)? })))
}

async fn list_jobs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "jobs": state.store.jobs().list().await }))
}

async fn start_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> ApiResult<Response> {
    let info = state.store.jobs().start(request).await?;
    Ok((StatusCode::CREATED, Json(info)).into_response())
}

async fn stop_job(State(state): State<AppState>, Path(output): Path<String>) -> Json<Value> {
    let stopped = state.store.jobs().stop(&output).await;
    Json(json!({ "output_capture_id": output, "stopped": stopped }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let cases = [
            (Error::CaptureNotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::InvalidRequest("bad".into()), StatusCode::BAD_REQUEST),
            (
                Error::SourceUnavailable {
                    locator: "http://h/c".into(),
                    message: "HTTP 404".into(),
                },
                StatusCode::BAD_GATEWAY,
            ),
            (Error::Derivation("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            let message = error.to_string();
            let response = ApiError(error).into_response();
            assert_eq!(response.status(), status);
            assert_eq!(body_json(response).await["error"], json!(message));
        }
    }

    #[tokio::test]
    async fn test_upload_then_list() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState {
            store: Arc::new(Store::open_in(dir.path()).unwrap()),
            shutdown: CancellationToken::new(),
        };
        let line = Bytes::from_static(b"{\"tick\":1,\"entities\":{\"e\":{\"c\":{\"v\":1}}}}\n");

        let created = upload_capture(
            State(state.clone()),
            Query(UploadQuery {
                name: Some("one".into()),
            }),
            line.clone(),
        )
        .await
        .ok()
        .unwrap();
        assert_eq!(created.status(), StatusCode::CREATED);

        let again = upload_capture(State(state.clone()), Query(UploadQuery { name: None }), line)
            .await
            .ok()
            .unwrap();
        assert_eq!(again.status(), StatusCode::OK);
        assert_eq!(body_json(again).await["deduplicated"], json!(true));

        let Json(listed) = list_captures(State(state.clone())).await;
        assert_eq!(listed["captures"].as_array().unwrap().len(), 1);
        state.store.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_plugin_upload_is_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState {
            store: Arc::new(Store::open_in(dir.path()).unwrap()),
            shutdown: CancellationToken::new(),
        };
        let body = Bytes::from_static(br#"{"id":"p","name":"P","outputs":[]}"#);
        let response = upload_plugin(State(state.clone()), body).await.ok().unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["plugin"]["valid"], json!(false));
        assert!(json["error"].is_string());

        let missing = delete_plugin(State(state.clone()), Path("nope".into())).await;
        assert!(matches!(missing, Err(ApiError(Error::PluginNotFound(_)))));
        state.store.shutdown().await;
    }
}
