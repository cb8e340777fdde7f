//! HTTP shell: `/predict`, `/interface` and `/healthz`

use crate::config::ServerConfig;
use crate::error::ServiceError;
use crate::service::{RawRequest, SegmentationService};
use crate::types::envelope::{CapabilityManifest, Envelope};
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::Semaphore;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

pub const PREDICTION_PATH: &str = "/predict";
pub const INTERFACE_PATH: &str = "/interface";
pub const API_KEY_HEADER: &str = "x-api-key";
/// Form field accepted in place of the header
pub const API_KEY_FIELD: &str = "api_key";

#[derive(Clone)]
struct AppState {
    service: Arc<SegmentationService>,
    api_key: Arc<str>,
    permits: Arc<Semaphore>,
}

/// Request-level failure as seen by the HTTP caller
#[derive(Debug)]
pub enum AppError {
    Unauthorized,
    BadRequest(String),
    Service(ServiceError),
    Internal(String),
}

impl From<ServiceError> for AppError {
    fn from(e: ServiceError) -> Self {
        AppError::Service(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, kind, message) = match self {
            AppError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "missing or invalid API key".to_string(),
            ),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "invalid_argument", msg),
            AppError::Service(e) => {
                let status = match &e {
                    ServiceError::InvalidArgument(_) | ServiceError::Codec(_) => StatusCode::BAD_REQUEST,
                    ServiceError::ShapeMismatch { .. } => StatusCode::UNPROCESSABLE_ENTITY,
                    ServiceError::Resource { .. } | ServiceError::Runtime(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                };
                (status, e.kind(), e.to_string())
            }
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "internal", msg),
        };
        (
            status,
            Json(serde_json::json!({ "error": kind, "message": message })),
        )
            .into_response()
    }
}

/// Build the router around a ready service
pub fn router(service: Arc<SegmentationService>, server: &ServerConfig) -> Router {
    let state = AppState {
        service,
        api_key: Arc::from(server.api_key.as_str()),
        permits: Arc::new(Semaphore::new(server.max_concurrent_requests.max(1))),
    };

    Router::new()
        .route(PREDICTION_PATH, post(predict_handler))
        .route(INTERFACE_PATH, get(interface_handler))
        .route("/healthz", get(healthz_handler))
        .with_state(state)
        .layer(DefaultBodyLimit::max(server.max_upload_bytes))
        .layer(TraceLayer::new_for_http())
}

async fn healthz_handler() -> &'static str {
    "OK"
}

async fn interface_handler(State(state): State<AppState>) -> Json<CapabilityManifest> {
    Json(state.service.manifest())
}

async fn read_multipart(mut multipart: Multipart) -> Result<RawRequest, AppError> {
    let mut raw = RawRequest::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::BadRequest(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let data = field
            .bytes()
            .await
            .map_err(|e| AppError::BadRequest(e.body_text()))?;
        raw.push(name, data.to_vec());
    }
    Ok(raw)
}

/// Decide on the `X-Api-Key` header alone. `None` means the header is absent
/// and the form field has to be consulted.
fn header_verdict(expected: &str, headers: &HeaderMap) -> Option<bool> {
    if expected.is_empty() {
        return Some(true);
    }
    headers
        .get(API_KEY_HEADER)
        .map(|v| v.as_bytes() == expected.as_bytes())
}

async fn predict_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<Envelope>, AppError> {
    // A wrong header is refused before the body is buffered
    let verdict = header_verdict(&state.api_key, &headers);
    if verdict == Some(false) {
        warn!("Rejected request with invalid API key header");
        return Err(AppError::Unauthorized);
    }

    let raw = read_multipart(multipart).await?;
    if verdict.is_none() && raw.first(API_KEY_FIELD) != Some(state.api_key.as_bytes()) {
        warn!("Rejected request with missing or invalid API key");
        return Err(AppError::Unauthorized);
    }

    let _permit = state
        .permits
        .clone()
        .acquire_owned()
        .await
        .map_err(|e| AppError::Internal(format!("request gate closed: {e}")))?;

    let service = state.service.clone();
    let envelope = tokio::task::spawn_blocking(move || service.handle(&raw))
        .await
        .map_err(|e| AppError::Internal(format!("request worker failed: {e}")))??;
    Ok(Json(envelope))
}

/// Serve until ctrl-c
pub async fn serve(app: Router, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!(addr = %addr, "Segmentation service listening");

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to install CTRL+C handler");
            }
            info!("Shutting down gracefully");
        })
        .await
        .context("HTTP server error")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;
    use crate::config::AppConfig;
    use crate::metrics::ServiceMetrics;
    use crate::models::inference::test_support::ConstantRuntime;
    use crate::types::volume::{Geometry, Volume};
    use axum::body::{to_bytes, Body};
    use axum::http::{header::CONTENT_TYPE, Request};
    use ndarray::Array3;
    use tower::ServiceExt;

    const BOUNDARY: &str = "volseg-test-boundary";

    fn app(scratch: &std::path::Path, api_key: &str) -> Router {
        let mut config = AppConfig::default();
        config.geometry.volume_resolution = [2.0; 3];
        config.geometry.volume_size = [8, 8, 8];
        config.server.scratch_dir = Some(scratch.to_path_buf());
        config.server.api_key = api_key.to_string();

        let service = SegmentationService::from_config(
            &config,
            Arc::new(ConstantRuntime::new(0.9)),
            Arc::new(ServiceMetrics::new()),
        );
        router(Arc::new(service), &config.server)
    }

    fn volume_bytes() -> Vec<u8> {
        let geometry = Geometry::new([10, 10, 6], [1.0, 1.0, 2.0]);
        let data = Array3::from_shape_fn(geometry.array_shape(), |(z, y, x)| (x + y + z) as f32);
        codec::encode(&Volume::from_f32(geometry, data).unwrap(), true).unwrap()
    }

    fn multipart_body(parts: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, data) in parts {
            body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
            body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{name}\"; filename=\"{name}.bin\"\r\n")
                    .as_bytes(),
            );
            body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
            body.extend_from_slice(data);
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        body
    }

    fn predict_request(parts: &[(&str, &[u8])], api_key: Option<&str>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(PREDICTION_PATH)
            .header(CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"));
        if let Some(key) = api_key {
            builder = builder.header(API_KEY_HEADER, key);
        }
        builder.body(Body::from(multipart_body(parts))).unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_predict_returns_envelope() {
        let scratch = tempfile::tempdir().unwrap();
        let volume = volume_bytes();
        let response = app(scratch.path(), "")
            .oneshot(predict_request(&[("input", volume.as_slice()), ("threshold", &b"0.5"[..])], None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json[0]["type"], "LabelVolume");
        assert_eq!(json[1]["type"], "PlainText");
        assert!(!json[0]["content"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_bad_threshold_is_400() {
        let scratch = tempfile::tempdir().unwrap();
        let volume = volume_bytes();
        let response = app(scratch.path(), "")
            .oneshot(predict_request(&[("input", volume.as_slice()), ("threshold", &b"abc"[..])], None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["error"], "invalid_argument");
    }

    #[tokio::test]
    async fn test_api_key_is_enforced() {
        let scratch = tempfile::tempdir().unwrap();
        let volume = volume_bytes();
        let parts: &[(&str, &[u8])] = &[("input", volume.as_slice()), ("threshold", &b"0.5"[..])];

        let missing = app(scratch.path(), "secret")
            .oneshot(predict_request(parts, None))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::UNAUTHORIZED);

        let wrong = app(scratch.path(), "secret")
            .oneshot(predict_request(parts, Some("nope")))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);

        let header = app(scratch.path(), "secret")
            .oneshot(predict_request(parts, Some("secret")))
            .await
            .unwrap();
        assert_eq!(header.status(), StatusCode::OK);

        let form = app(scratch.path(), "secret")
            .oneshot(predict_request(
                &[("input", volume.as_slice()), ("threshold", &b"0.5"[..]), ("api_key", &b"secret"[..])],
                None,
            ))
            .await
            .unwrap();
        assert_eq!(form.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_wrong_key_header_refused_before_body_is_read() {
        let scratch = tempfile::tempdir().unwrap();
        let garbled = |key: &str| {
            Request::builder()
                .method("POST")
                .uri(PREDICTION_PATH)
                .header(CONTENT_TYPE, format!("multipart/form-data; boundary={BOUNDARY}"))
                .header(API_KEY_HEADER, key)
                .body(Body::from("this is not a multipart body"))
                .unwrap()
        };

        let wrong = app(scratch.path(), "secret")
            .oneshot(garbled("nope"))
            .await
            .unwrap();
        assert_eq!(wrong.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(json_body(wrong).await["error"], "unauthorized");

        // The right key gets as far as the body, which then fails to parse
        let right = app(scratch.path(), "secret")
            .oneshot(garbled("secret"))
            .await
            .unwrap();
        assert_eq!(right.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_interface_lists_widgets() {
        let scratch = tempfile::tempdir().unwrap();
        let response = app(scratch.path(), "")
            .oneshot(Request::builder().uri(INTERFACE_PATH).body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["inputs"][0]["type"], "volume");
        assert_eq!(json["inputs"][0]["destination"], "input");
        assert_eq!(json["inputs"][1]["type"], "slider");
        assert_eq!(json["inputs"][1]["destination"], "threshold");
        assert_eq!(json["outputs"], serde_json::json!(["LabelVolume", "PlainText"]));
    }

    #[tokio::test]
    async fn test_healthz() {
        let scratch = tempfile::tempdir().unwrap();
        let response = app(scratch.path(), "")
            .oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"OK");
    }
}
