//! HTTP API
//!
//! JSON endpoints over [`InferenceService`]. Failures render as
//! `{"success": false, "error": ...}`.

use crate::explain::Explanation;
use crate::inference::{BatchPrediction, CsvAnalysis, HealthStatus, InferenceService, ModelInfo, Prediction};
use crate::{FlowGuardError, Result};
use axum::{
    body::Bytes,
    extract::{
        multipart::MultipartError, rejection::JsonRejection, DefaultBodyLimit, FromRequest, Multipart,
        Request, State,
    },
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;
use tower_http::{catch_panic::CatchPanicLayer, cors::CorsLayer, trace::TraceLayer};

/// Upload size limit for CSV analysis
const MAX_UPLOAD_BYTES: usize = 64 * 1024 * 1024;

type SharedService = Arc<InferenceService>;

/// Handler error rendered as a JSON body
#[derive(Debug, Error)]
pub enum ApiError {
    /// Service-level failure
    #[error(transparent)]
    Service(#[from] FlowGuardError),
    /// Malformed request
    #[error("{0}")]
    BadRequest(String),
    /// Worker task failed
    #[error("{0}")]
    Internal(String),
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<MultipartError> for ApiError {
    fn from(err: MultipartError) -> Self {
        ApiError::BadRequest(err.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Service(FlowGuardError::ModelNotLoaded) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Service(FlowGuardError::InvalidInput(_) | FlowGuardError::Dataset(_))
            | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Service(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let message = self.to_string();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", message);
        } else {
            tracing::warn!("Request rejected: {}", message);
        }
        (status, Json(json!({ "success": false, "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct PredictRequest {
    features: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct BatchPredictRequest {
    features: Vec<Vec<f64>>,
}

#[derive(Debug, Deserialize)]
struct ExplainRequest {
    features: Vec<f64>,
    #[serde(default)]
    top_k: Option<usize>,
}

/// Build the router
pub fn router(service: SharedService) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/config", get(config))
        .route("/predict", post(predict))
        .route("/predict/batch", post(predict_batch))
        .route("/predict/explain", post(explain))
        .route("/analyze/csv", post(analyze_csv))
        .route("/api/last-analysis", get(get_last_analysis).post(set_last_analysis))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Bind and serve until shutdown
pub async fn serve(service: SharedService, addr: &str) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("FlowGuard API listening on {}", addr);
    axum::serve(listener, router(service)).await?;
    Ok(())
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!("Handler panicked: {}", detail);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "success": false, "error": "internal error" })),
    )
        .into_response()
}

async fn health(State(service): State<SharedService>) -> Json<HealthStatus> {
    Json(service.health())
}

async fn config(State(service): State<SharedService>) -> std::result::Result<Json<ModelInfo>, ApiError> {
    Ok(Json(service.model_info()?))
}

async fn predict(
    State(service): State<SharedService>,
    payload: std::result::Result<Json<PredictRequest>, JsonRejection>,
) -> std::result::Result<Json<Prediction>, ApiError> {
    let Json(request) = payload?;
    let prediction = tokio::task::spawn_blocking(move || service.predict(&request.features))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(prediction))
}

async fn predict_batch(
    State(service): State<SharedService>,
    payload: std::result::Result<Json<BatchPredictRequest>, JsonRejection>,
) -> std::result::Result<Json<BatchPrediction>, ApiError> {
    let Json(request) = payload?;
    let batch = tokio::task::spawn_blocking(move || service.predict_batch(&request.features))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(batch))
}

async fn explain(
    State(service): State<SharedService>,
    payload: std::result::Result<Json<ExplainRequest>, JsonRejection>,
) -> std::result::Result<Json<Explanation>, ApiError> {
    let Json(request) = payload?;
    let explanation =
        tokio::task::spawn_blocking(move || service.explain(&request.features, request.top_k))
            .await
            .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(explanation))
}

async fn analyze_csv(
    State(service): State<SharedService>,
    request: Request,
) -> std::result::Result<Json<CsvAnalysis>, ApiError> {
    let is_multipart = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("multipart/form-data"))
        .unwrap_or(false);

    let bytes = if is_multipart {
        let mut multipart = Multipart::from_request(request, &())
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?;
        read_upload(&mut multipart).await?
    } else {
        Bytes::from_request(request, &())
            .await
            .map_err(|e| ApiError::BadRequest(e.body_text()))?
    };

    let analysis = tokio::task::spawn_blocking(move || service.analyze_csv(&bytes))
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))??;
    Ok(Json(analysis))
}

/// Contents of the `file` field, or of the first field when none is named `file`.
async fn read_upload(multipart: &mut Multipart) -> std::result::Result<Bytes, ApiError> {
    let mut first = None;
    while let Some(field) = multipart.next_field().await? {
        let is_file = field.name() == Some("file");
        let data = field.bytes().await?;
        if is_file {
            return Ok(data);
        }
        first.get_or_insert(data);
    }
    first.ok_or_else(|| ApiError::BadRequest("upload has no file field".into()))
}

async fn get_last_analysis(State(service): State<SharedService>) -> Json<Option<Value>> {
    Json(service.last_analysis().map(|v| v.as_ref().clone()))
}

async fn set_last_analysis(
    State(service): State<SharedService>,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> std::result::Result<Json<Value>, ApiError> {
    let Json(value) = payload?;
    service.store_last_analysis(value);
    Ok(Json(json!({ "ok": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::ModelArtifactBundle;
    use crate::config::{ServiceConfig, TrainConfig};
    use crate::dataset::{sample_table, DatasetDialect, LoadedDataset};
    use crate::inference::AnalysisStore;
    use crate::trainer::Trainer;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use tower::ServiceExt;

    fn trained_service() -> SharedService {
        let dataset = LoadedDataset {
            table: sample_table(120, 21),
            label_column: "label".into(),
            dialect: DatasetDialect::Cicids,
            files: Vec::new(),
        };
        let config = TrainConfig { epochs: 3, batch_size: 32, hidden_dims: vec![8], ..Default::default() };
        let bundle: ModelArtifactBundle = Trainer::new(config).fit(&dataset).unwrap();
        let service_config = ServiceConfig { benign_label: "Normal".into(), ..Default::default() };
        Arc::new(InferenceService::from_bundle(
            service_config,
            Arc::new(bundle),
            Arc::new(AnalysisStore::new()),
        ))
    }

    fn degraded_service() -> SharedService {
        let config = ServiceConfig {
            artifacts_dir: std::env::temp_dir().join("flowguard-no-such-artifacts"),
            ..Default::default()
        };
        Arc::new(InferenceService::new(config, Arc::new(AnalysisStore::new())))
    }

    fn sample_csv(rows: usize) -> String {
        let table = sample_table(rows, 4);
        let mut out = table.headers.join(",").replace("label", "Label");
        out.push('\n');
        for row in &table.rows {
            out.push_str(&row.join(","));
            out.push('\n');
        }
        out
    }

    async fn send(app: Router, request: HttpRequest<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn post_json(uri: &str, body: Value) -> HttpRequest<Body> {
        HttpRequest::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn test_degraded_health_and_predict() {
        tokio_test::block_on(async {
            let app = router(degraded_service());
            let get = HttpRequest::builder().uri("/health").body(Body::empty()).unwrap();
            let (status, body) = send(app.clone(), get).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["model_loaded"], false);

            let (status, body) = send(app, post_json("/predict", json!({ "features": [0.0, 1.0] }))).await;
            assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
            assert_eq!(body["success"], false);
            assert_eq!(body["error"], "Model not loaded");
        });
    }

    #[tokio::test]
    async fn test_predict_and_config() {
        let app = router(trained_service());
        let (status, body) = send(app.clone(), post_json("/predict", json!({ "features": vec![0.0; 20] }))).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["predicted_class"].is_string());
        assert_eq!(body["top_predictions"].as_array().unwrap().len(), 2);

        let get = HttpRequest::builder().uri("/config").body(Body::empty()).unwrap();
        let (status, body) = send(app, get).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["input_dim"], 20);
        assert_eq!(body["class_names"], json!(["Attack", "Normal"]));
    }

    #[tokio::test]
    async fn test_malformed_json_is_structured() {
        let app = router(trained_service());
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/predict")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from("{"))
            .unwrap();
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_batch_and_explain() {
        let app = router(trained_service());
        let rows = vec![vec![0.5; 20]; 3];
        let (status, body) = send(app.clone(), post_json("/predict/batch", json!({ "features": rows }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_predictions"], 3);

        let (status, body) =
            send(app, post_json("/predict/explain", json!({ "features": vec![0.1; 20], "top_k": 3 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["top_features"].as_array().unwrap().len(), 3);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_large_batch_leaves_runtime_responsive() {
        let app = router(trained_service());
        let rows = vec![vec![0.25; 20]; 5000];
        let batch = tokio::spawn(send(app.clone(), post_json("/predict/batch", json!({ "features": rows }))));

        let get = HttpRequest::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, _) = send(app, get).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = batch.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_predictions"], 5000);
    }

    #[tokio::test]
    async fn test_csv_raw_body_then_last_analysis() {
        let app = router(trained_service());
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/analyze/csv")
            .header(header::CONTENT_TYPE, "text/csv")
            .body(Body::from(sample_csv(25)))
            .unwrap();
        let (status, body) = send(app.clone(), request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["total_rows"], 25);
        assert!(body["summary"]["accuracy"].is_number());

        let get = HttpRequest::builder().uri("/api/last-analysis").body(Body::empty()).unwrap();
        let (_, stored) = send(app, get).await;
        assert_eq!(stored["total_rows"], 25);
    }

    #[tokio::test]
    async fn test_csv_multipart_upload() {
        let app = router(trained_service());
        let boundary = "flowguardboundary";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"flows.csv\"\r\n\
             Content-Type: text/csv\r\n\r\n{csv}\r\n--{b}--\r\n",
            b = boundary,
            csv = sample_csv(7)
        );
        let request = HttpRequest::builder()
            .method("POST")
            .uri("/analyze/csv")
            .header(header::CONTENT_TYPE, format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap();
        let (status, body) = send(app, request).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_rows"], 7);
    }

    #[tokio::test]
    async fn test_store_last_analysis() {
        let app = router(degraded_service());
        let get = HttpRequest::builder().uri("/api/last-analysis").body(Body::empty()).unwrap();
        let (_, empty) = send(app.clone(), get).await;
        assert!(empty.is_null());

        let (status, body) = send(app.clone(), post_json("/api/last-analysis", json!({ "rows": 3 }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);

        let get = HttpRequest::builder().uri("/api/last-analysis").body(Body::empty()).unwrap();
        let (_, stored) = send(app, get).await;
        assert_eq!(stored, json!({ "rows": 3 }));
    }
}
