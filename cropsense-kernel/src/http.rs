/**
 * API REST CROPSENSE - Serving boundary du kernel
 *
 * RÔLE :
 * Expose les lectures capteurs, le statut système et le moteur de
 * recommandation (prédiction, entraînement, rechargement du modèle).
 *
 * FONCTIONNEMENT :
 * - Serveur Axum avec middleware API key optionnel
 * - Erreurs de validation -> 400 avec la liste des champs manquants/invalides
 * - Catégorie inconnue -> 422, modèle absent -> 503
 * - Prédiction, entraînement et rechargement sur un thread bloquant
 *   (spawn_blocking) : le chargement du modèle ne bloque pas le runtime
 *
 * SÉCURITÉ :
 * - Si une API key est configurée, header x-api-key obligatoire sur toutes
 *   les routes sauf /health
 */

use crate::health::{HealthTracker, KernelHealth};
use crate::models::{RecommendationRecord, SensorReading, SystemStatusRecord};
use crate::state::{SharedEngine, SharedSink};
use crate::status::StatusMonitor;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use cropsense_engine::{EngineError, EngineStatus, Recommendation, RecommendationRequest, TrainingReport};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Plafond de `?limit=` sur toutes les listes
pub const MAX_LIMIT: usize = crate::storage::TAIL_CAPACITY;
const DEFAULT_HISTORY_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub sink: SharedSink,
    pub engine: SharedEngine,
    pub monitor: Arc<StatusMonitor>,
    pub health_tracker: HealthTracker,
    pub api_key: Option<Arc<str>>,
}

type ApiError = (StatusCode, Json<Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn engine_error(e: EngineError) -> ApiError {
    match e {
        EngineError::NotTrained => api_error(StatusCode::SERVICE_UNAVAILABLE, "Model not trained"),
        EngineError::UnknownCategory { field, value } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "error": format!("Unknown category '{value}' for field '{field}'"),
                "field": field,
                "value": value,
            })),
        ),
        EngineError::Dataset(e) => api_error(StatusCode::UNPROCESSABLE_ENTITY, e.to_string()),
        other => {
            error!("[http] engine failure: {other}");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

async fn require_api_key(State(app): State<AppState>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let Some(expected) = app.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    // Health check toujours accessible
    if req.uri().path() == "/health" {
        return Ok(next.run(req).await);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == expected);

    if !ok {
        warn!("[http] rejected request to {} (bad api key)", req.uri().path());
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/api/sensor-data", get(get_sensor_data))
        .route("/api/predict", post(predict))
        .route("/api/train", post(train))
        .route("/api/model/reload", post(reload_model))
        .route("/api/system-status", get(get_system_status))
        .route("/api/system-status/history", get(get_status_history))
        .route("/api/recommendations", get(get_recommendations))
        .layer(middleware::from_fn_with_state(app_state.clone(), require_api_key))
        .with_state(app_state)
}

#[derive(Debug, Deserialize)]
struct LimitParams {
    limit: Option<usize>,
}

impl LimitParams {
    fn resolve(&self, default: usize) -> usize {
        self.limit.unwrap_or(default).min(MAX_LIMIT)
    }
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let engine = app.engine.status();
    Json(app.health_tracker.get_health(app.sink.readings_count(), engine))
}

// GET /api/sensor-data?limit=N (plus récentes d'abord)
async fn get_sensor_data(State(app): State<AppState>, Query(params): Query<LimitParams>) -> Json<Vec<SensorReading>> {
    Json(app.sink.latest_readings(params.resolve(MAX_LIMIT)))
}

// POST /api/predict
async fn predict(
    State(app): State<AppState>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<Recommendation>, ApiError> {
    let Json(body) = body.map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {e}")))?;

    let request = RecommendationRequest::from_json(&body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "error": "Missing or invalid fields",
                "missing_fields": e.missing_fields,
                "invalid_fields": e.invalid_fields,
            })),
        )
    })?;

    // le premier appel peut charger le modèle depuis le disque
    let engine = app.engine.clone();
    let (request, outcome) = tokio::task::spawn_blocking(move || {
        let outcome = engine.predict(&request);
        (request, outcome)
    })
    .await
    .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("prediction task failed: {e}")))?;
    let recommendation = outcome.map_err(engine_error)?;

    let record = RecommendationRecord {
        id: Uuid::new_v4(),
        request,
        crop: recommendation.crop.clone(),
        confidence: recommendation.confidence,
        timestamp: OffsetDateTime::now_utc(),
    };
    if let Err(e) = app.sink.append_recommendation(record) {
        warn!("[http] failed to record recommendation: {e}");
    }

    Ok(Json(recommendation))
}

#[derive(Debug, Deserialize)]
struct TrainBody {
    dataset_path: Option<String>,
}

// POST /api/train {dataset_path}
async fn train(
    State(app): State<AppState>,
    body: Result<Json<TrainBody>, JsonRejection>,
) -> Result<Json<TrainingReport>, ApiError> {
    let Json(body) = body.map_err(|e| api_error(StatusCode::BAD_REQUEST, format!("Invalid JSON body: {e}")))?;
    let Some(dataset_path) = body.dataset_path.filter(|path| !path.trim().is_empty()) else {
        return Err(api_error(StatusCode::BAD_REQUEST, "Missing field 'dataset_path'"));
    };

    info!("[http] training requested on {dataset_path}");
    let engine = app.engine.clone();
    let report = tokio::task::spawn_blocking(move || engine.train(&dataset_path))
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("training task failed: {e}")))?
        .map_err(engine_error)?;

    Ok(Json(report))
}

// POST /api/model/reload
async fn reload_model(State(app): State<AppState>) -> Result<Json<EngineStatus>, ApiError> {
    let engine = app.engine.clone();
    let status = tokio::task::spawn_blocking(move || engine.reload())
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("reload task failed: {e}")))?
        .map_err(engine_error)?;
    Ok(Json(status))
}

// GET /api/system-status (évalue et enregistre)
async fn get_system_status(State(app): State<AppState>) -> Result<Json<SystemStatusRecord>, ApiError> {
    app.monitor
        .check()
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// GET /api/system-status/history?limit=N
async fn get_status_history(
    State(app): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Json<Vec<SystemStatusRecord>> {
    Json(app.sink.status_history(params.resolve(DEFAULT_HISTORY_LIMIT)))
}

// GET /api/recommendations?limit=N
async fn get_recommendations(
    State(app): State<AppState>,
    Query(params): Query<LimitParams>,
) -> Json<Vec<RecommendationRecord>> {
    Json(app.sink.recent_recommendations(params.resolve(DEFAULT_HISTORY_LIMIT)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SystemStatus;
    use crate::status::DEFAULT_FRESHNESS_WINDOW;
    use crate::storage::{JsonlStore, SensorSink};
    use axum::body::Body;
    use axum::http::{header, Method};
    use cropsense_devkit::{DatasetBuilder, SensorPayloadBuilder, TestWorkspace};
    use cropsense_engine::{ForestParams, RecommendationEngine};
    use tower::ServiceExt;

    struct Harness {
        workspace: TestWorkspace,
        store: Arc<JsonlStore>,
        router: Router,
    }

    fn harness(api_key: Option<&str>) -> Harness {
        let workspace = TestWorkspace::new().unwrap();
        let store = Arc::new(JsonlStore::open(workspace.data_dir()).unwrap());
        let engine = RecommendationEngine::open(workspace.model_dir())
            .unwrap()
            .with_params(ForestParams { n_trees: 15, ..ForestParams::default() });
        let state = AppState {
            sink: store.clone(),
            engine: Arc::new(engine),
            monitor: Arc::new(StatusMonitor::new(store.clone(), DEFAULT_FRESHNESS_WINDOW)),
            health_tracker: HealthTracker::new(),
            api_key: api_key.map(Arc::from),
        };
        Harness { workspace, store, router: build_router(state) }
    }

    async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = axum::http::Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(value.to_string())
            }
            None => Body::empty(),
        };
        let response = router.clone().oneshot(builder.body(body).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn predict_body(soil_type: &str) -> Value {
        json!({
            "N": 82, "P": 44, "K": 41,
            "temperature": 23.1, "humidity": 81.5, "ph": 6.4, "rainfall": 225.0,
            "soil_type": soil_type, "weather": "rainy", "region": "kerala"
        })
    }

    async fn trained(harness: &Harness) {
        let path = harness
            .workspace
            .write_dataset("crops.csv", &DatasetBuilder::synthetic_corpus(8))
            .unwrap();
        let (status, report) = call(
            &harness.router,
            Method::POST,
            "/api/train",
            Some(json!({ "dataset_path": path.to_string_lossy() })),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{report}");
        assert_eq!(report["samples"], 24);
    }

    #[tokio::test]
    async fn test_health_is_plain_ok() {
        let harness = harness(None);
        let response = harness
            .router
            .clone()
            .oneshot(axum::http::Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"ok");
    }

    #[tokio::test]
    async fn test_predict_before_training_is_503() {
        let harness = harness(None);
        let (status, body) = call(&harness.router, Method::POST, "/api/predict", Some(predict_body("clay"))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "Model not trained");
    }

    #[tokio::test]
    async fn test_predict_reports_missing_and_invalid_fields() {
        let harness = harness(None);
        let mut body = predict_body("clay");
        body.as_object_mut().unwrap().remove("rainfall");
        body["N"] = json!("lots");

        let (status, error) = call(&harness.router, Method::POST, "/api/predict", Some(body)).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(error["missing_fields"], json!(["rainfall"]));
        assert_eq!(error["invalid_fields"], json!(["N"]));
    }

    #[tokio::test]
    async fn test_train_predict_and_history() {
        let harness = harness(None);
        trained(&harness).await;

        let (status, recommendation) =
            call(&harness.router, Method::POST, "/api/predict", Some(predict_body("clay"))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(recommendation["crop"], "rice");
        let confidence = recommendation["confidence"].as_f64().unwrap();
        assert!((0.0..=1.0).contains(&confidence));

        let (status, history) = call(&harness.router, Method::GET, "/api/recommendations", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["request"]["soil_type"], "clay");
    }

    #[tokio::test]
    async fn test_predict_loads_persisted_model_after_restart() {
        let first = harness(None);
        let path = first
            .workspace
            .write_dataset("crops.csv", &DatasetBuilder::synthetic_corpus(8))
            .unwrap();
        RecommendationEngine::open(first.workspace.model_dir())
            .unwrap()
            .with_params(ForestParams { n_trees: 15, ..ForestParams::default() })
            .train(&path)
            .unwrap();

        // nouveau moteur sur le même dossier, rien en mémoire
        let engine = Arc::new(RecommendationEngine::open(first.workspace.model_dir()).unwrap());
        let state = AppState {
            sink: first.store.clone(),
            engine: engine.clone(),
            monitor: Arc::new(StatusMonitor::new(first.store.clone(), DEFAULT_FRESHNESS_WINDOW)),
            health_tracker: HealthTracker::new(),
            api_key: None,
        };
        let router = build_router(state);

        let calls: Vec<_> = (0..4)
            .map(|_| {
                let router = router.clone();
                tokio::spawn(async move {
                    call(&router, Method::POST, "/api/predict", Some(predict_body("clay"))).await
                })
            })
            .collect();
        for handle in calls {
            let (status, recommendation) = handle.await.unwrap();
            assert_eq!(status, StatusCode::OK);
            assert_eq!(recommendation["crop"], "rice");
        }
        assert_eq!(engine.status().state, cropsense_engine::EngineState::LoadedFromDisk);
    }

    #[tokio::test]
    async fn test_unknown_category_is_422() {
        let harness = harness(None);
        trained(&harness).await;

        let (status, body) = call(&harness.router, Method::POST, "/api/predict", Some(predict_body("martian"))).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["field"], "soil_type");
        assert_eq!(body["value"], "martian");
        assert!(harness.store.recent_recommendations(10).is_empty());
    }

    #[tokio::test]
    async fn test_train_errors() {
        let harness = harness(None);
        let (status, _) = call(&harness.router, Method::POST, "/api/train", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let bad = harness
            .workspace
            .write_file("bad.csv", "N,P,K,label\n1,2,3,rice\n")
            .unwrap();
        let (status, body) = call(
            &harness.router,
            Method::POST,
            "/api/train",
            Some(json!({ "dataset_path": bad.to_string_lossy() })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["error"].as_str().unwrap().contains("temperature"));
    }

    #[tokio::test]
    async fn test_reload_without_model_is_503() {
        let harness = harness(None);
        let (status, _) = call(&harness.router, Method::POST, "/api/model/reload", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        trained(&harness).await;
        let (status, body) = call(&harness.router, Method::POST, "/api/model/reload", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "loaded_from_disk");
    }

    #[tokio::test]
    async fn test_sensor_data_most_recent_first_and_capped() {
        let harness = harness(None);
        for i in 0..105 {
            let payload = serde_json::from_value(SensorPayloadBuilder::baseline(i as f64, 50.0, 30.0, 6.5).to_json()).unwrap();
            harness.store.append_reading(payload).unwrap();
        }

        let (_, all) = call(&harness.router, Method::GET, "/api/sensor-data", None).await;
        let all = all.as_array().unwrap();
        assert_eq!(all.len(), MAX_LIMIT);
        assert_eq!(all[0]["temperature"], 104.0);

        let (_, few) = call(&harness.router, Method::GET, "/api/sensor-data?limit=3", None).await;
        assert_eq!(few.as_array().unwrap().len(), 3);

        let (_, capped) = call(&harness.router, Method::GET, "/api/sensor-data?limit=500", None).await;
        assert_eq!(capped.as_array().unwrap().len(), MAX_LIMIT);
    }

    #[tokio::test]
    async fn test_system_status_is_recorded() {
        let harness = harness(None);
        let (status, record) = call(&harness.router, Method::GET, "/api/system-status", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(record["status"], "offline");
        assert_eq!(record["message"], "No sensor data available");

        let (_, history) = call(&harness.router, Method::GET, "/api/system-status/history", None).await;
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(harness.store.status_history(1)[0].status, SystemStatus::Offline);
    }

    #[tokio::test]
    async fn test_system_health_reports_engine_and_counters() {
        let harness = harness(None);
        let (status, health) = call(&harness.router, Method::GET, "/system/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["engine"]["state"], "uninitialized");
        assert_eq!(health["ingestion"]["accepted"], 0);
        assert_eq!(health["mqtt_status"], "disconnected");
    }

    #[tokio::test]
    async fn test_api_key_guards_everything_but_health() {
        let harness = harness(Some("s3cret"));

        let (status, _) = call(&harness.router, Method::GET, "/api/sensor-data", None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let response = harness
            .router
            .clone()
            .oneshot(
                axum::http::Request::get("/api/sensor-data")
                    .header("x-api-key", "s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = harness
            .router
            .clone()
            .oneshot(axum::http::Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
