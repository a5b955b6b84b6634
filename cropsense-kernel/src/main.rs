/**
 * CROPSENSE KERNEL - Point d'entrée principal du service
 *
 * RÔLE : Orchestration de tous les modules : config, stockage, moteur de
 * recommandation, ingestion MQTT, monitoring, HTTP.
 *
 * ARCHITECTURE : une tâche tokio pour l'ingestion + le serveur Axum, sur le
 * même runtime. Le moteur est partagé par Arc, sans état global.
 * Échec d'ouverture du dossier data ou modèles, ou du bind HTTP -> arrêt
 * (exit 1). Le modèle persisté est chargé avant l'ouverture du serveur.
 */

mod config;
mod health;
mod http;
mod ingestor;
mod models;
mod state;
mod status;
mod storage;

use crate::config::{load_config, KernelConfig};
use crate::health::HealthTracker;
use crate::http::AppState;
use crate::state::{SharedEngine, SharedSink};
use crate::status::StatusMonitor;
use crate::storage::JsonlStore;

use anyhow::{Context, Result};
use cropsense_engine::RecommendationEngine;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cfg: KernelConfig = load_config().await;
    if let Err(e) = run(cfg).await {
        error!("[kernel] fatal: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cfg: KernelConfig) -> Result<()> {
    // stockage capteurs / statuts / recommandations
    let sink: SharedSink = Arc::new(
        JsonlStore::open(&cfg.storage.data_dir)
            .with_context(|| format!("cannot open data dir {}", cfg.storage.data_dir.display()))?,
    );

    // moteur de recommandation
    let engine: SharedEngine = Arc::new(
        RecommendationEngine::open(&cfg.model.dir)
            .with_context(|| format!("cannot open model dir {}", cfg.model.dir.display()))?
            .with_params(cfg.model.forest_params()),
    );

    if let Some(dataset) = cfg.model.bootstrap_dataset.clone() {
        bootstrap_training(engine.clone(), dataset).await;
    }
    warm_model(engine.clone()).await;

    let health_tracker = HealthTracker::new();

    // MQTT remplit le stockage
    ingestor::spawn_ingestor(&cfg.mqtt, sink.clone(), health_tracker.clone());

    let window = time::Duration::seconds(cfg.status.freshness_window_secs);
    let app_state = AppState {
        sink: sink.clone(),
        engine,
        monitor: Arc::new(StatusMonitor::new(sink, window)),
        health_tracker,
        api_key: cfg.http.api_key.as_deref().map(Arc::from),
    };
    if app_state.api_key.is_none() {
        warn!("[kernel] no API key configured, HTTP API is open");
    }

    // HTTP
    let app = http::build_router(app_state);

    let listener = TcpListener::bind(&cfg.http.addr)
        .await
        .with_context(|| format!("cannot bind {}", cfg.http.addr))?;
    info!("[kernel] listening on http://{}", cfg.http.addr);
    axum::serve(listener, app).await.context("HTTP server stopped")
}

/// Entraîne une fois au démarrage si aucun modèle n'est persisté. Non fatal.
async fn bootstrap_training(engine: SharedEngine, dataset: PathBuf) {
    if engine.store().has_model() {
        info!("[kernel] persisted model found, skipping bootstrap training");
        return;
    }

    info!("[kernel] no persisted model, training on {}", dataset.display());
    let outcome = tokio::task::spawn_blocking(move || engine.train(&dataset))
        .await
        .context("bootstrap training task failed")
        .and_then(|result| result.context("bootstrap training failed"));
    match outcome {
        Ok(report) => info!(
            "[kernel] bootstrap model {} ready ({} samples)",
            report.generation, report.samples
        ),
        Err(e) => warn!("[kernel] {e:#}"),
    }
}

/// Charge le modèle persisté avant d'ouvrir le serveur. Non fatal : sans
/// modèle, /api/predict répond 503 jusqu'au premier entraînement.
async fn warm_model(engine: SharedEngine) {
    if !engine.store().has_model() {
        return;
    }
    let outcome = tokio::task::spawn_blocking(move || engine.model().map(|model| model.generation))
        .await
        .context("model load task failed")
        .and_then(|result| result.context("cannot load persisted model"));
    match outcome {
        Ok(generation) => info!("[kernel] model generation {generation} resident"),
        Err(e) => warn!("[kernel] {e:#}"),
    }
}
