/**
 * CONFIGURATION KERNEL - kernel.yaml + surcharges par variables d'environnement
 *
 * FONCTIONNEMENT :
 * - Chemin du fichier : CROPSENSE_KERNEL_CONFIG (défaut kernel.yaml)
 * - Fichier absent, vide ou invalide -> valeurs par défaut
 * - Variables d'environnement appliquées ensuite (priorité sur le fichier)
 * - Valeurs hors bornes corrigées par validate(), avec un warning
 */

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub storage: StorageConf,
    pub http: HttpConf,
    pub model: ModelConf,
    pub status: StatusConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: String,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub retry_delay_secs: u64,
    pub tls: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConf {
    pub data_dir: PathBuf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub addr: String,
    pub api_key: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ModelConf {
    pub dir: PathBuf,
    /// Dataset d'entraînement utilisé au démarrage quand aucun modèle n'est persisté.
    pub bootstrap_dataset: Option<PathBuf>,
    pub n_trees: usize,
    pub max_depth: usize,
    pub seed: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StatusConf {
    pub freshness_window_secs: i64,
}

/// Plus petit keep-alive accepté par rumqttc
pub const MIN_KEEP_ALIVE_SECS: u64 = 5;
pub const MIN_RETRY_DELAY_SECS: u64 = 1;

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 8883,
            username: None,
            password: None,
            topic: "sensor/data".into(),
            client_id: "cropsense-kernel".into(),
            keep_alive_secs: 60,
            retry_delay_secs: 5,
            tls: true,
        }
    }
}

impl Default for StorageConf {
    fn default() -> Self {
        Self { data_dir: PathBuf::from("./data") }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { addr: "0.0.0.0:8080".into(), api_key: None }
    }
}

impl Default for ModelConf {
    fn default() -> Self {
        let forest = cropsense_engine::ForestParams::default();
        Self {
            dir: PathBuf::from("./models"),
            bootstrap_dataset: None,
            n_trees: forest.n_trees,
            max_depth: forest.max_depth,
            seed: forest.seed,
        }
    }
}

impl Default for StatusConf {
    fn default() -> Self {
        Self { freshness_window_secs: 300 }
    }
}

impl ModelConf {
    pub fn forest_params(&self) -> cropsense_engine::ForestParams {
        cropsense_engine::ForestParams {
            n_trees: self.n_trees,
            max_depth: self.max_depth,
            seed: self.seed,
            ..cropsense_engine::ForestParams::default()
        }
    }
}

impl KernelConfig {
    /// Ramène les valeurs hors bornes à leur minimum. Retourne un message par
    /// correction (chacun est aussi loggé).
    pub fn validate(&mut self) -> Vec<String> {
        let mut fixes = Vec::new();
        if self.mqtt.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            fixes.push(format!(
                "mqtt.keep_alive_secs={} below {MIN_KEEP_ALIVE_SECS}, using {MIN_KEEP_ALIVE_SECS}",
                self.mqtt.keep_alive_secs
            ));
            self.mqtt.keep_alive_secs = MIN_KEEP_ALIVE_SECS;
        }
        if self.mqtt.retry_delay_secs < MIN_RETRY_DELAY_SECS {
            fixes.push(format!(
                "mqtt.retry_delay_secs={} would reconnect in a tight loop, using {MIN_RETRY_DELAY_SECS}",
                self.mqtt.retry_delay_secs
            ));
            self.mqtt.retry_delay_secs = MIN_RETRY_DELAY_SECS;
        }
        if self.status.freshness_window_secs <= 0 {
            let default = StatusConf::default().freshness_window_secs;
            fixes.push(format!(
                "status.freshness_window_secs={} must be positive, using {default}",
                self.status.freshness_window_secs
            ));
            self.status.freshness_window_secs = default;
        }
        for fix in &fixes {
            warn!("[kernel] config: {fix}");
        }
        fixes
    }
}

pub async fn load_config() -> KernelConfig {
    let path = std::env::var("CROPSENSE_KERNEL_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = load_config_file(Path::new(&path)).await;
    apply_env_overrides(&mut cfg, |name| std::env::var(name).ok());
    cfg.validate();
    cfg
}

pub async fn load_config_file(path: &Path) -> KernelConfig {
    if !path.exists() {
        info!("[kernel] no {}, using default config", path.display());
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        warn!("[kernel] invalid config {}: {e}", path.display());
        KernelConfig::default()
    })
}

/// Surcharges d'environnement. `lookup` est injecté pour les tests.
pub fn apply_env_overrides<F>(cfg: &mut KernelConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

    if let Some(host) = var("MQTT_BROKER") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = var("MQTT_PORT") {
        match port.parse() {
            Ok(port) => cfg.mqtt.port = port,
            Err(_) => warn!("[kernel] ignoring MQTT_PORT={port}"),
        }
    }
    if let Some(user) = var("MQTT_USER") {
        cfg.mqtt.username = Some(user);
    }
    if let Some(password) = var("MQTT_PASSWORD") {
        cfg.mqtt.password = Some(password);
    }
    if let Some(topic) = var("MQTT_TOPIC") {
        cfg.mqtt.topic = topic;
    }
    if let Some(keep_alive) = var("MQTT_KEEPALIVE") {
        match keep_alive.parse() {
            Ok(secs) => cfg.mqtt.keep_alive_secs = secs,
            Err(_) => warn!("[kernel] ignoring MQTT_KEEPALIVE={keep_alive}"),
        }
    }
    if let Some(dir) = var("CROPSENSE_DATA_DIR") {
        cfg.storage.data_dir = dir.into();
    }
    if let Some(dir) = var("CROPSENSE_MODEL_DIR") {
        cfg.model.dir = dir.into();
    }
    if let Some(addr) = var("CROPSENSE_HTTP_ADDR") {
        cfg.http.addr = addr;
    }
    if let Some(key) = var("CROPSENSE_API_KEY") {
        cfg.http.api_key = Some(key);
    }
}
