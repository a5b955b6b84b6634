/**
 * MODÈLES DE DONNÉES - Enregistrements persistés et schéma du topic capteurs
 *
 * RÔLE :
 * Types partagés par l'ingestion, le stockage, le monitoring et l'API.
 *
 * FONCTIONNEMENT :
 * - SensorPayload = schéma strict du message MQTT (champs inconnus refusés)
 * - SensorReading = lecture persistée (id + horodatage attribués par le stockage)
 * - SystemStatusRecord / RecommendationRecord = historiques append-only
 */

use cropsense_engine::RecommendationRequest;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Champs obligatoires de chaque message capteur.
pub const BASELINE_FIELDS: [&str; 4] = ["temperature", "humidity", "moisture", "ph"];

/// Message du topic capteurs tel qu'il arrive du broker.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SensorPayload {
    pub temperature: f64,
    pub humidity: f64,
    pub moisture: f64,
    pub ph: f64,
    #[serde(default)]
    pub nitrogen: Option<f64>,
    #[serde(default)]
    pub phosphorus: Option<f64>,
    #[serde(default)]
    pub potassium: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub id: Uuid,
    pub temperature: f64,
    pub humidity: f64,
    pub moisture: f64,
    pub ph: f64,
    pub nitrogen: Option<f64>,
    pub phosphorus: Option<f64>,
    pub potassium: Option<f64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl SensorReading {
    pub fn from_payload(payload: SensorPayload, timestamp: OffsetDateTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            temperature: payload.temperature,
            humidity: payload.humidity,
            moisture: payload.moisture,
            ph: payload.ph,
            nitrogen: payload.nitrogen,
            phosphorus: payload.phosphorus,
            potassium: payload.potassium,
            timestamp,
        }
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        SensorSnapshot {
            temperature: self.temperature,
            humidity: self.humidity,
            moisture: self.moisture,
            ph: self.ph,
        }
    }
}

/// Mesures de base d'une lecture, recopiées dans les enregistrements de statut.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    pub temperature: f64,
    pub humidity: f64,
    pub moisture: f64,
    pub ph: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Online,
    Offline,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatusRecord {
    pub id: Uuid,
    pub status: SystemStatus,
    pub message: String,
    pub sensor_snapshot: Option<SensorSnapshot>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Une recommandation servie par l'API, avec la requête qui l'a produite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRecord {
    pub id: Uuid,
    pub request: RecommendationRequest,
    pub crop: String,
    pub confidence: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}
