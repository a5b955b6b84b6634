/**
 * STORAGE SINK - Persistence append-only des lectures, statuts et recommandations
 *
 * RÔLE :
 * Point unique d'écriture pour l'ingestion MQTT, le monitoring et l'API.
 * Aucune mise à jour ni suppression : chaque enregistrement est immuable.
 *
 * FONCTIONNEMENT :
 * - SensorSink trait = interface commune (append + lectures récentes)
 * - JsonlStore = une collection JSON Lines par type sous le dossier data
 * - Mémoire bornée : seuls les TAIL_CAPACITY derniers enregistrements de
 *   chaque collection sont gardés (plus un compteur total), le fichier reste
 *   la source complète
 * - Mutex tenu pendant l'écriture disque : chaque append est une ligne
 *   complète, sans entrelacement
 * - Horodatage des lectures attribué ici, jamais décroissant
 *
 * FICHIERS :
 * - sensor_readings.jsonl
 * - system_status.jsonl
 * - recommendations.jsonl
 */

use crate::models::{RecommendationRecord, SensorPayload, SensorReading, SystemStatusRecord};
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use time::OffsetDateTime;
use tracing::{info, warn};

const READINGS_FILE: &str = "sensor_readings.jsonl";
const STATUS_FILE: &str = "system_status.jsonl";
const RECOMMENDATIONS_FILE: &str = "recommendations.jsonl";

/// Erreurs possibles du stockage
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Interface du Storage Sink
pub trait SensorSink: Send + Sync {
    /// Persiste une lecture validée; l'id et le timestamp sont attribués ici.
    fn append_reading(&self, payload: SensorPayload) -> Result<SensorReading, StorageError>;

    /// Lectures les plus récentes d'abord, au plus `TAIL_CAPACITY`.
    fn latest_readings(&self, limit: usize) -> Vec<SensorReading>;

    fn latest_reading(&self) -> Option<SensorReading>;

    fn readings_count(&self) -> usize;

    fn append_status(&self, record: SystemStatusRecord) -> Result<(), StorageError>;

    fn status_history(&self, limit: usize) -> Vec<SystemStatusRecord>;

    fn append_recommendation(&self, record: RecommendationRecord) -> Result<(), StorageError>;

    fn recent_recommendations(&self, limit: usize) -> Vec<RecommendationRecord>;
}

/// Nombre d'enregistrements gardés en mémoire par collection. Les lectures
/// ne remontent jamais plus loin.
pub const TAIL_CAPACITY: usize = 100;

/// Les derniers enregistrements + le total écrit dans le fichier
struct Tail<T> {
    records: VecDeque<T>,
    count: usize,
}

impl<T> Tail<T> {
    fn push(&mut self, record: T) {
        if self.records.len() == TAIL_CAPACITY {
            self.records.pop_front();
        }
        self.records.push_back(record);
        self.count += 1;
    }
}

/// Fichier JSON Lines + queue mémoire bornée
struct Collection<T> {
    path: PathBuf,
    tail: Mutex<Tail<T>>,
}

impl<T: Serialize + DeserializeOwned + Clone> Collection<T> {
    fn open(path: PathBuf) -> Result<Self, StorageError> {
        let mut tail = Tail { records: VecDeque::with_capacity(TAIL_CAPACITY), count: 0 };
        if path.exists() {
            let file = File::open(&path).map_err(|source| StorageError::Io { path: path.clone(), source })?;
            for (index, line) in BufReader::new(file).lines().enumerate() {
                let line = line.map_err(|source| StorageError::Io { path: path.clone(), source })?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str(&line) {
                    Ok(record) => tail.push(record),
                    // ligne tronquée par un arrêt brutal
                    Err(e) => warn!("[storage] skipping line {} of {}: {e}", index + 1, path.display()),
                }
            }
        }

        Ok(Self { path, tail: Mutex::new(tail) })
    }

    /// Construit l'enregistrement sous le verrou (à partir du dernier) puis l'écrit.
    fn append_with<F>(&self, build: F) -> Result<T, StorageError>
    where
        F: FnOnce(Option<&T>) -> T,
    {
        let mut tail = self.tail.lock();
        let record = build(tail.records.back());
        let mut line = serde_json::to_string(&record)?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| StorageError::Io { path: self.path.clone(), source })?;
        file.write_all(line.as_bytes())
            .map_err(|source| StorageError::Io { path: self.path.clone(), source })?;

        tail.push(record.clone());
        Ok(record)
    }

    fn append(&self, record: T) -> Result<(), StorageError> {
        self.append_with(|_| record).map(|_| ())
    }

    fn latest(&self, limit: usize) -> Vec<T> {
        self.tail.lock().records.iter().rev().take(limit).cloned().collect()
    }

    fn last(&self) -> Option<T> {
        self.tail.lock().records.back().cloned()
    }

    fn len(&self) -> usize {
        self.tail.lock().count
    }
}

/// Stockage JSON Lines sous un dossier data
pub struct JsonlStore {
    dir: PathBuf,
    readings: Collection<SensorReading>,
    statuses: Collection<SystemStatusRecord>,
    recommendations: Collection<RecommendationRecord>,
}

impl JsonlStore {
    /// Ouvre (et crée au besoin) le dossier et recharge les historiques existants
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, StorageError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StorageError::Io { path: dir.clone(), source })?;

        let store = Self {
            readings: Collection::open(dir.join(READINGS_FILE))?,
            statuses: Collection::open(dir.join(STATUS_FILE))?,
            recommendations: Collection::open(dir.join(RECOMMENDATIONS_FILE))?,
            dir,
        };
        info!(
            "[storage] opened {} ({} readings, {} status records, {} recommendations)",
            store.dir.display(),
            store.readings.len(),
            store.statuses.len(),
            store.recommendations.len()
        );
        Ok(store)
    }

    fn append_reading_at(&self, payload: SensorPayload, now: OffsetDateTime) -> Result<SensorReading, StorageError> {
        self.readings.append_with(|last| {
            // horloge revenue en arrière: on garde l'horodatage précédent
            let timestamp = match last {
                Some(previous) if previous.timestamp > now => previous.timestamp,
                _ => now,
            };
            SensorReading::from_payload(payload, timestamp)
        })
    }
}

impl SensorSink for JsonlStore {
    fn append_reading(&self, payload: SensorPayload) -> Result<SensorReading, StorageError> {
        self.append_reading_at(payload, OffsetDateTime::now_utc())
    }

    fn latest_readings(&self, limit: usize) -> Vec<SensorReading> {
        self.readings.latest(limit)
    }

    fn latest_reading(&self) -> Option<SensorReading> {
        self.readings.last()
    }

    fn readings_count(&self) -> usize {
        self.readings.len()
    }

    fn append_status(&self, record: SystemStatusRecord) -> Result<(), StorageError> {
        self.statuses.append(record)
    }

    fn status_history(&self, limit: usize) -> Vec<SystemStatusRecord> {
        self.statuses.latest(limit)
    }

    fn append_recommendation(&self, record: RecommendationRecord) -> Result<(), StorageError> {
        self.recommendations.append(record)
    }

    fn recent_recommendations(&self, limit: usize) -> Vec<RecommendationRecord> {
        self.recommendations.latest(limit)
    }
}
