/**
 * STATUS MONITOR - Verdict de vivacité à partir de la dernière lecture capteur
 *
 * FONCTIONNEMENT :
 * - aucune lecture            -> offline
 * - lecture plus vieille que la fenêtre de fraîcheur -> error
 * - sinon                     -> online
 * Chaque vérification est enregistrée dans l'historique des statuts.
 */

use crate::models::{SensorReading, SystemStatus, SystemStatusRecord};
use crate::state::SharedSink;
use crate::storage::StorageError;
use time::{Duration, OffsetDateTime};
use tracing::debug;
use uuid::Uuid;

pub const DEFAULT_FRESHNESS_WINDOW: Duration = Duration::seconds(300);

pub const MSG_NO_DATA: &str = "No sensor data available";
pub const MSG_STALE: &str = "Sensor data is not recent";
pub const MSG_OK: &str = "System is functioning normally";

/// Verdict pur, sans effet de bord.
pub fn evaluate(latest: Option<&SensorReading>, now: OffsetDateTime, window: Duration) -> (SystemStatus, &'static str) {
    match latest {
        None => (SystemStatus::Offline, MSG_NO_DATA),
        Some(reading) if now - reading.timestamp > window => (SystemStatus::Error, MSG_STALE),
        Some(_) => (SystemStatus::Online, MSG_OK),
    }
}

pub struct StatusMonitor {
    sink: SharedSink,
    window: Duration,
}

impl StatusMonitor {
    pub fn new(sink: SharedSink, window: Duration) -> Self {
        Self { sink, window }
    }

    /// Évalue l'état courant et l'ajoute à l'historique.
    pub fn check(&self) -> Result<SystemStatusRecord, StorageError> {
        self.check_at(OffsetDateTime::now_utc())
    }

    pub fn check_at(&self, now: OffsetDateTime) -> Result<SystemStatusRecord, StorageError> {
        let latest = self.sink.latest_reading();
        let (status, message) = evaluate(latest.as_ref(), now, self.window);
        let record = SystemStatusRecord {
            id: Uuid::new_v4(),
            status,
            message: message.to_string(),
            sensor_snapshot: latest.as_ref().map(SensorReading::snapshot),
            timestamp: now,
        };
        self.sink.append_status(record.clone())?;
        debug!("[status] {:?}: {}", record.status, record.message);
        Ok(record)
    }
}
