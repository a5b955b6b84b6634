/**
 * HEALTH TRACKER - Compteurs d'ingestion et état de connexion du kernel
 *
 * RÔLE :
 * Partagé entre la tâche d'ingestion (qui l'alimente) et l'API (qui le lit).
 * Tous les compteurs sont atomiques : aucun verrou sur le chemin des messages.
 */

use crate::ingestor::ConnectionPhase;
use crate::state::{new_state, Shared};
use cropsense_engine::EngineStatus;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IngestionCounters {
    pub accepted: u64,
    pub rejected: u64,
    pub decode_errors: u64,
    pub storage_failures: u64,
    pub reconnect_attempts: u64,
}

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub memory_usage_mb: f32,
    pub mqtt_status: ConnectionPhase,
    pub last_connack_code: Option<u8>,
    pub ingestion: IngestionCounters,
    pub readings_stored: usize,
    pub engine: EngineStatus,
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    decode_errors: AtomicU64,
    storage_failures: AtomicU64,
    reconnect_attempts: AtomicU64,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    counters: Arc<Counters>,
    mqtt_status: Shared<(ConnectionPhase, Option<u8>)>,
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            counters: Arc::new(Counters::default()),
            mqtt_status: new_state((ConnectionPhase::Disconnected, None)),
        }
    }

    pub fn set_connection(&self, phase: ConnectionPhase, last_error_code: Option<u8>) {
        *self.mqtt_status.lock() = (phase, last_error_code);
    }

    pub fn record_accepted(&self) {
        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_error(&self) {
        self.counters.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_storage_failure(&self) {
        self.counters.storage_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_reconnects(&self) {
        self.counters.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> IngestionCounters {
        IngestionCounters {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            decode_errors: self.counters.decode_errors.load(Ordering::Relaxed),
            storage_failures: self.counters.storage_failures.load(Ordering::Relaxed),
            reconnect_attempts: self.counters.reconnect_attempts.load(Ordering::Relaxed),
        }
    }

    pub fn get_health(&self, readings_stored: usize, engine: EngineStatus) -> KernelHealth {
        let (mqtt_status, last_connack_code) = *self.mqtt_status.lock();
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            memory_usage_mb: get_memory_usage_mb(),
            mqtt_status,
            last_connack_code,
            ingestion: self.counters(),
            readings_stored,
            engine,
        }
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }

    0.0
}
