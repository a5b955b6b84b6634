//! Handles shared between the ingestor task and the HTTP handlers.

use crate::storage::SensorSink;
use cropsense_engine::RecommendationEngine;
use parking_lot::Mutex;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub type SharedSink = Arc<dyn SensorSink>;

pub type SharedEngine = Arc<RecommendationEngine>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}
