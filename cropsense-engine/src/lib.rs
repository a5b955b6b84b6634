//! Crop recommendation engine.
//!
//! Trains a random forest on a labelled CSV of soil and weather
//! measurements, persists it next to the categorical encoders it was fitted
//! with, and answers predictions from whichever generation is resident.

pub mod dataset;
pub mod encoder;
pub mod engine;
pub mod forest;
pub mod model;
pub mod request;
pub mod store;

pub use dataset::{CropDataset, DatasetError};
pub use encoder::{CategoryEncoder, EncoderSet};
pub use engine::{EngineError, EngineState, EngineStatus, RecommendationEngine, TrainingReport};
pub use forest::{ForestParams, RandomForest};
pub use model::TrainedModel;
pub use request::{Recommendation, RecommendationRequest, RequestError};
pub use store::{ModelStore, StoreError};
