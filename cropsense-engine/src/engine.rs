//! Model lifecycle: train, lazy load, reload, predict.
//!
//! The resident model is a single `Arc<TrainedModel>` slot. `predict` clones
//! the `Arc` under a short read lock and works outside of it; `train` builds a
//! complete new model first and replaces the slot under a short write lock.
//! A prediction therefore always runs against one generation's encoders and
//! classifier, whatever `train` is doing concurrently.

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dataset::{CropDataset, DatasetError};
use crate::forest::ForestParams;
use crate::model::TrainedModel;
use crate::request::{Recommendation, RecommendationRequest};
use crate::store::{ModelStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Model not trained")]
    NotTrained,
    #[error("Unknown category '{value}' for field '{field}'")]
    UnknownCategory { field: String, value: String },
    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),
    #[error("Model store error: {0}")]
    Store(#[from] StoreError),
    #[error("Training failed: {0}")]
    Training(String),
    #[error("Corrupt model: {0}")]
    CorruptModel(String),
}

/// Where the resident model came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Uninitialized,
    TrainedInMemory,
    LoadedFromDisk,
}

/// Snapshot of the engine for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub generation: Option<Uuid>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub trained_at: Option<OffsetDateTime>,
    pub classes: Vec<String>,
    pub model_on_disk: bool,
}

/// Result of a successful `train`.
#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub generation: Uuid,
    pub dataset: PathBuf,
    pub samples: usize,
    pub classes: Vec<String>,
    /// Categorical columns missing from the dataset and filled with defaults.
    pub defaulted_columns: Vec<String>,
}

#[derive(Clone)]
struct Resident {
    model: Arc<TrainedModel>,
    state: EngineState,
}

pub struct RecommendationEngine {
    store: ModelStore,
    params: ForestParams,
    resident: RwLock<Option<Resident>>,
    /// Serializes `train`, `reload` and `save`: the resident model is only
    /// ever replaced by the generation that is current on disk.
    training: Mutex<()>,
}

impl RecommendationEngine {
    /// Opens the engine on `model_dir`. Nothing is loaded until the first
    /// prediction.
    pub fn open<P: Into<PathBuf>>(model_dir: P) -> Result<Self, EngineError> {
        let store = ModelStore::open(model_dir)?;
        info!("[engine] model store at {}", store.dir().display());
        Ok(Self {
            store,
            params: ForestParams::default(),
            resident: RwLock::new(None),
            training: Mutex::new(()),
        })
    }

    pub fn with_params(mut self, params: ForestParams) -> Self {
        self.params = params;
        self
    }

    pub fn params(&self) -> &ForestParams {
        &self.params
    }

    pub fn store(&self) -> &ModelStore {
        &self.store
    }

    /// Trains on a CSV dataset, persists the result and makes it resident.
    pub fn train<P: AsRef<Path>>(&self, dataset_path: P) -> Result<TrainingReport, EngineError> {
        let dataset_path = dataset_path.as_ref();
        let _guard = self.training.lock();

        info!("[engine] loading dataset from {}", dataset_path.display());
        let dataset = CropDataset::from_path(dataset_path)?;
        for column in &dataset.defaulted_columns {
            warn!(
                "[engine] dataset has no '{column}' column, every row trained as '{}'",
                default_for(column)
            );
        }

        let model = TrainedModel::fit(&dataset, &self.params)?;
        self.store.save(&model)?;

        let report = TrainingReport {
            generation: model.generation,
            dataset: dataset_path.to_path_buf(),
            samples: dataset.len(),
            classes: model.classes.clone(),
            defaulted_columns: dataset.defaulted_columns.clone(),
        };

        *self.resident.write() = Some(Resident {
            model: Arc::new(model),
            state: EngineState::TrainedInMemory,
        });
        info!(
            "[engine] trained generation {} on {} samples ({} crops)",
            report.generation,
            report.samples,
            report.classes.len()
        );
        Ok(report)
    }

    /// Recommends a crop. Loads the persisted model on first use.
    pub fn predict(&self, request: &RecommendationRequest) -> Result<Recommendation, EngineError> {
        self.model()?.predict(request)
    }

    /// The resident model, loading it from disk when the slot is empty.
    pub fn model(&self) -> Result<Arc<TrainedModel>, EngineError> {
        if let Some(resident) = self.resident.read().as_ref() {
            return Ok(Arc::clone(&resident.model));
        }

        let mut slot = self.resident.write();
        // another caller may have loaded it while we waited
        if let Some(resident) = slot.as_ref() {
            return Ok(Arc::clone(&resident.model));
        }
        let model = Arc::new(self.store.load()?.ok_or(EngineError::NotTrained)?);
        info!("[engine] loaded generation {} from disk", model.generation);
        *slot = Some(Resident {
            model: Arc::clone(&model),
            state: EngineState::LoadedFromDisk,
        });
        Ok(model)
    }

    /// Drops the resident model and reads the persisted one again.
    pub fn reload(&self) -> Result<EngineStatus, EngineError> {
        let _guard = self.training.lock();
        let loaded = self.store.load();
        {
            let mut slot = self.resident.write();
            *slot = None;
            match loaded {
                Ok(Some(model)) => {
                    info!("[engine] reloaded generation {}", model.generation);
                    *slot = Some(Resident {
                        model: Arc::new(model),
                        state: EngineState::LoadedFromDisk,
                    });
                }
                Ok(None) => return Err(EngineError::NotTrained),
                Err(e) => return Err(e.into()),
            }
        }
        drop(_guard);
        Ok(self.status())
    }

    /// Writes the resident model to the store.
    pub fn save(&self) -> Result<(), EngineError> {
        let _guard = self.training.lock();
        let model = self
            .resident
            .read()
            .as_ref()
            .map(|resident| Arc::clone(&resident.model))
            .ok_or(EngineError::NotTrained)?;
        self.store.save(&model)?;
        Ok(())
    }

    pub fn status(&self) -> EngineStatus {
        let resident = self.resident.read().clone();
        let model_on_disk = self.store.has_model();
        match resident {
            Some(Resident { model, state }) => EngineStatus {
                state,
                generation: Some(model.generation),
                trained_at: Some(model.trained_at),
                classes: model.classes.clone(),
                model_on_disk,
            },
            None => EngineStatus {
                state: EngineState::Uninitialized,
                generation: None,
                trained_at: None,
                classes: Vec::new(),
                model_on_disk,
            },
        }
    }
}

fn default_for(column: &str) -> &'static str {
    use crate::dataset::{CATEGORICAL_COLUMNS, CATEGORICAL_DEFAULTS};
    CATEGORICAL_COLUMNS
        .iter()
        .position(|name| *name == column)
        .map(|index| CATEGORICAL_DEFAULTS[index])
        .unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cropsense_devkit::{DatasetBuilder, TestWorkspace};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;

    fn fast_params() -> ForestParams {
        ForestParams { n_trees: 20, ..ForestParams::default() }
    }

    fn engine(workspace: &TestWorkspace) -> RecommendationEngine {
        RecommendationEngine::open(workspace.model_dir())
            .unwrap()
            .with_params(fast_params())
    }

    fn clay_request() -> RecommendationRequest {
        RecommendationRequest {
            nitrogen: 85.0,
            phosphorus: 45.0,
            potassium: 40.0,
            temperature: 23.0,
            humidity: 82.0,
            ph: 6.4,
            rainfall: 230.0,
            soil_type: "clay".into(),
            weather: "rainy".into(),
            region: "kerala".into(),
        }
    }

    #[test]
    fn test_predict_before_training_is_not_trained() {
        let workspace = TestWorkspace::new().unwrap();
        let engine = engine(&workspace);

        assert!(matches!(engine.predict(&clay_request()), Err(EngineError::NotTrained)));
        assert_eq!(engine.status().state, EngineState::Uninitialized);
        assert!(!engine.status().model_on_disk);
    }

    #[test]
    fn test_train_then_predict() {
        let workspace = TestWorkspace::new().unwrap();
        let dataset = workspace.write_dataset("crops.csv", &DatasetBuilder::synthetic_corpus(10)).unwrap();
        let engine = engine(&workspace);

        let report = engine.train(&dataset).unwrap();
        assert_eq!(report.samples, 30);
        assert!(report.defaulted_columns.is_empty());

        let recommendation = engine.predict(&clay_request()).unwrap();
        assert!(report.classes.contains(&recommendation.crop));
        assert!((0.0..=1.0).contains(&recommendation.confidence));

        let status = engine.status();
        assert_eq!(status.state, EngineState::TrainedInMemory);
        assert_eq!(status.generation, Some(report.generation));
        assert!(status.model_on_disk);
    }

    #[test]
    fn test_unseen_category_fails() {
        let workspace = TestWorkspace::new().unwrap();
        let dataset = workspace.write_dataset("crops.csv", &DatasetBuilder::synthetic_corpus(5)).unwrap();
        let engine = engine(&workspace);
        engine.train(&dataset).unwrap();

        let mut request = clay_request();
        request.soil_type = "martian".into();
        match engine.predict(&request) {
            Err(EngineError::UnknownCategory { field, value }) => {
                assert_eq!(field, "soil_type");
                assert_eq!(value, "martian");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_repeated_predictions_are_identical() {
        let workspace = TestWorkspace::new().unwrap();
        let dataset = workspace.write_dataset("crops.csv", &DatasetBuilder::synthetic_corpus(8)).unwrap();
        let engine = engine(&workspace);
        engine.train(&dataset).unwrap();

        let first = engine.predict(&clay_request()).unwrap();
        let second = engine.predict(&clay_request()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_fresh_engine_lazily_loads_persisted_model() {
        let workspace = TestWorkspace::new().unwrap();
        let dataset = workspace.write_dataset("crops.csv", &DatasetBuilder::synthetic_corpus(8)).unwrap();
        let trained = engine(&workspace);
        trained.train(&dataset).unwrap();
        let expected = trained.predict(&clay_request()).unwrap();

        let restarted = engine(&workspace);
        assert_eq!(restarted.status().state, EngineState::Uninitialized);
        assert_eq!(restarted.predict(&clay_request()).unwrap(), expected);
        assert_eq!(restarted.status().state, EngineState::LoadedFromDisk);
    }

    #[test]
    fn test_reload_picks_up_model_trained_elsewhere() {
        let workspace = TestWorkspace::new().unwrap();
        let first_csv = workspace.write_dataset("first.csv", &DatasetBuilder::synthetic_corpus(5)).unwrap();
        let second_csv = workspace.write_dataset("second.csv", &DatasetBuilder::synthetic_corpus(7)).unwrap();

        let serving = engine(&workspace);
        let first = serving.train(&first_csv).unwrap();

        let offline = engine(&workspace);
        let second = offline.train(&second_csv).unwrap();
        assert_eq!(serving.status().generation, Some(first.generation));

        let status = serving.reload().unwrap();
        assert_eq!(status.generation, Some(second.generation));
        assert_eq!(status.state, EngineState::LoadedFromDisk);
    }

    #[test]
    fn test_reload_without_model_is_not_trained() {
        let workspace = TestWorkspace::new().unwrap();
        let engine = engine(&workspace);
        assert!(matches!(engine.reload(), Err(EngineError::NotTrained)));
        assert!(matches!(engine.save(), Err(EngineError::NotTrained)));
    }

    #[test]
    fn test_dataset_without_categorical_columns_trains_with_defaults() {
        let workspace = TestWorkspace::new().unwrap();
        let builder = DatasetBuilder::synthetic_corpus(6).without_categorical();
        let dataset = workspace.write_dataset("legacy.csv", &builder).unwrap();
        let engine = engine(&workspace);

        let report = engine.train(&dataset).unwrap();
        assert_eq!(report.defaulted_columns, ["soil_type", "weather", "region"]);

        let mut request = clay_request();
        request.soil_type = "alluvial".into();
        request.weather = "sunny".into();
        request.region = "karnataka".into();
        assert!(engine.predict(&request).is_ok());
        assert!(matches!(
            engine.predict(&clay_request()),
            Err(EngineError::UnknownCategory { .. })
        ));
    }

    #[test]
    fn test_missing_dataset_file_keeps_previous_model() {
        let workspace = TestWorkspace::new().unwrap();
        let dataset = workspace.write_dataset("crops.csv", &DatasetBuilder::synthetic_corpus(5)).unwrap();
        let engine = engine(&workspace);
        let report = engine.train(&dataset).unwrap();

        let result = engine.train(workspace.root().join("nope.csv"));
        assert!(matches!(result, Err(EngineError::Dataset(DatasetError::Io(_)))));
        assert_eq!(engine.status().generation, Some(report.generation));
    }

    #[test]
    fn test_predictions_during_training_never_mix_generations() {
        let workspace = TestWorkspace::new().unwrap();
        // generation A knows sandy soil, generation B knows silty soil
        let corpus_a = DatasetBuilder::synthetic_corpus(6);
        let corpus_b = DatasetBuilder::synthetic_corpus(6).rename_category("soil_type", "sandy", "silty");
        let path_a = workspace.write_dataset("a.csv", &corpus_a).unwrap();
        let path_b = workspace.write_dataset("b.csv", &corpus_b).unwrap();

        let engine = Arc::new(engine(&workspace));
        engine.train(&path_a).unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let engine = Arc::clone(&engine);
                let done = Arc::clone(&done);
                thread::spawn(move || {
                    let mut checked = 0usize;
                    while !done.load(Ordering::Acquire) || checked == 0 {
                        let model = engine.model().unwrap();
                        let soils = model.known_categories("soil_type");
                        // encoders and classifier come from the same Arc
                        let knows_sandy = soils.iter().any(|soil| soil == "sandy");
                        let knows_silty = soils.iter().any(|soil| soil == "silty");
                        assert!(knows_sandy != knows_silty);
                        assert_eq!(model.forest.n_classes(), model.classes.len());
                        assert!(model.predict(&clay_request()).is_ok());
                        checked += 1;
                    }
                    checked
                })
            })
            .collect();

        for _ in 0..3 {
            engine.train(&path_b).unwrap();
            engine.train(&path_a).unwrap();
        }
        done.store(true, Ordering::Release);

        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
        let generation = engine.status().generation.unwrap();
        assert_eq!(engine.store().current_generation().unwrap(), Some(generation));
    }

    #[test]
    fn test_reload_racing_train_settles_on_current_generation() {
        let workspace = TestWorkspace::new().unwrap();
        let dataset = workspace.write_dataset("crops.csv", &DatasetBuilder::synthetic_corpus(4)).unwrap();
        let engine = Arc::new(RecommendationEngine::open(workspace.model_dir()).unwrap().with_params(ForestParams {
            n_trees: 3,
            ..ForestParams::default()
        }));
        engine.train(&dataset).unwrap();

        let reloader = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..40 {
                    engine.reload().unwrap();
                }
            })
        };
        for _ in 0..10 {
            engine.train(&dataset).unwrap();
        }
        reloader.join().unwrap();

        let resident = engine.status().generation.unwrap();
        assert_eq!(engine.store().current_generation().unwrap(), Some(resident));
        // the generation the resident model came from is still loadable
        assert!(workspace.model_dir().join(resident.to_string()).join("encoders.json").exists());
    }
}
