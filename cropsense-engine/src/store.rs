//! On-disk persistence of trained models.
//!
//! Layout under the model directory:
//!
//! ```text
//! CURRENT                        generation id of the live model
//! <generation>/classifier.json   forest, classes, feature names
//! <generation>/encoders.json     categorical encoders
//! ```
//!
//! Both artifacts of a generation are written before `CURRENT` is replaced
//! (temp file + rename), so a reader sees either the previous pair or the new
//! one, never a mix. Each artifact also records its generation and the pair
//! is rejected when they disagree.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::encoder::EncoderSet;
use crate::forest::RandomForest;
use crate::model::TrainedModel;

const CURRENT_FILE: &str = "CURRENT";
const CLASSIFIER_FILE: &str = "classifier.json";
const ENCODERS_FILE: &str = "encoders.json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("JSON error in {path}: {source}")]
    Json { path: PathBuf, source: serde_json::Error },
    #[error("Model generation {generation} is incomplete: {missing} not found")]
    Incomplete { generation: Uuid, missing: &'static str },
    #[error("Classifier generation {classifier} does not match encoder generation {encoders}")]
    GenerationMismatch { classifier: Uuid, encoders: Uuid },
    #[error("Corrupt model artifact: {0}")]
    Corrupt(String),
}

#[derive(Serialize, Deserialize)]
struct ClassifierArtifact {
    generation: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    trained_at: OffsetDateTime,
    classes: Vec<String>,
    feature_names: Vec<String>,
    forest: RandomForest,
}

#[derive(Serialize, Deserialize)]
struct EncodersArtifact {
    generation: Uuid,
    encoders: EncoderSet,
}

/// Model directory handle.
#[derive(Debug, Clone)]
pub struct ModelStore {
    dir: PathBuf,
}

impl ModelStore {
    /// Opens (and creates if needed) the model directory.
    pub fn open<P: Into<PathBuf>>(dir: P) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StoreError::Io { path: dir.clone(), source })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Generation currently pointed to by `CURRENT`, if any.
    pub fn current_generation(&self) -> Result<Option<Uuid>, StoreError> {
        let path = self.dir.join(CURRENT_FILE);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        Uuid::parse_str(text.trim())
            .map(Some)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", path.display())))
    }

    pub fn has_model(&self) -> bool {
        matches!(self.current_generation(), Ok(Some(_)))
    }

    /// Persists `model` as the new live generation and prunes older ones.
    /// The generation it replaces is kept so that a reader which already
    /// resolved `CURRENT` can still finish loading it.
    pub fn save(&self, model: &TrainedModel) -> Result<(), StoreError> {
        let previous = self.current_generation().ok().flatten();
        let generation_dir = self.dir.join(model.generation.to_string());
        fs::create_dir_all(&generation_dir)
            .map_err(|source| StoreError::Io { path: generation_dir.clone(), source })?;

        let classifier = ClassifierArtifact {
            generation: model.generation,
            trained_at: model.trained_at,
            classes: model.classes.clone(),
            feature_names: model.feature_names.clone(),
            forest: model.forest.clone(),
        };
        let encoders = EncodersArtifact {
            generation: model.generation,
            encoders: model.encoders.clone(),
        };
        write_json(&generation_dir.join(CLASSIFIER_FILE), &classifier)?;
        write_json(&generation_dir.join(ENCODERS_FILE), &encoders)?;

        write_atomic(&self.dir.join(CURRENT_FILE), model.generation.to_string().as_bytes())?;
        debug!("[store] generation {} is now current", model.generation);

        self.prune(&[Some(model.generation), previous]);
        Ok(())
    }

    /// Loads the live generation. `Ok(None)` when nothing was ever saved.
    pub fn load(&self) -> Result<Option<TrainedModel>, StoreError> {
        let Some(generation) = self.current_generation()? else {
            return Ok(None);
        };
        let generation_dir = self.dir.join(generation.to_string());

        let classifier: ClassifierArtifact = read_json(&generation_dir.join(CLASSIFIER_FILE))?
            .ok_or(StoreError::Incomplete { generation, missing: CLASSIFIER_FILE })?;
        let encoders: EncodersArtifact = read_json(&generation_dir.join(ENCODERS_FILE))?
            .ok_or(StoreError::Incomplete { generation, missing: ENCODERS_FILE })?;

        if classifier.generation != encoders.generation {
            return Err(StoreError::GenerationMismatch {
                classifier: classifier.generation,
                encoders: encoders.generation,
            });
        }
        if classifier.generation != generation {
            return Err(StoreError::Corrupt(format!(
                "{} holds generation {} instead of {generation}",
                generation_dir.display(),
                classifier.generation
            )));
        }

        classifier.forest.check().map_err(StoreError::Corrupt)?;
        if classifier.forest.n_classes() != classifier.classes.len() {
            return Err(StoreError::Corrupt(format!(
                "forest has {} classes, labels list has {}",
                classifier.forest.n_classes(),
                classifier.classes.len()
            )));
        }
        if classifier.forest.n_features() != classifier.feature_names.len() {
            return Err(StoreError::Corrupt(format!(
                "forest expects {} features, {} names stored",
                classifier.forest.n_features(),
                classifier.feature_names.len()
            )));
        }

        Ok(Some(TrainedModel {
            generation,
            trained_at: classifier.trained_at,
            classes: classifier.classes,
            feature_names: classifier.feature_names,
            forest: classifier.forest,
            encoders: encoders.encoders,
        }))
    }

    /// Removes every generation directory not listed in `keep`. Best effort.
    fn prune(&self, keep: &[Option<Uuid>]) {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("[store] cannot list {}: {e}", self.dir.display());
                return;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let is_generation = path.is_dir()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .and_then(|name| Uuid::parse_str(name).ok())
                    .is_some_and(|generation| !keep.contains(&Some(generation)));
            if is_generation {
                if let Err(e) = fs::remove_dir_all(&path) {
                    warn!("[store] failed to prune {}: {e}", path.display());
                }
            }
        }
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec(value).map_err(|source| StoreError::Json { path: path.to_path_buf(), source })?;
    write_atomic(path, &bytes)
}

/// Temp file, fsync, rename, then fsync of the parent directory: after a
/// crash the target holds either the old bytes or the complete new ones.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp).map_err(io_err(&tmp))?;
    file.write_all(bytes).map_err(io_err(&tmp))?;
    file.sync_all().map_err(io_err(&tmp))?;
    drop(file);

    fs::rename(&tmp, path).map_err(io_err(path))?;
    sync_parent(path);
    Ok(())
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

#[cfg(unix)]
fn sync_parent(path: &Path) {
    let Some(parent) = path.parent() else { return };
    if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
        warn!("[store] cannot sync {}: {e}", parent.display());
    }
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) {}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(StoreError::Io { path: path.to_path_buf(), source }),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Json { path: path.to_path_buf(), source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::CropDataset;
    use crate::forest::ForestParams;
    use cropsense_devkit::DatasetBuilder;
    use tempfile::TempDir;

    fn model() -> TrainedModel {
        let csv = DatasetBuilder::synthetic_corpus(6).to_csv_string();
        let dataset = CropDataset::from_reader(csv.as_bytes()).unwrap();
        let params = ForestParams { n_trees: 5, ..ForestParams::default() };
        TrainedModel::fit(&dataset, &params).unwrap()
    }

    #[test]
    fn test_empty_store_has_no_model() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path().join("models")).unwrap();
        assert!(!store.has_model());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_save_then_load_returns_same_unit() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        let model = model();

        store.save(&model).unwrap();
        assert_eq!(store.current_generation().unwrap(), Some(model.generation));

        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.generation, model.generation);
        assert_eq!(loaded.classes, model.classes);
        assert_eq!(loaded.encoders, model.encoders);
        assert_eq!(loaded.forest, model.forest);
    }

    #[test]
    fn test_save_keeps_one_previous_generation() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        let first = model();
        let second = model();
        let third = model();

        store.save(&first).unwrap();
        store.save(&second).unwrap();
        assert_eq!(store.load().unwrap().unwrap().generation, second.generation);
        assert!(dir.path().join(first.generation.to_string()).exists());

        store.save(&third).unwrap();
        assert_eq!(store.load().unwrap().unwrap().generation, third.generation);
        assert!(!dir.path().join(first.generation.to_string()).exists());
        assert!(dir.path().join(second.generation.to_string()).exists());
        assert!(dir.path().join(third.generation.to_string()).exists());
    }

    #[test]
    fn test_reader_holding_replaced_generation_can_still_load_it() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        let first = model();
        store.save(&first).unwrap();

        // a reader resolved CURRENT just before the next save landed
        let resolved = store.current_generation().unwrap().unwrap();
        store.save(&model()).unwrap();

        let generation_dir = dir.path().join(resolved.to_string());
        assert!(generation_dir.join(CLASSIFIER_FILE).exists());
        assert!(generation_dir.join(ENCODERS_FILE).exists());
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        store.save(&model()).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .flatten()
            .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
        assert!(store.current_generation().unwrap().is_some());
    }

    #[test]
    fn test_missing_encoders_is_an_error() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        let model = model();
        store.save(&model).unwrap();

        fs::remove_file(dir.path().join(model.generation.to_string()).join(ENCODERS_FILE)).unwrap();
        assert!(matches!(
            store.load(),
            Err(StoreError::Incomplete { missing: ENCODERS_FILE, .. })
        ));
    }

    #[test]
    fn test_encoders_from_another_generation_are_rejected() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        let model = model();
        store.save(&model).unwrap();

        let stray = EncodersArtifact {
            generation: Uuid::new_v4(),
            encoders: model.encoders.clone(),
        };
        let path = dir.path().join(model.generation.to_string()).join(ENCODERS_FILE);
        fs::write(&path, serde_json::to_vec(&stray).unwrap()).unwrap();

        assert!(matches!(store.load(), Err(StoreError::GenerationMismatch { .. })));
    }

    #[test]
    fn test_garbage_current_pointer_is_corrupt() {
        let dir = TempDir::new().unwrap();
        let store = ModelStore::open(dir.path()).unwrap();
        fs::write(dir.path().join(CURRENT_FILE), "not-a-uuid").unwrap();
        assert!(matches!(store.load(), Err(StoreError::Corrupt(_))));
    }
}
