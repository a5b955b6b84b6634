//! A fitted classifier together with the encoders it was trained against.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::dataset::{feature_names, CropDataset, CATEGORICAL_COLUMNS, FEATURE_COUNT};
use crate::encoder::{CategoryEncoder, EncoderSet};
use crate::engine::EngineError;
use crate::forest::{argmax, ForestParams, RandomForest};
use crate::request::{Recommendation, RecommendationRequest};

/// One training generation. The classifier and the encoders are never
/// separated: they are built, persisted, loaded and swapped together.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainedModel {
    pub generation: Uuid,
    pub trained_at: OffsetDateTime,
    /// Crop labels; index = class index of the forest.
    pub classes: Vec<String>,
    pub feature_names: Vec<String>,
    pub forest: RandomForest,
    pub encoders: EncoderSet,
}

impl TrainedModel {
    /// Fits fresh encoders and a forest on `dataset`.
    pub fn fit(dataset: &CropDataset, params: &ForestParams) -> Result<Self, EngineError> {
        if dataset.is_empty() {
            return Err(EngineError::Dataset(crate::dataset::DatasetError::Empty));
        }

        let mut encoders = EncoderSet::new();
        for (index, column) in CATEGORICAL_COLUMNS.iter().enumerate() {
            encoders.insert(*column, CategoryEncoder::fit(dataset.categorical_values(index)));
        }

        let classes: Vec<String> = dataset.labels().into_iter().map(str::to_owned).collect();
        let label_encoder = CategoryEncoder::fit(classes.iter().map(String::as_str));

        let mut features = Vec::with_capacity(dataset.len());
        let mut targets = Vec::with_capacity(dataset.len());
        for sample in &dataset.samples {
            let mut row = Vec::with_capacity(FEATURE_COUNT);
            row.extend_from_slice(&sample.numeric);
            for (column, value) in CATEGORICAL_COLUMNS.iter().zip(&sample.categorical) {
                let code = encoders
                    .encode(column, value)
                    .ok_or_else(|| EngineError::Training(format!("'{value}' missing from the {column} encoder")))?;
                row.push(code as f64);
            }
            features.push(row);
            targets.push(
                label_encoder
                    .encode(&sample.label)
                    .ok_or_else(|| EngineError::Training(format!("label '{}' has no class", sample.label)))?,
            );
        }

        let forest = RandomForest::fit(&features, &targets, classes.len(), params);

        Ok(Self {
            generation: Uuid::new_v4(),
            trained_at: OffsetDateTime::now_utc(),
            classes,
            feature_names: feature_names(),
            forest,
            encoders,
        })
    }

    /// Encodes `request` with this generation's encoders and classifies it.
    pub fn predict(&self, request: &RecommendationRequest) -> Result<Recommendation, EngineError> {
        let row = self.encode(request)?;
        let probabilities = self.forest.predict_proba(&row);
        let best = argmax(&probabilities)
            .ok_or_else(|| EngineError::CorruptModel(format!("generation {} has no classes", self.generation)))?;
        let crop = self.classes.get(best).cloned().ok_or_else(|| {
            EngineError::CorruptModel(format!("generation {}: class {best} has no label", self.generation))
        })?;

        Ok(Recommendation {
            crop,
            confidence: probabilities[best],
        })
    }

    /// Feature vector of `request`. Fails on any category the encoders never saw.
    pub fn encode(&self, request: &RecommendationRequest) -> Result<Vec<f64>, EngineError> {
        let mut row = Vec::with_capacity(FEATURE_COUNT);
        row.extend_from_slice(&request.numeric_features());
        for (column, value) in request.categorical_features() {
            let code = self
                .encoders
                .encode(column, value)
                .ok_or_else(|| EngineError::UnknownCategory {
                    field: column.to_string(),
                    value: value.to_string(),
                })?;
            row.push(code as f64);
        }
        Ok(row)
    }

    /// Training categories of one column, for error messages and the API.
    pub fn known_categories(&self, column: &str) -> &[String] {
        self.encoders.get(column).map(CategoryEncoder::classes).unwrap_or(&[])
    }
}
