//! Prediction input and output.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::dataset::{CATEGORICAL_COLUMNS, NUMERIC_COLUMNS};

/// The ten agronomic inputs of one prediction. None of them has a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecommendationRequest {
    #[serde(rename = "N")]
    pub nitrogen: f64,
    #[serde(rename = "P")]
    pub phosphorus: f64,
    #[serde(rename = "K")]
    pub potassium: f64,
    pub temperature: f64,
    pub humidity: f64,
    pub ph: f64,
    pub rainfall: f64,
    pub soil_type: String,
    pub weather: String,
    pub region: String,
}

/// Field-level validation failure of a request body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("invalid recommendation request: missing {missing_fields:?}, invalid {invalid_fields:?}")]
pub struct RequestError {
    /// Absent or `null`.
    pub missing_fields: Vec<String>,
    /// Present with the wrong JSON type.
    pub invalid_fields: Vec<String>,
}

impl RecommendationRequest {
    /// Validates a decoded JSON body, reporting every bad field at once.
    pub fn from_json(body: &Value) -> Result<Self, RequestError> {
        let mut error = RequestError::default();
        let Some(object) = body.as_object() else {
            error.missing_fields = NUMERIC_COLUMNS
                .iter()
                .chain(CATEGORICAL_COLUMNS.iter())
                .map(|name| (*name).to_string())
                .collect();
            return Err(error);
        };

        let mut numeric = [0.0; NUMERIC_COLUMNS.len()];
        for (slot, name) in numeric.iter_mut().zip(NUMERIC_COLUMNS) {
            match object.get(name) {
                None | Some(Value::Null) => error.missing_fields.push(name.to_string()),
                Some(value) => match value.as_f64() {
                    Some(number) => *slot = number,
                    None => error.invalid_fields.push(name.to_string()),
                },
            }
        }

        let mut categorical: [String; CATEGORICAL_COLUMNS.len()] = Default::default();
        for (slot, name) in categorical.iter_mut().zip(CATEGORICAL_COLUMNS) {
            match object.get(name) {
                None | Some(Value::Null) => error.missing_fields.push(name.to_string()),
                Some(Value::String(text)) => *slot = text.clone(),
                Some(_) => error.invalid_fields.push(name.to_string()),
            }
        }

        if !error.missing_fields.is_empty() || !error.invalid_fields.is_empty() {
            return Err(error);
        }

        let [nitrogen, phosphorus, potassium, temperature, humidity, ph, rainfall] = numeric;
        let [soil_type, weather, region] = categorical;
        Ok(Self {
            nitrogen,
            phosphorus,
            potassium,
            temperature,
            humidity,
            ph,
            rainfall,
            soil_type,
            weather,
            region,
        })
    }

    /// Numeric inputs in feature order.
    pub fn numeric_features(&self) -> [f64; NUMERIC_COLUMNS.len()] {
        [
            self.nitrogen,
            self.phosphorus,
            self.potassium,
            self.temperature,
            self.humidity,
            self.ph,
            self.rainfall,
        ]
    }

    /// `(column, value)` pairs in feature order.
    pub fn categorical_features(&self) -> [(&'static str, &str); CATEGORICAL_COLUMNS.len()] {
        [
            (CATEGORICAL_COLUMNS[0], self.soil_type.as_str()),
            (CATEGORICAL_COLUMNS[1], self.weather.as_str()),
            (CATEGORICAL_COLUMNS[2], self.region.as_str()),
        ]
    }
}

/// Most likely crop and the classifier's probability for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub crop: String,
    pub confidence: f64,
}
