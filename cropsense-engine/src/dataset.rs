//! CSV training corpus loading.
//!
//! The header row is mandatory. Numeric and label columns are required; the
//! three categorical columns are optional and get a fixed default when the
//! whole column is absent, so that older datasets stay trainable.

use std::collections::BTreeSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Numeric feature columns, in feature-vector order.
pub const NUMERIC_COLUMNS: [&str; 7] = ["N", "P", "K", "temperature", "humidity", "ph", "rainfall"];

/// Categorical feature columns, in feature-vector order after the numeric ones.
pub const CATEGORICAL_COLUMNS: [&str; 3] = ["soil_type", "weather", "region"];

/// Value used for a categorical column that the dataset does not carry.
pub const CATEGORICAL_DEFAULTS: [&str; 3] = ["alluvial", "sunny", "karnataka"];

pub const LABEL_COLUMN: &str = "label";

pub const FEATURE_COUNT: usize = NUMERIC_COLUMNS.len() + CATEGORICAL_COLUMNS.len();

/// Feature names in the order the classifier sees them.
pub fn feature_names() -> Vec<String> {
    NUMERIC_COLUMNS
        .iter()
        .chain(CATEGORICAL_COLUMNS.iter())
        .map(|name| (*name).to_string())
        .collect()
}

#[derive(Debug, thiserror::Error)]
pub enum DatasetError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("Missing required columns: {0:?}")]
    MissingColumns(Vec<String>),
    #[error("Row {row}: empty value in column '{column}'")]
    MissingValue { row: usize, column: String },
    #[error("Row {row}: invalid number '{value}' in column '{column}'")]
    InvalidNumber { row: usize, column: String, value: String },
    #[error("Dataset contains no samples")]
    Empty,
}

/// One labelled row.
#[derive(Debug, Clone, PartialEq)]
pub struct CropSample {
    pub numeric: [f64; NUMERIC_COLUMNS.len()],
    pub categorical: [String; CATEGORICAL_COLUMNS.len()],
    pub label: String,
}

/// A fully parsed training corpus.
#[derive(Debug, Clone, Default)]
pub struct CropDataset {
    pub samples: Vec<CropSample>,
    /// Categorical columns absent from the file and filled with defaults.
    pub defaulted_columns: Vec<String>,
}

/// Where a categorical value comes from for every row.
enum CategoricalSource {
    Column(usize),
    Default(&'static str),
}

impl CropDataset {
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, DatasetError> {
        let file = File::open(path.as_ref())?;
        Self::from_reader(file)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, DatasetError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let headers = reader.headers()?.clone();
        let position = |name: &str| headers.iter().position(|header| header == name);

        let missing: Vec<String> = NUMERIC_COLUMNS
            .iter()
            .chain(std::iter::once(&LABEL_COLUMN))
            .filter(|name| position(name).is_none())
            .map(|name| (*name).to_string())
            .collect();
        if !missing.is_empty() {
            return Err(DatasetError::MissingColumns(missing));
        }

        // validated just above
        let numeric_at: Vec<usize> = NUMERIC_COLUMNS.iter().filter_map(|name| position(name)).collect();
        let label_at = position(LABEL_COLUMN).ok_or_else(|| DatasetError::MissingColumns(vec![LABEL_COLUMN.into()]))?;

        let mut defaulted_columns = Vec::new();
        let sources: Vec<CategoricalSource> = CATEGORICAL_COLUMNS
            .iter()
            .zip(CATEGORICAL_DEFAULTS)
            .map(|(name, default)| match position(name) {
                Some(index) => CategoricalSource::Column(index),
                None => {
                    defaulted_columns.push((*name).to_string());
                    CategoricalSource::Default(default)
                }
            })
            .collect();

        let mut samples = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record?;
            // header is line 1
            let row = index + 2;
            let cell = |at: usize, column: &str| -> Result<String, DatasetError> {
                match record.get(at) {
                    Some(value) if !value.is_empty() => Ok(value.to_string()),
                    _ => Err(DatasetError::MissingValue { row, column: column.to_string() }),
                }
            };

            let mut numeric = [0.0; NUMERIC_COLUMNS.len()];
            for (slot, (&at, column)) in numeric.iter_mut().zip(numeric_at.iter().zip(NUMERIC_COLUMNS)) {
                let raw = cell(at, column)?;
                *slot = raw
                    .parse::<f64>()
                    .ok()
                    .filter(|value| value.is_finite())
                    .ok_or_else(|| DatasetError::InvalidNumber {
                        row,
                        column: column.to_string(),
                        value: raw.clone(),
                    })?;
            }

            let mut categorical: [String; CATEGORICAL_COLUMNS.len()] = Default::default();
            for ((slot, source), column) in categorical.iter_mut().zip(&sources).zip(CATEGORICAL_COLUMNS) {
                *slot = match source {
                    CategoricalSource::Column(at) => cell(*at, column)?,
                    CategoricalSource::Default(value) => (*value).to_string(),
                };
            }

            samples.push(CropSample {
                numeric,
                categorical,
                label: cell(label_at, LABEL_COLUMN)?,
            });
        }

        if samples.is_empty() {
            return Err(DatasetError::Empty);
        }

        Ok(Self { samples, defaulted_columns })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Distinct labels, sorted.
    pub fn labels(&self) -> BTreeSet<&str> {
        self.samples.iter().map(|sample| sample.label.as_str()).collect()
    }

    /// Every value of one categorical column, row order.
    pub fn categorical_values(&self, column: usize) -> impl Iterator<Item = &str> {
        self.samples.iter().map(move |sample| sample.categorical[column].as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FULL: &str = "\
N,P,K,temperature,humidity,ph,rainfall,soil_type,weather,region,label
90,42,43,20.8,82.0,6.5,202.9,clay,rainy,kerala,rice
71,54,16,22.6,63.6,5.7,87.7,loamy,sunny,karnataka,maize
";

    #[test]
    fn test_load_full_dataset() {
        let dataset = CropDataset::from_reader(FULL.as_bytes()).unwrap();
        assert_eq!(dataset.len(), 2);
        assert!(dataset.defaulted_columns.is_empty());

        let first = &dataset.samples[0];
        assert_eq!(first.numeric, [90.0, 42.0, 43.0, 20.8, 82.0, 6.5, 202.9]);
        assert_eq!(first.categorical, ["clay".to_string(), "rainy".into(), "kerala".into()]);
        assert_eq!(first.label, "rice");
        assert_eq!(dataset.labels().into_iter().collect::<Vec<_>>(), ["maize", "rice"]);
    }

    #[test]
    fn test_column_order_does_not_matter() {
        let csv = "label,region,weather,soil_type,rainfall,ph,humidity,temperature,K,P,N\n\
                   rice,kerala,rainy,clay,202.9,6.5,82.0,20.8,43,42,90\n";
        let dataset = CropDataset::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(dataset.samples[0].numeric, [90.0, 42.0, 43.0, 20.8, 82.0, 6.5, 202.9]);
        assert_eq!(dataset.samples[0].categorical[0], "clay");
    }

    #[test]
    fn test_missing_categorical_columns_get_defaults() {
        let csv = "N,P,K,temperature,humidity,ph,rainfall,weather,label\n\
                   90,42,43,20.8,82.0,6.5,202.9,rainy,rice\n";
        let dataset = CropDataset::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(dataset.defaulted_columns, ["soil_type", "region"]);
        assert_eq!(
            dataset.samples[0].categorical,
            ["alluvial".to_string(), "rainy".into(), "karnataka".into()]
        );
    }

    #[test]
    fn test_missing_required_columns_are_listed() {
        let csv = "N,P,temperature,humidity,ph,label\n1,2,3,4,5,rice\n";
        match CropDataset::from_reader(csv.as_bytes()) {
            Err(DatasetError::MissingColumns(columns)) => assert_eq!(columns, ["K", "rainfall"]),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_number_reports_row_and_column() {
        let csv = "N,P,K,temperature,humidity,ph,rainfall,label\n\
                   90,42,43,20.8,82.0,6.5,202.9,rice\n\
                   90,42,43,warm,82.0,6.5,202.9,rice\n";
        match CropDataset::from_reader(csv.as_bytes()) {
            Err(DatasetError::InvalidNumber { row, column, value }) => {
                assert_eq!(row, 3);
                assert_eq!(column, "temperature");
                assert_eq!(value, "warm");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_empty_label_is_rejected() {
        let csv = "N,P,K,temperature,humidity,ph,rainfall,label\n90,42,43,20.8,82.0,6.5,202.9,\n";
        assert!(matches!(
            CropDataset::from_reader(csv.as_bytes()),
            Err(DatasetError::MissingValue { row: 2, .. })
        ));
    }

    #[test]
    fn test_header_only_is_empty() {
        let csv = "N,P,K,temperature,humidity,ph,rainfall,label\n";
        assert!(matches!(CropDataset::from_reader(csv.as_bytes()), Err(DatasetError::Empty)));
    }

    #[test]
    fn test_feature_names_order() {
        let names = feature_names();
        assert_eq!(names.len(), FEATURE_COUNT);
        assert_eq!(names[0], "N");
        assert_eq!(names[7], "soil_type");
        assert_eq!(names[9], "region");
    }
}
