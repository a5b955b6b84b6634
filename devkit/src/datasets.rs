/*!
Générateur de datasets CSV pour l'entraînement

Produit des corpus déterministes (pas d'aléatoire) pour que les tests du
moteur soient reproductibles.
*/

use anyhow::{Context, Result};
use std::path::Path;

/// Colonnes complètes d'un dataset d'entraînement, dans l'ordre d'écriture.
pub const STANDARD_COLUMNS: [&str; 11] = [
    "N",
    "P",
    "K",
    "temperature",
    "humidity",
    "ph",
    "rainfall",
    "soil_type",
    "weather",
    "region",
    "label",
];

const CATEGORICAL: [&str; 3] = ["soil_type", "weather", "region"];

/// Profil agronomique d'une culture du corpus synthétique.
struct CropProfile {
    label: &'static str,
    numeric: [f64; 7],
    soil_type: &'static str,
    weather: &'static str,
    region: &'static str,
}

const PROFILES: [CropProfile; 3] = [
    CropProfile {
        label: "rice",
        numeric: [80.0, 45.0, 40.0, 23.0, 82.0, 6.4, 220.0],
        soil_type: "clay",
        weather: "rainy",
        region: "kerala",
    },
    CropProfile {
        label: "maize",
        numeric: [75.0, 48.0, 20.0, 22.0, 65.0, 6.2, 85.0],
        soil_type: "loamy",
        weather: "sunny",
        region: "karnataka",
    },
    CropProfile {
        label: "chickpea",
        numeric: [40.0, 67.0, 80.0, 18.0, 16.0, 7.3, 80.0],
        soil_type: "sandy",
        weather: "cloudy",
        region: "punjab",
    },
];

/// Builder de dataset: une en-tête et des lignes de texte brut.
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetBuilder {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl DatasetBuilder {
    /// Dataset vide avec les colonnes données.
    pub fn with_columns<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    /// Dataset vide avec toutes les colonnes attendues par le moteur.
    pub fn standard() -> Self {
        Self::with_columns(STANDARD_COLUMNS)
    }

    /// Trois cultures bien séparées (rice/clay/rainy/kerala,
    /// maize/loamy/sunny/karnataka, chickpea/sandy/cloudy/punjab),
    /// `per_crop` lignes chacune, avec une variation déterministe.
    pub fn synthetic_corpus(per_crop: usize) -> Self {
        let mut builder = Self::standard();
        for profile in &PROFILES {
            for i in 0..per_crop {
                // -0.5..=0.5 selon la ligne
                let jitter = ((i * 7) % 11) as f64 / 10.0 - 0.5;
                let mut row: Vec<String> = profile
                    .numeric
                    .iter()
                    .enumerate()
                    .map(|(column, base)| {
                        let spread = if column == 5 { 0.2 } else { base * 0.08 };
                        format!("{:.2}", base + jitter * spread)
                    })
                    .collect();
                row.extend(
                    [profile.soil_type, profile.weather, profile.region, profile.label]
                        .iter()
                        .map(|value| value.to_string()),
                );
                builder.rows.push(row);
            }
        }
        builder
    }

    /// Ajoute une ligne (valeurs dans l'ordre des colonnes).
    pub fn row<I, S>(mut self, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rows.push(values.into_iter().map(Into::into).collect());
        self
    }

    /// Retire une colonne et ses valeurs.
    pub fn without_column(mut self, name: &str) -> Self {
        if let Some(at) = self.columns.iter().position(|column| column == name) {
            self.columns.remove(at);
            for row in &mut self.rows {
                if at < row.len() {
                    row.remove(at);
                }
            }
        }
        self
    }

    /// Ancien format: sans soil_type, weather ni region.
    pub fn without_categorical(self) -> Self {
        CATEGORICAL
            .iter()
            .fold(self, |builder, column| builder.without_column(column))
    }

    /// Remplace une valeur dans une colonne pour toutes les lignes.
    pub fn rename_category(mut self, column: &str, from: &str, to: &str) -> Self {
        if let Some(at) = self.columns.iter().position(|name| name == column) {
            for row in &mut self.rows {
                if let Some(cell) = row.get_mut(at) {
                    if cell == from {
                        *cell = to.to_string();
                    }
                }
            }
        }
        self
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rend le CSV complet, en-tête comprise.
    pub fn to_csv_string(&self) -> String {
        let mut writer = csv::WriterBuilder::new()
            .flexible(true)
            .from_writer(Vec::new());
        // écriture en mémoire: seules des erreurs d'IO pourraient survenir
        let _ = writer.write_record(&self.columns);
        for row in &self.rows {
            let _ = writer.write_record(row);
        }
        let bytes = writer.into_inner().unwrap_or_default();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    /// Écrit le CSV dans `path`.
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_csv_string())
            .with_context(|| format!("writing dataset to {}", path.display()))
    }
}
