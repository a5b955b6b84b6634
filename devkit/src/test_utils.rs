/*!
Environnement de test

`TestWorkspace` fournit un répertoire temporaire avec les sous-dossiers
`data/` et `models/` attendus par le kernel et le moteur. Il est supprimé
à la fin du test.
*/

use crate::datasets::DatasetBuilder;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Initialise tracing pour les tests (sortie capturée par le harness cargo)
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

/// Répertoire de travail jetable
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Result<Self> {
        init_test_tracing();
        let dir = TempDir::new().context("creating temp workspace")?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Dossier des lectures capteurs (créé par le store au besoin)
    pub fn data_dir(&self) -> PathBuf {
        self.root().join("data")
    }

    /// Dossier des modèles (créé par le store au besoin)
    pub fn model_dir(&self) -> PathBuf {
        self.root().join("models")
    }

    /// Écrit un dataset CSV à la racine et retourne son chemin
    pub fn write_dataset(&self, name: &str, dataset: &DatasetBuilder) -> Result<PathBuf> {
        let path = self.root().join(name);
        dataset.write_csv(&path)?;
        Ok(path)
    }

    /// Écrit un fichier texte quelconque (kernel.yaml, CSV invalide...)
    pub fn write_file(&self, name: &str, contents: &str) -> Result<PathBuf> {
        let path = self.root().join(name);
        std::fs::write(&path, contents).with_context(|| format!("writing {}", path.display()))?;
        Ok(path)
    }
}
