//! Local JSON state file backing the CLI
//!
//! Holds the model catalog and every endpoint record. The file is read once
//! at startup into the in-memory catalog and repository, and written back
//! after the command finishes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use llmops_common::{Error, Result};
use llmops_serving::{CatalogModel, InMemoryCatalog, InMemoryEndpointRepository, ServingEndpoint};

/// On-disk layout
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct StateFile {
    models: Vec<CatalogModel>,
    endpoints: Vec<ServingEndpoint>,
}

/// Catalog and repository loaded from a state file
pub struct LocalState {
    path: PathBuf,
    models: Vec<CatalogModel>,
    catalog: Arc<InMemoryCatalog>,
    repository: Arc<InMemoryEndpointRepository>,
}

impl LocalState {
    /// Load `path`; a missing file is an empty state
    pub async fn load(path: &Path) -> Result<Self> {
        let file = match tokio::fs::read_to_string(path).await {
            Ok(raw) => serde_json::from_str::<StateFile>(&raw).map_err(|e| {
                Error::config(format!("invalid state file {}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no state file, starting empty");
                StateFile::default()
            }
            Err(e) => {
                return Err(Error::config(format!(
                    "failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let catalog = InMemoryCatalog::new();
        for model in &file.models {
            catalog.insert(model.clone());
        }

        Ok(Self {
            path: path.to_path_buf(),
            models: file.models,
            catalog: Arc::new(catalog),
            repository: Arc::new(InMemoryEndpointRepository::from_records(file.endpoints)),
        })
    }

    pub fn catalog(&self) -> Arc<InMemoryCatalog> {
        self.catalog.clone()
    }

    pub fn repository(&self) -> Arc<InMemoryEndpointRepository> {
        self.repository.clone()
    }

    pub fn models(&self) -> &[CatalogModel] {
        &self.models
    }

    /// Add a model, replacing any entry with the same id
    pub fn register_model(&mut self, model: CatalogModel) {
        self.models.retain(|m| m.id != model.id);
        self.catalog.insert(model.clone());
        self.models.push(model);
    }

    /// Write the current state back, replacing the file atomically
    pub async fn save(&self) -> Result<()> {
        let file = StateFile {
            models: self.models.clone(),
            endpoints: self.repository.records(),
        };
        let raw = serde_json::to_string_pretty(&file)?;

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, raw)
            .await
            .map_err(|e| Error::config(format!("failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            Error::config(format!("failed to replace {}: {}", self.path.display(), e))
        })?;
        debug!(path = %self.path.display(), endpoints = file.endpoints.len(), "saved state");
        Ok(())
    }
}
