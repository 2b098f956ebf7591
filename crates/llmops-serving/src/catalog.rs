//! Model catalog contract
//!
//! The catalog itself lives elsewhere; serving only needs to read one entry
//! to gate deploys and pick a runtime.

use std::collections::BTreeMap;

use async_trait::async_trait;
use dashmap::DashMap;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

use llmops_common::Result;

/// Review status of a catalog entry
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ModelStatus {
    /// Registered, not reviewed
    Draft,
    /// Under review
    Pending,
    /// Cleared for deployment
    Approved,
    /// Rejected in review
    Rejected,
    /// No longer deployable
    Deprecated,
}

/// Kind of model
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum ModelType {
    /// Pretrained base model
    Base,
    /// Fine-tuned from a base model
    FineTuned,
    /// Hosted by a third party and reached over its API; never deployed
    External,
}

/// Catalog entry as seen by serving
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CatalogModel {
    /// Catalog id
    pub id: String,
    /// Display name
    pub name: String,
    /// Review status
    pub status: ModelStatus,
    /// Model kind
    #[serde(rename = "type")]
    pub model_type: ModelType,
    /// Object-storage location of the weights (`s3://bucket/prefix/`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_uri: Option<String>,
    /// Model family (e.g. "llama", "mistral")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_family: Option<String>,
    /// Free-form metadata recorded at registration
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

impl CatalogModel {
    /// String-valued metadata entry, ignoring blanks
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata
            .get(key)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// Usable storage URI, ignoring blanks
    pub fn storage(&self) -> Option<&str> {
        self.storage_uri
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

/// Read access to the model catalog
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ModelCatalog: Send + Sync {
    /// Fetch one model; `None` when the id is unknown
    async fn get_model(&self, id: &str) -> Result<Option<CatalogModel>>;
}

/// Catalog held in memory, for tests and local tooling
#[derive(Default)]
pub struct InMemoryCatalog {
    models: DashMap<String, CatalogModel>,
}

impl InMemoryCatalog {
    /// Empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a model
    pub fn insert(&self, model: CatalogModel) {
        self.models.insert(model.id.clone(), model);
    }
}

#[async_trait]
impl ModelCatalog for InMemoryCatalog {
    async fn get_model(&self, id: &str) -> Result<Option<CatalogModel>> {
        Ok(self.models.get(id).map(|m| m.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model() -> CatalogModel {
        CatalogModel {
            id: "m-1".to_string(),
            name: "llama-3-8b-sft".to_string(),
            status: ModelStatus::Approved,
            model_type: ModelType::FineTuned,
            storage_uri: Some("s3://models/llama-3-8b-sft/".to_string()),
            model_family: Some("llama".to_string()),
            metadata: BTreeMap::from([
                ("runtime".to_string(), serde_json::json!("vllm")),
                ("blank".to_string(), serde_json::json!("  ")),
            ]),
        }
    }

    #[test]
    fn test_metadata_accessors() {
        let m = model();
        assert_eq!(m.metadata_str("runtime"), Some("vllm"));
        assert_eq!(m.metadata_str("blank"), None);
        assert_eq!(m.metadata_str("missing"), None);
        assert_eq!(m.storage(), Some("s3://models/llama-3-8b-sft/"));
    }

    #[test]
    fn test_wire_format() {
        let value = serde_json::to_value(model()).unwrap();
        assert_eq!(value["type"], "fine-tuned");
        assert_eq!(value["status"], "approved");
        assert_eq!(value["storageUri"], "s3://models/llama-3-8b-sft/");
    }

    #[tokio::test]
    async fn test_in_memory_catalog() {
        let catalog = InMemoryCatalog::new();
        catalog.insert(model());
        assert!(catalog.get_model("m-1").await.unwrap().is_some());
        assert!(catalog.get_model("m-2").await.unwrap().is_none());
    }
}
