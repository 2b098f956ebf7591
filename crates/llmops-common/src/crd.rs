//! Typed view of the KServe `InferenceService` custom resource
//!
//! We never install or watch this CRD; we only create instances of it when the
//! backend is enabled and the API group is served by the cluster. Only the
//! fields we write or read back are modelled.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Container, Volume};
use serde::{Deserialize, Serialize};

use crate::kube_utils::HasApiResource;

/// API group serving the InferenceService kind
pub const INFERENCE_SERVICE_GROUP: &str = "serving.kserve.io";

/// Annotation selecting KServe's deployment mode
pub const DEPLOYMENT_MODE_ANNOTATION: &str = "serving.kserve.io/deploymentMode";

/// Suffix KServe appends to the predictor's Deployment and Service names
pub const PREDICTOR_SUFFIX: &str = "-predictor";

/// KServe InferenceService
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceService {
    /// API version (serving.kserve.io/v1beta1)
    #[serde(default = "InferenceService::default_api_version")]
    pub api_version: String,
    /// Resource kind (InferenceService)
    #[serde(default = "InferenceService::default_kind")]
    pub kind: String,
    /// Metadata
    pub metadata: InferenceServiceMetadata,
    /// Spec
    pub spec: InferenceServiceSpec,
}

impl HasApiResource for InferenceService {
    const API_VERSION: &'static str = "serving.kserve.io/v1beta1";
    const KIND: &'static str = "InferenceService";
}

impl InferenceService {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }

    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Create a new InferenceService
    pub fn new(metadata: InferenceServiceMetadata, spec: InferenceServiceSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }

    /// Name of the Deployment KServe creates for the predictor
    pub fn predictor_name(name: &str) -> String {
        format!("{}{}", name, PREDICTOR_SUFFIX)
    }
}

/// Metadata for InferenceService resources
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct InferenceServiceMetadata {
    /// Resource name
    pub name: String,
    /// Resource namespace
    pub namespace: String,
    /// Labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// InferenceService spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct InferenceServiceSpec {
    /// Predictor component
    pub predictor: PredictorSpec,
}

/// Predictor using a custom serving container
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PredictorSpec {
    /// Minimum replica count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_replicas: Option<i32>,
    /// Maximum replica count
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_replicas: Option<i32>,
    /// Serving containers
    pub containers: Vec<Container>,
    /// Init containers (model sync)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    /// Pod volumes
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}
