//! Shared fixtures for cluster-backed tests

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;

use llmops_common::ServingConfig;
use llmops_serving::{
    CatalogModel, EndpointService, InMemoryCatalog, InMemoryEndpointRepository,
    KubeClusterClient, ModelStatus, ModelType,
};

/// Namespace every test works in
pub const TEST_NAMESPACE: &str = "llmops-dev";

/// Approved model the tests deploy
pub const TEST_MODEL: &str = "kind-test-model";

/// Create the test namespace if it does not exist
pub async fn ensure_namespace() {
    let client = Client::try_default()
        .await
        .expect("a kubeconfig pointing at a test cluster");
    let namespaces: Api<Namespace> = Api::all(client);
    if namespaces.get_opt(TEST_NAMESPACE).await.unwrap().is_some() {
        return;
    }
    let ns = Namespace {
        metadata: ObjectMeta {
            name: Some(TEST_NAMESPACE.to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    namespaces.create(&PostParams::default(), &ns).await.unwrap();
}

/// Config with the InferenceService backend off so plain Deployments are used
pub fn test_config() -> Arc<ServingConfig> {
    let mut config = ServingConfig::default();
    config.platform = "llmops".to_string();
    config.inference_service.enabled = false;
    Arc::new(config)
}

pub fn test_model() -> CatalogModel {
    CatalogModel {
        id: TEST_MODEL.to_string(),
        name: "tiny-llama".to_string(),
        status: ModelStatus::Approved,
        model_type: ModelType::Base,
        storage_uri: Some("s3://models/tiny-llama/".to_string()),
        model_family: Some("llama".to_string()),
        metadata: BTreeMap::new(),
    }
}

/// Real cluster client plus a service over in-memory records
pub async fn test_service() -> (Arc<KubeClusterClient>, EndpointService) {
    ensure_namespace().await;
    let config = test_config();
    let cluster = Arc::new(KubeClusterClient::connect(&config).await.unwrap());
    let catalog = InMemoryCatalog::new();
    catalog.insert(test_model());
    let service = EndpointService::new(
        config,
        cluster.clone(),
        Arc::new(catalog),
        Arc::new(InMemoryEndpointRepository::new()),
    );
    (cluster, service)
}
