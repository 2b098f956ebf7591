//! Serving endpoint control plane for llmops
//!
//! Turns declarative endpoint records into Kubernetes workloads and keeps
//! their status in step with the pods:
//!
//! - **Spec builder / workload**: pick an image and arguments, compile Deployments,
//!   InferenceServices, Services, HPAs and Ingresses
//! - **Reconciler**: delete-then-create that survives asynchronous garbage collection
//! - **Deployer**: backend selection, conflict handling, rollback and teardown
//! - **Status**: endpoint health derived from pod state
//! - **Service**: the endpoint lifecycle façade over catalog, repository and cluster

pub mod catalog;
pub mod cluster;
pub mod deployer;
pub mod endpoint;
pub mod naming;
pub mod reconciler;
pub mod service;
pub mod spec_builder;
pub mod status;
pub mod store;
pub mod workload;

#[cfg(test)]
mod testing;

pub use catalog::{CatalogModel, InMemoryCatalog, ModelCatalog, ModelStatus, ModelType};
pub use cluster::{ClusterApi, KubeClusterClient, ResourceKind};
pub use deployer::{Backend, DeployRequest, Deployed, Deployer};
pub use endpoint::{EndpointStatus, Environment, ServingEndpoint};
pub use service::{DeployEndpointRequest, EndpointService, RedeployRequest, SyncReport};
pub use status::WorkloadStatus;
pub use store::{EndpointRepository, InMemoryEndpointRepository};
