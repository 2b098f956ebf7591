//! Deployer: turns a deploy request into cluster objects
//!
//! The InferenceService backend is tried first when enabled and served; any
//! reason it cannot be used is a [`FallbackReason`] and the raw Deployment
//! path runs instead. Only the primary workload's failure is fatal.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use llmops_common::crd::InferenceService;
use llmops_common::retry::{retry_if, RetryPolicy};
use llmops_common::{Error, Result, ServingConfig};

use crate::catalog::CatalogModel;
use crate::cluster::{ClusterApi, ListSelector, ResourceKind};
use crate::endpoint::{
    normalize_route, validate_replicas, AutoscalePolicy, DeploymentSpec, ResourceOverrides,
};
use crate::naming;
use crate::reconciler::Reconciler;
use crate::spec_builder::{ContainerPlan, SpecBuilder, SpecInputs};
use crate::status::{StatusSynchronizer, WorkloadStatus};
use crate::workload::{compile_inference_service, compile_ingress, compile_raw, WorkloadContext};

/// Primary workload kinds, in teardown order
const PRIMARY_KINDS: [ResourceKind; 2] = [ResourceKind::InferenceService, ResourceKind::Deployment];

/// Everything needed to deploy one endpoint
#[derive(Clone, Copy, Debug)]
pub struct DeployRequest<'a> {
    /// Endpoint id; the short name is derived from it
    pub endpoint_id: &'a Uuid,
    /// Model weights location
    pub storage_uri: &'a str,
    /// Route, normalized before use
    pub route: &'a str,
    /// Minimum replicas
    pub min_replicas: i32,
    /// Maximum replicas
    pub max_replicas: i32,
    /// Autoscale policy; no HPA when absent
    pub autoscale: Option<&'a AutoscalePolicy>,
    /// Target namespace
    pub namespace: &'a str,
    /// Explicit runtime image
    pub runtime_image: Option<&'a str>,
    /// Explicit GPU choice
    pub use_gpu: Option<bool>,
    /// Per-field resource overrides
    pub overrides: Option<&'a ResourceOverrides>,
    /// Catalog entry for metadata-driven image selection
    pub model: Option<&'a CatalogModel>,
    /// Declarative deployment spec
    pub deployment_spec: Option<&'a DeploymentSpec>,
}

/// Which backend ended up running the endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Backend {
    /// apps/v1 Deployment plus Service, HPA and Ingress
    Deployment,
    /// KServe InferenceService plus Ingress
    InferenceService,
}

/// Outcome of a successful deploy
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployed {
    /// Primary resource UID, or `namespace/name` when the server returned none
    pub resource_id: String,
    /// Short name used for every object
    pub short_name: String,
    /// Backend used
    pub backend: Backend,
    /// Image actually deployed
    pub image: String,
    /// Whether the pod requests GPUs
    pub use_gpu: bool,
}

/// Why the InferenceService backend was not used
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FallbackReason {
    /// Turned off in configuration
    Disabled,
    /// The API is not served in the namespace
    Unavailable,
    /// Creating the InferenceService failed
    CreateFailed(String),
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackReason::Disabled => write!(f, "InferenceService backend disabled"),
            FallbackReason::Unavailable => write!(f, "InferenceService API unavailable"),
            FallbackReason::CreateFailed(msg) => {
                write!(f, "InferenceService create failed: {}", msg)
            }
        }
    }
}

/// Creates, scales and removes endpoint workloads
#[derive(Clone)]
pub struct Deployer {
    cluster: Arc<dyn ClusterApi>,
    reconciler: Reconciler,
    synchronizer: StatusSynchronizer,
    spec_builder: SpecBuilder,
    config: Arc<ServingConfig>,
}

impl Deployer {
    /// Deployer over a cluster client and configuration
    pub fn new(cluster: Arc<dyn ClusterApi>, config: Arc<ServingConfig>) -> Self {
        Self {
            reconciler: Reconciler::new(cluster.clone(), config.timeouts.clone()),
            synchronizer: StatusSynchronizer::new(cluster.clone(), config.timeouts.probe_timeout()),
            spec_builder: SpecBuilder::new(&config),
            cluster,
            config,
        }
    }

    /// The reconciler this deployer uses
    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Deploy an endpoint, replacing whatever runs under its name
    #[instrument(skip(self, req), fields(endpoint = %req.endpoint_id, namespace = %req.namespace))]
    pub async fn deploy(&self, req: &DeployRequest<'_>) -> Result<Deployed> {
        let short = naming::short_name(req.endpoint_id);
        let route = normalize_route(req.route);
        validate_replicas(&short, req.min_replicas, req.max_replicas)?;
        if let Some(policy) = req.autoscale {
            policy.validate(&short)?;
        }

        // resolve before touching the cluster so bad input mutates nothing
        let plan = self.plan(req)?;

        self.clear_existing(&short, req.namespace).await?;

        let ctx = WorkloadContext {
            short_name: &short,
            namespace: req.namespace,
            endpoint_id: req.endpoint_id,
            route: &route,
            min_replicas: req.min_replicas,
            max_replicas: req.max_replicas,
            autoscale: req.autoscale,
            plan: &plan,
        };

        let (resource_id, backend) = match self.try_deploy_via_inference_service(&ctx).await {
            Ok(id) => (id, Backend::InferenceService),
            Err(reason) => {
                if reason != FallbackReason::Disabled {
                    warn!(%short, %reason, "using raw Deployment backend");
                }
                (self.deploy_raw(&ctx).await?, Backend::Deployment)
            }
        };

        info!(%short, %resource_id, ?backend, image = %plan.image, "endpoint deployed");
        Ok(Deployed {
            resource_id,
            short_name: short,
            backend,
            image: plan.image.clone(),
            use_gpu: plan.use_gpu,
        })
    }

    /// Resolve the container plan a request would deploy
    pub fn plan(&self, req: &DeployRequest<'_>) -> Result<ContainerPlan> {
        self.spec_builder.build(&SpecInputs {
            storage_uri: req.storage_uri,
            use_gpu: req.use_gpu,
            explicit_image: req.runtime_image,
            deployment_spec: req.deployment_spec,
            model: req.model,
            overrides: req.overrides,
        })
    }

    /// Remove a primary workload left under this name by an earlier deploy.
    ///
    /// A 401 here is fatal: the creates that follow would fail the same way.
    async fn clear_existing(&self, short: &str, namespace: &str) -> Result<()> {
        let timeouts = self.reconciler.timeouts();
        for kind in PRIMARY_KINDS {
            let state = match self.reconciler.exists(kind, short, namespace).await {
                Ok(state) => state,
                Err(e @ Error::AuthenticationFailed { .. }) => return Err(e),
                Err(e) if e.is_unauthorized() => {
                    return Err(Error::authentication_failed(
                        "check existing deployment",
                        e.to_string(),
                    ))
                }
                Err(e) => {
                    warn!(%kind, %short, %namespace, error = %e, "could not check for existing workload");
                    continue;
                }
            };

            let max_wait = if state.terminating {
                timeouts.extended_deletion_wait()
            } else if state.exists {
                timeouts.deletion_wait()
            } else {
                continue;
            };
            info!(%kind, %short, %namespace, terminating = state.terminating, "replacing existing workload");
            self.reconciler
                .ensure_deleted(kind, short, namespace, max_wait, timeouts.poll_interval())
                .await?;
        }
        Ok(())
    }

    /// Try the InferenceService backend
    pub async fn try_deploy_via_inference_service(
        &self,
        ctx: &WorkloadContext<'_>,
    ) -> std::result::Result<String, FallbackReason> {
        if !self.config.inference_service.enabled {
            return Err(FallbackReason::Disabled);
        }
        if !self.cluster.inference_service_available(ctx.namespace).await {
            return Err(FallbackReason::Unavailable);
        }

        let isvc = compile_inference_service(ctx, &self.config.inference_service.deployment_mode);
        let body = serde_json::to_value(&isvc)
            .map_err(|e| FallbackReason::CreateFailed(e.to_string()))?;
        let created = self
            .create_with_conflict(ResourceKind::InferenceService, ctx.short_name, ctx.namespace, &body)
            .await
            .map_err(|e| FallbackReason::CreateFailed(e.to_string()))?;

        let predictor = InferenceService::predictor_name(ctx.short_name);
        let ingress = compile_ingress(ctx, &predictor, &self.config.ingress);
        self.create_satellite(ResourceKind::Ingress, &naming::ingress_name(ctx.short_name), ctx.namespace, &ingress)
            .await;

        Ok(resource_id(&created, ctx.namespace, ctx.short_name))
    }

    async fn deploy_raw(&self, ctx: &WorkloadContext<'_>) -> Result<String> {
        let short = ctx.short_name;
        let workloads = compile_raw(ctx, &self.config.ingress);
        let body = serde_json::to_value(&workloads.deployment)?;

        let created = self
            .create_with_conflict(ResourceKind::Deployment, short, ctx.namespace, &body)
            .await
            .map_err(|e| match e {
                Error::AuthenticationFailed { .. }
                | Error::ResourceStillExists { .. }
                | Error::DeletionTimeout { .. } => e,
                other => Error::deployment_failed(short, other.to_string()),
            })?;

        self.create_satellite(ResourceKind::Service, short, ctx.namespace, &workloads.service)
            .await;
        match &workloads.hpa {
            Some(hpa) => {
                self.create_satellite(ResourceKind::HorizontalPodAutoscaler, short, ctx.namespace, hpa)
                    .await;
            }
            None => self.remove_stale_hpa(short, ctx.namespace).await,
        }
        self.create_satellite(
            ResourceKind::Ingress,
            &naming::ingress_name(short),
            ctx.namespace,
            &workloads.ingress,
        )
        .await;

        Ok(resource_id(&created, ctx.namespace, short))
    }

    async fn create_with_conflict(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        body: &serde_json::Value,
    ) -> Result<kube::api::DynamicObject> {
        let cluster = &self.cluster;
        self.reconciler
            .handle_conflict(kind, name, namespace, move || {
                cluster.create(kind, namespace, body.clone())
            })
            .await
    }

    /// Create a supporting object; failure is logged, never returned
    async fn create_satellite<T: Serialize>(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        object: &T,
    ) -> bool {
        let result = match serde_json::to_value(object) {
            Ok(body) => self.create_with_conflict(kind, name, namespace, &body).await,
            Err(e) => Err(Error::from(e)),
        };
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!(%kind, %name, %namespace, error = %e, "failed to create satellite, continuing");
                false
            }
        }
    }

    /// Drop an autoscaler left by an earlier deploy that had a policy
    async fn remove_stale_hpa(&self, short: &str, namespace: &str) {
        let kind = ResourceKind::HorizontalPodAutoscaler;
        match self.cluster.delete(kind, short, namespace, None).await {
            Ok(true) => info!(%short, %namespace, "removed autoscaler without a policy"),
            Ok(false) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(%short, %namespace, error = %e, "failed to remove stale autoscaler"),
        }
    }

    /// Scale the endpoint's workload to zero
    #[instrument(skip(self))]
    pub async fn rollback(&self, short: &str, namespace: &str) -> Result<()> {
        let mut found = false;

        if self
            .cluster
            .get(ResourceKind::Deployment, short, namespace)
            .await?
            .is_some()
        {
            self.scale_to_zero(short, namespace).await?;
            found = true;
        }

        if self
            .cluster
            .get(ResourceKind::InferenceService, short, namespace)
            .await?
            .is_some()
        {
            let patch = serde_json::json!({ "spec": { "predictor": { "minReplicas": 0 } } });
            self.cluster
                .patch(ResourceKind::InferenceService, short, namespace, patch)
                .await?;

            for name in self.backing_deployments(short, namespace).await? {
                self.scale_to_zero(&name, namespace).await?;
            }
            found = true;
        }

        if !found {
            return Err(Error::not_found("workload", format!("{}/{}", namespace, short)));
        }
        info!(%short, %namespace, "scaled workload to zero");
        Ok(())
    }

    /// Deployments KServe created for an InferenceService
    async fn backing_deployments(&self, short: &str, namespace: &str) -> Result<Vec<String>> {
        let selector = ListSelector::Labels(naming::app_selector(short));
        let mut names: Vec<String> = self
            .cluster
            .list(ResourceKind::Deployment, namespace, &selector)
            .await?
            .into_iter()
            .filter_map(|d| d.metadata.name)
            .collect();

        let predictor = InferenceService::predictor_name(short);
        if !names.contains(&predictor)
            && self
                .cluster
                .get(ResourceKind::Deployment, &predictor, namespace)
                .await?
                .is_some()
        {
            names.push(predictor);
        }
        Ok(names)
    }

    /// Patch replicas to zero, retrying `resourceVersion` conflicts
    async fn scale_to_zero(&self, name: &str, namespace: &str) -> Result<()> {
        let cluster = &self.cluster;
        retry_if(
            &RetryPolicy::conflict(),
            "scale deployment to zero",
            |e: &Error| e.is_conflict(),
            move || {
                let patch = serde_json::json!({ "spec": { "replicas": 0 } });
                cluster.patch(ResourceKind::Deployment, name, namespace, patch)
            },
        )
        .await
    }

    /// Tear down every object of an endpoint.
    ///
    /// Both primary kinds are removed whatever the current configuration, since
    /// the backend may have changed since the endpoint was created. Satellites
    /// are always swept. Returns `false` when a primary resource could not be
    /// confirmed gone.
    #[instrument(skip(self))]
    pub async fn delete(&self, short: &str, namespace: &str) -> Result<bool> {
        let timeouts = self.reconciler.timeouts();
        let mut failed = Vec::new();

        for kind in PRIMARY_KINDS {
            if let Err(e) = self
                .reconciler
                .ensure_deleted(
                    kind,
                    short,
                    namespace,
                    timeouts.deletion_wait(),
                    timeouts.poll_interval(),
                )
                .await
            {
                warn!(%kind, %short, %namespace, error = %e, "failed to delete primary workload");
                failed.push(kind);
            }
        }

        let report = self.reconciler.cleanup_satellites(short, namespace).await;
        if report.errors > 0 {
            warn!(%short, %namespace, errors = report.errors, "some satellites could not be removed");
        }

        Ok(failed.is_empty())
    }

    /// Observe workload status
    pub async fn get_status(&self, short: &str, namespace: &str) -> Result<WorkloadStatus> {
        self.synchronizer.observe(short, namespace).await
    }

    /// Whether a primary workload exists under this name, terminating or not
    pub async fn primary_exists(&self, short: &str, namespace: &str) -> Result<bool> {
        for kind in PRIMARY_KINDS {
            if self.reconciler.exists(kind, short, namespace).await?.exists {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

fn resource_id(obj: &kube::api::DynamicObject, namespace: &str, name: &str) -> String {
    obj.metadata
        .uid
        .clone()
        .unwrap_or_else(|| format!("{}/{}", namespace, name))
}
