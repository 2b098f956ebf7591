//! Endpoint service: the lifecycle façade
//!
//! The only component that changes an endpoint's status. Transitions:
//!
//! ```text
//! deploying -> healthy | degraded | failed     (status sync)
//! healthy | degraded | failed -> deploying     (redeploy)
//! any -> rolled-back                           (rollback)
//! any -> removed                               (delete, after cluster cleanup)
//! ```
//!
//! `deploying` doubles as the redeploy lease. Taking it is a compare-and-swap
//! on the record's revision, so two concurrent redeploys cannot both win.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use llmops_common::retry::{retry_if, RetryPolicy};
use llmops_common::{Error, Result, ServingConfig};

use crate::catalog::{CatalogModel, ModelCatalog, ModelStatus, ModelType};
use crate::cluster::ClusterApi;
use crate::deployer::{DeployRequest, Deployer};
use crate::endpoint::{
    normalize_route, validate_replicas, AutoscalePolicy, ConfigSnapshot, DeploymentSpec,
    EndpointStatus, Environment, ResourceOverrides, RuntimeEngine, RuntimeSpec, ServeTarget,
    ServingEndpoint,
};
use crate::naming;
use crate::store::EndpointRepository;

/// Input for a first deploy
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeployEndpointRequest {
    /// Catalog model to serve
    pub model_id: String,
    /// Target environment
    pub environment: Environment,
    /// Route, unique within the environment
    pub route: String,
    /// Minimum replicas
    #[serde(default = "default_replicas")]
    pub min_replicas: i32,
    /// Maximum replicas
    #[serde(default = "default_replicas")]
    pub max_replicas: i32,
    /// Autoscale policy
    #[serde(default)]
    pub autoscale_policy: Option<AutoscalePolicy>,
    /// Prompt policy link
    #[serde(default)]
    pub prompt_policy_id: Option<String>,
    /// Explicit runtime image
    #[serde(default)]
    pub runtime_image: Option<String>,
    /// Explicit GPU choice
    #[serde(default)]
    pub use_gpu: Option<bool>,
    /// Resource overrides
    #[serde(default)]
    pub resources: ResourceOverrides,
    /// Declarative deployment spec
    #[serde(default)]
    pub deployment_spec: Option<DeploymentSpec>,
}

fn default_replicas() -> i32 {
    1
}

/// Changes applied by a redeploy; `None` keeps the stored value
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct RedeployRequest {
    /// New runtime image
    pub runtime_image: Option<String>,
    /// New GPU choice
    pub use_gpu: Option<bool>,
    /// New resource overrides
    pub resources: Option<ResourceOverrides>,
    /// New autoscale policy
    pub autoscale_policy: Option<AutoscalePolicy>,
    /// New minimum replicas
    pub min_replicas: Option<i32>,
    /// New maximum replicas
    pub max_replicas: Option<i32>,
    /// New deployment spec
    pub deployment_spec: Option<DeploymentSpec>,
}

/// Outcome of a sync pass over all endpoints
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Endpoints looked at
    pub checked: usize,
    /// Endpoints whose status changed
    pub updated: usize,
    /// Endpoints that could not be observed
    pub errors: usize,
}

/// Lifecycle operations on serving endpoints
pub struct EndpointService {
    config: Arc<ServingConfig>,
    catalog: Arc<dyn ModelCatalog>,
    repository: Arc<dyn EndpointRepository>,
    deployer: Deployer,
}

impl EndpointService {
    /// Service over its collaborators
    pub fn new(
        config: Arc<ServingConfig>,
        cluster: Arc<dyn ClusterApi>,
        catalog: Arc<dyn ModelCatalog>,
        repository: Arc<dyn EndpointRepository>,
    ) -> Self {
        Self {
            deployer: Deployer::new(cluster, config.clone()),
            config,
            catalog,
            repository,
        }
    }

    fn namespace(&self, environment: Environment) -> String {
        naming::namespace_for(&self.config.platform, environment)
    }

    /// Create an endpoint and deploy it.
    ///
    /// Every validation runs before the cluster is touched. External models
    /// are recorded as `healthy` without any cluster call.
    #[instrument(skip(self, request), fields(model = %request.model_id, environment = %request.environment))]
    pub async fn deploy_endpoint(&self, request: DeployEndpointRequest) -> Result<ServingEndpoint> {
        let id = Uuid::new_v4();
        let key = id.to_string();
        let route = normalize_route(&request.route);

        validate_replicas(&key, request.min_replicas, request.max_replicas)?;
        if let Some(policy) = &request.autoscale_policy {
            policy.validate(&key)?;
        }
        let model = self.approved_model(&key, &request.model_id).await?;
        if self
            .repository
            .find_by_route(request.environment, &route)
            .await?
            .is_some()
        {
            return Err(Error::validation_for_field(
                key,
                "route",
                format!("route '{}' is already in use in {}", route, request.environment),
            ));
        }

        let mut endpoint = ServingEndpoint {
            id,
            model_id: request.model_id.clone(),
            environment: request.environment,
            route,
            status: EndpointStatus::Deploying,
            min_replicas: request.min_replicas,
            max_replicas: request.max_replicas,
            autoscale_policy: request.autoscale_policy.clone(),
            prompt_policy_id: request.prompt_policy_id.clone(),
            runtime_image: request.runtime_image.clone(),
            use_gpu: request.use_gpu.unwrap_or(false),
            resources: request.resources.clone(),
            deployment_spec: request.deployment_spec.clone(),
            rollback_plan: None,
            last_health_check: None,
            created_at: Utc::now(),
            revision: 0,
        };

        if model.model_type == ModelType::External {
            endpoint.status = EndpointStatus::Healthy;
            let endpoint = self.repository.insert(endpoint).await?;
            info!(endpoint = %endpoint.id, "external model, nothing to deploy");
            return Ok(endpoint);
        }

        let Some(storage_uri) = model.storage() else {
            return Err(Error::validation_for_field(
                key,
                "model_id",
                format!("model '{}' has no object-storage content to serve", model.id),
            ));
        };

        // claims the route before any cluster work
        let endpoint = self.repository.insert(endpoint).await?;
        let namespace = self.namespace(endpoint.environment);

        let deployed = self
            .deployer
            .deploy(&DeployRequest {
                endpoint_id: &endpoint.id,
                storage_uri,
                route: &endpoint.route,
                min_replicas: endpoint.min_replicas,
                max_replicas: endpoint.max_replicas,
                autoscale: endpoint.autoscale_policy.as_ref(),
                namespace: &namespace,
                runtime_image: endpoint.runtime_image.as_deref(),
                use_gpu: request.use_gpu,
                overrides: Some(&endpoint.resources),
                model: Some(&model),
                deployment_spec: endpoint.deployment_spec.as_ref(),
            })
            .await;

        let deployed = match deployed {
            Ok(deployed) => deployed,
            Err(e) => {
                warn!(endpoint = %endpoint.id, error = %e, "deploy failed");
                if let Err(write_err) = self
                    .apply(&endpoint.id, |ep| ep.status = EndpointStatus::Failed)
                    .await
                {
                    warn!(endpoint = %endpoint.id, error = %write_err, "could not record failed status");
                }
                return Err(e);
            }
        };

        let endpoint = self
            .apply(&endpoint.id, |ep| {
                ep.rollback_plan = Some(deployed.resource_id.clone());
                ep.use_gpu = deployed.use_gpu;
                ep.status = EndpointStatus::Deploying;
            })
            .await?;
        info!(endpoint = %endpoint.id, resource = %deployed.resource_id, "endpoint deployed");

        Ok(self.sync_quietly(endpoint).await)
    }

    /// Replace an endpoint's workload with a new configuration.
    ///
    /// Refused while another redeploy holds the lease and its workload still
    /// exists. A `deploying` endpoint with no workload is a crashed attempt and
    /// may be redeployed. On failure every configuration field is restored.
    #[instrument(skip(self, request))]
    pub async fn redeploy_endpoint(
        &self,
        id: Uuid,
        request: RedeployRequest,
    ) -> Result<ServingEndpoint> {
        let endpoint = self.require(&id).await?;
        let key = id.to_string();
        let short = naming::short_name(&id);
        let namespace = self.namespace(endpoint.environment);

        let model = self.approved_model(&key, &endpoint.model_id).await?;
        if model.model_type == ModelType::External {
            return Err(Error::validation_for(
                key,
                "external models are served by their provider and cannot be redeployed",
            ));
        }
        let Some(storage_uri) = model.storage() else {
            return Err(Error::validation_for_field(
                key,
                "model_id",
                format!("model '{}' has no object-storage content to serve", model.id),
            ));
        };

        if endpoint.status == EndpointStatus::Deploying {
            if self.deployer.primary_exists(&short, &namespace).await? {
                return Err(Error::validation_for(
                    key,
                    "a deployment is already in progress for this endpoint",
                ));
            }
            warn!(endpoint = %id, "marked deploying but no workload exists, treating previous attempt as failed");
        }

        let snapshot = endpoint.snapshot();
        let mut next = endpoint.clone();
        if let Some(image) = request.runtime_image.clone() {
            next.runtime_image = Some(image);
        }
        if let Some(use_gpu) = request.use_gpu {
            next.use_gpu = use_gpu;
        }
        if let Some(resources) = request.resources.clone() {
            next.resources = resources;
        }
        if let Some(policy) = request.autoscale_policy.clone() {
            next.autoscale_policy = Some(policy);
        }
        next.min_replicas = request.min_replicas.unwrap_or(next.min_replicas);
        next.max_replicas = request.max_replicas.unwrap_or(next.max_replicas);
        next.deployment_spec = Some(effective_spec(
            request.deployment_spec.as_ref(),
            &endpoint,
            &model,
        ));
        validate_replicas(&key, next.min_replicas, next.max_replicas)?;
        if let Some(policy) = &next.autoscale_policy {
            policy.validate(&key)?;
        }
        next.status = EndpointStatus::Deploying;

        // lease: fails with StaleRevision if anyone wrote since we read
        let next = self.repository.update(&next).await?;
        info!(endpoint = %id, revision = next.revision, "took redeploy lease");

        match self.deployer.delete(&short, &namespace).await {
            Ok(true) => {}
            Ok(false) => {
                self.restore(&id, &snapshot).await;
                return Err(Error::deployment_failed(
                    short,
                    "existing workload could not be removed",
                ));
            }
            Err(e) => {
                self.restore(&id, &snapshot).await;
                return Err(e);
            }
        }

        let deployed = self
            .deployer
            .deploy(&DeployRequest {
                endpoint_id: &id,
                storage_uri,
                route: &next.route,
                min_replicas: next.min_replicas,
                max_replicas: next.max_replicas,
                autoscale: next.autoscale_policy.as_ref(),
                namespace: &namespace,
                runtime_image: next.runtime_image.as_deref(),
                // caller's flag, then a new spec's flag, then what ran before
                use_gpu: request
                    .use_gpu
                    .or_else(|| request.deployment_spec.as_ref().and_then(|s| s.use_gpu))
                    .or(Some(next.use_gpu)),
                overrides: Some(&next.resources),
                model: Some(&model),
                deployment_spec: next.deployment_spec.as_ref(),
            })
            .await;

        match deployed {
            Ok(deployed) => {
                let endpoint = self
                    .apply(&id, |ep| {
                        ep.rollback_plan = Some(deployed.resource_id.clone());
                        ep.use_gpu = deployed.use_gpu;
                        ep.status = EndpointStatus::Deploying;
                    })
                    .await?;
                info!(endpoint = %id, resource = %deployed.resource_id, "endpoint redeployed");
                Ok(self.sync_quietly(endpoint).await)
            }
            Err(e) => {
                warn!(endpoint = %id, error = %e, "redeploy failed, restoring previous configuration");
                self.restore(&id, &snapshot).await;
                Err(e)
            }
        }
    }

    /// Scale an endpoint to zero and mark it rolled back
    #[instrument(skip(self))]
    pub async fn rollback_endpoint(&self, id: Uuid) -> Result<ServingEndpoint> {
        let endpoint = self.require(&id).await?;
        if !self.is_external(&endpoint).await {
            let short = naming::short_name(&id);
            self.deployer
                .rollback(&short, &self.namespace(endpoint.environment))
                .await?;
        }
        let endpoint = self
            .apply(&id, |ep| ep.status = EndpointStatus::RolledBack)
            .await?;
        info!(endpoint = %id, "endpoint rolled back");
        Ok(endpoint)
    }

    /// Tear down an endpoint; the record goes only once the cluster is clean
    #[instrument(skip(self))]
    pub async fn delete_endpoint(&self, id: Uuid) -> Result<()> {
        let endpoint = self.require(&id).await?;
        if !self.is_external(&endpoint).await {
            let short = naming::short_name(&id);
            let removed = self
                .deployer
                .delete(&short, &self.namespace(endpoint.environment))
                .await?;
            if !removed {
                return Err(Error::deletion_failed(
                    id.to_string(),
                    "kubernetes resources are still present; record kept",
                ));
            }
        }
        self.repository.delete(&id).await?;
        info!(endpoint = %id, "endpoint deleted");
        Ok(())
    }

    /// Fetch an endpoint, syncing its status from the cluster when it changed
    #[instrument(skip(self))]
    pub async fn get_endpoint(&self, id: Uuid) -> Result<ServingEndpoint> {
        let endpoint = self.require(&id).await?;
        Ok(self.sync_quietly(endpoint).await)
    }

    /// List endpoints, syncing each one's status
    #[instrument(skip(self))]
    pub async fn list_endpoints(
        &self,
        environment: Option<Environment>,
    ) -> Result<Vec<ServingEndpoint>> {
        let mut out = Vec::new();
        for endpoint in self.repository.list(environment).await? {
            out.push(self.sync_quietly(endpoint).await);
        }
        Ok(out)
    }

    /// Observe the cluster and always write, stamping the health-check time
    #[instrument(skip(self))]
    pub async fn refresh_endpoint_status(&self, id: Uuid) -> Result<ServingEndpoint> {
        let endpoint = self.require(&id).await?;
        self.synchronize(endpoint, true).await.map(|(ep, _)| ep)
    }

    /// One sync pass over every endpoint
    #[instrument(skip(self))]
    pub async fn sync_all(&self) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        for endpoint in self.repository.list(None).await? {
            report.checked += 1;
            let id = endpoint.id;
            match self.synchronize(endpoint, false).await {
                Ok((_, true)) => report.updated += 1,
                Ok((_, false)) => {}
                Err(e) => {
                    warn!(endpoint = %id, error = %e, "status sync failed");
                    report.errors += 1;
                }
            }
        }
        info!(
            checked = report.checked,
            updated = report.updated,
            errors = report.errors,
            "sync pass finished"
        );
        Ok(report)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    async fn require(&self, id: &Uuid) -> Result<ServingEndpoint> {
        self.repository
            .get(id)
            .await?
            .ok_or_else(|| Error::not_found("endpoint", id.to_string()))
    }

    async fn approved_model(&self, endpoint: &str, model_id: &str) -> Result<CatalogModel> {
        let model = self.catalog.get_model(model_id).await?.ok_or_else(|| {
            Error::validation_for_field(
                endpoint,
                "model_id",
                format!("model '{}' does not exist", model_id),
            )
        })?;
        if model.status != ModelStatus::Approved {
            return Err(Error::validation_for_field(
                endpoint,
                "model_id",
                format!("model '{}' is not approved", model_id),
            ));
        }
        Ok(model)
    }

    async fn is_external(&self, endpoint: &ServingEndpoint) -> bool {
        match self.catalog.get_model(&endpoint.model_id).await {
            Ok(model) => model.is_some_and(|m| m.model_type == ModelType::External),
            Err(e) => {
                warn!(endpoint = %endpoint.id, error = %e, "catalog lookup failed");
                false
            }
        }
    }

    /// Read-modify-write against the latest stored record, retrying lost races
    async fn apply<F>(&self, id: &Uuid, mutate: F) -> Result<ServingEndpoint>
    where
        F: Fn(&mut ServingEndpoint) + Send + Sync,
    {
        let repository = &self.repository;
        let mutate = &mutate;
        retry_if(
            &RetryPolicy::default(),
            "update endpoint",
            |e: &Error| matches!(e, Error::StaleRevision { .. }),
            move || async move {
                let mut current = repository
                    .get(id)
                    .await?
                    .ok_or_else(|| Error::not_found("endpoint", id.to_string()))?;
                mutate(&mut current);
                repository.update(&current).await
            },
        )
        .await
    }

    async fn restore(&self, id: &Uuid, snapshot: &ConfigSnapshot) {
        let restored = self
            .apply(id, |ep| {
                ep.restore(snapshot.clone());
                ep.status = EndpointStatus::Failed;
            })
            .await;
        if let Err(e) = restored {
            warn!(endpoint = %id, error = %e, "could not restore endpoint configuration");
        }
    }

    async fn sync_quietly(&self, endpoint: ServingEndpoint) -> ServingEndpoint {
        let fallback = endpoint.clone();
        match self.synchronize(endpoint, false).await {
            Ok((endpoint, _)) => endpoint,
            Err(e) => {
                debug!(endpoint = %fallback.id, error = %e, "status sync skipped");
                fallback
            }
        }
    }

    /// Observe and, when the status moved or `force` is set, write back.
    ///
    /// Returns the record and whether it was written.
    async fn synchronize(
        &self,
        endpoint: ServingEndpoint,
        force: bool,
    ) -> Result<(ServingEndpoint, bool)> {
        let observe = endpoint.status != EndpointStatus::RolledBack
            && !self.is_external(&endpoint).await;

        let status = if observe {
            let short = naming::short_name(&endpoint.id);
            let observed = self
                .deployer
                .get_status(&short, &self.namespace(endpoint.environment))
                .await?;
            next_status(endpoint.status, observed.workload_found, observed.status)
        } else {
            endpoint.status
        };

        if status == endpoint.status && !force {
            return Ok((endpoint, false));
        }

        let mut next = endpoint.clone();
        next.status = status;
        if force {
            next.last_health_check = Some(Utc::now());
        }
        match self.repository.update(&next).await {
            Ok(written) => {
                debug!(endpoint = %written.id, from = %endpoint.status, to = %written.status, "status written");
                Ok((written, true))
            }
            // someone else wrote first; their record wins
            Err(Error::StaleRevision { .. }) if !force => Ok((endpoint, false)),
            Err(e) => Err(e),
        }
    }
}

/// Status after an observation.
///
/// A missing workload leaves `deploying` and `failed` alone and turns a
/// previously running endpoint into `failed`.
fn next_status(current: EndpointStatus, workload_found: bool, observed: EndpointStatus) -> EndpointStatus {
    if workload_found {
        return observed;
    }
    match current {
        EndpointStatus::Deploying | EndpointStatus::Failed => current,
        _ => EndpointStatus::Failed,
    }
}

/// Deployment spec for a redeploy: explicit > stored > synthesized from the
/// catalog entry. Runtime and resource fields the chosen spec leaves empty are
/// carried over from what the endpoint ran before.
pub fn effective_spec(
    explicit: Option<&DeploymentSpec>,
    endpoint: &ServingEndpoint,
    model: &CatalogModel,
) -> DeploymentSpec {
    let stored = endpoint.deployment_spec.as_ref();
    let mut spec = match (explicit, stored) {
        (Some(spec), _) => spec.clone(),
        (None, Some(spec)) => return spec.clone(),
        (None, None) => synthesize_spec(model),
    };

    let previous = stored.cloned().unwrap_or_else(|| DeploymentSpec {
        runtime: RuntimeSpec {
            image: endpoint.runtime_image.clone(),
            ..Default::default()
        },
        use_gpu: Some(endpoint.use_gpu),
        ..Default::default()
    });
    carry_over(&mut spec, &previous);
    spec
}

fn synthesize_spec(model: &CatalogModel) -> DeploymentSpec {
    let engine = match model.metadata_str("runtime").map(str::to_ascii_lowercase).as_deref() {
        Some("vllm") => Some(RuntimeEngine::Vllm),
        Some("tgi") | Some("text-generation-inference") => Some(RuntimeEngine::Tgi),
        _ => None,
    };
    let serve_target = match model.metadata_str("serve_target") {
        Some(t) if t.eq_ignore_ascii_case("rag") => ServeTarget::Rag,
        _ => ServeTarget::Generation,
    };
    DeploymentSpec {
        model_ref: Some(model.id.clone()),
        model_family: model.model_family.clone(),
        job_type: model.metadata_str("job_type").map(str::to_string),
        serve_target,
        runtime: RuntimeSpec {
            engine,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn carry_over(spec: &mut DeploymentSpec, previous: &DeploymentSpec) {
    let runtime = &mut spec.runtime;
    runtime.image = runtime.image.take().or_else(|| previous.runtime.image.clone());
    runtime.engine = runtime.engine.or(previous.runtime.engine);
    runtime.max_concurrent_requests = runtime
        .max_concurrent_requests
        .or(previous.runtime.max_concurrent_requests);
    runtime.max_input_tokens = runtime.max_input_tokens.or(previous.runtime.max_input_tokens);
    runtime.max_output_tokens = runtime
        .max_output_tokens
        .or(previous.runtime.max_output_tokens);

    let resources = &mut spec.resources;
    resources.gpu_count = resources.gpu_count.or(previous.resources.gpu_count);
    resources.gpu_memory = resources
        .gpu_memory
        .take()
        .or_else(|| previous.resources.gpu_memory.clone());

    spec.use_gpu = spec.use_gpu.or(previous.use_gpu);
}
