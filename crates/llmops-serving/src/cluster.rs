//! Kubernetes resource client
//!
//! [`ClusterApi`] is the seam between the serving logic and the API server.
//! Everything above it speaks in [`ResourceKind`]s and JSON bodies so the
//! reconciler can treat Deployments, InferenceServices and satellites the
//! same way. [`KubeClusterClient`] is the kube-rs implementation.

use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::autoscaling::v2::HorizontalPodAutoscaler;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{
    Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams,
    PropagationPolicy,
};
use kube::discovery::ApiResource;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use llmops_common::crd::InferenceService;
use llmops_common::kube_utils::{create_client_with_timeout, HasApiResource};
use llmops_common::{Error, Result, ServingConfig};

/// Field manager recorded on our writes
pub const FIELD_MANAGER: &str = "llmops-serving";

/// Resource kinds the serving subsystem creates or observes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    /// apps/v1 Deployment
    Deployment,
    /// serving.kserve.io/v1beta1 InferenceService
    InferenceService,
    /// v1 Service
    Service,
    /// autoscaling/v2 HorizontalPodAutoscaler
    HorizontalPodAutoscaler,
    /// networking.k8s.io/v1 Ingress
    Ingress,
    /// v1 Pod
    Pod,
}

impl ResourceKind {
    /// API coordinates for dynamic access
    pub fn api_resource(&self) -> ApiResource {
        match self {
            ResourceKind::Deployment => ApiResource::erase::<Deployment>(&()),
            ResourceKind::InferenceService => InferenceService::api_resource(),
            ResourceKind::Service => ApiResource::erase::<Service>(&()),
            ResourceKind::HorizontalPodAutoscaler => {
                ApiResource::erase::<HorizontalPodAutoscaler>(&())
            }
            ResourceKind::Ingress => ApiResource::erase::<Ingress>(&()),
            ResourceKind::Pod => ApiResource::erase::<Pod>(&()),
        }
    }

    /// Kind name as the API server spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Deployment => "Deployment",
            ResourceKind::InferenceService => "InferenceService",
            ResourceKind::Service => "Service",
            ResourceKind::HorizontalPodAutoscaler => "HorizontalPodAutoscaler",
            ResourceKind::Ingress => "Ingress",
            ResourceKind::Pod => "Pod",
        }
    }

    /// True for the kinds that run the serving container
    pub fn is_primary(&self) -> bool {
        matches!(
            self,
            ResourceKind::Deployment | ResourceKind::InferenceService
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which objects a list call returns
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListSelector {
    /// Every object of the kind in the namespace
    All,
    /// Objects matching a label selector (`k=v,k2=v2`)
    Labels(String),
}

/// Typed CRUD across the resource kinds serving touches
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch one object; `None` when it does not exist
    async fn get(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>>;

    /// List objects in a namespace
    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &ListSelector,
    ) -> Result<Vec<DynamicObject>>;

    /// Create an object from its JSON manifest; 409 when the name is taken
    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        body: serde_json::Value,
    ) -> Result<DynamicObject>;

    /// Apply a JSON merge patch
    async fn patch(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        patch: serde_json::Value,
    ) -> Result<()>;

    /// Delete an object; `Ok(false)` when it was already gone
    async fn delete(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        grace_period_secs: Option<u32>,
    ) -> Result<bool>;

    /// Whether the InferenceService API is served for this namespace
    async fn inference_service_available(&self, namespace: &str) -> bool;
}

/// Run `operation`; on a 401, run `refresh` and retry exactly once.
///
/// A second 401, or a failed refresh, becomes [`Error::AuthenticationFailed`].
/// Every other error is returned unchanged.
pub async fn call_with_retry_on_401<T, F, Fut, R, RFut>(
    operation_name: &str,
    mut operation: F,
    refresh: R,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: FnOnce() -> RFut,
    RFut: Future<Output = Result<()>>,
{
    match operation().await {
        Err(e) if e.is_unauthorized() => {
            warn!(operation = %operation_name, error = %e, "unauthorized, reloading credentials and retrying once");
            if let Err(refresh_err) = refresh().await {
                warn!(operation = %operation_name, error = %refresh_err, "credential reload failed");
                return Err(Error::authentication_failed(operation_name, e.to_string()));
            }
            match operation().await {
                Err(e) if e.is_unauthorized() => {
                    Err(Error::authentication_failed(operation_name, e.to_string()))
                }
                other => other,
            }
        }
        other => other,
    }
}

// =============================================================================
// kube-rs implementation
// =============================================================================

/// [`ClusterApi`] backed by a kube-rs client
pub struct KubeClusterClient {
    client: RwLock<Client>,
    kubeconfig: Option<PathBuf>,
    connect_timeout: Duration,
    read_timeout: Duration,
    probe_timeout: Duration,
}

impl KubeClusterClient {
    /// Connect using the configured kubeconfig or in-cluster credentials.
    ///
    /// Fails when no usable configuration is found. An unreachable API server
    /// only logs a warning so the process can start and fail per operation.
    pub async fn connect(config: &ServingConfig) -> Result<Self> {
        let kubeconfig = config.kube.kubeconfig.clone();
        let connect_timeout = config.kube.connect_timeout();
        let read_timeout = config.kube.read_timeout();
        let client =
            create_client_with_timeout(kubeconfig.as_deref(), connect_timeout, read_timeout)
                .await?;

        let this = Self {
            client: RwLock::new(client),
            kubeconfig,
            connect_timeout,
            read_timeout,
            probe_timeout: config.timeouts.probe_timeout(),
        };
        this.probe_connection().await;
        Ok(this)
    }

    async fn probe_connection(&self) {
        let client = self.current_client().await;
        let namespaces: Api<Namespace> = Api::all(client);
        let probe = tokio::time::timeout(
            self.probe_timeout,
            namespaces.list(&ListParams::default().limit(1)),
        )
        .await;
        match probe {
            Ok(Ok(_)) => info!("connected to kubernetes API"),
            Ok(Err(e)) => warn!(error = %e, "kubernetes API probe failed, continuing"),
            Err(_) => warn!(
                timeout_secs = self.probe_timeout.as_secs(),
                "kubernetes API probe timed out, continuing"
            ),
        }
    }

    async fn current_client(&self) -> Client {
        self.client.read().await.clone()
    }

    /// Rebuild the client, re-reading the service-account token or kubeconfig
    async fn refresh_client(&self) -> Result<()> {
        let fresh = create_client_with_timeout(
            self.kubeconfig.as_deref(),
            self.connect_timeout,
            self.read_timeout,
        )
        .await?;
        *self.client.write().await = fresh;
        debug!("reloaded kubernetes credentials");
        Ok(())
    }

    async fn api(&self, kind: ResourceKind, namespace: &str) -> Api<DynamicObject> {
        Api::namespaced_with(self.current_client().await, namespace, &kind.api_resource())
    }
}

#[async_trait]
impl ClusterApi for KubeClusterClient {
    async fn get(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<Option<DynamicObject>> {
        call_with_retry_on_401(
            "get",
            move || async move {
                let api = self.api(kind, namespace).await;
                match api.get_opt(name).await {
                    Ok(obj) => Ok(obj),
                    // kind not served (e.g. CRD not installed)
                    Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
                    Err(e) => Err(Error::from(e)),
                }
            },
            || self.refresh_client(),
        )
        .await
    }

    async fn list(
        &self,
        kind: ResourceKind,
        namespace: &str,
        selector: &ListSelector,
    ) -> Result<Vec<DynamicObject>> {
        let params = match selector {
            ListSelector::All => ListParams::default(),
            ListSelector::Labels(labels) => ListParams::default().labels(labels),
        };
        let params = &params;
        call_with_retry_on_401(
            "list",
            move || async move {
                let api = self.api(kind, namespace).await;
                match api.list(params).await {
                    Ok(list) => Ok(list.items),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(Vec::new()),
                    Err(e) => Err(Error::from(e)),
                }
            },
            || self.refresh_client(),
        )
        .await
    }

    async fn create(
        &self,
        kind: ResourceKind,
        namespace: &str,
        body: serde_json::Value,
    ) -> Result<DynamicObject> {
        let obj: DynamicObject = serde_json::from_value(body)
            .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))?;
        let params = PostParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let (params, obj) = (&params, &obj);
        call_with_retry_on_401(
            "create",
            move || async move {
                let api = self.api(kind, namespace).await;
                api.create(params, obj).await.map_err(Error::from)
            },
            || self.refresh_client(),
        )
        .await
    }

    async fn patch(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        patch: serde_json::Value,
    ) -> Result<()> {
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..Default::default()
        };
        let (params, patch) = (&params, &patch);
        call_with_retry_on_401(
            "patch",
            move || async move {
                let api = self.api(kind, namespace).await;
                api.patch(name, params, &Patch::Merge(patch))
                    .await
                    .map(|_| ())
                    .map_err(Error::from)
            },
            || self.refresh_client(),
        )
        .await
    }

    async fn delete(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        grace_period_secs: Option<u32>,
    ) -> Result<bool> {
        let params = DeleteParams {
            grace_period_seconds: grace_period_secs,
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        let params = &params;
        call_with_retry_on_401(
            "delete",
            move || async move {
                let api = self.api(kind, namespace).await;
                match api.delete(name, params).await {
                    Ok(_) => Ok(true),
                    Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
                    Err(e) => Err(Error::from(e)),
                }
            },
            || self.refresh_client(),
        )
        .await
    }

    async fn inference_service_available(&self, namespace: &str) -> bool {
        let api = self.api(ResourceKind::InferenceService, namespace).await;
        let probe = tokio::time::timeout(
            self.probe_timeout,
            api.list(&ListParams::default().limit(1)),
        )
        .await;
        match probe {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(error = %e, %namespace, "InferenceService API not available");
                false
            }
            Err(_) => {
                warn!(%namespace, "InferenceService availability probe timed out");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use llmops_common::error::api_error;

    // =========================================================================
    // Story Tests: 401 handling
    // =========================================================================

    #[tokio::test]
    async fn story_expired_token_is_refreshed_and_call_retried_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let refreshes = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let r = refreshes.clone();

        let result = call_with_retry_on_401(
            "get",
            move || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(Error::from(api_error(401, "Unauthorized", "token expired")))
                    } else {
                        Ok("deployment")
                    }
                }
            },
            move || async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert_eq!(result.unwrap(), "deployment");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn story_persistent_401_becomes_authentication_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<()> = call_with_retry_on_401(
            "create",
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::from(api_error(401, "Unauthorized", "bad token")))
                }
            },
            || async { Ok(()) },
        )
        .await;

        assert!(matches!(result, Err(Error::AuthenticationFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_does_not_retry() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();

        let result: Result<()> = call_with_retry_on_401(
            "list",
            move || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err(Error::from(api_error(401, "Unauthorized", "bad token")))
                }
            },
            || async { Err(Error::config("no service account token")) },
        )
        .await;

        assert!(matches!(result, Err(Error::AuthenticationFailed { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_other_errors_pass_through_without_refresh() {
        let refreshed = Arc::new(AtomicU32::new(0));
        let r = refreshed.clone();

        let result: Result<()> = call_with_retry_on_401(
            "create",
            || async { Err(Error::from(api_error(409, "AlreadyExists", "exists"))) },
            move || async move {
                r.fetch_add(1, Ordering::SeqCst);
                Ok(())
            },
        )
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(refreshed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_resource_kind_coordinates() {
        let ar = ResourceKind::HorizontalPodAutoscaler.api_resource();
        assert_eq!(ar.group, "autoscaling");
        assert_eq!(ar.version, "v2");
        assert_eq!(ar.plural, "horizontalpodautoscalers");

        let ar = ResourceKind::InferenceService.api_resource();
        assert_eq!(ar.group, "serving.kserve.io");
        assert_eq!(ar.plural, "inferenceservices");

        assert!(ResourceKind::Deployment.is_primary());
        assert!(!ResourceKind::Ingress.is_primary());
        assert_eq!(ResourceKind::Pod.to_string(), "Pod");
    }
}
