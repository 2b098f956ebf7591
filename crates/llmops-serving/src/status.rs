//! Status synchronizer
//!
//! The controller's own conditions lag, so endpoint health is derived from the
//! pods directly. [`derive_status`] is pure; [`StatusSynchronizer`] gathers the
//! pods and workload counters from the cluster.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};
use kube::api::DynamicObject;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use llmops_common::crd::InferenceService;
use llmops_common::kube_utils::to_typed;
use llmops_common::retry::{retry_if, RetryPolicy};
use llmops_common::{Error, Result};

use crate::cluster::{ClusterApi, ListSelector, ResourceKind};
use crate::endpoint::EndpointStatus;
use crate::naming;

/// Waiting reasons that mean the container will not start on its own
const FAILED_WAITING_REASONS: [&str; 3] = ["Error", "CrashLoopBackOff", "ImagePullBackOff"];

/// `PodScheduled=False` reasons/messages that mean the pod is still waiting on capacity
const SCHEDULING_WAIT_MARKERS: [&str; 5] = [
    "Insufficient",
    "Unschedulable",
    "volume",
    "storage",
    "PersistentVolumeClaim",
];

/// Observed state of one endpoint's workload
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadStatus {
    /// UID of the primary resource
    pub uid: Option<String>,
    /// Desired replicas
    pub replicas: i32,
    /// Ready replicas
    pub ready_replicas: i32,
    /// Available replicas
    pub available_replicas: i32,
    /// Derived status
    pub status: EndpointStatus,
    /// Whether a primary workload was found at all
    pub workload_found: bool,
}

/// Classify a pod set.
///
/// Terminating pods are ignored. Any failing pod makes the whole set
/// `Failed`, regardless of the others' readiness.
pub fn derive_status(pods: &[Pod]) -> EndpointStatus {
    let live: Vec<&Pod> = pods
        .iter()
        .filter(|p| p.metadata.deletion_timestamp.is_none())
        .collect();

    if live.is_empty() {
        return EndpointStatus::Deploying;
    }
    if live.iter().any(|p| pod_failed(p)) {
        return EndpointStatus::Failed;
    }
    if live.iter().any(|p| pod_waiting_on_start(p)) {
        return EndpointStatus::Deploying;
    }

    let ready = live.iter().filter(|p| pod_ready(p)).count();
    if ready == live.len() {
        EndpointStatus::Healthy
    } else if ready > 0 {
        EndpointStatus::Degraded
    } else {
        EndpointStatus::Deploying
    }
}

fn container_statuses(pod: &Pod) -> impl Iterator<Item = &ContainerStatus> {
    let status = pod.status.as_ref();
    let main = status.and_then(|s| s.container_statuses.as_ref());
    let init = status.and_then(|s| s.init_container_statuses.as_ref());
    main.into_iter().chain(init).flatten()
}

fn pod_failed(pod: &Pod) -> bool {
    let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
    if phase == Some("Failed") {
        return true;
    }
    container_statuses(pod).any(|cs| {
        let state = cs.state.as_ref();
        let bad_exit = state
            .and_then(|s| s.terminated.as_ref())
            .is_some_and(|t| t.exit_code != 0);
        let bad_wait = state
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.as_deref())
            .is_some_and(|reason| FAILED_WAITING_REASONS.iter().any(|r| reason.contains(r)));
        bad_exit || bad_wait
    })
}

fn pod_waiting_on_start(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };
    if status.phase.as_deref() != Some("Pending") {
        return false;
    }
    let creating = container_statuses(pod).any(|cs| {
        cs.state
            .as_ref()
            .and_then(|s| s.waiting.as_ref())
            .and_then(|w| w.reason.as_deref())
            == Some("ContainerCreating")
    });
    let unschedulable = status.conditions.iter().flatten().any(|c| {
        c.type_ == "PodScheduled"
            && c.status == "False"
            && [c.reason.as_deref(), c.message.as_deref()]
                .into_iter()
                .flatten()
                .any(|text| SCHEDULING_WAIT_MARKERS.iter().any(|m| text.contains(m)))
    });
    creating || unschedulable
}

fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Reads workload and pod state for an endpoint
#[derive(Clone)]
pub struct StatusSynchronizer {
    cluster: Arc<dyn ClusterApi>,
    probe_timeout: Duration,
}

impl StatusSynchronizer {
    /// Synchronizer bounding each observation by `probe_timeout`
    pub fn new(cluster: Arc<dyn ClusterApi>, probe_timeout: Duration) -> Self {
        Self {
            cluster,
            probe_timeout,
        }
    }

    /// Observe the workload named `short_name`
    ///
    /// Transient API failures get one more attempt inside the probe timeout.
    pub async fn observe(&self, short_name: &str, namespace: &str) -> Result<WorkloadStatus> {
        let policy = RetryPolicy::with_max_attempts(2);
        let observe = retry_if(
            &policy,
            "observe workload",
            Error::is_retryable,
            move || self.observe_inner(short_name, namespace),
        );
        tokio::time::timeout(self.probe_timeout, observe)
            .await
            .map_err(|_| {
                Error::internal_with_context(
                    "status",
                    format!("timed out observing {}/{}", namespace, short_name),
                )
            })?
    }

    async fn observe_inner(&self, short_name: &str, namespace: &str) -> Result<WorkloadStatus> {
        let mut primary = self
            .cluster
            .get(ResourceKind::Deployment, short_name, namespace)
            .await?;
        let mut deployment = primary.clone();

        if primary.is_none() {
            primary = self
                .cluster
                .get(ResourceKind::InferenceService, short_name, namespace)
                .await?;
            if primary.is_some() {
                deployment = self
                    .cluster
                    .get(
                        ResourceKind::Deployment,
                        &InferenceService::predictor_name(short_name),
                        namespace,
                    )
                    .await?;
            }
        }

        let mut observed = WorkloadStatus {
            uid: primary.as_ref().and_then(|o| o.metadata.uid.clone()),
            workload_found: primary.is_some(),
            ..Default::default()
        };

        if let Some(obj) = deployment {
            match to_typed::<Deployment>(obj) {
                Ok(d) => {
                    observed.replicas = d.spec.and_then(|s| s.replicas).unwrap_or_default();
                    if let Some(s) = d.status {
                        observed.ready_replicas = s.ready_replicas.unwrap_or_default();
                        observed.available_replicas = s.available_replicas.unwrap_or_default();
                    }
                }
                Err(e) => warn!(%short_name, %namespace, error = %e, "unreadable deployment status"),
            }
        }

        let pods = self.pods_for(short_name, namespace).await?;
        observed.status = derive_status(&pods);
        debug!(
            %short_name,
            %namespace,
            pods = pods.len(),
            status = %observed.status,
            "observed workload"
        );
        Ok(observed)
    }

    /// Pods labeled `app=<short_name>`, falling back to a name-prefix match
    /// for pods created by a controller that does not carry our labels.
    async fn pods_for(&self, short_name: &str, namespace: &str) -> Result<Vec<Pod>> {
        let selector = ListSelector::Labels(naming::app_selector(short_name));
        let mut objects = self
            .cluster
            .list(ResourceKind::Pod, namespace, &selector)
            .await?;

        if objects.is_empty() {
            objects = self
                .cluster
                .list(ResourceKind::Pod, namespace, &ListSelector::All)
                .await?
                .into_iter()
                .filter(|o| {
                    o.metadata
                        .name
                        .as_deref()
                        .is_some_and(|n| n.starts_with(short_name))
                })
                .collect();
        }

        Ok(objects.into_iter().filter_map(typed_pod).collect())
    }
}

fn typed_pod(obj: DynamicObject) -> Option<Pod> {
    let name = obj.metadata.name.clone().unwrap_or_default();
    to_typed::<Pod>(obj)
        .map_err(|e| warn!(pod = %name, error = %e, "skipping unreadable pod"))
        .ok()
}
