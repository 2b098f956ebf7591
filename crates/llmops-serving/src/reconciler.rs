//! Deletion and conflict reconciler
//!
//! Kubernetes deletes asynchronously and finalizers can hold an object in
//! `Terminating` indefinitely, so a naive delete-then-create races and
//! produces 409s. Every create in the deployer funnels conflicts through
//! [`Reconciler::handle_conflict`], and every teardown waits for real absence
//! through [`Reconciler::ensure_deleted`].
//!
//! Per resource: `absent -> exists -> terminating -> absent`.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use llmops_common::config::ReconcileTimeouts;
use llmops_common::crd::PREDICTOR_SUFFIX;
use llmops_common::kube_utils::{is_terminating, poll_until};
use llmops_common::{Error, Result};

use crate::cluster::{ClusterApi, ListSelector, ResourceKind};
use crate::naming;

/// Observed state of one named resource
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Existence {
    /// The object is present
    pub exists: bool,
    /// The object has a deletion timestamp
    pub terminating: bool,
}

/// Result of a best-effort satellite sweep
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Objects a delete was issued for, as `Kind/name`
    pub deleted: BTreeSet<String>,
    /// Calls that failed with something other than 404
    pub errors: usize,
}

/// Satellite kinds swept on teardown
const SATELLITE_KINDS: [ResourceKind; 3] = [
    ResourceKind::HorizontalPodAutoscaler,
    ResourceKind::Ingress,
    ResourceKind::Service,
];

/// Makes delete-then-create sequences safe against asynchronous garbage collection
#[derive(Clone)]
pub struct Reconciler {
    cluster: Arc<dyn ClusterApi>,
    timeouts: ReconcileTimeouts,
}

impl Reconciler {
    /// Reconciler over a cluster client
    pub fn new(cluster: Arc<dyn ClusterApi>, timeouts: ReconcileTimeouts) -> Self {
        Self { cluster, timeouts }
    }

    /// Configured timings
    pub fn timeouts(&self) -> &ReconcileTimeouts {
        &self.timeouts
    }

    /// Check whether a resource exists and whether it is terminating
    pub async fn exists(&self, kind: ResourceKind, name: &str, namespace: &str) -> Result<Existence> {
        Ok(match self.cluster.get(kind, name, namespace).await? {
            Some(obj) => Existence {
                exists: true,
                terminating: is_terminating(&obj),
            },
            None => Existence::default(),
        })
    }

    /// Make sure a resource is gone, waiting up to `max_wait`.
    ///
    /// Deletes it if present and not already terminating. Once it has been
    /// terminating for the finalizer grace period, its finalizers are cleared
    /// and its pods force-deleted. Fails with [`Error::DeletionTimeout`] when
    /// the resource outlives the budget.
    pub async fn ensure_deleted(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> Result<()> {
        let state = self.exists(kind, name, namespace).await?;
        if !state.exists {
            return Ok(());
        }

        if state.terminating {
            info!(%kind, %name, %namespace, "resource already terminating, waiting for removal");
        } else {
            info!(%kind, %name, %namespace, "deleting resource");
            match self.cluster.delete(kind, name, namespace, None).await {
                Ok(true) => {}
                Ok(false) => return Ok(()),
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            }
        }

        let start = tokio::time::Instant::now();
        let grace = self.timeouts.finalizer_grace();
        let finalizers_cleared = AtomicBool::new(false);
        let finalizers_cleared = &finalizers_cleared;

        poll_until(
            max_wait,
            poll_interval,
            format!("{} {}/{} still present", kind, namespace, name),
            move || async move {
                let state = self.exists(kind, name, namespace).await?;
                if !state.exists {
                    return Ok(true);
                }
                if start.elapsed() >= grace && !finalizers_cleared.swap(true, Ordering::SeqCst) {
                    warn!(
                        %kind, %name, %namespace,
                        waited_secs = start.elapsed().as_secs(),
                        "resource stuck terminating, clearing finalizers"
                    );
                    self.clear_finalizers(kind, name, namespace).await;
                    if kind.is_primary() {
                        self.force_delete_pods(name, namespace).await;
                    }
                }
                Ok(false)
            },
        )
        .await
        .map_err(|_| Error::DeletionTimeout {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            waited: max_wait,
        })?;

        debug!(%kind, %name, %namespace, "resource is gone");
        Ok(())
    }

    /// Run `create_fn`; on a 409, delete the existing resource, wait for it to
    /// disappear and retry exactly once.
    ///
    /// A second 409 is [`Error::ResourceStillExists`].
    pub async fn handle_conflict<T, F, Fut>(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        mut create_fn: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match create_fn().await {
            Err(e) if e.is_conflict() => {
                info!(%kind, %name, %namespace, "create conflicted, replacing existing resource");
                self.ensure_deleted(
                    kind,
                    name,
                    namespace,
                    self.timeouts.deletion_wait(),
                    self.timeouts.poll_interval(),
                )
                .await?;
                match create_fn().await {
                    Err(e) if e.is_conflict() => Err(Error::ResourceStillExists {
                        kind: kind.to_string(),
                        name: name.to_string(),
                        namespace: namespace.to_string(),
                    }),
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Clear `metadata.finalizers`; failures are logged
    pub async fn clear_finalizers(&self, kind: ResourceKind, name: &str, namespace: &str) {
        let patch = serde_json::json!({ "metadata": { "finalizers": null } });
        match self.cluster.patch(kind, name, namespace, patch).await {
            Ok(()) => info!(%kind, %name, %namespace, "cleared finalizers"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(%kind, %name, %namespace, error = %e, "failed to clear finalizers"),
        }
    }

    /// Delete with zero grace every pod belonging to `short_name`
    pub async fn force_delete_pods(&self, short_name: &str, namespace: &str) {
        let mut pods = BTreeSet::new();
        let selector = ListSelector::Labels(naming::app_selector(short_name));
        match self.cluster.list(ResourceKind::Pod, namespace, &selector).await {
            Ok(items) => pods.extend(items.into_iter().filter_map(|p| p.metadata.name)),
            Err(e) => warn!(%short_name, %namespace, error = %e, "failed to list pods by label"),
        }
        match self.cluster.list(ResourceKind::Pod, namespace, &ListSelector::All).await {
            Ok(items) => pods.extend(
                items
                    .into_iter()
                    .filter_map(|p| p.metadata.name)
                    .filter(|n| n.starts_with(short_name)),
            ),
            Err(e) => warn!(%short_name, %namespace, error = %e, "failed to list pods"),
        }

        for pod in pods {
            self.clear_finalizers(ResourceKind::Pod, &pod, namespace).await;
            match self
                .cluster
                .delete(ResourceKind::Pod, &pod, namespace, Some(0))
                .await
            {
                Ok(_) => debug!(%pod, %namespace, "force-deleted pod"),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(%pod, %namespace, error = %e, "failed to force-delete pod"),
            }
        }
    }

    /// Best-effort removal of an endpoint's HPA, Ingress, Service and pods.
    ///
    /// Tries well-known names first, then the `app` label, then any object
    /// whose name contains the short name. The last pass exists for objects
    /// created by other controllers (KServe) whose labels we do not control;
    /// finding nothing there is normal. 404s are never errors.
    pub async fn cleanup_satellites(&self, short_name: &str, namespace: &str) -> CleanupReport {
        let mut report = CleanupReport::default();
        let predictor = format!("{}{}", short_name, PREDICTOR_SUFFIX);

        // by name
        for kind in SATELLITE_KINDS {
            let names = match kind {
                ResourceKind::Ingress => vec![naming::ingress_name(short_name)],
                _ => vec![short_name.to_string(), predictor.clone()],
            };
            for name in names {
                self.delete_satellite(kind, &name, namespace, &mut report)
                    .await;
            }
        }

        // by label
        let selector = ListSelector::Labels(naming::app_selector(short_name));
        for kind in SATELLITE_KINDS.into_iter().chain([ResourceKind::Pod]) {
            match self.cluster.list(kind, namespace, &selector).await {
                Ok(items) => {
                    for name in items.into_iter().filter_map(|o| o.metadata.name) {
                        self.delete_satellite(kind, &name, namespace, &mut report)
                            .await;
                    }
                }
                Err(e) => {
                    warn!(%kind, %short_name, %namespace, error = %e, "label sweep failed");
                    report.errors += 1;
                }
            }
        }

        // by name substring
        for kind in SATELLITE_KINDS.into_iter().chain([ResourceKind::Pod]) {
            match self.cluster.list(kind, namespace, &ListSelector::All).await {
                Ok(items) => {
                    let matches: Vec<String> = items
                        .into_iter()
                        .filter_map(|o| o.metadata.name)
                        .filter(|n| n.contains(short_name))
                        .collect();
                    for name in matches {
                        self.delete_satellite(kind, &name, namespace, &mut report)
                            .await;
                    }
                }
                Err(e) => {
                    debug!(%kind, %namespace, error = %e, "name sweep failed");
                    report.errors += 1;
                }
            }
        }

        info!(
            %short_name,
            %namespace,
            deleted = report.deleted.len(),
            errors = report.errors,
            "satellite cleanup finished"
        );
        report
    }

    async fn delete_satellite(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
        report: &mut CleanupReport,
    ) {
        let key = format!("{}/{}", kind, name);
        if report.deleted.contains(&key) {
            return;
        }
        match self.cluster.delete(kind, name, namespace, None).await {
            Ok(true) => {
                debug!(%kind, %name, %namespace, "deleted satellite");
                report.deleted.insert(key);
            }
            Ok(false) => {}
            Err(e) if e.is_not_found() => {}
            Err(e) => {
                warn!(%kind, %name, %namespace, error = %e, "failed to delete satellite");
                report.errors += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use kube::api::DynamicObject;
    use llmops_common::error::api_error;

    use crate::cluster::MockClusterApi;
    use crate::testing::FakeCluster;

    fn timeouts() -> ReconcileTimeouts {
        ReconcileTimeouts::default()
    }

    fn deployment(name: &str) -> serde_json::Value {
        serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": name, "namespace": "llmops-dev", "labels": {"app": name}},
            "spec": {}
        })
    }

    // =========================================================================
    // Story Tests: ensure_deleted
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn story_absent_resource_returns_immediately() {
        let fake = Arc::new(FakeCluster::new());
        let reconciler = Reconciler::new(fake.clone(), timeouts());

        reconciler
            .ensure_deleted(
                ResourceKind::Deployment,
                "ep-missing",
                "llmops-dev",
                Duration::from_secs(120),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(fake.deletes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn story_delete_waits_for_garbage_collection() {
        let fake = Arc::new(FakeCluster::new());
        fake.seed(ResourceKind::Deployment, "llmops-dev", deployment("ep-a"));
        fake.linger_after_delete(ResourceKind::Deployment, "ep-a", 3);
        let reconciler = Reconciler::new(fake.clone(), timeouts());

        reconciler
            .ensure_deleted(
                ResourceKind::Deployment,
                "ep-a",
                "llmops-dev",
                Duration::from_secs(120),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        assert!(!fake.contains(ResourceKind::Deployment, "llmops-dev", "ep-a"));
        assert_eq!(fake.deletes(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn story_terminating_resource_is_not_deleted_again() {
        let fake = Arc::new(FakeCluster::new());
        fake.seed(ResourceKind::Deployment, "llmops-dev", deployment("ep-a"));
        fake.linger_after_delete(ResourceKind::Deployment, "ep-a", 2);
        fake.mark_terminating(ResourceKind::Deployment, "llmops-dev", "ep-a");
        let reconciler = Reconciler::new(fake.clone(), timeouts());

        reconciler
            .ensure_deleted(
                ResourceKind::Deployment,
                "ep-a",
                "llmops-dev",
                Duration::from_secs(180),
                Duration::from_secs(2),
            )
            .await
            .unwrap();
        assert_eq!(fake.deletes(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn story_stuck_finalizer_is_cleared_after_grace() {
        let fake = Arc::new(FakeCluster::new());
        fake.seed(ResourceKind::Deployment, "llmops-dev", deployment("ep-a"));
        fake.stick_on_finalizers(ResourceKind::Deployment, "ep-a");
        let reconciler = Reconciler::new(fake.clone(), timeouts());

        let started = tokio::time::Instant::now();
        reconciler
            .ensure_deleted(
                ResourceKind::Deployment,
                "ep-a",
                "llmops-dev",
                Duration::from_secs(120),
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_secs(60));
        assert!(fake.finalizers_cleared(ResourceKind::Deployment, "ep-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn story_wedged_resource_times_out_with_its_name() {
        let fake = Arc::new(FakeCluster::new());
        fake.seed(ResourceKind::Deployment, "llmops-dev", deployment("ep-a"));
        fake.linger_after_delete(ResourceKind::Deployment, "ep-a", u32::MAX);
        let reconciler = Reconciler::new(fake.clone(), timeouts());

        let err = reconciler
            .ensure_deleted(
                ResourceKind::Deployment,
                "ep-a",
                "llmops-dev",
                Duration::from_secs(30),
                Duration::from_secs(2),
            )
            .await
            .unwrap_err();

        match err {
            Error::DeletionTimeout {
                kind,
                name,
                namespace,
                ..
            } => {
                assert_eq!(kind, "Deployment");
                assert_eq!(name, "ep-a");
                assert_eq!(namespace, "llmops-dev");
            }
            other => panic!("expected DeletionTimeout, got {other:?}"),
        }
    }

    // =========================================================================
    // Story Tests: handle_conflict
    // =========================================================================

    #[tokio::test(start_paused = true)]
    async fn story_conflict_replaces_existing_and_recreates_once() {
        let fake = Arc::new(FakeCluster::new());
        fake.seed(ResourceKind::Deployment, "llmops-dev", deployment("ep-a"));
        fake.linger_after_delete(ResourceKind::Deployment, "ep-a", 2);
        let reconciler = Reconciler::new(fake.clone(), timeouts());
        let attempts = AtomicU32::new(0);

        let created = reconciler
            .handle_conflict(ResourceKind::Deployment, "ep-a", "llmops-dev", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                fake.create(ResourceKind::Deployment, "llmops-dev", deployment("ep-a"))
            })
            .await
            .unwrap();

        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(created.metadata.name.as_deref(), Some("ep-a"));
        assert_eq!(fake.count(ResourceKind::Deployment, "llmops-dev"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn story_second_conflict_is_fatal() {
        let mut mock = MockClusterApi::new();
        mock.expect_create()
            .times(2)
            .returning(|_, _, _| Err(Error::from(api_error(409, "AlreadyExists", "exists"))));
        // the conflicting object is already gone by the time we look
        mock.expect_get().returning(|_, _, _| Ok(None));
        mock.expect_delete().never();

        let cluster: Arc<dyn ClusterApi> = Arc::new(mock);
        let reconciler = Reconciler::new(cluster.clone(), timeouts());

        let result: Result<DynamicObject> = reconciler
            .handle_conflict(ResourceKind::Deployment, "ep-a", "llmops-dev", || {
                cluster.create(ResourceKind::Deployment, "llmops-dev", deployment("ep-a"))
            })
            .await;

        assert!(matches!(result, Err(Error::ResourceStillExists { .. })));
    }

    #[tokio::test]
    async fn test_non_conflict_errors_are_returned_unchanged() {
        let reconciler = Reconciler::new(Arc::new(FakeCluster::new()), timeouts());
        let result: Result<()> = reconciler
            .handle_conflict(ResourceKind::Service, "ep-a", "llmops-dev", || async {
                Err(Error::from(api_error(422, "Invalid", "bad spec")))
            })
            .await;
        assert_eq!(result.unwrap_err().status_code(), Some(422));
    }

    // =========================================================================
    // Story Tests: satellite cleanup
    // =========================================================================

    #[tokio::test]
    async fn story_satellites_found_by_name_label_and_substring() {
        let fake = Arc::new(FakeCluster::new());
        let ns = "llmops-dev";
        fake.seed(
            ResourceKind::Service,
            ns,
            serde_json::json!({"metadata": {"name": "ep-a"}}),
        );
        fake.seed(
            ResourceKind::Ingress,
            ns,
            serde_json::json!({"metadata": {"name": "ep-a-ingress"}}),
        );
        fake.seed(
            ResourceKind::HorizontalPodAutoscaler,
            ns,
            serde_json::json!({"metadata": {"name": "custom-hpa", "labels": {"app": "ep-a"}}}),
        );
        // created by another controller, unlabeled
        fake.seed(
            ResourceKind::Pod,
            ns,
            serde_json::json!({"metadata": {"name": "ep-a-predictor-7d9f-x2x"}}),
        );
        fake.seed(
            ResourceKind::Service,
            ns,
            serde_json::json!({"metadata": {"name": "unrelated"}}),
        );

        let reconciler = Reconciler::new(fake.clone(), timeouts());
        let report = reconciler.cleanup_satellites("ep-a", ns).await;

        assert_eq!(report.errors, 0);
        assert!(report.deleted.contains("Service/ep-a"));
        assert!(report.deleted.contains("Ingress/ep-a-ingress"));
        assert!(report.deleted.contains("HorizontalPodAutoscaler/custom-hpa"));
        assert!(report.deleted.contains("Pod/ep-a-predictor-7d9f-x2x"));
        assert!(fake.contains(ResourceKind::Service, ns, "unrelated"));
    }

    #[tokio::test]
    async fn story_cleanup_is_idempotent() {
        let fake = Arc::new(FakeCluster::new());
        let reconciler = Reconciler::new(fake.clone(), timeouts());
        let first = reconciler.cleanup_satellites("ep-a", "llmops-dev").await;
        let second = reconciler.cleanup_satellites("ep-a", "llmops-dev").await;
        assert_eq!(first, CleanupReport::default());
        assert_eq!(second, CleanupReport::default());
    }

    #[tokio::test]
    async fn test_cleanup_counts_failures_without_aborting() {
        let mut mock = MockClusterApi::new();
        mock.expect_delete()
            .returning(|_, _, _, _| Err(Error::from(api_error(403, "Forbidden", "rbac"))));
        mock.expect_list().returning(|_, _, _| Ok(Vec::new()));
        let reconciler = Reconciler::new(Arc::new(mock), timeouts());

        let report = reconciler.cleanup_satellites("ep-a", "llmops-dev").await;
        // 2 HPA names + 1 Ingress + 2 Service names
        assert_eq!(report.errors, 5);
        assert!(report.deleted.is_empty());
    }
}
