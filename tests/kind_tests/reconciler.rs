//! Stories about deleting and recreating resources against real garbage collection

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use llmops_common::config::ReconcileTimeouts;
use llmops_serving::reconciler::Reconciler;
use llmops_serving::{ClusterApi, KubeClusterClient, ResourceKind};

use super::helpers::{ensure_namespace, test_config, TEST_NAMESPACE};

fn service_body(name: &str, finalizers: &[&str]) -> serde_json::Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": name,
            "labels": {"app": name},
            "finalizers": finalizers,
        },
        "spec": {
            "selector": {"app": name},
            "ports": [{"port": 80, "targetPort": 8000}],
        },
    })
}

async fn reconciler(timeouts: ReconcileTimeouts) -> (Arc<KubeClusterClient>, Reconciler) {
    ensure_namespace().await;
    let cluster = Arc::new(KubeClusterClient::connect(&test_config()).await.unwrap());
    let reconciler = Reconciler::new(cluster.clone(), timeouts);
    (cluster, reconciler)
}

// =============================================================================
// Stories
// =============================================================================

/// A finalizer nobody will ever remove must not wedge a redeploy
#[tokio::test]
#[ignore]
async fn story_stuck_finalizer_is_cleared_after_grace() {
    let timeouts = ReconcileTimeouts {
        deletion_wait_secs: 30,
        poll_interval_secs: 1,
        finalizer_grace_secs: 3,
        ..ReconcileTimeouts::default()
    };
    let (cluster, reconciler) = reconciler(timeouts).await;
    let name = "kind-stuck-svc";

    cluster
        .create(
            ResourceKind::Service,
            TEST_NAMESPACE,
            service_body(name, &["llmops.dev/test-hold"]),
        )
        .await
        .unwrap();

    reconciler
        .ensure_deleted(
            ResourceKind::Service,
            name,
            TEST_NAMESPACE,
            Duration::from_secs(30),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert!(cluster
        .get(ResourceKind::Service, name, TEST_NAMESPACE)
        .await
        .unwrap()
        .is_none());
}

/// Creating over an existing object replaces it instead of failing
#[tokio::test]
#[ignore]
async fn story_conflict_is_resolved_by_replacing() {
    let (cluster, reconciler) = reconciler(ReconcileTimeouts::default()).await;
    let name = "kind-conflict-svc";

    cluster
        .create(ResourceKind::Service, TEST_NAMESPACE, service_body(name, &[]))
        .await
        .unwrap();
    let first_uid = cluster
        .get(ResourceKind::Service, name, TEST_NAMESPACE)
        .await
        .unwrap()
        .and_then(|o| o.metadata.uid)
        .unwrap();

    let created = reconciler
        .handle_conflict(ResourceKind::Service, name, TEST_NAMESPACE, || {
            cluster.create(ResourceKind::Service, TEST_NAMESPACE, service_body(name, &[]))
        })
        .await
        .unwrap();

    assert_ne!(created.metadata.uid, Some(first_uid));
    let report = reconciler.cleanup_satellites(name, TEST_NAMESPACE).await;
    assert_eq!(report.errors, 0);
}
