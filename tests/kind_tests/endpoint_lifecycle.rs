//! Stories about an endpoint's life in a real cluster
//!
//! The runtime image is never expected to become ready here; these stories
//! check which objects the control plane creates and removes.

use llmops_serving::cluster::ListSelector;
use llmops_serving::endpoint::ResourceOverrides;
use llmops_serving::naming;
use llmops_serving::{
    ClusterApi, DeployEndpointRequest, EndpointStatus, Environment, RedeployRequest, ResourceKind,
};

use super::helpers::{test_service, TEST_MODEL, TEST_NAMESPACE};

fn request(route: &str) -> DeployEndpointRequest {
    DeployEndpointRequest {
        model_id: TEST_MODEL.to_string(),
        environment: Environment::Dev,
        route: route.to_string(),
        min_replicas: 1,
        max_replicas: 1,
        autoscale_policy: None,
        prompt_policy_id: None,
        runtime_image: None,
        use_gpu: Some(false),
        resources: ResourceOverrides::default(),
        deployment_spec: None,
    }
}

async fn deployment_uid(cluster: &dyn ClusterApi, short: &str) -> Option<String> {
    cluster
        .get(ResourceKind::Deployment, short, TEST_NAMESPACE)
        .await
        .unwrap()
        .and_then(|o| o.metadata.uid)
}

// =============================================================================
// Stories
// =============================================================================

/// Deploy, redeploy and delete leave exactly the expected objects in the cluster
#[tokio::test]
#[ignore]
async fn story_endpoint_lifecycle_against_real_cluster() {
    let (cluster, service) = test_service().await;

    let endpoint = service
        .deploy_endpoint(request("/kind/lifecycle"))
        .await
        .unwrap();
    let short = naming::short_name(&endpoint.id);
    assert_eq!(endpoint.status, EndpointStatus::Deploying);

    for (kind, name) in [
        (ResourceKind::Deployment, short.clone()),
        (ResourceKind::Service, short.clone()),
        (ResourceKind::Ingress, naming::ingress_name(&short)),
    ] {
        assert!(
            cluster.get(kind, &name, TEST_NAMESPACE).await.unwrap().is_some(),
            "{kind} {name} should exist after deploy"
        );
    }

    let first_uid = deployment_uid(&*cluster, &short).await;

    // Still deploying with a live workload: the redeploy is refused untouched
    let refused = service
        .redeploy_endpoint(endpoint.id, RedeployRequest::default())
        .await;
    assert!(refused.is_err());
    assert_eq!(deployment_uid(&*cluster, &short).await, first_uid);

    // Once settled, a redeploy replaces the workload with exactly one new one
    service.rollback_endpoint(endpoint.id).await.unwrap();
    let redeployed = service
        .redeploy_endpoint(
            endpoint.id,
            RedeployRequest {
                max_replicas: Some(2),
                ..RedeployRequest::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(redeployed.max_replicas, 2);
    let second_uid = deployment_uid(&*cluster, &short).await;
    assert!(second_uid.is_some());
    assert_ne!(second_uid, first_uid);
    let deployments = cluster
        .list(
            ResourceKind::Deployment,
            TEST_NAMESPACE,
            &ListSelector::Labels(naming::app_selector(&short)),
        )
        .await
        .unwrap();
    assert_eq!(deployments.len(), 1);

    service.delete_endpoint(endpoint.id).await.unwrap();
    for kind in [
        ResourceKind::Deployment,
        ResourceKind::Service,
        ResourceKind::Ingress,
        ResourceKind::HorizontalPodAutoscaler,
    ] {
        let left = cluster
            .list(
                kind,
                TEST_NAMESPACE,
                &ListSelector::Labels(naming::app_selector(&short)),
            )
            .await
            .unwrap();
        assert!(left.is_empty(), "{kind} left behind after delete");
    }
}

/// Rollback scales the workload to zero and sticks
#[tokio::test]
#[ignore]
async fn story_rollback_scales_to_zero() {
    let (cluster, service) = test_service().await;

    let endpoint = service
        .deploy_endpoint(request("/kind/rollback"))
        .await
        .unwrap();
    let short = naming::short_name(&endpoint.id);

    let rolled = service.rollback_endpoint(endpoint.id).await.unwrap();
    assert_eq!(rolled.status, EndpointStatus::RolledBack);

    let deployment = cluster
        .get(ResourceKind::Deployment, &short, TEST_NAMESPACE)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(deployment.data["spec"]["replicas"], serde_json::json!(0));

    let again = service.get_endpoint(endpoint.id).await.unwrap();
    assert_eq!(again.status, EndpointStatus::RolledBack);

    service.delete_endpoint(endpoint.id).await.unwrap();
}
