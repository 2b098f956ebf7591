//! Shared Kubernetes utilities using kube-rs
//!
//! Client construction with sanity checks on the resolved API host, bounded
//! polling, and helpers for working with `ApiResource` and `DynamicObject`.

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use kube::api::DynamicObject;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

use crate::Error;

// =============================================================================
// HasApiResource Trait
// =============================================================================

/// Trait for types that have a known API group, version, and kind.
///
/// Implement this for custom resources we only talk to dynamically so the
/// `ApiResource` is derived from the same constants the type serializes with.
///
/// ```ignore
/// impl HasApiResource for InferenceService {
///     const API_VERSION: &'static str = "serving.kserve.io/v1beta1";
///     const KIND: &'static str = "InferenceService";
/// }
///
/// let ar = InferenceService::api_resource();
/// ```
pub trait HasApiResource {
    /// Full API version (e.g., "serving.kserve.io/v1beta1", "v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "InferenceService")
    const KIND: &'static str;

    /// Build an ApiResource from the type's constants.
    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an `ApiResource` from an apiVersion string and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        api_version: api_version.to_string(),
        kind: kind.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split an apiVersion into (group, version); core resources have an empty group
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lowercase plural resource name for a kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Convert a dynamic object into a typed k8s-openapi resource
pub fn to_typed<K: DeserializeOwned>(obj: DynamicObject) -> Result<K, Error> {
    let kind = obj
        .types
        .as_ref()
        .map(|t| t.kind.clone())
        .unwrap_or_default();
    let value = serde_json::to_value(obj)?;
    serde_json::from_value(value).map_err(|e| Error::serialization_for_kind(kind, e.to_string()))
}

/// True when the object has a deletion timestamp, i.e. it is terminating
pub fn is_terminating(obj: &DynamicObject) -> bool {
    obj.metadata.deletion_timestamp.is_some()
}

// =============================================================================
// Polling
// =============================================================================

/// Poll until a condition is met or timeout is reached
///
/// `check_fn` returns `Ok(true)` when the condition holds and `Ok(false)` to
/// keep polling. Errors from the check are logged and treated as "not yet".
/// The only error this returns is the timeout, carrying `timeout_msg`.
pub async fn poll_until<F, Fut>(
    timeout: Duration,
    poll_interval: Duration,
    timeout_msg: impl Into<String>,
    mut check_fn: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, Error>>,
{
    let start = tokio::time::Instant::now();
    let timeout_msg = timeout_msg.into();

    loop {
        match check_fn().await {
            Ok(true) => return Ok(()),
            Ok(false) => trace!("polling condition not yet met"),
            Err(e) => trace!(error = %e, "polling check returned error, retrying"),
        }

        if start.elapsed() >= timeout {
            return Err(Error::internal_with_context("poll_until", timeout_msg));
        }

        tokio::time::sleep(poll_interval).await;
    }
}

// =============================================================================
// Client Construction
// =============================================================================

/// Reject API hosts that mean configuration loading silently fell through.
///
/// An empty host or `localhost` outside a dev kubeconfig almost always means
/// neither the kubeconfig nor the in-cluster service account was found.
pub fn validate_api_host(host: Option<&str>) -> Result<(), Error> {
    match host.map(str::trim) {
        None | Some("") => Err(Error::config(
            "resolved kubernetes API host is empty; kubeconfig or in-cluster config was not loaded",
        )),
        Some(h) if h.eq_ignore_ascii_case("localhost") => Err(Error::config(
            "resolved kubernetes API host is localhost; refusing to use a fallback configuration",
        )),
        Some(_) => Ok(()),
    }
}

/// Resolve a kube `Config` from an explicit kubeconfig path or the environment
pub async fn load_config(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Config, Error> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
        None => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kube config: {}", e)))?,
    };

    validate_api_host(config.cluster_url.host())?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    debug!(cluster_url = %config.cluster_url, "resolved kubernetes API endpoint");
    Ok(config)
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let config = load_config(kubeconfig, connect_timeout, read_timeout).await?;
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_parse_api_version() {
        assert_eq!(
            parse_api_version("serving.kserve.io/v1beta1"),
            ("serving.kserve.io".to_string(), "v1beta1".to_string())
        );
        assert_eq!(parse_api_version("v1"), (String::new(), "v1".to_string()));
    }

    #[test]
    fn test_pluralize_kind() {
        assert_eq!(pluralize_kind("InferenceService"), "inferenceservices");
        assert_eq!(pluralize_kind("Ingress"), "ingresses");
        assert_eq!(pluralize_kind("Deployment"), "deployments");
        assert_eq!(
            pluralize_kind("HorizontalPodAutoscaler"),
            "horizontalpodautoscalers"
        );
    }

    #[test]
    fn test_build_api_resource() {
        let ar = build_api_resource("serving.kserve.io/v1beta1", "InferenceService");
        assert_eq!(ar.group, "serving.kserve.io");
        assert_eq!(ar.version, "v1beta1");
        assert_eq!(ar.plural, "inferenceservices");
    }

    #[test]
    fn story_fallback_configs_are_rejected() {
        assert!(validate_api_host(None).is_err());
        assert!(validate_api_host(Some("")).is_err());
        assert!(validate_api_host(Some("localhost")).is_err());
        assert!(validate_api_host(Some("LOCALHOST")).is_err());
        assert!(validate_api_host(Some("10.96.0.1")).is_ok());
        assert!(validate_api_host(Some("api.prod.example.com")).is_ok());
    }

    #[test]
    fn test_to_typed_deployment() {
        let obj: DynamicObject = serde_json::from_value(serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "ep-abc", "namespace": "llmops-dev", "uid": "u-1"},
            "spec": {
                "replicas": 2,
                "selector": {"matchLabels": {"app": "ep-abc"}},
                "template": {"spec": {"containers": []}}
            }
        }))
        .unwrap();
        assert!(!is_terminating(&obj));

        let deployment: k8s_openapi::api::apps::v1::Deployment = to_typed(obj).unwrap();
        assert_eq!(deployment.metadata.uid.as_deref(), Some("u-1"));
        assert_eq!(deployment.spec.and_then(|s| s.replicas), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn story_poll_until_succeeds_once_condition_holds() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let result = poll_until(
            Duration::from_secs(10),
            Duration::from_secs(1),
            "never ready",
            move || {
                let c = c.clone();
                async move { Ok(c.fetch_add(1, Ordering::SeqCst) >= 2) }
            },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn story_poll_until_times_out() {
        let result = poll_until(
            Duration::from_secs(5),
            Duration::from_secs(1),
            "resource still present",
            || async { Ok(false) },
        )
        .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("resource still present"));
    }
}
