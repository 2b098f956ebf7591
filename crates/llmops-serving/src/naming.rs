//! Deterministic Kubernetes names for endpoints

use std::collections::BTreeMap;

use uuid::Uuid;

use llmops_common::{LABEL_APP, LABEL_ENDPOINT_ID, LABEL_MANAGED_BY, LABEL_MANAGED_BY_LLMOPS};

use crate::endpoint::Environment;

/// Prefix on every short name so it starts with a letter
pub const SHORT_NAME_PREFIX: &str = "ep-";

/// Hex characters of the UUID kept in the short name
pub const SHORT_NAME_HEX_LEN: usize = 12;

/// Short name for an endpoint: `ep-` plus the first 12 hex chars of its id.
///
/// 15 characters leaves room for KServe's `-predictor-default` suffix inside
/// the 63-character DNS label limit.
pub fn short_name(endpoint_id: &Uuid) -> String {
    let simple = endpoint_id.simple().to_string();
    format!("{}{}", SHORT_NAME_PREFIX, &simple[..SHORT_NAME_HEX_LEN])
}

/// Namespace an environment's endpoints live in
pub fn namespace_for(platform: &str, environment: Environment) -> String {
    format!("{}-{}", platform, environment)
}

/// Labels stamped on the primary workload and its pods
pub fn workload_labels(short_name: &str, endpoint_id: &Uuid) -> BTreeMap<String, String> {
    let mut labels = selector_labels(short_name);
    labels.insert(LABEL_ENDPOINT_ID.to_string(), endpoint_id.to_string());
    labels.insert(
        LABEL_MANAGED_BY.to_string(),
        LABEL_MANAGED_BY_LLMOPS.to_string(),
    );
    labels
}

/// Labels used as the pod selector
pub fn selector_labels(short_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_APP.to_string(), short_name.to_string())])
}

/// Label selector string matching an endpoint's pods
pub fn app_selector(short_name: &str) -> String {
    format!("{}={}", LABEL_APP, short_name)
}

/// Name of the Ingress for an endpoint
pub fn ingress_name(short_name: &str) -> String {
    format!("{}-ingress", short_name)
}
