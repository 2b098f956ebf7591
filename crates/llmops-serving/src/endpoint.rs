//! Serving endpoint record and the declarative types embedded in it

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use llmops_common::Error;

/// Deployment environment; part of the route uniqueness key and the namespace
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Development
    Dev,
    /// Staging
    Stg,
    /// Production
    Prod,
}

impl Environment {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Stg => "stg",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "stg" => Ok(Environment::Stg),
            "prod" => Ok(Environment::Prod),
            other => Err(Error::validation_for_field(
                other,
                "environment",
                "environment must be one of dev, stg, prod",
            )),
        }
    }
}

/// Endpoint lifecycle status
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointStatus {
    /// Resources submitted, pods not ready yet
    #[default]
    Deploying,
    /// All pods ready
    Healthy,
    /// Some pods ready
    Degraded,
    /// A pod failed or the deploy failed
    Failed,
    /// Scaled to zero by rollback
    RolledBack,
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointStatus::Deploying => write!(f, "deploying"),
            EndpointStatus::Healthy => write!(f, "healthy"),
            EndpointStatus::Degraded => write!(f, "degraded"),
            EndpointStatus::Failed => write!(f, "failed"),
            EndpointStatus::RolledBack => write!(f, "rolled-back"),
        }
    }
}

/// Declared inference mode
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServeTarget {
    /// Plain text generation
    #[default]
    Generation,
    /// Retrieval-augmented generation
    Rag,
}

/// Serving engine a runtime image belongs to
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEngine {
    /// vLLM OpenAI-compatible server
    Vllm,
    /// Hugging Face Text Generation Inference
    Tgi,
}

/// Autoscaling policy, compiled into an `autoscaling/v2` HPA
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AutoscalePolicy {
    /// Target average CPU utilization percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_cpu_utilization: Option<i32>,
    /// Target average memory utilization percentage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_memory_utilization: Option<i32>,
    /// Scale-down stabilization window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_stabilization_secs: Option<i32>,
}

impl AutoscalePolicy {
    /// CPU target applied when a policy names no metric at all
    pub const DEFAULT_CPU_TARGET: i32 = 80;

    /// Check percentages are in range
    pub fn validate(&self, endpoint: &str) -> Result<(), Error> {
        for (field, value) in [
            ("autoscale_policy.target_cpu_utilization", self.target_cpu_utilization),
            ("autoscale_policy.target_memory_utilization", self.target_memory_utilization),
        ] {
            if let Some(v) = value {
                if !(1..=100).contains(&v) {
                    return Err(Error::validation_for_field(
                        endpoint,
                        field,
                        format!("utilization target {} must be between 1 and 100", v),
                    ));
                }
            }
        }
        if matches!(self.scale_down_stabilization_secs, Some(s) if s < 0) {
            return Err(Error::validation_for_field(
                endpoint,
                "autoscale_policy.scale_down_stabilization_secs",
                "stabilization window must not be negative",
            ));
        }
        Ok(())
    }
}

/// Per-field overrides of the default resource table
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceOverrides {
    /// CPU request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_request: Option<String>,
    /// CPU limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit: Option<String>,
    /// Memory request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_request: Option<String>,
    /// Memory limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_limit: Option<String>,
}

/// Accelerator shape requested by a deployment spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceShape {
    /// GPUs per replica
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_count: Option<u32>,
    /// Memory per GPU (e.g. "24Gi"), informational
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory: Option<String>,
}

/// Runtime selection and serving limits
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    /// Pinned image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    /// Engine to pick from the image table
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<RuntimeEngine>,
    /// Concurrent request cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<u32>,
    /// Input token cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_input_tokens: Option<u32>,
    /// Output token cap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
}

/// Declarative contract the spec builder consumes
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSpec {
    /// Catalog model reference
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_ref: Option<String>,
    /// Model family (e.g. "llama")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_family: Option<String>,
    /// Job type the model came from (e.g. "sft")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_type: Option<String>,
    /// Inference mode
    #[serde(default)]
    pub serve_target: ServeTarget,
    /// Accelerator shape
    #[serde(default)]
    pub resources: ResourceShape,
    /// Runtime selection and limits
    #[serde(default)]
    pub runtime: RuntimeSpec,
    /// GPU flag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_gpu: Option<bool>,
}

/// Persisted serving endpoint
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ServingEndpoint {
    /// Endpoint id
    pub id: Uuid,
    /// Catalog model id
    pub model_id: String,
    /// Environment
    pub environment: Environment,
    /// Normalized route, unique per environment
    pub route: String,
    /// Lifecycle status
    pub status: EndpointStatus,
    /// Minimum replicas
    pub min_replicas: i32,
    /// Maximum replicas
    pub max_replicas: i32,
    /// Autoscale policy; no HPA when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autoscale_policy: Option<AutoscalePolicy>,
    /// Prompt policy link
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_policy_id: Option<String>,
    /// Runtime image override
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_image: Option<String>,
    /// GPU flag
    #[serde(default)]
    pub use_gpu: bool,
    /// Resource overrides
    #[serde(default)]
    pub resources: ResourceOverrides,
    /// Structured deployment spec
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_spec: Option<DeploymentSpec>,
    /// Provider resource id of the last successful deploy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_plan: Option<String>,
    /// Last status observation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Optimistic-lock counter, bumped on every write
    #[serde(default)]
    pub revision: u64,
}

impl ServingEndpoint {
    /// Fields redeploy may change, captured so a failed redeploy can put them back
    pub fn snapshot(&self) -> ConfigSnapshot {
        ConfigSnapshot {
            runtime_image: self.runtime_image.clone(),
            use_gpu: self.use_gpu,
            resources: self.resources.clone(),
            autoscale_policy: self.autoscale_policy.clone(),
            deployment_spec: self.deployment_spec.clone(),
            min_replicas: self.min_replicas,
            max_replicas: self.max_replicas,
            rollback_plan: self.rollback_plan.clone(),
        }
    }

    /// Put snapshotted fields back
    pub fn restore(&mut self, snapshot: ConfigSnapshot) {
        self.runtime_image = snapshot.runtime_image;
        self.use_gpu = snapshot.use_gpu;
        self.resources = snapshot.resources;
        self.autoscale_policy = snapshot.autoscale_policy;
        self.deployment_spec = snapshot.deployment_spec;
        self.min_replicas = snapshot.min_replicas;
        self.max_replicas = snapshot.max_replicas;
        self.rollback_plan = snapshot.rollback_plan;
    }

    /// Human-readable key used in logs and validation errors
    pub fn route_key(&self) -> String {
        format!("{}:{}", self.environment, self.route)
    }
}

/// Mutable configuration of an endpoint at one point in time
#[derive(Clone, Debug, PartialEq)]
pub struct ConfigSnapshot {
    runtime_image: Option<String>,
    use_gpu: bool,
    resources: ResourceOverrides,
    autoscale_policy: Option<AutoscalePolicy>,
    deployment_spec: Option<DeploymentSpec>,
    min_replicas: i32,
    max_replicas: i32,
    rollback_plan: Option<String>,
}

/// Normalize a route to an absolute path without a trailing slash (except root)
pub fn normalize_route(route: &str) -> String {
    let trimmed = route.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Check min/max replica bounds
pub fn validate_replicas(endpoint: &str, min: i32, max: i32) -> Result<(), Error> {
    if min < 0 {
        return Err(Error::validation_for_field(
            endpoint,
            "min_replicas",
            "min_replicas must not be negative",
        ));
    }
    if max < 1 || max < min {
        return Err(Error::validation_for_field(
            endpoint,
            "max_replicas",
            format!("max_replicas {} must be at least 1 and >= min_replicas {}", max, min),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_route() {
        assert_eq!(normalize_route("/serve/m1"), "/serve/m1");
        assert_eq!(normalize_route("serve/m1/"), "/serve/m1");
        assert_eq!(normalize_route("/serve/m1///"), "/serve/m1");
        assert_eq!(normalize_route("/"), "/");
        assert_eq!(normalize_route(""), "/");
        assert_eq!(normalize_route("  /chat "), "/chat");
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("dev".parse::<Environment>().unwrap(), Environment::Dev);
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("qa".parse::<Environment>().is_err());
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_value(EndpointStatus::RolledBack).unwrap(),
            "rolled-back"
        );
        assert_eq!(EndpointStatus::RolledBack.to_string(), "rolled-back");
        assert_eq!(serde_json::to_value(ServeTarget::Rag).unwrap(), "RAG");
        assert_eq!(
            serde_json::to_value(ServeTarget::Generation).unwrap(),
            "GENERATION"
        );
    }

    #[test]
    fn test_autoscale_policy_validation() {
        let ok = AutoscalePolicy {
            target_cpu_utilization: Some(70),
            ..Default::default()
        };
        assert!(ok.validate("ep").is_ok());

        let bad = AutoscalePolicy {
            target_memory_utilization: Some(150),
            ..Default::default()
        };
        assert!(bad.validate("ep").is_err());
    }

    #[test]
    fn test_replica_bounds() {
        assert!(validate_replicas("ep", 1, 3).is_ok());
        assert!(validate_replicas("ep", 0, 1).is_ok());
        assert!(validate_replicas("ep", 3, 1).is_err());
        assert!(validate_replicas("ep", -1, 1).is_err());
        assert!(validate_replicas("ep", 0, 0).is_err());
    }
}
