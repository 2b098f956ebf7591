//! Process-wide serving configuration
//!
//! Built once at startup (defaults, then an optional YAML file, then CLI
//! overrides) and handed to every component that needs it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration for the serving control plane
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ServingConfig {
    /// Platform name, used as the namespace prefix (`<platform>-<environment>`)
    pub platform: String,
    /// Cluster connection settings
    pub kube: KubeSettings,
    /// InferenceService backend
    pub inference_service: InferenceServiceSettings,
    /// Runtime images
    pub images: ImageTable,
    /// Default resource shapes
    pub resources: ResourceDefaults,
    /// Object storage credential references
    pub storage: StorageCredentials,
    /// Ingress settings
    pub ingress: IngressSettings,
    /// Reconcile timings
    pub timeouts: ReconcileTimeouts,
}

impl Default for ServingConfig {
    fn default() -> Self {
        Self {
            platform: "llmops".to_string(),
            kube: KubeSettings::default(),
            inference_service: InferenceServiceSettings::default(),
            images: ImageTable::default(),
            resources: ResourceDefaults::default(),
            storage: StorageCredentials::default(),
            ingress: IngressSettings::default(),
            timeouts: ReconcileTimeouts::default(),
        }
    }
}

impl ServingConfig {
    /// Load from a YAML file; missing keys take their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        Self::from_yaml(&raw)
    }

    /// Parse from YAML text and validate
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| Error::config(format!("invalid serving config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.platform.trim().is_empty() {
            return Err(Error::config("platform must not be empty"));
        }
        if self.timeouts.poll_interval_secs == 0 {
            return Err(Error::config("timeouts.pollIntervalSecs must be at least 1"));
        }
        if self.timeouts.extended_deletion_wait_secs < self.timeouts.deletion_wait_secs {
            return Err(Error::config(
                "timeouts.extendedDeletionWaitSecs must not be shorter than deletionWaitSecs",
            ));
        }
        if self.images.default.trim().is_empty() {
            return Err(Error::config("images.default must not be empty"));
        }
        Ok(())
    }

    /// Render as YAML
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::serialization(e.to_string()))
    }
}

/// Cluster connection settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct KubeSettings {
    /// Explicit kubeconfig; in-cluster or `KUBECONFIG` when unset
    pub kubeconfig: Option<PathBuf>,
    /// TCP connect timeout
    pub connect_timeout_secs: u64,
    /// Per-request read timeout
    pub read_timeout_secs: u64,
}

impl Default for KubeSettings {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            connect_timeout_secs: 5,
            read_timeout_secs: 30,
        }
    }
}

impl KubeSettings {
    /// Connect timeout as a Duration
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Read timeout as a Duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

/// InferenceService backend settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct InferenceServiceSettings {
    /// Try the InferenceService path before raw Deployments
    pub enabled: bool,
    /// Value of the `serving.kserve.io/deploymentMode` annotation
    pub deployment_mode: String,
}

impl Default for InferenceServiceSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            deployment_mode: "RawDeployment".to_string(),
        }
    }
}

/// Runtime container images
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ImageTable {
    /// vLLM with CUDA
    pub vllm_gpu: String,
    /// vLLM CPU build
    pub vllm_cpu: String,
    /// Text Generation Inference with CUDA
    pub tgi_gpu: String,
    /// Text Generation Inference CPU build
    pub tgi_cpu: String,
    /// Retrieval-augmented serving image
    pub rag: String,
    /// Used when nothing else selects an image
    pub default: String,
    /// Init container that copies model artifacts into the pod
    pub model_sync: String,
}

impl Default for ImageTable {
    fn default() -> Self {
        Self {
            vllm_gpu: "vllm/vllm-openai:v0.6.3".to_string(),
            vllm_cpu: "public.ecr.aws/q9t5s3a7/vllm-cpu-release-repo:v0.6.3".to_string(),
            tgi_gpu: "ghcr.io/huggingface/text-generation-inference:2.4.0".to_string(),
            tgi_cpu: "ghcr.io/huggingface/text-generation-inference:2.4.0-intel-cpu".to_string(),
            rag: "ghcr.io/llmops/rag-server:0.3.0".to_string(),
            default: "vllm/vllm-openai:v0.6.3".to_string(),
            model_sync: "amazon/aws-cli:2.17.0".to_string(),
        }
    }
}

/// CPU/memory/GPU shape for one class of runtime
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceProfile {
    /// CPU request
    pub cpu_request: String,
    /// Memory request
    pub memory_request: String,
    /// CPU limit
    pub cpu_limit: String,
    /// Memory limit
    pub memory_limit: String,
    /// `nvidia.com/gpu` count; zero for CPU profiles
    pub gpu_count: u32,
}

impl Default for ResourceProfile {
    fn default() -> Self {
        ResourceDefaults::cpu_profile()
    }
}

/// Default resource tables
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ResourceDefaults {
    /// GPU runtimes
    pub gpu: ResourceProfile,
    /// CPU-only runtimes
    pub cpu: ResourceProfile,
    /// Minimum memory limit for TGI on CPU
    pub tgi_cpu_memory_floor: String,
}

impl ResourceDefaults {
    fn cpu_profile() -> ResourceProfile {
        ResourceProfile {
            cpu_request: "1".to_string(),
            memory_request: "2Gi".to_string(),
            cpu_limit: "2".to_string(),
            memory_limit: "4Gi".to_string(),
            gpu_count: 0,
        }
    }

    fn gpu_profile() -> ResourceProfile {
        ResourceProfile {
            cpu_request: "2".to_string(),
            memory_request: "8Gi".to_string(),
            cpu_limit: "4".to_string(),
            memory_limit: "16Gi".to_string(),
            gpu_count: 1,
        }
    }
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            gpu: Self::gpu_profile(),
            cpu: Self::cpu_profile(),
            tgi_cpu_memory_floor: "4Gi".to_string(),
        }
    }
}

/// Secret and ConfigMap the runtime reads object-storage access from
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageCredentials {
    /// Secret holding the access key pair
    pub secret_name: String,
    /// Secret key for the access key id
    pub access_key_key: String,
    /// Secret key for the secret access key
    pub secret_key_key: String,
    /// ConfigMap holding the endpoint URL
    pub config_map_name: String,
    /// ConfigMap key for the endpoint URL
    pub endpoint_key: String,
}

impl Default for StorageCredentials {
    fn default() -> Self {
        Self {
            secret_name: "minio-secret".to_string(),
            access_key_key: "MINIO_ROOT_USER".to_string(),
            secret_key_key: "MINIO_ROOT_PASSWORD".to_string(),
            config_map_name: "minio-config".to_string(),
            endpoint_key: "endpoint-url".to_string(),
        }
    }
}

/// Ingress settings
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct IngressSettings {
    /// `ingressClassName`
    pub class_name: Option<String>,
    /// Host rule; any host when unset
    pub host: Option<String>,
}

impl Default for IngressSettings {
    fn default() -> Self {
        Self {
            class_name: Some("nginx".to_string()),
            host: None,
        }
    }
}

/// Timings for deletion waits and status probes
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconcileTimeouts {
    /// Budget for a resource to disappear after delete
    pub deletion_wait_secs: u64,
    /// Budget when the resource was already terminating before we looked
    pub extended_deletion_wait_secs: u64,
    /// Interval between existence checks
    pub poll_interval_secs: u64,
    /// Time spent terminating before finalizers are cleared
    pub finalizer_grace_secs: u64,
    /// Bound on read/list probes
    pub probe_timeout_secs: u64,
}

impl Default for ReconcileTimeouts {
    fn default() -> Self {
        Self {
            deletion_wait_secs: 120,
            extended_deletion_wait_secs: 180,
            poll_interval_secs: 2,
            finalizer_grace_secs: 60,
            probe_timeout_secs: 10,
        }
    }
}

impl ReconcileTimeouts {
    /// Deletion budget as a Duration
    pub fn deletion_wait(&self) -> Duration {
        Duration::from_secs(self.deletion_wait_secs)
    }

    /// Extended deletion budget as a Duration
    pub fn extended_deletion_wait(&self) -> Duration {
        Duration::from_secs(self.extended_deletion_wait_secs)
    }

    /// Poll interval as a Duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Finalizer grace as a Duration
    pub fn finalizer_grace(&self) -> Duration {
        Duration::from_secs(self.finalizer_grace_secs)
    }

    /// Probe timeout as a Duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}
