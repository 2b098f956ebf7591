//! Container spec resolution for serving runtimes
//!
//! Pure functions from an endpoint's declared configuration to a
//! [`ContainerPlan`]: which image to run, the runtime's CLI arguments,
//! environment, resources, probes, and whether weights must be synced into
//! the pod before the runtime starts.

use k8s_openapi::api::core::v1::{ConfigMapKeySelector, EnvVar, EnvVarSource, SecretKeySelector};
use tracing::{debug, warn};

use llmops_common::config::{ImageTable, ResourceDefaults, StorageCredentials};
use llmops_common::{Error, Result, ServingConfig, SERVING_PORT};

use crate::catalog::CatalogModel;
use crate::endpoint::{DeploymentSpec, ResourceOverrides, RuntimeEngine, ServeTarget};

/// Mount path for synced model weights
pub const MODEL_MOUNT_PATH: &str = "/models";

/// Volume holding synced model weights
pub const MODEL_VOLUME_NAME: &str = "model-store";

/// Images that are not serving runtimes; selecting one is a configuration mistake
const GENERIC_IMAGES: &[&str] = &[
    "alpine", "busybox", "centos", "debian", "nginx", "python", "ubuntu",
];

// =============================================================================
// Plan types
// =============================================================================

/// Serving engine family, detected from the image reference
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RuntimeFamily {
    /// vLLM OpenAI-compatible server
    Vllm,
    /// Text Generation Inference
    Tgi,
    /// Anything else; gets TCP probes and no engine arguments
    Generic,
}

/// Where the chosen image came from
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ImageSource {
    /// Caller passed an image
    Explicit,
    /// Derived from the endpoint's deployment spec
    DeploymentSpec,
    /// Derived from catalog metadata
    ModelMetadata,
    /// Global default
    Default,
    /// A generic image was selected and replaced by a serving image
    GenericFallback,
}

/// Resolved requests and limits
#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedResources {
    /// CPU request
    pub cpu_request: String,
    /// CPU limit
    pub cpu_limit: String,
    /// Memory request
    pub memory_request: String,
    /// Memory limit
    pub memory_limit: String,
    /// `nvidia.com/gpu` count
    pub gpu_count: u32,
}

/// Init container that copies weights from object storage into the pod
#[derive(Clone, Debug, PartialEq)]
pub struct ModelSync {
    /// Sync image
    pub image: String,
    /// Object storage source
    pub source_uri: String,
    /// Destination inside the shared volume
    pub mount_path: String,
    /// Credentials and endpoint for the sync tool
    pub env: Vec<EnvVar>,
}

/// Health check style
#[derive(Clone, Debug, PartialEq)]
pub enum ProbeKind {
    /// HTTP GET on a path
    Http {
        /// Request path
        path: String,
        /// Container port
        port: i32,
    },
    /// TCP connect
    Tcp {
        /// Container port
        port: i32,
    },
}

/// Readiness and liveness probe settings
#[derive(Clone, Debug, PartialEq)]
pub struct ProbePlan {
    /// Check style
    pub kind: ProbeKind,
    /// Delay before the first readiness check
    pub readiness_initial_delay_secs: i32,
    /// Delay before the first liveness check
    pub liveness_initial_delay_secs: i32,
    /// Interval between checks
    pub period_secs: i32,
    /// Failures before the pod is marked unready or restarted
    pub failure_threshold: i32,
}

/// Everything needed to render the serving container
#[derive(Clone, Debug, PartialEq)]
pub struct ContainerPlan {
    /// Image reference
    pub image: String,
    /// How the image was chosen
    pub image_source: ImageSource,
    /// Engine family
    pub runtime: RuntimeFamily,
    /// Whether the pod requests GPUs
    pub use_gpu: bool,
    /// Runtime arguments, in order
    pub args: Vec<String>,
    /// Container environment
    pub env: Vec<EnvVar>,
    /// Requests and limits
    pub resources: ResolvedResources,
    /// Weight sync init container, when the runtime needs a local path
    pub model_sync: Option<ModelSync>,
    /// Health checks
    pub probes: ProbePlan,
}

/// Inputs for one build
#[derive(Clone, Copy, Debug, Default)]
pub struct SpecInputs<'a> {
    /// Model location
    pub storage_uri: &'a str,
    /// Explicit GPU choice from the caller
    pub use_gpu: Option<bool>,
    /// Explicit image from the caller
    pub explicit_image: Option<&'a str>,
    /// Endpoint deployment spec
    pub deployment_spec: Option<&'a DeploymentSpec>,
    /// Catalog entry
    pub model: Option<&'a CatalogModel>,
    /// Per-field resource overrides
    pub overrides: Option<&'a ResourceOverrides>,
}

// =============================================================================
// Builder
// =============================================================================

/// Resolves container plans against the configured image and resource tables
#[derive(Clone, Debug)]
pub struct SpecBuilder {
    images: ImageTable,
    resources: ResourceDefaults,
    storage: StorageCredentials,
}

impl SpecBuilder {
    /// Builder over the configured tables
    pub fn new(config: &ServingConfig) -> Self {
        Self {
            images: config.images.clone(),
            resources: config.resources.clone(),
            storage: config.storage.clone(),
        }
    }

    /// Resolve the full container plan
    pub fn build(&self, input: &SpecInputs<'_>) -> Result<ContainerPlan> {
        let storage_uri = input.storage_uri.trim();
        if storage_uri.is_empty() {
            return Err(Error::validation_for_field(
                "spec",
                "storage_uri",
                "model storage URI is required",
            ));
        }

        let use_gpu = resolve_use_gpu(input);
        let (image, image_source) = self.select_image(input, use_gpu);
        let runtime = detect_runtime(&image);
        debug!(%image, ?image_source, ?runtime, use_gpu, "selected runtime image");

        let needs_sync = runtime != RuntimeFamily::Vllm && is_object_storage(storage_uri);
        let model_path = if needs_sync {
            MODEL_MOUNT_PATH.to_string()
        } else {
            storage_uri.to_string()
        };

        let args = runtime_args(runtime, &model_path, use_gpu);
        let resources = self.resolve_resources(input, runtime, use_gpu)?;

        let mut env = self.storage_env();
        env.push(plain_env("MODEL_URI", storage_uri));
        if runtime == RuntimeFamily::Generic {
            env.push(plain_env("MODEL_PATH", &model_path));
        }
        if let Some(spec) = input.deployment_spec {
            env.extend(runtime_limit_env(spec));
        }

        let model_sync = needs_sync.then(|| ModelSync {
            image: self.images.model_sync.clone(),
            source_uri: storage_uri.to_string(),
            mount_path: MODEL_MOUNT_PATH.to_string(),
            env: self.storage_env(),
        });

        Ok(ContainerPlan {
            image,
            image_source,
            runtime,
            use_gpu,
            args,
            env,
            resources,
            model_sync,
            probes: probes_for(runtime, use_gpu),
        })
    }

    /// Pick an image: explicit > deployment spec > model metadata > default
    pub fn select_image(&self, input: &SpecInputs<'_>, use_gpu: bool) -> (String, ImageSource) {
        let (image, source) = if let Some(image) = non_blank(input.explicit_image) {
            (image.to_string(), ImageSource::Explicit)
        } else if let Some(image) = input
            .deployment_spec
            .and_then(|spec| self.image_from_spec(spec, use_gpu))
        {
            (image, ImageSource::DeploymentSpec)
        } else if let Some(image) = input
            .model
            .and_then(|model| self.image_from_metadata(model, use_gpu))
        {
            (image, ImageSource::ModelMetadata)
        } else {
            (self.images.default.clone(), ImageSource::Default)
        };

        if is_generic_image(&image) {
            let fallback = self.engine_image(RuntimeEngine::Vllm, use_gpu);
            warn!(
                selected = %image,
                fallback = %fallback,
                "selected image is not a serving runtime, falling back"
            );
            return (fallback, ImageSource::GenericFallback);
        }
        (image, source)
    }

    fn image_from_spec(&self, spec: &DeploymentSpec, use_gpu: bool) -> Option<String> {
        if let Some(image) = non_blank(spec.runtime.image.as_deref()) {
            return Some(image.to_string());
        }
        if spec.serve_target == ServeTarget::Rag {
            return Some(self.images.rag.clone());
        }
        spec.runtime
            .engine
            .map(|engine| self.engine_image(engine, use_gpu))
    }

    fn image_from_metadata(&self, model: &CatalogModel, use_gpu: bool) -> Option<String> {
        if let Some(image) = model.metadata_str("runtime_image") {
            return Some(image.to_string());
        }
        match model.metadata_str("runtime")?.to_ascii_lowercase().as_str() {
            "vllm" => Some(self.engine_image(RuntimeEngine::Vllm, use_gpu)),
            "tgi" | "text-generation-inference" => {
                Some(self.engine_image(RuntimeEngine::Tgi, use_gpu))
            }
            _ => None,
        }
    }

    fn engine_image(&self, engine: RuntimeEngine, use_gpu: bool) -> String {
        match (engine, use_gpu) {
            (RuntimeEngine::Vllm, true) => self.images.vllm_gpu.clone(),
            (RuntimeEngine::Vllm, false) => self.images.vllm_cpu.clone(),
            (RuntimeEngine::Tgi, true) => self.images.tgi_gpu.clone(),
            (RuntimeEngine::Tgi, false) => self.images.tgi_cpu.clone(),
        }
    }

    fn resolve_resources(
        &self,
        input: &SpecInputs<'_>,
        runtime: RuntimeFamily,
        use_gpu: bool,
    ) -> Result<ResolvedResources> {
        let profile = if use_gpu {
            &self.resources.gpu
        } else {
            &self.resources.cpu
        };
        let overrides = input.overrides.cloned().unwrap_or_default();

        let gpu_count = if use_gpu {
            input
                .deployment_spec
                .and_then(|s| s.resources.gpu_count)
                .unwrap_or(profile.gpu_count)
                .max(1)
        } else {
            0
        };

        let mut resolved = ResolvedResources {
            cpu_request: overrides
                .cpu_request
                .unwrap_or_else(|| profile.cpu_request.clone()),
            cpu_limit: overrides
                .cpu_limit
                .unwrap_or_else(|| profile.cpu_limit.clone()),
            memory_request: overrides
                .memory_request
                .unwrap_or_else(|| profile.memory_request.clone()),
            memory_limit: overrides
                .memory_limit
                .unwrap_or_else(|| profile.memory_limit.clone()),
            gpu_count,
        };

        for (field, value) in [
            ("cpu_request", &resolved.cpu_request),
            ("cpu_limit", &resolved.cpu_limit),
        ] {
            if parse_cpu_millis(value).is_none() {
                return Err(Error::validation_for_field(
                    "spec",
                    field,
                    format!("invalid cpu quantity '{}' (expected e.g. '500m', '2')", value),
                ));
            }
        }
        let memory_request = parse_memory_bytes(&resolved.memory_request);
        let memory_limit = parse_memory_bytes(&resolved.memory_limit);
        let (Some(memory_request), Some(mut memory_limit)) = (memory_request, memory_limit) else {
            return Err(Error::validation_for_field(
                "spec",
                "memory",
                format!(
                    "invalid memory quantity in request '{}' or limit '{}' (expected e.g. '2Gi')",
                    resolved.memory_request, resolved.memory_limit
                ),
            ));
        };

        if runtime == RuntimeFamily::Tgi && !use_gpu {
            let floor = &self.resources.tgi_cpu_memory_floor;
            match parse_memory_bytes(floor) {
                Some(floor_bytes) if memory_limit < floor_bytes => {
                    warn!(
                        requested = %resolved.memory_limit,
                        floor = %floor,
                        "raising memory limit for TGI on CPU to avoid OOM during model download"
                    );
                    resolved.memory_limit = floor.clone();
                    memory_limit = floor_bytes;
                }
                Some(_) => {}
                None => warn!(floor = %floor, "ignoring unparseable TGI CPU memory floor"),
            }
        }

        if memory_request > memory_limit {
            return Err(Error::validation_for_field(
                "spec",
                "memory_request",
                format!(
                    "memory request {} exceeds limit {}",
                    resolved.memory_request, resolved.memory_limit
                ),
            ));
        }

        Ok(resolved)
    }

    fn storage_env(&self) -> Vec<EnvVar> {
        vec![
            secret_env(
                "AWS_ACCESS_KEY_ID",
                &self.storage.secret_name,
                &self.storage.access_key_key,
            ),
            secret_env(
                "AWS_SECRET_ACCESS_KEY",
                &self.storage.secret_name,
                &self.storage.secret_key_key,
            ),
            config_map_env(
                "AWS_ENDPOINT_URL",
                &self.storage.config_map_name,
                &self.storage.endpoint_key,
            ),
        ]
    }
}

// =============================================================================
// Free functions
// =============================================================================

/// Detect the engine family from an image reference
pub fn detect_runtime(image: &str) -> RuntimeFamily {
    let lower = image.to_ascii_lowercase();
    if lower.contains("vllm") {
        RuntimeFamily::Vllm
    } else if lower.contains("text-generation-inference") || lower.contains("tgi") {
        RuntimeFamily::Tgi
    } else {
        RuntimeFamily::Generic
    }
}

/// True for base OS or language images that do not serve models
pub fn is_generic_image(image: &str) -> bool {
    let without_digest = image.split('@').next().unwrap_or(image);
    let repo = without_digest
        .rsplit('/')
        .next()
        .unwrap_or(without_digest)
        .split(':')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();
    GENERIC_IMAGES.contains(&repo.as_str())
}

/// True when the URI points at object storage and must be synced for local-path runtimes
pub fn is_object_storage(uri: &str) -> bool {
    uri.starts_with("s3://")
}

/// Runtime CLI arguments; order matters for vLLM on CPU
pub fn runtime_args(runtime: RuntimeFamily, model_path: &str, use_gpu: bool) -> Vec<String> {
    let port = SERVING_PORT.to_string();
    let mut args: Vec<String> = Vec::new();
    match runtime {
        RuntimeFamily::Vllm => {
            if !use_gpu {
                // must precede --model or vLLM probes for CUDA while loading
                args.extend(["--device".to_string(), "cpu".to_string()]);
            }
            args.extend([
                "--model".to_string(),
                model_path.to_string(),
                "--host".to_string(),
                "0.0.0.0".to_string(),
                "--port".to_string(),
                port,
            ]);
        }
        RuntimeFamily::Tgi => {
            args.extend([
                "--model-id".to_string(),
                model_path.to_string(),
                "--hostname".to_string(),
                "0.0.0.0".to_string(),
                "--port".to_string(),
                port,
            ]);
            if !use_gpu {
                args.push("--disable-custom-kernels".to_string());
            }
        }
        RuntimeFamily::Generic => {}
    }
    args
}

fn probes_for(runtime: RuntimeFamily, use_gpu: bool) -> ProbePlan {
    let kind = match runtime {
        RuntimeFamily::Vllm | RuntimeFamily::Tgi => ProbeKind::Http {
            path: "/health".to_string(),
            port: SERVING_PORT,
        },
        RuntimeFamily::Generic => ProbeKind::Tcp { port: SERVING_PORT },
    };
    // CPU model loads are much slower
    let (readiness, liveness) = if use_gpu { (30, 120) } else { (60, 300) };
    ProbePlan {
        kind,
        readiness_initial_delay_secs: readiness,
        liveness_initial_delay_secs: liveness,
        period_secs: 10,
        failure_threshold: 6,
    }
}

fn resolve_use_gpu(input: &SpecInputs<'_>) -> bool {
    if let Some(flag) = input.use_gpu {
        return flag;
    }
    if let Some(spec) = input.deployment_spec {
        if let Some(flag) = spec.use_gpu {
            return flag;
        }
        if let Some(count) = spec.resources.gpu_count {
            return count > 0;
        }
    }
    false
}

fn runtime_limit_env(spec: &DeploymentSpec) -> Vec<EnvVar> {
    [
        ("MAX_CONCURRENT_REQUESTS", spec.runtime.max_concurrent_requests),
        ("MAX_INPUT_TOKENS", spec.runtime.max_input_tokens),
        ("MAX_OUTPUT_TOKENS", spec.runtime.max_output_tokens),
    ]
    .into_iter()
    .filter_map(|(name, value)| value.map(|v| plain_env(name, &v.to_string())))
    .collect()
}

fn non_blank(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|s| !s.is_empty())
}

fn plain_env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        value_from: None,
    }
}

fn secret_env(name: &str, secret: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            secret_key_ref: Some(SecretKeySelector {
                name: secret.to_string(),
                key: key.to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        }),
    }
}

fn config_map_env(name: &str, config_map: &str, key: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: None,
        value_from: Some(EnvVarSource {
            config_map_key_ref: Some(ConfigMapKeySelector {
                name: config_map.to_string(),
                key: key.to_string(),
                optional: Some(true),
            }),
            ..Default::default()
        }),
    }
}

// =============================================================================
// Quantities
// =============================================================================

/// Parse a Kubernetes memory quantity into bytes
pub fn parse_memory_bytes(qty: &str) -> Option<u64> {
    const SUFFIXES: &[(&str, f64)] = &[
        ("Ki", 1024.0),
        ("Mi", 1024.0 * 1024.0),
        ("Gi", 1024.0 * 1024.0 * 1024.0),
        ("Ti", 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Pi", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("Ei", 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0 * 1024.0),
        ("k", 1e3),
        ("M", 1e6),
        ("G", 1e9),
        ("T", 1e12),
        ("P", 1e15),
        ("E", 1e18),
    ];
    let qty = qty.trim();
    let (number, multiplier) = SUFFIXES
        .iter()
        .find(|(suffix, _)| qty.ends_with(suffix))
        .map(|(suffix, mult)| (&qty[..qty.len() - suffix.len()], *mult))
        .unwrap_or((qty, 1.0));
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value < 0.0 {
        return None;
    }
    Some((value * multiplier) as u64)
}

/// Parse a Kubernetes CPU quantity into millicores
pub fn parse_cpu_millis(qty: &str) -> Option<u64> {
    let qty = qty.trim();
    let (number, scale) = match qty.strip_suffix('m') {
        Some(n) => (n, 1.0),
        None => (qty, 1000.0),
    };
    let value: f64 = number.parse().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }
    Some((value * scale) as u64)
}
