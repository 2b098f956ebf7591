//! Compiles a resolved container plan into Kubernetes objects
//!
//! Output is typed k8s-openapi structs; nothing here talks to the cluster.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec as K8sDeploymentSpec};
use k8s_openapi::api::autoscaling::v2::{
    CrossVersionObjectReference, HPAScalingRules, HorizontalPodAutoscaler,
    HorizontalPodAutoscalerBehavior, HorizontalPodAutoscalerSpec, MetricSpec, MetricTarget,
    ResourceMetricSource,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, HTTPGetAction, PodSpec, PodTemplateSpec,
    Probe, ResourceRequirements, Service, ServicePort, ServiceSpec, TCPSocketAction, Volume,
    VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use uuid::Uuid;

use llmops_common::config::IngressSettings;
use llmops_common::crd::{
    InferenceService, InferenceServiceMetadata, InferenceServiceSpec, PredictorSpec,
    DEPLOYMENT_MODE_ANNOTATION,
};
use llmops_common::{SERVICE_PORT, SERVING_PORT};

use crate::endpoint::AutoscalePolicy;
use crate::naming;
use crate::spec_builder::{
    ContainerPlan, ProbeKind, ProbePlan, ResolvedResources, MODEL_VOLUME_NAME,
};

/// Container name in raw Deployments
pub const SERVER_CONTAINER: &str = "server";

/// Container name KServe expects for custom predictors
pub const KSERVE_CONTAINER: &str = "kserve-container";

/// Init container name for weight sync
pub const MODEL_SYNC_CONTAINER: &str = "model-sync";

/// Identity and sizing shared by every object of one endpoint
#[derive(Clone, Copy, Debug)]
pub struct WorkloadContext<'a> {
    /// Short name; also the primary resource's name
    pub short_name: &'a str,
    /// Target namespace
    pub namespace: &'a str,
    /// Endpoint id
    pub endpoint_id: &'a Uuid,
    /// Normalized route
    pub route: &'a str,
    /// Minimum replicas
    pub min_replicas: i32,
    /// Maximum replicas
    pub max_replicas: i32,
    /// Autoscale policy; no HPA when absent
    pub autoscale: Option<&'a AutoscalePolicy>,
    /// Resolved container
    pub plan: &'a ContainerPlan,
}

impl WorkloadContext<'_> {
    fn labels(&self) -> BTreeMap<String, String> {
        naming::workload_labels(self.short_name, self.endpoint_id)
    }

    fn metadata(&self, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(self.namespace.to_string()),
            labels: Some(self.labels()),
            ..Default::default()
        }
    }

    /// Replica count for the primary workload; never zero on deploy
    fn initial_replicas(&self) -> i32 {
        self.min_replicas.max(1)
    }
}

/// Objects for the raw Deployment backend
#[derive(Clone, Debug)]
pub struct GeneratedWorkloads {
    /// Primary workload
    pub deployment: Deployment,
    /// ClusterIP Service
    pub service: Service,
    /// Autoscaler, when a policy is set
    pub hpa: Option<HorizontalPodAutoscaler>,
    /// Ingress routing the endpoint's path to the Service
    pub ingress: Ingress,
}

/// Compile the raw Deployment backend's objects
pub fn compile_raw(ctx: &WorkloadContext<'_>, ingress: &IngressSettings) -> GeneratedWorkloads {
    GeneratedWorkloads {
        deployment: compile_deployment(ctx),
        service: compile_service(ctx),
        hpa: ctx.autoscale.map(|policy| compile_hpa(ctx, policy)),
        ingress: compile_ingress(ctx, ctx.short_name, ingress),
    }
}

/// Compile the Deployment
pub fn compile_deployment(ctx: &WorkloadContext<'_>) -> Deployment {
    Deployment {
        metadata: ctx.metadata(ctx.short_name),
        spec: Some(K8sDeploymentSpec {
            replicas: Some(ctx.initial_replicas()),
            selector: LabelSelector {
                match_labels: Some(naming::selector_labels(ctx.short_name)),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(ctx.labels()),
                    ..Default::default()
                }),
                spec: Some(compile_pod_spec(ctx.plan, SERVER_CONTAINER)),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Compile the pod spec shared by both backends
pub fn compile_pod_spec(plan: &ContainerPlan, container_name: &str) -> PodSpec {
    let (init_containers, volumes) = model_sync_parts(plan);
    PodSpec {
        containers: vec![compile_container(plan, container_name)],
        init_containers,
        volumes,
        ..Default::default()
    }
}

fn model_sync_parts(plan: &ContainerPlan) -> (Option<Vec<Container>>, Option<Vec<Volume>>) {
    let Some(sync) = &plan.model_sync else {
        return (None, None);
    };
    let init = Container {
        name: MODEL_SYNC_CONTAINER.to_string(),
        image: Some(sync.image.clone()),
        command: Some(vec!["aws".to_string()]),
        args: Some(vec![
            "s3".to_string(),
            "sync".to_string(),
            sync.source_uri.clone(),
            sync.mount_path.clone(),
        ]),
        env: Some(sync.env.clone()),
        volume_mounts: Some(vec![model_volume_mount(&sync.mount_path)]),
        ..Default::default()
    };
    let volume = Volume {
        name: MODEL_VOLUME_NAME.to_string(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    };
    (Some(vec![init]), Some(vec![volume]))
}

fn model_volume_mount(path: &str) -> VolumeMount {
    VolumeMount {
        name: MODEL_VOLUME_NAME.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

/// Compile the serving container
pub fn compile_container(plan: &ContainerPlan, name: &str) -> Container {
    Container {
        name: name.to_string(),
        image: Some(plan.image.clone()),
        args: (!plan.args.is_empty()).then(|| plan.args.clone()),
        env: (!plan.env.is_empty()).then(|| plan.env.clone()),
        ports: Some(vec![ContainerPort {
            name: Some("http".to_string()),
            container_port: SERVING_PORT,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }]),
        resources: Some(compile_resources(&plan.resources)),
        readiness_probe: Some(compile_probe(&plan.probes, plan.probes.readiness_initial_delay_secs)),
        liveness_probe: Some(compile_probe(&plan.probes, plan.probes.liveness_initial_delay_secs)),
        volume_mounts: plan
            .model_sync
            .as_ref()
            .map(|sync| vec![model_volume_mount(&sync.mount_path)]),
        ..Default::default()
    }
}

fn compile_resources(resources: &ResolvedResources) -> ResourceRequirements {
    let mut requests = BTreeMap::from([
        ("cpu".to_string(), Quantity(resources.cpu_request.clone())),
        ("memory".to_string(), Quantity(resources.memory_request.clone())),
    ]);
    let mut limits = BTreeMap::from([
        ("cpu".to_string(), Quantity(resources.cpu_limit.clone())),
        ("memory".to_string(), Quantity(resources.memory_limit.clone())),
    ]);
    if resources.gpu_count > 0 {
        let gpus = Quantity(resources.gpu_count.to_string());
        requests.insert("nvidia.com/gpu".to_string(), gpus.clone());
        limits.insert("nvidia.com/gpu".to_string(), gpus);
    }
    ResourceRequirements {
        requests: Some(requests),
        limits: Some(limits),
        ..Default::default()
    }
}

fn compile_probe(plan: &ProbePlan, initial_delay: i32) -> Probe {
    let mut probe = Probe {
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(plan.period_secs),
        failure_threshold: Some(plan.failure_threshold),
        timeout_seconds: Some(5),
        ..Default::default()
    };
    match &plan.kind {
        ProbeKind::Http { path, port } => {
            probe.http_get = Some(HTTPGetAction {
                path: Some(path.clone()),
                port: IntOrString::Int(*port),
                ..Default::default()
            });
        }
        ProbeKind::Tcp { port } => {
            probe.tcp_socket = Some(TCPSocketAction {
                port: IntOrString::Int(*port),
                ..Default::default()
            });
        }
    }
    probe
}

/// Compile the ClusterIP Service in front of the runtime
pub fn compile_service(ctx: &WorkloadContext<'_>) -> Service {
    Service {
        metadata: ctx.metadata(ctx.short_name),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(naming::selector_labels(ctx.short_name)),
            ports: Some(vec![ServicePort {
                name: Some("http".to_string()),
                port: SERVICE_PORT,
                target_port: Some(IntOrString::Int(SERVING_PORT)),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Compile the autoscaler targeting the Deployment
pub fn compile_hpa(ctx: &WorkloadContext<'_>, policy: &AutoscalePolicy) -> HorizontalPodAutoscaler {
    let cpu_target = match (policy.target_cpu_utilization, policy.target_memory_utilization) {
        (None, None) => Some(AutoscalePolicy::DEFAULT_CPU_TARGET),
        (cpu, _) => cpu,
    };
    let metrics: Vec<MetricSpec> = [
        ("cpu", cpu_target),
        ("memory", policy.target_memory_utilization),
    ]
    .into_iter()
    .filter_map(|(name, target)| target.map(|t| utilization_metric(name, t)))
    .collect();

    let behavior = policy
        .scale_down_stabilization_secs
        .map(|window| HorizontalPodAutoscalerBehavior {
            scale_down: Some(HPAScalingRules {
                stabilization_window_seconds: Some(window),
                ..Default::default()
            }),
            ..Default::default()
        });

    HorizontalPodAutoscaler {
        metadata: ctx.metadata(ctx.short_name),
        spec: Some(HorizontalPodAutoscalerSpec {
            scale_target_ref: CrossVersionObjectReference {
                api_version: Some("apps/v1".to_string()),
                kind: "Deployment".to_string(),
                name: ctx.short_name.to_string(),
            },
            min_replicas: Some(ctx.initial_replicas()),
            max_replicas: ctx.max_replicas.max(ctx.initial_replicas()),
            metrics: Some(metrics),
            behavior,
        }),
        ..Default::default()
    }
}

fn utilization_metric(name: &str, target: i32) -> MetricSpec {
    MetricSpec {
        type_: "Resource".to_string(),
        resource: Some(ResourceMetricSource {
            name: name.to_string(),
            target: MetricTarget {
                type_: "Utilization".to_string(),
                average_utilization: Some(target),
                ..Default::default()
            },
        }),
        ..Default::default()
    }
}

/// Compile the Ingress routing the endpoint's path to `backend_service`.
///
/// Non-root routes use an nginx regex path with a rewrite so the runtime
/// sees requests at `/`.
pub fn compile_ingress(
    ctx: &WorkloadContext<'_>,
    backend_service: &str,
    settings: &IngressSettings,
) -> Ingress {
    let mut metadata = ctx.metadata(&naming::ingress_name(ctx.short_name));
    let (path, path_type) = if ctx.route == "/" {
        ("/".to_string(), "Prefix")
    } else {
        metadata.annotations = Some(BTreeMap::from([
            (
                "nginx.ingress.kubernetes.io/rewrite-target".to_string(),
                "/$2".to_string(),
            ),
            (
                "nginx.ingress.kubernetes.io/use-regex".to_string(),
                "true".to_string(),
            ),
        ]));
        // the route is literal text inside the path regex
        (
            format!("{}(/|$)(.*)", regex::escape(ctx.route)),
            "ImplementationSpecific",
        )
    };

    Ingress {
        metadata,
        spec: Some(IngressSpec {
            ingress_class_name: settings.class_name.clone(),
            rules: Some(vec![IngressRule {
                host: settings.host.clone(),
                http: Some(HTTPIngressRuleValue {
                    paths: vec![HTTPIngressPath {
                        path: Some(path),
                        path_type: path_type.to_string(),
                        backend: IngressBackend {
                            service: Some(IngressServiceBackend {
                                name: backend_service.to_string(),
                                port: Some(ServiceBackendPort {
                                    number: Some(SERVICE_PORT),
                                    ..Default::default()
                                }),
                            }),
                            ..Default::default()
                        },
                    }],
                }),
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Compile the InferenceService for the CRD backend
pub fn compile_inference_service(
    ctx: &WorkloadContext<'_>,
    deployment_mode: &str,
) -> InferenceService {
    let pod = compile_pod_spec(ctx.plan, KSERVE_CONTAINER);
    InferenceService::new(
        InferenceServiceMetadata {
            name: ctx.short_name.to_string(),
            namespace: ctx.namespace.to_string(),
            labels: ctx.labels(),
            annotations: BTreeMap::from([(
                DEPLOYMENT_MODE_ANNOTATION.to_string(),
                deployment_mode.to_string(),
            )]),
        },
        InferenceServiceSpec {
            predictor: PredictorSpec {
                min_replicas: Some(ctx.initial_replicas()),
                max_replicas: Some(ctx.max_replicas.max(ctx.initial_replicas())),
                containers: pod.containers,
                init_containers: pod.init_containers.unwrap_or_default(),
                volumes: pod.volumes.unwrap_or_default(),
            },
        },
    )
}
