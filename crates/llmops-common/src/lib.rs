//! Common plumbing for llmops: errors, configuration, Kubernetes helpers and telemetry

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use config::ServingConfig;
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label carrying the endpoint's short name; pods, Services and HPAs select on it
pub const LABEL_APP: &str = "app";

/// Label carrying the full endpoint UUID
pub const LABEL_ENDPOINT_ID: &str = "endpoint-id";

/// Standard Kubernetes managed-by label key
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Value for the managed-by label on everything we create
pub const LABEL_MANAGED_BY_LLMOPS: &str = "llmops";

/// Port every serving runtime listens on
pub const SERVING_PORT: i32 = 8000;

/// Port exposed by the ClusterIP Service in front of the runtime
pub const SERVICE_PORT: i32 = 80;
