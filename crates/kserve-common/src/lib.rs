//! Common types for KServe: CRDs, errors, configuration, and utilities

#![deny(missing_docs)]

pub mod admission;
pub mod config;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod network;
pub mod telemetry;
pub mod template;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group for all KServe serving resources
pub const SERVING_GROUP: &str = "serving.kserve.io";

/// Namespace used when `POD_NAMESPACE` is not set
pub const DEFAULT_KSERVE_NAMESPACE: &str = "kserve";

/// Name of the shared operator ConfigMap
pub const INFERENCE_SERVICE_CONFIG_MAP_NAME: &str = "inferenceservice-config";

/// Mount path for model artifacts inside serving containers
pub const DEFAULT_MODEL_LOCAL_MOUNT_PATH: &str = "/mnt/models";

/// Field manager used for server-side apply and finalizer patches
pub const FIELD_MANAGER: &str = "kserve-controller";

/// Label placed on InferenceServices bound to a LocalModelCache
pub const LOCAL_MODEL_LABEL: &str = "internal.serving.kserve.io/localmodel";

/// Resolve the namespace KServe itself runs in.
///
/// Read from `POD_NAMESPACE` (downward API), falling back to `kserve`.
pub fn kserve_namespace() -> String {
    std::env::var("POD_NAMESPACE")
        .ok()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(|| DEFAULT_KSERVE_NAMESPACE.to_string())
}
