//! Workload builders for LLMInferenceService
//!
//! The serving pods of a service are laid out in one of two shapes:
//! - single node: a Deployment per role (`-kserve`, `-kserve-prefill`)
//! - multi node: a LeaderWorkerSet per role (`-kserve-mn`, `-kserve-mn-prefill`)
//!
//! Every builder is a pure function of the service (for ownership and
//! naming) and its merged spec. Builders return `None` when the object must
//! not exist so that the reconciler can delete any stale copy.

mod multi_node;
mod service;
mod single_node;
mod storage;

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    Container, EnvVar, PodSpec, PodTemplateSpec, Service, ServiceAccount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

use kserve_common::config::StorageInitializerConfig;
use kserve_common::crd::{LLMInferenceService, LLMInferenceServiceSpec};
use kserve_common::kube_utils::child_name;
use kserve_common::network::LeaderWorkerSet;
use kserve_common::Result;

pub use multi_node::{
    build_leader_worker_set, build_multi_node_service_account,
    build_prefill_leader_worker_set, build_prefill_multi_node_service_account,
    leader_worker_set_readiness,
};
pub use service::{build_workload_service, serving_port, DEFAULT_SERVING_PORT};
pub use single_node::{
    build_deployment, build_prefill_deployment, build_service_account, deployment_readiness,
};
pub use storage::attach_model_artifacts;

// =============================================================================
// Labels and names
// =============================================================================

/// `app.kubernetes.io/component`
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
/// `app.kubernetes.io/name`, set to the service name
pub const NAME_LABEL: &str = "app.kubernetes.io/name";
/// `app.kubernetes.io/part-of`
pub const PART_OF_LABEL: &str = "app.kubernetes.io/part-of";
/// Value of [`PART_OF_LABEL`] on every child
pub const PART_OF_VALUE: &str = "llminferenceservice";
/// Marks pods that serve inference traffic
pub const KSERVE_COMPONENT_LABEL: &str = "kserve.io/component";
/// Serving role of a pod: `decode`, `prefill` or `both`
pub const ROLE_LABEL: &str = "llm-d.ai/role";

/// Container that runs the model server
pub const MAIN_CONTAINER: &str = "main";
/// Init container proxying between prefill and decode
pub const ROUTING_SIDECAR: &str = "llm-d-routing-sidecar";

/// Child name suffixes
pub mod suffix {
    /// Single-node decode Deployment and its ServiceAccount
    pub const MAIN: &str = "-kserve";
    /// Single-node prefill Deployment
    pub const PREFILL: &str = "-kserve-prefill";
    /// Multi-node decode LeaderWorkerSet and its ServiceAccount
    pub const MULTI_NODE: &str = "-kserve-mn";
    /// Multi-node prefill LeaderWorkerSet and its ServiceAccount
    pub const MULTI_NODE_PREFILL: &str = "-kserve-mn-prefill";
    /// Workload Service
    pub const WORKLOAD_SERVICE: &str = "-kserve-workload-svc";
}

/// `app.kubernetes.io/{component,name,part-of}` for `name`
pub fn base_labels(name: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (COMPONENT_LABEL.to_string(), component.to_string()),
        (NAME_LABEL.to_string(), name.to_string()),
        (PART_OF_LABEL.to_string(), PART_OF_VALUE.to_string()),
    ])
}

/// Base labels plus the workload marker and `role`
pub fn workload_labels(name: &str, component: &str, role: &str) -> BTreeMap<String, String> {
    let mut labels = base_labels(name, component);
    labels.insert(KSERVE_COMPONENT_LABEL.to_string(), "workload".to_string());
    labels.insert(ROLE_LABEL.to_string(), role.to_string());
    labels
}

/// Selector matching every serving pod of `name`, any role
pub fn inference_pool_selector(name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (NAME_LABEL.to_string(), name.to_string()),
        (PART_OF_LABEL.to_string(), PART_OF_VALUE.to_string()),
        (KSERVE_COMPONENT_LABEL.to_string(), "workload".to_string()),
    ])
}

/// Role of the decode pods: `decode` when prefill is split out, else `both`
pub fn decode_role(spec: &LLMInferenceServiceSpec) -> &'static str {
    if spec.prefill.is_some() {
        "decode"
    } else {
        "both"
    }
}

/// Name of the InferencePool serving `name`, if a scheduler is configured
pub fn inference_pool_name(name: &str, spec: &LLMInferenceServiceSpec) -> Option<String> {
    let scheduler = spec.scheduler()?;
    match scheduler.pool.as_ref().and_then(|p| p.ref_.as_ref()) {
        Some(r) if !r.name.is_empty() => Some(r.name.clone()),
        _ => Some(child_name(name, "-inference-pool")),
    }
}

// =============================================================================
// Pod helpers
// =============================================================================

/// The model server container, if present
pub fn main_container_mut(pod: &mut PodSpec) -> Option<&mut Container> {
    pod.containers.iter_mut().find(|c| c.name == MAIN_CONTAINER)
}

/// Whether `pod` carries the prefill/decode routing sidecar
pub fn has_routing_sidecar(pod: &PodSpec) -> bool {
    pod.init_containers
        .as_ref()
        .is_some_and(|c| c.iter().any(|c| c.name == ROUTING_SIDECAR))
}

fn routing_sidecar_mut(pod: &mut PodSpec) -> Option<&mut Container> {
    pod.init_containers
        .as_mut()?
        .iter_mut()
        .find(|c| c.name == ROUTING_SIDECAR)
}

/// Point the routing sidecar at the InferencePool
fn configure_routing_sidecar(pod: &mut PodSpec, pool_name: Option<&str>) {
    let (Some(sidecar), Some(pool)) = (routing_sidecar_mut(pod), pool_name) else {
        return;
    };
    set_env(sidecar, "INFERENCE_POOL_NAME", pool);
}

/// Insert or overwrite an environment variable
pub(crate) fn set_env(container: &mut Container, name: &str, value: &str) {
    let env = container.env.get_or_insert_with(Vec::new);
    match env.iter_mut().find(|e| e.name == name) {
        Some(existing) => {
            existing.value = Some(value.to_string());
            existing.value_from = None;
        }
        None => env.push(EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            ..Default::default()
        }),
    }
}

pub(crate) fn pod_template(
    labels: BTreeMap<String, String>,
    annotations: BTreeMap<String, String>,
    spec: PodSpec,
) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels),
            annotations: (!annotations.is_empty()).then_some(annotations),
            ..Default::default()
        }),
        spec: Some(spec),
    }
}

// =============================================================================
// Readiness
// =============================================================================

/// Readiness of one workload object, from its `Available` condition
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Readiness {
    /// `Available=True`
    Ready,
    /// `Available` present but not true
    NotReady {
        /// Condition reason
        reason: String,
        /// Condition message
        message: String,
    },
    /// No `Available` condition yet
    Progressing,
}

impl Readiness {
    /// Whether the workload is ready
    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Ready)
    }

    /// Reason and message to surface on a not-ready condition
    pub fn reason_and_message(&self) -> (String, String) {
        match self {
            Self::Ready => (String::new(), String::new()),
            Self::NotReady { reason, message } => (reason.clone(), message.clone()),
            Self::Progressing => ("Progressing".to_string(), String::new()),
        }
    }

    fn from_available(status: Option<(&str, Option<&str>, Option<&str>)>) -> Self {
        match status {
            Some(("True", _, _)) => Self::Ready,
            Some((_, reason, message)) => Self::NotReady {
                reason: reason.unwrap_or_default().to_string(),
                message: message.unwrap_or_default().to_string(),
            },
            None => Self::Progressing,
        }
    }
}

// =============================================================================
// Generated Workloads Container
// =============================================================================

/// Every workload object for a service, `None` for the ones that must not exist
#[derive(Clone, Debug, Default)]
pub struct GeneratedWorkloads {
    /// Single-node decode Deployment
    pub deployment: Option<Deployment>,
    /// Single-node prefill Deployment
    pub prefill_deployment: Option<Deployment>,
    /// Multi-node decode LeaderWorkerSet
    pub leader_worker_set: Option<LeaderWorkerSet>,
    /// Multi-node prefill LeaderWorkerSet
    pub prefill_leader_worker_set: Option<LeaderWorkerSet>,
    /// Single-node ServiceAccount used with the routing sidecar
    pub service_account: Option<ServiceAccount>,
    /// Multi-node decode ServiceAccount
    pub multi_node_service_account: Option<ServiceAccount>,
    /// Multi-node prefill ServiceAccount
    pub prefill_multi_node_service_account: Option<ServiceAccount>,
    /// Workload Service
    pub service: Option<Service>,
}

/// Compiles the merged spec of a service into workload objects
pub struct WorkloadCompiler;

impl WorkloadCompiler {
    /// Build every workload object for `svc` from its merged `spec`
    pub fn compile(
        svc: &LLMInferenceService,
        spec: &LLMInferenceServiceSpec,
        storage: &StorageInitializerConfig,
    ) -> Result<GeneratedWorkloads> {
        let pool = inference_pool_name(&svc.name_any(), spec);
        let pool = pool.as_deref();

        let deployment = build_deployment(svc, spec, storage, pool)?;
        let service_account = build_service_account(svc, deployment.as_ref());

        Ok(GeneratedWorkloads {
            prefill_deployment: build_prefill_deployment(svc, spec, storage)?,
            leader_worker_set: build_leader_worker_set(svc, spec, storage, pool)?,
            prefill_leader_worker_set: build_prefill_leader_worker_set(svc, spec, storage)?,
            multi_node_service_account: build_multi_node_service_account(svc, spec),
            prefill_multi_node_service_account: build_prefill_multi_node_service_account(svc, spec),
            service: build_workload_service(svc, spec),
            deployment,
            service_account,
        })
    }
}
