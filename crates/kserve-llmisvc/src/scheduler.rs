//! Endpoint-picker (EPP) scheduler builders
//!
//! A service with `router.scheduler` gets an endpoint picker in front of its
//! serving pods:
//! - Deployment `<name>-kserve-router-scheduler` running the picker
//! - Service `<name>-epp-service` exposing its gRPC, health and metrics ports
//! - ServiceAccount `<name>-epp-sa` (or the template's own account name)
//! - InferencePool `<name>-inference-pool`, unless an existing pool is referenced
//! - InferenceModel `<name>-inference-model`

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{Service, ServiceAccount, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use tracing::debug;

use kserve_common::crd::{LLMInferenceService, LLMInferenceServiceSpec, SchedulerSpec};
use kserve_common::kube_utils::{child_name, owned_meta};
use kserve_common::network::{
    InferenceModel, InferenceModelSpec, InferencePool, PoolObjectReference,
};

use crate::workload::{base_labels, inference_pool_name, pod_template, MAIN_CONTAINER};

const COMPONENT: &str = "llminferenceservice-router-scheduler";

/// Scheduler Deployment suffix
pub const SCHEDULER_SUFFIX: &str = "-kserve-router-scheduler";
/// Scheduler Service suffix
pub const EPP_SERVICE_SUFFIX: &str = "-epp-service";
/// Scheduler ServiceAccount suffix
pub const EPP_SERVICE_ACCOUNT_SUFFIX: &str = "-epp-sa";
/// Managed InferencePool suffix
pub const INFERENCE_POOL_SUFFIX: &str = "-inference-pool";
/// InferenceModel suffix
pub const INFERENCE_MODEL_SUFFIX: &str = "-inference-model";

/// Container ports exposed by the scheduler Service
const EPP_PORTS: [&str; 3] = ["grpc", "grpc-health", "metrics"];

/// Arguments that mean the picker configuration is already supplied
const CONFIG_FLAGS: [&str; 4] = ["--configText", "-configText", "--configFile", "-configFile"];

const PD_CONFIG: &str = r#"
apiVersion: inference.networking.x-k8s.io/v1alpha1
kind: EndpointPickerConfig
plugins:
- type: pd-profile-handler
  parameters:
    threshold: 100
- type: prefill-header-handler
- type: prefill-filter
- type: decode-filter
- type: prefix-cache-scorer
- type: load-aware-scorer
- type: max-score-picker
schedulingProfiles:
- name: prefill
  plugins:
  - pluginRef: prefill-filter
  - pluginRef: prefix-cache-scorer
    weight: 2.0
  - pluginRef: load-aware-scorer
    weight: 1.0
  - pluginRef: max-score-picker
- name: decode
  plugins:
  - pluginRef: decode-filter
  - pluginRef: prefix-cache-scorer
    weight: 2.0
  - pluginRef: load-aware-scorer
    weight: 1.0
  - pluginRef: max-score-picker
"#;

const SINGLE_CONFIG: &str = r#"
apiVersion: inference.networking.x-k8s.io/v1alpha1
kind: EndpointPickerConfig
plugins:
- type: single-profile-handler
- type: prefix-cache-scorer
- type: load-aware-scorer
- type: max-score-picker
schedulingProfiles:
- name: default
  plugins:
  - pluginRef: prefix-cache-scorer
    weight: 2.0
  - pluginRef: load-aware-scorer
    weight: 1.0
  - pluginRef: max-score-picker
"#;

/// Labels shared by every scheduler object
pub fn scheduler_labels(name: &str) -> BTreeMap<String, String> {
    base_labels(name, COMPONENT)
}

/// EndpointPickerConfig passed to the picker through `--configText`.
///
/// An inline config wins. Otherwise prefill/decode disaggregation picks the
/// two-profile config and everything else the single-profile one.
pub fn scheduler_config_text(spec: &LLMInferenceServiceSpec) -> String {
    let inline = spec
        .scheduler()
        .and_then(|s| s.config.as_ref())
        .and_then(|c| c.inline.as_ref())
        .and_then(|v| serde_json::to_string(v).ok());
    if let Some(inline) = inline {
        return inline;
    }
    if spec.prefill.is_some() {
        PD_CONFIG.to_string()
    } else {
        SINGLE_CONFIG.to_string()
    }
}

/// Every scheduler object for a service, `None` for the ones that must not exist
#[derive(Clone, Debug, Default)]
pub struct SchedulerObjects {
    /// Picker Deployment
    pub deployment: Option<Deployment>,
    /// Picker Service
    pub service: Option<Service>,
    /// Picker ServiceAccount
    pub service_account: Option<ServiceAccount>,
    /// Managed InferencePool
    pub inference_pool: Option<InferencePool>,
    /// InferenceModel binding the model name to the pool
    pub inference_model: Option<InferenceModel>,
}

/// Build every scheduler object for `svc` from its merged `spec`
pub fn build_scheduler(svc: &LLMInferenceService, spec: &LLMInferenceServiceSpec) -> SchedulerObjects {
    let Some(scheduler) = spec.scheduler() else {
        return SchedulerObjects::default();
    };

    SchedulerObjects {
        deployment: Some(build_scheduler_deployment(svc, spec, scheduler)),
        service: build_scheduler_service(svc, scheduler),
        service_account: Some(build_scheduler_service_account(svc, scheduler)),
        inference_pool: build_inference_pool(svc, scheduler),
        inference_model: Some(build_inference_model(svc, spec)),
    }
}

/// Name of the scheduler ServiceAccount
pub fn scheduler_service_account_name(name: &str, scheduler: &SchedulerSpec) -> String {
    scheduler
        .template
        .as_ref()
        .and_then(|t| t.service_account_name.clone())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| child_name(name, EPP_SERVICE_ACCOUNT_SUFFIX))
}

fn build_scheduler_deployment(
    svc: &LLMInferenceService,
    spec: &LLMInferenceServiceSpec,
    scheduler: &SchedulerSpec,
) -> Deployment {
    let name = svc.name_any();
    let labels = scheduler_labels(&name);

    let mut pod = scheduler.template.clone().unwrap_or_default();
    if let Some(main) = pod.containers.iter_mut().find(|c| c.name == MAIN_CONTAINER) {
        let args = main.args.get_or_insert_with(Vec::new);
        if args.iter().any(|a| CONFIG_FLAGS.contains(&a.as_str())) {
            debug!(service = %name, "scheduler configuration supplied by template args");
        } else {
            args.push("--configText".to_string());
            args.push(scheduler_config_text(spec));
        }
    }

    Deployment {
        metadata: owned_meta(
            svc,
            child_name(&name, SCHEDULER_SUFFIX),
            svc.namespace(),
            labels.clone(),
        ),
        spec: Some(DeploymentSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: pod_template(labels, BTreeMap::new(), pod),
            ..Default::default()
        }),
        status: None,
    }
}

/// The picker Service, present only when a scheduler template is set
fn build_scheduler_service(svc: &LLMInferenceService, scheduler: &SchedulerSpec) -> Option<Service> {
    let template = scheduler.template.as_ref()?;
    let name = svc.name_any();
    let labels = scheduler_labels(&name);

    // BTreeMap keeps ports sorted by name
    let ports: BTreeMap<&str, ServicePort> = template
        .containers
        .iter()
        .flat_map(|c| c.ports.iter().flatten())
        .filter_map(|p| {
            let port_name = p.name.as_deref().filter(|n| EPP_PORTS.contains(n))?;
            Some((
                port_name,
                ServicePort {
                    name: Some(port_name.to_string()),
                    port: p.container_port,
                    target_port: Some(IntOrString::String(port_name.to_string())),
                    protocol: p.protocol.clone(),
                    ..Default::default()
                },
            ))
        })
        .collect();

    if ports.len() != EPP_PORTS.len() {
        let found: BTreeSet<&str> = ports.keys().copied().collect();
        debug!(service = %name, ?found, "scheduler template does not expose every EPP port");
    }

    Some(Service {
        metadata: owned_meta(
            svc,
            child_name(&name, EPP_SERVICE_SUFFIX),
            svc.namespace(),
            labels.clone(),
        ),
        spec: Some(ServiceSpec {
            selector: Some(labels),
            ports: Some(ports.into_values().collect()),
            ..Default::default()
        }),
        status: None,
    })
}

fn build_scheduler_service_account(
    svc: &LLMInferenceService,
    scheduler: &SchedulerSpec,
) -> ServiceAccount {
    let name = svc.name_any();
    ServiceAccount {
        metadata: owned_meta(
            svc,
            scheduler_service_account_name(&name, scheduler),
            svc.namespace(),
            scheduler_labels(&name),
        ),
        ..Default::default()
    }
}

/// Managed pool; `None` when the scheduler references an existing one
fn build_inference_pool(svc: &LLMInferenceService, scheduler: &SchedulerSpec) -> Option<InferencePool> {
    if scheduler.has_pool_ref() {
        return None;
    }
    let name = svc.name_any();
    let spec = scheduler
        .pool
        .as_ref()
        .and_then(|p| p.spec.clone())
        .unwrap_or_default();
    Some(InferencePool::new(
        owned_meta(
            svc,
            child_name(&name, INFERENCE_POOL_SUFFIX),
            svc.namespace(),
            scheduler_labels(&name),
        ),
        spec,
    ))
}

fn build_inference_model(svc: &LLMInferenceService, spec: &LLMInferenceServiceSpec) -> InferenceModel {
    let name = svc.name_any();
    let pool = inference_pool_name(&name, spec)
        .unwrap_or_else(|| child_name(&name, INFERENCE_POOL_SUFFIX));

    InferenceModel::new(
        owned_meta(
            svc,
            child_name(&name, INFERENCE_MODEL_SUFFIX),
            svc.namespace(),
            scheduler_labels(&name),
        ),
        InferenceModelSpec {
            model_name: spec.model.name.clone().unwrap_or_else(|| name.clone()),
            criticality: Some(spec.model.criticality.unwrap_or_default().to_string()),
            target_models: Vec::new(),
            pool_ref: PoolObjectReference::inference_pool(pool),
        },
    )
}
