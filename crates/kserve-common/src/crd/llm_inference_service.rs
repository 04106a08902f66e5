//! LLMInferenceService and LLMInferenceServiceConfig CRD types
//!
//! An `LLMInferenceService` declares a model, how its serving pods are laid
//! out (single node, multi-node pipeline or data parallel, optional
//! disaggregated prefill) and how traffic reaches it (managed or
//! user-supplied Gateway API objects plus an optional endpoint-picker
//! scheduler). `LLMInferenceServiceConfig` carries the same spec shape and is
//! merged underneath services that reference it through `baseRefs`.

use k8s_openapi::api::core::v1::{ConfigMapKeySelector, PodSpec};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{Addressable, Condition, LocalObjectReference, UntypedObjectReference};
use crate::network::HttpRouteSpec as GatewayHttpRouteSpec;
use crate::network::InferencePoolSpec as GatewayInferencePoolSpec;

/// Short name registered for LLMInferenceService
pub const LLMISVC_SHORT_NAME: &str = "llmisvc";

// =============================================================================
// LLMInferenceService
// =============================================================================

/// Desired state of an LLM serving deployment
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "serving.kserve.io",
    version = "v1alpha1",
    kind = "LLMInferenceService",
    plural = "llminferenceservices",
    shortname = "llmisvc",
    namespaced,
    status = "LLMInferenceServiceStatus",
    printcolumn = r#"{"name":"URL","type":"string","jsonPath":".status.url"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type=='Ready')].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LLMInferenceServiceSpec {
    /// Model to serve
    #[serde(default, skip_serializing_if = "LLMModelSpec::is_empty")]
    pub model: LLMModelSpec,

    /// Storage initializer settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_initializer: Option<StorageInitializerSpec>,

    /// Decode (or combined) workload
    #[serde(flatten)]
    pub workload: WorkloadSpec,

    /// Traffic routing
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub router: Option<RouterSpec>,

    /// Disaggregated prefill workload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefill: Option<WorkloadSpec>,

    /// LLMInferenceServiceConfig objects merged underneath this spec, in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub base_refs: Vec<LocalObjectReference>,
}

impl LLMInferenceServiceSpec {
    /// Scheduler settings, if a router with a scheduler is configured
    pub fn scheduler(&self) -> Option<&SchedulerSpec> {
        self.router.as_ref().and_then(|r| r.scheduler.as_ref())
    }

    /// Route settings, if configured
    pub fn route(&self) -> Option<&GatewayRoutesSpec> {
        self.router.as_ref().and_then(|r| r.route.as_ref())
    }

    /// Gateway settings, if configured
    pub fn gateway(&self) -> Option<&GatewaySpec> {
        self.router.as_ref().and_then(|r| r.gateway.as_ref())
    }

    /// Whether the model artifacts should be fetched by the storage initializer
    pub fn storage_initializer_enabled(&self) -> bool {
        self.storage_initializer
            .as_ref()
            .and_then(|s| s.enabled)
            .unwrap_or(true)
    }
}

/// Request criticality for the endpoint picker
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum Criticality {
    /// Never shed
    #[default]
    Critical,
    /// Shed after sheddable traffic
    Standard,
    /// Shed first under load
    Sheddable,
}

impl std::fmt::Display for Criticality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Critical => write!(f, "Critical"),
            Self::Standard => write!(f, "Standard"),
            Self::Sheddable => write!(f, "Sheddable"),
        }
    }
}

/// Model identity and location
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LLMModelSpec {
    /// Model URI (`hf://`, `s3://`, `pvc://`, `oci://`)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uri: String,

    /// Name clients use to request the model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Request criticality
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criticality: Option<Criticality>,

    /// LoRA adapters served on top of the base model
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lora: Option<LoRASpec>,
}

impl LLMModelSpec {
    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// LoRA adapter list
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoRASpec {
    /// Adapters, each a model of its own
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adapters: Vec<LLMModelSpec>,
}

/// Storage initializer toggle
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageInitializerSpec {
    /// Defaults to true
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

// =============================================================================
// Workload
// =============================================================================

/// Pod layout of one serving role
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkloadSpec {
    /// Number of replicas (groups, for multi-node)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 0))]
    pub replicas: Option<i32>,

    /// Parallelism layout
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallelism: Option<ParallelismSpec>,

    /// Pod template for single-node serving, or the leader in multi-node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodSpec>,

    /// Pod template for multi-node workers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<PodSpec>,
}

impl WorkloadSpec {
    /// Group size derived from the parallelism layout
    pub fn size(&self) -> Option<i32> {
        self.parallelism.as_ref().and_then(ParallelismSpec::size)
    }

    /// Whether pipeline parallelism is configured
    pub fn is_pipeline_parallel(&self) -> bool {
        self.parallelism
            .as_ref()
            .is_some_and(ParallelismSpec::is_pipeline_parallel)
    }

    /// Whether data parallelism is configured
    pub fn is_data_parallel(&self) -> bool {
        self.parallelism
            .as_ref()
            .is_some_and(ParallelismSpec::is_data_parallel)
    }
}

/// Parallelism dimensions
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ParallelismSpec {
    /// Tensor parallel degree
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub tensor: Option<i32>,

    /// Pipeline parallel degree (number of nodes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub pipeline: Option<i32>,

    /// Total data parallel ranks
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub data: Option<i32>,

    /// Data parallel ranks per node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1))]
    pub data_local: Option<i32>,

    /// Port used for data parallel RPC
    #[serde(rename = "dataRPCPort", default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(min = 1, max = 65535))]
    pub data_rpc_port: Option<i32>,

    /// Expert parallelism
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub expert: bool,
}

impl ParallelismSpec {
    /// Number of pods per group.
    ///
    /// Pipeline parallel: one pod per stage. Data parallel: one pod per
    /// `dataLocal` ranks, at least one.
    pub fn size(&self) -> Option<i32> {
        if let Some(pipeline) = self.pipeline {
            return Some(pipeline);
        }
        match (self.data, self.data_local) {
            (Some(data), Some(local)) if local > 0 => Some((data / local).max(1)),
            (Some(data), _) => Some(data.max(1)),
            _ => None,
        }
    }

    /// Whether `pipeline` is set to a positive value
    pub fn is_pipeline_parallel(&self) -> bool {
        self.pipeline.is_some_and(|p| p > 0)
    }

    /// Whether `data` or `dataLocal` is set to a positive value
    pub fn is_data_parallel(&self) -> bool {
        self.data.is_some_and(|d| d > 0) || self.data_local.is_some_and(|d| d > 0)
    }
}

// =============================================================================
// Router
// =============================================================================

/// Traffic routing settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RouterSpec {
    /// HTTPRoute settings; `{}` means a managed route
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<GatewayRoutesSpec>,

    /// Gateway settings; `{}` means the managed ingress gateway
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<GatewaySpec>,

    /// Ingress settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<IngressSpec>,

    /// Endpoint-picker scheduler
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<SchedulerSpec>,
}

/// Route kinds
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewayRoutesSpec {
    /// HTTPRoute settings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpRouteSpec>,
}

impl GatewayRoutesSpec {
    /// Whether this is the literal empty route (fully managed)
    pub fn is_managed(&self) -> bool {
        self.http.is_none()
    }
}

/// HTTPRoute settings: user refs or an inline spec, never both
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HttpRouteSpec {
    /// Existing HTTPRoutes in the service namespace
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<LocalObjectReference>,

    /// Inline spec for the managed HTTPRoute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<GatewayHttpRouteSpec>,
}

impl HttpRouteSpec {
    /// Whether user-supplied routes are referenced
    pub fn has_refs(&self) -> bool {
        !self.refs.is_empty()
    }
}

/// Gateway settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    /// User-supplied Gateways
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<UntypedObjectReference>,
}

impl GatewaySpec {
    /// Whether user-supplied gateways are referenced
    pub fn has_refs(&self) -> bool {
        !self.refs.is_empty()
    }
}

/// Ingress settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// User-supplied Ingresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<UntypedObjectReference>,
}

/// Endpoint-picker scheduler settings
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerSpec {
    /// InferencePool to schedule over
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool: Option<InferencePoolSpec>,

    /// Scheduler pod template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodSpec>,

    /// Scheduler configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<SchedulerConfigSpec>,
}

impl SchedulerSpec {
    /// Whether an existing pool is referenced instead of a managed one
    pub fn has_pool_ref(&self) -> bool {
        self.pool.as_ref().is_some_and(InferencePoolSpec::has_ref)
    }
}

/// Scheduler configuration source
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SchedulerConfigSpec {
    /// Inline EndpointPickerConfig
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<serde_json::Value>,

    /// ConfigMap key holding the EndpointPickerConfig
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_: Option<ConfigMapKeySelector>,
}

/// InferencePool settings: managed spec or existing pool
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferencePoolSpec {
    /// Spec for the managed pool
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<GatewayInferencePoolSpec>,

    /// Existing pool in the service namespace
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub ref_: Option<LocalObjectReference>,
}

impl InferencePoolSpec {
    /// Whether an existing pool is referenced
    pub fn has_ref(&self) -> bool {
        self.ref_.as_ref().is_some_and(|r| !r.name.is_empty())
    }
}

// =============================================================================
// Status
// =============================================================================

/// Observed state of an LLMInferenceService
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LLMInferenceServiceStatus {
    /// Primary external URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Status conditions
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,

    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// All discovered addresses
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<Addressable>,
}

// =============================================================================
// LLMInferenceServiceConfig
// =============================================================================

/// Reusable fragment merged underneath LLMInferenceServices
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "serving.kserve.io",
    version = "v1alpha1",
    kind = "LLMInferenceServiceConfig",
    plural = "llminferenceserviceconfigs",
    shortname = "llmisvcconfig",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct LLMInferenceServiceConfigSpec {
    /// The mergeable service spec
    #[serde(flatten)]
    pub service: LLMInferenceServiceSpec,
}

impl From<LLMInferenceServiceSpec> for LLMInferenceServiceConfigSpec {
    fn from(service: LLMInferenceServiceSpec) -> Self {
        Self { service }
    }
}
