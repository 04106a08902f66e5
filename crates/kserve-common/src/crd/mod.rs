//! Custom Resource Definitions for KServe
//!
//! This module contains the CRDs owned by the LLM and LocalModel controllers,
//! plus a minimal view of the InferenceService they interact with.

mod inference_service;
mod llm_inference_service;
mod local_model;
mod types;

pub use inference_service::InferenceService;
pub use llm_inference_service::{
    Criticality, GatewayRoutesSpec, GatewaySpec, HttpRouteSpec, InferencePoolSpec, IngressSpec,
    LLMInferenceService, LLMInferenceServiceConfig, LLMInferenceServiceConfigSpec,
    LLMInferenceServiceSpec, LLMInferenceServiceStatus, LLMModelSpec, LoRASpec, ParallelismSpec,
    RouterSpec, SchedulerConfigSpec, SchedulerSpec, StorageInitializerSpec, WorkloadSpec,
    LLMISVC_SHORT_NAME,
};
pub use local_model::{
    CacheSpec, LocalModelCache, LocalModelCacheSpec, LocalModelCacheStatus,
    LocalModelNamespaceCache, LocalModelNamespaceCacheSpec, LocalModelNodeGroup,
    LocalModelNodeGroupSpec, LocalModelNodeGroupStatus, ModelCopies, NodeStatus,
};
pub use types::{
    set_condition, Addressable, Condition, ConditionStatus, LocalObjectReference, NamespacedName,
    UntypedObjectReference,
};

use kube::CustomResourceExt;

/// YAML for every CRD owned by this operator, separated by `---`
pub fn all_crds_yaml() -> Result<String, serde_yaml::Error> {
    let crds = [
        LLMInferenceService::crd(),
        LLMInferenceServiceConfig::crd(),
        LocalModelCache::crd(),
        LocalModelNamespaceCache::crd(),
        LocalModelNodeGroup::crd(),
    ];
    let docs = crds
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(docs.join("---\n"))
}
