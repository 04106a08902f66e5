//! LocalModel cache CRDs
//!
//! A `LocalModelCache` (cluster-scoped) or `LocalModelNamespaceCache`
//! (namespaced) asks for a model to be pre-downloaded onto the nodes of one
//! or more `LocalModelNodeGroup`s. Each node group owns the storage and the
//! node agent that performs the downloads.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PersistentVolumeClaimSpec, PersistentVolumeSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::NamespacedName;

// =============================================================================
// Cache
// =============================================================================

/// Model to cache and where to cache it
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "serving.kserve.io",
    version = "v1alpha1",
    kind = "LocalModelCache",
    plural = "localmodelcaches",
    status = "LocalModelCacheStatus",
    printcolumn = r#"{"name":"URI","type":"string","jsonPath":".spec.sourceModelUri"}"#,
    printcolumn = r#"{"name":"Version","type":"integer","jsonPath":".spec.version"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelCacheSpec {
    /// Original storage URI of the model
    pub source_model_uri: String,

    /// Disk space the model needs on each node
    pub model_size: Quantity,

    /// Node groups the model is cached on
    #[serde(default)]
    pub node_groups: Vec<String>,

    /// Monotonic version for a given `sourceModelUri`
    #[serde(default)]
    pub version: i32,
}

/// Download state of a cached model on one node
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum NodeStatus {
    /// Download not started yet
    NodeDownloadPending,
    /// Download in progress
    NodeDownloading,
    /// Model is on disk
    NodeDownloaded,
    /// Download failed
    NodeDownloadError,
}

/// Aggregate copy counts across nodes
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ModelCopies {
    /// Nodes expected to hold the model
    #[serde(default)]
    pub total: i32,
    /// Nodes that finished downloading
    #[serde(default)]
    pub available: i32,
    /// Nodes whose download failed
    #[serde(default)]
    pub failed: i32,
}

/// Observed state of a cache
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelCacheStatus {
    /// Per-node download state
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_status: BTreeMap<String, NodeStatus>,

    /// Copy counts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_copies: Option<ModelCopies>,

    /// InferenceServices bound to this cache
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inference_services: Vec<NamespacedName>,
}

/// Namespaced analogue of [`LocalModelCacheSpec`]
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "serving.kserve.io",
    version = "v1alpha1",
    kind = "LocalModelNamespaceCache",
    plural = "localmodelnamespacecaches",
    namespaced,
    status = "LocalModelCacheStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelNamespaceCacheSpec {
    /// Original storage URI of the model
    pub source_model_uri: String,

    /// Disk space the model needs on each node
    pub model_size: Quantity,

    /// Node groups the model is cached on
    #[serde(default)]
    pub node_groups: Vec<String>,

    /// Monotonic version for a given `sourceModelUri`
    #[serde(default)]
    pub version: i32,
}

// =============================================================================
// Node group
// =============================================================================

/// Storage and placement of a caching tier
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "serving.kserve.io",
    version = "v1alpha1",
    kind = "LocalModelNodeGroup",
    plural = "localmodelnodegroups",
    status = "LocalModelNodeGroupStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelNodeGroupSpec {
    /// Maximum space models may use on each node
    pub storage_limit: Quantity,

    /// Spec of the PersistentVolume created for the group
    pub persistent_volume_spec: PersistentVolumeSpec,

    /// Spec of the PersistentVolumeClaim bound to that volume
    pub persistent_volume_claim_spec: PersistentVolumeClaimSpec,
}

/// Observed state of a node group
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelNodeGroupStatus {
    /// Space currently used on the group's nodes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub used: Option<Quantity>,
    /// Space still available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available: Option<Quantity>,
}

// =============================================================================
// Shared view
// =============================================================================

/// Fields shared by both cache kinds, used by version checks
pub trait CacheSpec {
    /// `sourceModelUri`
    fn source_model_uri(&self) -> &str;
    /// `version`
    fn version(&self) -> i32;
    /// `nodeGroups`
    fn node_groups(&self) -> &[String];
}

impl CacheSpec for LocalModelCacheSpec {
    fn source_model_uri(&self) -> &str {
        &self.source_model_uri
    }
    fn version(&self) -> i32 {
        self.version
    }
    fn node_groups(&self) -> &[String] {
        &self.node_groups
    }
}

impl CacheSpec for LocalModelNamespaceCacheSpec {
    fn source_model_uri(&self) -> &str {
        &self.source_model_uri
    }
    fn version(&self) -> i32 {
        self.version
    }
    fn node_groups(&self) -> &[String] {
        &self.node_groups
    }
}
