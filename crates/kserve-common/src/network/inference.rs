//! Gateway API inference extension types (InferencePool, InferenceModel)

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::gateway_api::impl_api_defaults;
use crate::kube_utils::HasApiResource;

/// API group of the inference extension
pub const INFERENCE_API_GROUP: &str = "inference.networking.x-k8s.io";

// =============================================================================
// InferencePool
// =============================================================================

/// A pool of model-server pods fronted by an endpoint picker
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferencePool {
    /// API version (inference.networking.x-k8s.io/v1alpha2)
    #[serde(default = "InferencePool::default_api_version")]
    pub api_version: String,
    /// Resource kind (InferencePool)
    #[serde(default = "InferencePool::default_kind")]
    pub kind: String,
    /// Resource metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired pool state
    pub spec: InferencePoolSpec,
}

impl HasApiResource for InferencePool {
    const API_VERSION: &'static str = "inference.networking.x-k8s.io/v1alpha2";
    const KIND: &'static str = "InferencePool";
}

impl_api_defaults!(InferencePool);

impl InferencePool {
    /// Create a new InferencePool
    pub fn new(metadata: ObjectMeta, spec: InferencePoolSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// InferencePool spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferencePoolSpec {
    /// Labels selecting the model-server pods
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub selector: BTreeMap<String, String>,
    /// Port the model servers listen on
    #[serde(default)]
    pub target_port_number: i32,
    /// Endpoint picker extension
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension_ref: Option<ExtensionReference>,
}

/// Reference to the endpoint picker service
#[derive(Clone, Debug, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionReference {
    /// API group (empty for core Services)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Kind (Service)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Name of the extension service
    pub name: String,
    /// Port of the extension service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_number: Option<i32>,
    /// FailOpen or FailClose
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_mode: Option<String>,
}

// =============================================================================
// InferenceModel
// =============================================================================

/// A model name served from an InferencePool
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceModel {
    /// API version (inference.networking.x-k8s.io/v1alpha2)
    #[serde(default = "InferenceModel::default_api_version")]
    pub api_version: String,
    /// Resource kind (InferenceModel)
    #[serde(default = "InferenceModel::default_kind")]
    pub kind: String,
    /// Resource metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired model state
    pub spec: InferenceModelSpec,
}

impl HasApiResource for InferenceModel {
    const API_VERSION: &'static str = "inference.networking.x-k8s.io/v1alpha2";
    const KIND: &'static str = "InferenceModel";
}

impl_api_defaults!(InferenceModel);

impl InferenceModel {
    /// Create a new InferenceModel
    pub fn new(metadata: ObjectMeta, spec: InferenceModelSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
        }
    }
}

/// InferenceModel spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceModelSpec {
    /// Model name as requested by clients
    pub model_name: String,
    /// Request criticality
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub criticality: Option<String>,
    /// Target models (e.g. LoRA adapters) with weights
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target_models: Vec<TargetModel>,
    /// The pool serving this model
    pub pool_ref: PoolObjectReference,
}

/// Weighted target model
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TargetModel {
    /// Target model name
    pub name: String,
    /// Relative weight
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<i32>,
}

/// Reference to an InferencePool
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolObjectReference {
    /// API group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    /// Kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Pool name
    pub name: String,
}

impl PoolObjectReference {
    /// Reference the InferencePool `name`
    pub fn inference_pool(name: impl Into<String>) -> Self {
        Self {
            group: Some(INFERENCE_API_GROUP.to_string()),
            kind: Some(InferencePool::KIND.to_string()),
            name: name.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_spec_uses_camel_case() {
        let spec = InferencePoolSpec {
            selector: BTreeMap::from([("app".to_string(), "llm".to_string())]),
            target_port_number: 8000,
            extension_ref: Some(ExtensionReference {
                name: "epp".into(),
                port_number: Some(9002),
                ..Default::default()
            }),
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["targetPortNumber"], 8000);
        assert_eq!(json["extensionRef"]["portNumber"], 9002);
    }

    #[test]
    fn pool_reference_points_at_inference_pool() {
        let r = PoolObjectReference::inference_pool("p");
        assert_eq!(r.group.as_deref(), Some(INFERENCE_API_GROUP));
        assert_eq!(r.kind.as_deref(), Some("InferencePool"));
    }
}
