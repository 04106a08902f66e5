//! Minimal view of the v1beta1 InferenceService
//!
//! The LocalModel admission checks only look at metadata, so `spec` and
//! status are kept as opaque JSON.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::kube_utils::HasApiResource;
use crate::network::gateway_api::impl_api_defaults;
use crate::LOCAL_MODEL_LABEL;

/// `serving.kserve.io/v1beta1` InferenceService
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferenceService {
    /// API version
    #[serde(default = "InferenceService::default_api_version")]
    pub api_version: String,
    /// Resource kind
    #[serde(default = "InferenceService::default_kind")]
    pub kind: String,
    /// Resource metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Untyped spec
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub spec: serde_json::Value,
    /// Untyped status
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub status: serde_json::Value,
}

impl HasApiResource for InferenceService {
    const API_VERSION: &'static str = "serving.kserve.io/v1beta1";
    const KIND: &'static str = "InferenceService";
}

impl_api_defaults!(InferenceService);

impl InferenceService {
    /// Name of the LocalModelCache this service is bound to, if any
    pub fn local_model(&self) -> Option<&str> {
        self.metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(LOCAL_MODEL_LABEL))
            .map(String::as_str)
    }
}
