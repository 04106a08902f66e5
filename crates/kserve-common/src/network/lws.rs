//! LeaderWorkerSet types for multi-node model serving

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta};
use serde::{Deserialize, Serialize};

use super::gateway_api::impl_api_defaults;
use crate::kube_utils::HasApiResource;

/// A group of leader + worker pods scheduled together
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderWorkerSet {
    /// API version (leaderworkerset.x-k8s.io/v1)
    #[serde(default = "LeaderWorkerSet::default_api_version")]
    pub api_version: String,
    /// Resource kind (LeaderWorkerSet)
    #[serde(default = "LeaderWorkerSet::default_kind")]
    pub kind: String,
    /// Resource metadata
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Desired state
    pub spec: LeaderWorkerSetSpec,
    /// Observed state
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<LeaderWorkerSetStatus>,
}

impl HasApiResource for LeaderWorkerSet {
    const API_VERSION: &'static str = "leaderworkerset.x-k8s.io/v1";
    const KIND: &'static str = "LeaderWorkerSet";
}

impl_api_defaults!(LeaderWorkerSet);

impl LeaderWorkerSet {
    /// Create a new LeaderWorkerSet
    pub fn new(metadata: ObjectMeta, spec: LeaderWorkerSetSpec) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec,
            status: None,
        }
    }

    /// Whether the set reports `Available=True`
    pub fn is_available(&self) -> bool {
        self.status.as_ref().is_some_and(|s| {
            s.conditions
                .iter()
                .any(|c| c.type_ == "Available" && c.status == "True")
        })
    }
}

/// LeaderWorkerSet spec
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderWorkerSetSpec {
    /// Number of groups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    /// Template for each group
    pub leader_worker_template: LeaderWorkerTemplate,
    /// Rollout behaviour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout_strategy: Option<RolloutStrategy>,
    /// LeaderCreated or LeaderReady
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_policy: Option<String>,
}

/// Pod templates and sizing for one group
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderWorkerTemplate {
    /// Leader pod template (defaults to the worker template)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_template: Option<PodTemplateSpec>,
    /// Worker pod template
    pub worker_template: PodTemplateSpec,
    /// Pods per group, leader included
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i32>,
    /// RecreateGroupOnPodRestart or None
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<String>,
    /// Sub-grouping for data-parallel placement
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_group_policy: Option<SubGroupPolicy>,
}

/// Sub-group sizing
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SubGroupPolicy {
    /// Pods per sub-group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_group_size: Option<i32>,
}

/// Rollout strategy
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RolloutStrategy {
    /// Strategy type (RollingUpdate)
    #[serde(rename = "type")]
    pub type_: String,
}

/// LeaderWorkerSet status
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaderWorkerSetStatus {
    /// Conditions (Available, Progressing, ...)
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Groups ready
    #[serde(default)]
    pub ready_replicas: i32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn availability_follows_condition() {
        let lws: LeaderWorkerSet = serde_json::from_value(serde_json::json!({
            "metadata": {"name": "x"},
            "spec": {"leaderWorkerTemplate": {"workerTemplate": {}}},
            "status": {"conditions": [{
                "type": "Available",
                "status": "True",
                "reason": "AllGroupsReady",
                "message": "",
                "lastTransitionTime": "2024-01-01T00:00:00Z"
            }]}
        }))
        .unwrap();
        assert!(lws.is_available());
        assert_eq!(lws.api_version, "leaderworkerset.x-k8s.io/v1");
    }
}
