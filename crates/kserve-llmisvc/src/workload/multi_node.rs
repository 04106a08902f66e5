//! Multi-node workloads: one LeaderWorkerSet per serving role
//!
//! A group is one leader (the `template`, optional) plus `size - 1` workers
//! (the `worker` template). Without a leader template the workers carry the
//! workload labels themselves so the InferencePool still selects them.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{PodSpec, ServiceAccount};
use kube::ResourceExt;
use tracing::debug;

use kserve_common::config::StorageInitializerConfig;
use kserve_common::crd::{LLMInferenceService, LLMInferenceServiceSpec, WorkloadSpec};
use kserve_common::kube_utils::{child_name, owned_meta};
use kserve_common::network::lws::{RolloutStrategy, SubGroupPolicy};
use kserve_common::network::{LeaderWorkerSet, LeaderWorkerSetSpec, LeaderWorkerTemplate};
use kserve_common::Result;

use super::{
    attach_model_artifacts, base_labels, configure_routing_sidecar, decode_role,
    has_routing_sidecar, pod_template, suffix, workload_labels, Readiness,
    KSERVE_COMPONENT_LABEL, NAME_LABEL, PART_OF_LABEL, PART_OF_VALUE, ROLE_LABEL,
};

/// Annotation prefixes copied from the service onto the LeaderWorkerSet and its pods
const PROPAGATED_ANNOTATION_PREFIXES: &[&str] = &["leaderworkerset.sigs.k8s.io", "k8s.v1.cni.cncf.io"];

const RESTART_POLICY: &str = "RecreateGroupOnPodRestart";
const ROLLOUT_STRATEGY: &str = "RollingUpdate";
const STARTUP_POLICY: &str = "LeaderCreated";

/// Which serving role a LeaderWorkerSet is built for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Decode,
    Prefill,
}

impl Role {
    fn suffix(self) -> &'static str {
        match self {
            Self::Decode => suffix::MULTI_NODE,
            Self::Prefill => suffix::MULTI_NODE_PREFILL,
        }
    }

    fn component(self, part: &str) -> String {
        match self {
            Self::Decode => format!("llminferenceservice-workload-{part}"),
            Self::Prefill => format!("llminferenceservice-workload-{part}-prefill"),
        }
    }

    /// Role of the leader, which receives traffic
    fn leader_label(self, spec: &LLMInferenceServiceSpec) -> &'static str {
        match self {
            Self::Decode => decode_role(spec),
            Self::Prefill => "prefill",
        }
    }

    /// Role of leaderless workers
    fn worker_label(self) -> &'static str {
        match self {
            Self::Decode => "decode",
            Self::Prefill => "prefill",
        }
    }
}

/// Decode LeaderWorkerSet `<name>-kserve-mn`, present when workers are set
pub fn build_leader_worker_set(
    svc: &LLMInferenceService,
    spec: &LLMInferenceServiceSpec,
    storage: &StorageInitializerConfig,
    pool_name: Option<&str>,
) -> Result<Option<LeaderWorkerSet>> {
    if spec.workload.worker.is_none() {
        return Ok(None);
    }
    let routing = spec.router.as_ref().and(pool_name);
    build(svc, spec, &spec.workload, Role::Decode, storage, routing).map(Some)
}

/// Prefill LeaderWorkerSet `<name>-kserve-mn-prefill`, present when prefill workers are set
pub fn build_prefill_leader_worker_set(
    svc: &LLMInferenceService,
    spec: &LLMInferenceServiceSpec,
    storage: &StorageInitializerConfig,
) -> Result<Option<LeaderWorkerSet>> {
    let Some(prefill) = spec.prefill.as_ref().filter(|p| p.worker.is_some()) else {
        return Ok(None);
    };
    build(svc, spec, prefill, Role::Prefill, storage, None).map(Some)
}

/// ServiceAccount `<name>-kserve-mn`, present when workers are set
pub fn build_multi_node_service_account(
    svc: &LLMInferenceService,
    spec: &LLMInferenceServiceSpec,
) -> Option<ServiceAccount> {
    spec.workload
        .worker
        .as_ref()
        .map(|_| service_account(svc, Role::Decode))
}

/// ServiceAccount `<name>-kserve-mn-prefill`, present when prefill workers are set
pub fn build_prefill_multi_node_service_account(
    svc: &LLMInferenceService,
    spec: &LLMInferenceServiceSpec,
) -> Option<ServiceAccount> {
    spec.prefill
        .as_ref()
        .and_then(|p| p.worker.as_ref())
        .map(|_| service_account(svc, Role::Prefill))
}

/// Readiness from the LeaderWorkerSet's `Available` condition
pub fn leader_worker_set_readiness(lws: &LeaderWorkerSet) -> Readiness {
    let available = lws
        .status
        .as_ref()
        .and_then(|s| s.conditions.iter().find(|c| c.type_ == "Available"))
        .map(|c| (c.status.as_str(), Some(c.reason.as_str()), Some(c.message.as_str())));
    Readiness::from_available(available)
}

fn service_account(svc: &LLMInferenceService, role: Role) -> ServiceAccount {
    let name = svc.name_any();
    let labels = BTreeMap::from([
        (NAME_LABEL.to_string(), name.clone()),
        (PART_OF_LABEL.to_string(), PART_OF_VALUE.to_string()),
    ]);
    ServiceAccount {
        metadata: owned_meta(svc, child_name(&name, role.suffix()), svc.namespace(), labels),
        ..Default::default()
    }
}

fn build(
    svc: &LLMInferenceService,
    spec: &LLMInferenceServiceSpec,
    workload: &WorkloadSpec,
    role: Role,
    storage: &StorageInitializerConfig,
    pool_name: Option<&str>,
) -> Result<LeaderWorkerSet> {
    let name = svc.name_any();
    let service_account = child_name(&name, role.suffix());
    let annotations = propagated_annotations(svc);

    let mut worker_labels = base_labels(&name, &role.component("worker"));
    if workload.template.is_none() {
        worker_labels.insert(KSERVE_COMPONENT_LABEL.to_string(), "workload".to_string());
        worker_labels.insert(ROLE_LABEL.to_string(), role.worker_label().to_string());
    }
    let leader_labels = workload_labels(&name, &role.component("leader"), role.leader_label(spec));

    let prepare = |template: &PodSpec| -> Result<PodSpec> {
        let mut pod = template.clone();
        pod.service_account_name = Some(service_account.clone());
        attach_model_artifacts(spec, &mut pod, storage)?;
        if has_routing_sidecar(&pod) {
            debug!(service = %name, "multi-node pod has a routing sidecar");
            configure_routing_sidecar(&mut pod, pool_name);
        }
        Ok(pod)
    };

    let leader_template = workload
        .template
        .as_ref()
        .map(|t| prepare(t).map(|pod| pod_template(leader_labels, annotations.clone(), pod)))
        .transpose()?;
    let worker_pod = workload
        .worker
        .as_ref()
        .map(&prepare)
        .transpose()?
        .unwrap_or_default();

    let size = workload.size();
    let sub_group_policy = (role == Role::Prefill && workload.is_data_parallel())
        .then_some(size)
        .flatten()
        .map(|s| SubGroupPolicy {
            sub_group_size: Some(s),
        });

    let mut metadata = owned_meta(
        svc,
        child_name(&name, role.suffix()),
        svc.namespace(),
        worker_labels.clone(),
    );
    if !annotations.is_empty() {
        metadata.annotations = Some(annotations.clone());
    }

    Ok(LeaderWorkerSet::new(
        metadata,
        LeaderWorkerSetSpec {
            replicas: workload.replicas,
            leader_worker_template: LeaderWorkerTemplate {
                leader_template,
                worker_template: pod_template(worker_labels, annotations, worker_pod),
                size,
                restart_policy: Some(RESTART_POLICY.to_string()),
                sub_group_policy,
            },
            rollout_strategy: Some(RolloutStrategy {
                type_: ROLLOUT_STRATEGY.to_string(),
            }),
            startup_policy: Some(STARTUP_POLICY.to_string()),
        },
    ))
}

fn propagated_annotations(svc: &LLMInferenceService) -> BTreeMap<String, String> {
    svc.annotations()
        .iter()
        .filter(|(k, _)| {
            PROPAGATED_ANNOTATION_PREFIXES
                .iter()
                .any(|p| k.starts_with(p))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::*;
    use super::super::{COMPONENT_LABEL, ROUTING_SIDECAR};
    use super::*;
    use serde_json::json;

    fn storage() -> StorageInitializerConfig {
        StorageInitializerConfig::default()
    }

    fn label<'a>(labels: &'a Option<BTreeMap<String, String>>, key: &str) -> Option<&'a str> {
        labels.as_ref().and_then(|l| l.get(key)).map(String::as_str)
    }

    #[test]
    fn pipeline_parallel_group_size_and_policies() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "replicas": 2,
            "parallelism": {"pipeline": 4, "tensor": 8},
            "template": main_pod(),
            "worker": main_pod()
        }));
        let lws = build_leader_worker_set(&svc, &svc.spec, &storage(), None)
            .unwrap()
            .unwrap();

        assert_eq!(lws.metadata.name.as_deref(), Some("test-llm-kserve-mn"));
        assert_eq!(lws.spec.replicas, Some(2));
        let tpl = &lws.spec.leader_worker_template;
        assert_eq!(tpl.size, Some(4));
        assert_eq!(tpl.restart_policy.as_deref(), Some("RecreateGroupOnPodRestart"));
        assert!(tpl.sub_group_policy.is_none());
        assert_eq!(lws.spec.startup_policy.as_deref(), Some("LeaderCreated"));
        assert_eq!(
            lws.spec.rollout_strategy.as_ref().map(|r| r.type_.as_str()),
            Some("RollingUpdate")
        );
    }

    #[test]
    fn leader_carries_workload_labels_and_workers_do_not() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "parallelism": {"pipeline": 2},
            "template": main_pod(),
            "worker": main_pod()
        }));
        let lws = build_leader_worker_set(&svc, &svc.spec, &storage(), None)
            .unwrap()
            .unwrap();
        let tpl = &lws.spec.leader_worker_template;

        let leader = tpl.leader_template.as_ref().unwrap().metadata.as_ref().unwrap();
        assert_eq!(
            label(&leader.labels, COMPONENT_LABEL),
            Some("llminferenceservice-workload-leader")
        );
        assert_eq!(label(&leader.labels, ROLE_LABEL), Some("both"));

        let worker = tpl.worker_template.metadata.as_ref().unwrap();
        assert_eq!(
            label(&worker.labels, COMPONENT_LABEL),
            Some("llminferenceservice-workload-worker")
        );
        assert_eq!(label(&worker.labels, KSERVE_COMPONENT_LABEL), None);
    }

    #[test]
    fn workers_join_pool_without_leader_template() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "parallelism": {"data": 4, "dataLocal": 2},
            "worker": main_pod()
        }));
        let lws = build_leader_worker_set(&svc, &svc.spec, &storage(), None)
            .unwrap()
            .unwrap();
        let tpl = &lws.spec.leader_worker_template;
        assert!(tpl.leader_template.is_none());
        assert_eq!(tpl.size, Some(2));

        let worker = tpl.worker_template.metadata.as_ref().unwrap();
        assert_eq!(label(&worker.labels, KSERVE_COMPONENT_LABEL), Some("workload"));
        assert_eq!(label(&worker.labels, ROLE_LABEL), Some("decode"));
    }

    #[test]
    fn pods_use_multi_node_service_account_and_model() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "parallelism": {"pipeline": 2},
            "template": main_pod(),
            "worker": main_pod()
        }));
        let lws = build_leader_worker_set(&svc, &svc.spec, &storage(), None)
            .unwrap()
            .unwrap();
        let worker = lws.spec.leader_worker_template.worker_template.spec.as_ref().unwrap();
        assert_eq!(worker.service_account_name.as_deref(), Some("test-llm-kserve-mn"));
        assert_eq!(
            worker.containers[0].command.as_ref().unwrap().last().map(String::as_str),
            Some("/mnt/models")
        );

        let sa = build_multi_node_service_account(&svc, &svc.spec).unwrap();
        assert_eq!(sa.metadata.name.as_deref(), Some("test-llm-kserve-mn"));
        assert!(build_prefill_multi_node_service_account(&svc, &svc.spec).is_none());
    }

    #[test]
    fn routing_sidecar_learns_pool_name() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "parallelism": {"pipeline": 2},
            "template": sidecar_pod(),
            "worker": main_pod(),
            "router": {"scheduler": {}}
        }));
        let lws = build_leader_worker_set(&svc, &svc.spec, &storage(), Some("pool"))
            .unwrap()
            .unwrap();
        let leader = lws
            .spec
            .leader_worker_template
            .leader_template
            .as_ref()
            .unwrap()
            .spec
            .as_ref()
            .unwrap();
        let sidecar = leader
            .init_containers
            .as_ref()
            .unwrap()
            .iter()
            .find(|c| c.name == ROUTING_SIDECAR)
            .unwrap();
        assert_eq!(sidecar.env.as_ref().unwrap()[0].value.as_deref(), Some("pool"));
    }

    #[test]
    fn annotations_are_propagated_by_prefix() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "parallelism": {"pipeline": 2},
            "template": main_pod(),
            "worker": main_pod()
        }));
        let lws = build_leader_worker_set(&svc, &svc.spec, &storage(), None)
            .unwrap()
            .unwrap();
        let annotations = lws.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations.len(), 2);
        assert!(annotations.contains_key("k8s.v1.cni.cncf.io/networks"));
        assert!(!annotations.contains_key("unrelated"));

        let worker = lws.spec.leader_worker_template.worker_template.metadata.as_ref().unwrap();
        assert_eq!(worker.annotations.as_ref(), Some(annotations));
    }

    #[test]
    fn prefill_data_parallel_sets_sub_group_policy() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "parallelism": {"data": 8, "dataLocal": 4},
            "worker": main_pod(),
            "prefill": {
                "replicas": 3,
                "parallelism": {"data": 4, "dataLocal": 2},
                "worker": main_pod()
            }
        }));
        let lws = build_prefill_leader_worker_set(&svc, &svc.spec, &storage())
            .unwrap()
            .unwrap();
        assert_eq!(lws.metadata.name.as_deref(), Some("test-llm-kserve-mn-prefill"));
        assert_eq!(lws.spec.replicas, Some(3));
        let tpl = &lws.spec.leader_worker_template;
        assert_eq!(tpl.size, Some(2));
        assert_eq!(
            tpl.sub_group_policy.as_ref().and_then(|p| p.sub_group_size),
            Some(2)
        );
        let worker = tpl.worker_template.metadata.as_ref().unwrap();
        assert_eq!(
            label(&worker.labels, COMPONENT_LABEL),
            Some("llminferenceservice-workload-worker-prefill")
        );
        assert_eq!(label(&worker.labels, ROLE_LABEL), Some("prefill"));
        assert_eq!(
            tpl.worker_template.spec.as_ref().unwrap().service_account_name.as_deref(),
            Some("test-llm-kserve-mn-prefill")
        );
    }

    #[test]
    fn absent_without_workers() {
        let svc = sample_service(json!({"model": {"uri": "hf://org/llama"}, "template": main_pod()}));
        assert!(build_leader_worker_set(&svc, &svc.spec, &storage(), None)
            .unwrap()
            .is_none());
        assert!(build_prefill_leader_worker_set(&svc, &svc.spec, &storage())
            .unwrap()
            .is_none());
        assert!(build_multi_node_service_account(&svc, &svc.spec).is_none());
    }

    #[test]
    fn readiness_from_status() {
        let lws: LeaderWorkerSet = serde_json::from_value(json!({
            "metadata": {"name": "x"},
            "spec": {"leaderWorkerTemplate": {"workerTemplate": {}}},
            "status": {"conditions": [{
                "type": "Available", "status": "True", "reason": "AllGroupsReady",
                "message": "", "lastTransitionTime": "2024-01-01T00:00:00Z"
            }]}
        }))
        .unwrap();
        assert!(leader_worker_set_readiness(&lws).is_ready());
    }
}
