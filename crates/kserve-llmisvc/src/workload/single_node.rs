//! Single-node workloads: one Deployment per serving role

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::ResourceExt;
use tracing::debug;

use kserve_common::config::StorageInitializerConfig;
use kserve_common::crd::{LLMInferenceService, LLMInferenceServiceSpec};
use kserve_common::kube_utils::{child_name, owned_meta};
use kserve_common::Result;

use super::{
    attach_model_artifacts, base_labels, configure_routing_sidecar, decode_role,
    has_routing_sidecar, pod_template, suffix, workload_labels, Readiness,
};

const COMPONENT: &str = "llminferenceservice-workload";
const PREFILL_COMPONENT: &str = "llminferenceservice-workload-prefill";

/// Decode (or combined) Deployment `<name>-kserve`.
///
/// Absent when workers are configured; the LeaderWorkerSet takes over.
pub fn build_deployment(
    svc: &LLMInferenceService,
    spec: &LLMInferenceServiceSpec,
    storage: &StorageInitializerConfig,
    pool_name: Option<&str>,
) -> Result<Option<Deployment>> {
    if spec.workload.worker.is_some() {
        return Ok(None);
    }

    let name = svc.name_any();
    let labels = workload_labels(&name, COMPONENT, decode_role(spec));

    let mut pod = spec.workload.template.clone().unwrap_or_default();
    if has_routing_sidecar(&pod) {
        debug!(service = %name, "main container has a routing sidecar");
        pod.service_account_name = Some(child_name(&name, suffix::MAIN));
        if spec.router.is_some() {
            configure_routing_sidecar(&mut pod, pool_name);
        }
    }
    attach_model_artifacts(spec, &mut pod, storage)?;

    Ok(Some(deployment(
        svc,
        child_name(&name, suffix::MAIN),
        labels,
        spec.workload.replicas,
        pod,
    )))
}

/// Prefill Deployment `<name>-kserve-prefill`, present for single-node prefill
pub fn build_prefill_deployment(
    svc: &LLMInferenceService,
    spec: &LLMInferenceServiceSpec,
    storage: &StorageInitializerConfig,
) -> Result<Option<Deployment>> {
    let Some(prefill) = spec.prefill.as_ref().filter(|p| p.worker.is_none()) else {
        return Ok(None);
    };

    let name = svc.name_any();
    let labels = workload_labels(&name, PREFILL_COMPONENT, "prefill");

    let mut pod = prefill.template.clone().unwrap_or_default();
    attach_model_artifacts(spec, &mut pod, storage)?;

    Ok(Some(deployment(
        svc,
        child_name(&name, suffix::PREFILL),
        labels,
        prefill.replicas,
        pod,
    )))
}

/// ServiceAccount `<name>-kserve` for a decode Deployment with a routing sidecar
pub fn build_service_account(
    svc: &LLMInferenceService,
    deployment: Option<&Deployment>,
) -> Option<ServiceAccount> {
    let pod = deployment?.spec.as_ref()?.template.spec.as_ref()?;
    if !has_routing_sidecar(pod) {
        return None;
    }
    let name = svc.name_any();
    Some(ServiceAccount {
        metadata: owned_meta(
            svc,
            child_name(&name, suffix::MAIN),
            svc.namespace(),
            base_labels(&name, COMPONENT),
        ),
        ..Default::default()
    })
}

/// Readiness from the Deployment's `Available` condition
pub fn deployment_readiness(deployment: &Deployment) -> Readiness {
    let available = deployment
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|c| c.iter().find(|c| c.type_ == "Available"))
        .map(|c| (c.status.as_str(), c.reason.as_deref(), c.message.as_deref()));
    Readiness::from_available(available)
}

fn deployment(
    svc: &LLMInferenceService,
    name: String,
    labels: BTreeMap<String, String>,
    replicas: Option<i32>,
    pod: k8s_openapi::api::core::v1::PodSpec,
) -> Deployment {
    Deployment {
        metadata: owned_meta(svc, name, svc.namespace(), labels.clone()),
        spec: Some(DeploymentSpec {
            replicas,
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

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::*;
    use super::super::{KSERVE_COMPONENT_LABEL, ROLE_LABEL, ROUTING_SIDECAR};
    use super::*;
    use serde_json::json;

    fn storage() -> StorageInitializerConfig {
        StorageInitializerConfig::default()
    }

    fn labels_of(d: &Deployment) -> &BTreeMap<String, String> {
        d.metadata.labels.as_ref().unwrap()
    }

    #[test]
    fn decode_deployment_has_role_both_without_prefill() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "replicas": 2,
            "template": main_pod()
        }));
        let d = build_deployment(&svc, &svc.spec, &storage(), None)
            .unwrap()
            .unwrap();

        assert_eq!(d.metadata.name.as_deref(), Some("test-llm-kserve"));
        assert_eq!(labels_of(&d).get(ROLE_LABEL).map(String::as_str), Some("both"));
        assert_eq!(
            labels_of(&d).get(KSERVE_COMPONENT_LABEL).map(String::as_str),
            Some("workload")
        );
        let spec = d.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(2));
        assert_eq!(spec.selector.match_labels.as_ref(), Some(labels_of(&d)));
        assert_eq!(
            d.metadata.owner_references.as_ref().unwrap()[0].uid,
            "uid-1"
        );
    }

    #[test]
    fn decode_role_with_prefill() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "template": main_pod(),
            "prefill": {"replicas": 1, "template": main_pod()}
        }));
        let d = build_deployment(&svc, &svc.spec, &storage(), None)
            .unwrap()
            .unwrap();
        assert_eq!(labels_of(&d).get(ROLE_LABEL).map(String::as_str), Some("decode"));

        let p = build_prefill_deployment(&svc, &svc.spec, &storage())
            .unwrap()
            .unwrap();
        assert_eq!(p.metadata.name.as_deref(), Some("test-llm-kserve-prefill"));
        assert_eq!(labels_of(&p).get(ROLE_LABEL).map(String::as_str), Some("prefill"));
        assert_eq!(p.spec.as_ref().unwrap().replicas, Some(1));
    }

    #[test]
    fn worker_suppresses_deployment() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "worker": main_pod(),
            "parallelism": {"pipeline": 2}
        }));
        assert!(build_deployment(&svc, &svc.spec, &storage(), None)
            .unwrap()
            .is_none());
    }

    #[test]
    fn routing_sidecar_gets_service_account_and_pool() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "template": sidecar_pod(),
            "router": {"scheduler": {}}
        }));
        let d = build_deployment(&svc, &svc.spec, &storage(), Some("test-llm-inference-pool"))
            .unwrap()
            .unwrap();
        let pod = d.spec.as_ref().unwrap().template.spec.as_ref().unwrap();
        assert_eq!(pod.service_account_name.as_deref(), Some("test-llm-kserve"));

        let sidecar = pod
            .init_containers
            .as_ref()
            .unwrap()
            .iter()
            .find(|c| c.name == ROUTING_SIDECAR)
            .unwrap();
        let env = sidecar.env.as_ref().unwrap();
        assert_eq!(env[0].name, "INFERENCE_POOL_NAME");
        assert_eq!(env[0].value.as_deref(), Some("test-llm-inference-pool"));

        let sa = build_service_account(&svc, Some(&d)).unwrap();
        assert_eq!(sa.metadata.name.as_deref(), Some("test-llm-kserve"));
    }

    #[test]
    fn no_sidecar_no_service_account() {
        let svc = sample_service(json!({"model": {"uri": "hf://org/llama"}, "template": main_pod()}));
        let d = build_deployment(&svc, &svc.spec, &storage(), None)
            .unwrap()
            .unwrap();
        assert!(build_service_account(&svc, Some(&d)).is_none());
        assert!(build_service_account(&svc, None).is_none());
    }

    #[test]
    fn model_is_attached_to_main_container() {
        let svc = sample_service(json!({"model": {"uri": "hf://org/llama"}, "template": main_pod()}));
        let d = build_deployment(&svc, &svc.spec, &storage(), None)
            .unwrap()
            .unwrap();
        let pod = d.spec.unwrap().template.spec.unwrap();
        assert_eq!(
            pod.containers[0].command.as_ref().unwrap().last().map(String::as_str),
            Some("/mnt/models")
        );
        assert_eq!(pod.init_containers.unwrap()[0].name, "storage-initializer");
    }

    #[test]
    fn readiness_reads_available_condition() {
        let d: Deployment = serde_json::from_value(json!({
            "metadata": {"name": "x"},
            "status": {"conditions": [{
                "type": "Available", "status": "False",
                "reason": "MinimumReplicasUnavailable", "message": "0/1 ready"
            }]}
        }))
        .unwrap();
        assert_eq!(
            deployment_readiness(&d),
            Readiness::NotReady {
                reason: "MinimumReplicasUnavailable".into(),
                message: "0/1 ready".into()
            }
        );
        assert_eq!(deployment_readiness(&Deployment::default()), Readiness::Progressing);
    }
}
