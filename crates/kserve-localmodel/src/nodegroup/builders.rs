//! Objects derived from a LocalModelNodeGroup
//!
//! Each node group gets one PersistentVolume, one PersistentVolumeClaim bound
//! to it and one agent DaemonSet mounting the claim. All three are named
//! `<nodegroup>-agent` and carry a controller reference to the group.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{DaemonSet, DaemonSetSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Capabilities, Container, EnvVar, EnvVarSource, NodeAffinity, NodeSelector,
    ObjectFieldSelector, PersistentVolume, PersistentVolumeClaim,
    PersistentVolumeClaimVolumeSource, PodSecurityContext, PodSpec, PodTemplateSpec,
    ResourceRequirements, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::ResourceExt;

use kserve_common::config::LocalModelConfig;
use kserve_common::crd::LocalModelNodeGroup;
use kserve_common::kube_utils::owned_meta;
use kserve_common::DEFAULT_MODEL_LOCAL_MOUNT_PATH;

/// Suffix of every object derived from a node group
pub const AGENT_SUFFIX: &str = "-agent";
/// ServiceAccount installed with KServe for the node agent
pub const AGENT_SERVICE_ACCOUNT: &str = "kserve-localmodelnode-agent";
/// Agent container name
pub const AGENT_CONTAINER: &str = "manager";

const MODELS_VOLUME: &str = "models";
const AGENT_GRACE_PERIOD_SECONDS: i64 = 10;

const APP_NAME_LABEL: &str = "app.kubernetes.io/name";
const APP_INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
const APP_MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
const APP_COMPONENT_LABEL: &str = "app.kubernetes.io/component";
const MANAGED_BY: &str = "kserve-localmodelnodegroup";

const PV_COMPONENT: &str = "localmodelnode-agent-pv";
const PVC_COMPONENT: &str = "localmodelnode-agent-pvc";
const DAEMONSET_COMPONENT: &str = "localmodelnode-agent";

/// `<nodegroup>-agent`
pub fn agent_name(node_group: &str) -> String {
    format!("{node_group}{AGENT_SUFFIX}")
}

fn agent_labels(node_group: &str, component: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_NAME_LABEL.to_string(), agent_name(node_group)),
        (APP_INSTANCE_LABEL.to_string(), node_group.to_string()),
        (APP_MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (APP_COMPONENT_LABEL.to_string(), component.to_string()),
    ])
}

/// PersistentVolume backing the group's model storage
pub fn build_persistent_volume(group: &LocalModelNodeGroup) -> PersistentVolume {
    let name = group.name_any();
    PersistentVolume {
        metadata: owned_meta(group, agent_name(&name), None, agent_labels(&name, PV_COMPONENT)),
        spec: Some(group.spec.persistent_volume_spec.clone()),
        ..Default::default()
    }
}

/// PersistentVolumeClaim in `namespace` bound to `pv_name`
pub fn build_persistent_volume_claim(
    group: &LocalModelNodeGroup,
    namespace: &str,
    pv_name: &str,
) -> PersistentVolumeClaim {
    let name = group.name_any();
    let mut spec = group.spec.persistent_volume_claim_spec.clone();
    spec.volume_name = Some(pv_name.to_string());

    PersistentVolumeClaim {
        metadata: owned_meta(
            group,
            agent_name(&name),
            Some(namespace.to_string()),
            agent_labels(&name, PVC_COMPONENT),
        ),
        spec: Some(spec),
        ..Default::default()
    }
}

fn field_env(name: &str, field_path: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value_from: Some(EnvVarSource {
            field_ref: Some(ObjectFieldSelector {
                field_path: field_path.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn agent_resources(config: &LocalModelConfig) -> ResourceRequirements {
    let list = |cpu: &str, memory: &str| {
        BTreeMap::from([
            ("cpu".to_string(), Quantity(cpu.to_string())),
            ("memory".to_string(), Quantity(memory.to_string())),
        ])
    };
    ResourceRequirements {
        requests: Some(list(
            &config.local_model_agent_cpu_request,
            &config.local_model_agent_memory_request,
        )),
        limits: Some(list(
            &config.local_model_agent_cpu_limit,
            &config.local_model_agent_memory_limit,
        )),
        ..Default::default()
    }
}

/// Restrict agent pods to the nodes the PersistentVolume is reachable from
fn agent_affinity(group: &LocalModelNodeGroup) -> Option<Affinity> {
    let required = group
        .spec
        .persistent_volume_spec
        .node_affinity
        .as_ref()
        .and_then(|a| a.required.as_ref())?;

    Some(Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: required.node_selector_terms.clone(),
            }),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Agent DaemonSet in `namespace` mounting `pvc_name`
pub fn build_agent_daemon_set(
    group: &LocalModelNodeGroup,
    config: &LocalModelConfig,
    namespace: &str,
    pvc_name: &str,
) -> DaemonSet {
    let name = group.name_any();
    let labels = agent_labels(&name, DAEMONSET_COMPONENT);

    let container = Container {
        name: AGENT_CONTAINER.to_string(),
        image: Some(config.local_model_agent_image.clone()),
        image_pull_policy: Some(config.local_model_agent_image_pull_policy.clone()),
        env: Some(vec![
            field_env("POD_NAMESPACE", "metadata.namespace"),
            field_env("NODE_NAME", "spec.nodeName"),
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(false),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            allow_privilege_escalation: Some(false),
            run_as_non_root: Some(true),
            read_only_root_filesystem: Some(true),
            ..Default::default()
        }),
        resources: Some(agent_resources(config)),
        volume_mounts: Some(vec![VolumeMount {
            name: MODELS_VOLUME.to_string(),
            mount_path: DEFAULT_MODEL_LOCAL_MOUNT_PATH.to_string(),
            read_only: Some(false),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let pod = PodSpec {
        containers: vec![container],
        affinity: agent_affinity(group),
        service_account_name: Some(AGENT_SERVICE_ACCOUNT.to_string()),
        security_context: Some(PodSecurityContext {
            run_as_non_root: Some(true),
            ..Default::default()
        }),
        termination_grace_period_seconds: Some(AGENT_GRACE_PERIOD_SECONDS),
        volumes: Some(vec![Volume {
            name: MODELS_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: pvc_name.to_string(),
                read_only: Some(false),
            }),
            ..Default::default()
        }]),
        ..Default::default()
    };

    DaemonSet {
        metadata: owned_meta(
            group,
            agent_name(&name),
            Some(namespace.to_string()),
            labels.clone(),
        ),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    annotations: Some(BTreeMap::from([(
                        "kubectl.kubernetes.io/default-container".to_string(),
                        AGENT_CONTAINER.to_string(),
                    )])),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Whether `existing` already matches `desired` on spec, labels and annotations
pub fn semantic_equals(desired: &DaemonSet, existing: &DaemonSet) -> bool {
    desired.spec == existing.spec
        && desired.metadata.labels == existing.metadata.labels
        && desired.metadata.annotations == existing.metadata.annotations
}
