//! Workload Service fronting every serving pod of a service

use k8s_openapi::api::core::v1::{PodSpec, Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use kserve_common::crd::{LLMInferenceService, LLMInferenceServiceSpec};
use kserve_common::kube_utils::{child_name, owned_meta};

use super::{base_labels, inference_pool_selector, suffix, MAIN_CONTAINER};

const COMPONENT: &str = "llminferenceservice-workload";

/// Port the model server listens on when the main container declares none
pub const DEFAULT_SERVING_PORT: i32 = 8000;

/// Service `<name>-kserve-workload-svc` selecting all serving pods.
///
/// Ports mirror the main container of the template (or the worker when
/// there is no template). Absent when neither pod spec is set.
pub fn build_workload_service(
    svc: &LLMInferenceService,
    spec: &LLMInferenceServiceSpec,
) -> Option<Service> {
    let pod = spec
        .workload
        .template
        .as_ref()
        .or(spec.workload.worker.as_ref())?;
    let name = svc.name_any();

    Some(Service {
        metadata: owned_meta(
            svc,
            child_name(&name, suffix::WORKLOAD_SERVICE),
            svc.namespace(),
            base_labels(&name, COMPONENT),
        ),
        spec: Some(ServiceSpec {
            type_: Some("ClusterIP".to_string()),
            selector: Some(inference_pool_selector(&name)),
            ports: Some(service_ports(pod)),
            ..Default::default()
        }),
        status: None,
    })
}

/// First port of the workload Service, used as the route backend port
pub fn serving_port(spec: &LLMInferenceServiceSpec) -> i32 {
    spec.workload
        .template
        .as_ref()
        .or(spec.workload.worker.as_ref())
        .and_then(|pod| service_ports(pod).first().map(|p| p.port))
        .unwrap_or(DEFAULT_SERVING_PORT)
}

fn service_ports(pod: &PodSpec) -> Vec<ServicePort> {
    let declared: Vec<ServicePort> = pod
        .containers
        .iter()
        .filter(|c| c.name == MAIN_CONTAINER)
        .flat_map(|c| c.ports.iter().flatten())
        .map(|p| ServicePort {
            name: p.name.clone(),
            port: p.container_port,
            target_port: Some(IntOrString::Int(p.container_port)),
            protocol: p.protocol.clone(),
            ..Default::default()
        })
        .collect();

    if !declared.is_empty() {
        return declared;
    }
    vec![ServicePort {
        name: Some("http".to_string()),
        port: DEFAULT_SERVING_PORT,
        target_port: Some(IntOrString::Int(DEFAULT_SERVING_PORT)),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }]
}

#[cfg(test)]
mod tests {
    use super::super::test_fixtures::*;
    use super::*;
    use serde_json::json;

    #[test]
    fn service_selects_all_roles_on_default_port() {
        let svc = sample_service(json!({"model": {"uri": "hf://org/llama"}, "template": main_pod()}));
        let service = build_workload_service(&svc, &svc.spec).unwrap();

        assert_eq!(
            service.metadata.name.as_deref(),
            Some("test-llm-kserve-workload-svc")
        );
        let spec = service.spec.unwrap();
        assert_eq!(spec.selector, Some(inference_pool_selector("test-llm")));
        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 8000);
        assert_eq!(ports[0].name.as_deref(), Some("http"));
    }

    #[test]
    fn declared_ports_are_mirrored() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "template": {"containers": [
                {"name": "main", "ports": [{"name": "https", "containerPort": 8443}]},
                {"name": "other", "ports": [{"name": "x", "containerPort": 1}]}
            ]}
        }));
        let ports = build_workload_service(&svc, &svc.spec)
            .unwrap()
            .spec
            .unwrap()
            .ports
            .unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 8443);
        assert_eq!(ports[0].target_port, Some(IntOrString::Int(8443)));
    }

    #[test]
    fn serving_port_defaults() {
        let svc = sample_service(json!({"model": {"uri": "hf://org/llama"}}));
        assert_eq!(serving_port(&svc.spec), DEFAULT_SERVING_PORT);
    }

    #[test]
    fn no_pod_spec_no_service() {
        let svc = sample_service(json!({"model": {"uri": "hf://org/llama"}}));
        assert!(build_workload_service(&svc, &svc.spec).is_none());
    }
}
