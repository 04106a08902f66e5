//! Managed HTTPRoute builder
//!
//! A service whose router declares a route without `http.refs` gets an
//! HTTPRoute `<name>-kserve-route`. Parent refs, rules and backends left
//! empty by the merged spec are filled in here:
//! - parents: the user's gateway refs, else the ingress gateway
//! - rules: one rule matching `/<namespace>/<name>` rewritten to `/`
//! - backends: the InferencePool when a scheduler exists, else the workload Service

use kube::ResourceExt;
use serde_json::json;

use kserve_common::crd::{LLMInferenceService, LLMInferenceServiceSpec};
use kserve_common::kube_utils::{child_name, owned_meta, HasApiResource};
use kserve_common::network::{
    BackendRef, HttpPathMatch, HttpRoute, HttpRouteMatch, HttpRouteRule, InferencePool,
    ParentRef, INFERENCE_API_GROUP,
};

use crate::config_merge::GlobalConfig;
use crate::workload::{base_labels, inference_pool_name, serving_port, suffix};

const COMPONENT: &str = "llminferenceservice-router";

/// Managed HTTPRoute suffix
pub const ROUTE_SUFFIX: &str = "-kserve-route";

/// Whether the merged spec asks for a managed HTTPRoute
pub fn has_managed_route(spec: &LLMInferenceServiceSpec) -> bool {
    spec.route()
        .is_some_and(|r| !r.http.as_ref().is_some_and(|h| h.has_refs()))
}

/// Names of user-supplied HTTPRoutes, in declaration order
pub fn referenced_routes(spec: &LLMInferenceServiceSpec) -> Vec<String> {
    spec.route()
        .and_then(|r| r.http.as_ref())
        .map(|h| h.refs.iter().map(|r| r.name.clone()).collect())
        .unwrap_or_default()
}

/// Build the managed HTTPRoute, `None` when the route is user-supplied or absent
pub fn build_http_route(
    svc: &LLMInferenceService,
    spec: &LLMInferenceServiceSpec,
    global: &GlobalConfig,
) -> Option<HttpRoute> {
    if !has_managed_route(spec) {
        return None;
    }

    let name = svc.name_any();
    let namespace = svc.namespace().unwrap_or_default();

    let mut route_spec = spec
        .route()
        .and_then(|r| r.http.as_ref())
        .and_then(|h| h.spec.clone())
        .unwrap_or_default();

    if route_spec.parent_refs.is_empty() {
        route_spec.parent_refs = parent_refs(spec, &namespace, global);
    }
    if route_spec.rules.is_empty() {
        route_spec.rules.push(default_rule(&name, &namespace));
    }
    let backend = backend_ref(&name, spec);
    for rule in &mut route_spec.rules {
        if rule.backend_refs.is_empty() {
            rule.backend_refs.push(backend.clone());
        }
    }

    Some(HttpRoute::new(
        owned_meta(
            svc,
            child_name(&name, ROUTE_SUFFIX),
            svc.namespace(),
            base_labels(&name, COMPONENT),
        ),
        route_spec,
    ))
}

fn parent_refs(spec: &LLMInferenceServiceSpec, namespace: &str, global: &GlobalConfig) -> Vec<ParentRef> {
    match spec.gateway().filter(|g| g.has_refs()) {
        Some(gateway) => gateway
            .refs
            .iter()
            .map(|r| {
                let ns = if r.namespace.is_empty() { namespace } else { r.namespace.as_str() };
                ParentRef::gateway(&r.name, ns)
            })
            .collect(),
        None => vec![ParentRef::gateway(
            &global.ingress_gateway_name,
            &global.ingress_gateway_namespace,
        )],
    }
}

fn default_rule(name: &str, namespace: &str) -> HttpRouteRule {
    HttpRouteRule {
        matches: vec![HttpRouteMatch {
            path: Some(HttpPathMatch::prefix(format!("/{namespace}/{name}"))),
            ..Default::default()
        }],
        filters: vec![json!({
            "type": "URLRewrite",
            "urlRewrite": {"path": {"type": "ReplacePrefixMatch", "replacePrefixMatch": "/"}}
        })],
        ..Default::default()
    }
}

fn backend_ref(name: &str, spec: &LLMInferenceServiceSpec) -> BackendRef {
    match inference_pool_name(name, spec) {
        Some(pool) => BackendRef {
            group: Some(INFERENCE_API_GROUP.to_string()),
            kind: Some(InferencePool::KIND.to_string()),
            name: pool,
            ..Default::default()
        },
        None => BackendRef {
            group: Some(String::new()),
            kind: Some("Service".to_string()),
            name: child_name(name, suffix::WORKLOAD_SERVICE),
            port: Some(serving_port(spec)),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workload::test_fixtures::sample_service;

    fn global() -> GlobalConfig {
        GlobalConfig {
            system_namespace: "kserve".into(),
            ingress_gateway_name: "kserve-ingress-gateway".into(),
            ingress_gateway_namespace: "kserve".into(),
        }
    }

    #[test]
    fn no_route_no_http_route() {
        let svc = sample_service(json!({"model": {"uri": "hf://org/llama"}}));
        assert!(build_http_route(&svc, &svc.spec, &global()).is_none());
    }

    #[test]
    fn referenced_routes_are_not_managed() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "router": {"route": {"http": {"refs": [{"name": "mine"}]}}}
        }));
        assert!(build_http_route(&svc, &svc.spec, &global()).is_none());
        assert_eq!(referenced_routes(&svc.spec), vec!["mine"]);
    }

    #[test]
    fn managed_route_targets_workload_service() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "router": {"route": {}, "gateway": {}}
        }));
        let route = build_http_route(&svc, &svc.spec, &global()).unwrap();
        assert_eq!(route.metadata.name.as_deref(), Some("test-llm-kserve-route"));

        let parent = &route.spec.parent_refs[0];
        assert_eq!(parent.name, "kserve-ingress-gateway");
        assert_eq!(parent.namespace.as_deref(), Some("kserve"));

        let rule = &route.spec.rules[0];
        assert_eq!(
            rule.matches[0].path.as_ref().and_then(|p| p.value.as_deref()),
            Some("/test-ns/test-llm")
        );
        let backend = &rule.backend_refs[0];
        assert_eq!(backend.kind.as_deref(), Some("Service"));
        assert_eq!(backend.name, "test-llm-kserve-workload-svc");
        assert_eq!(backend.port, Some(8000));
    }

    #[test]
    fn scheduler_routes_to_inference_pool() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "router": {"route": {}, "scheduler": {}}
        }));
        let route = build_http_route(&svc, &svc.spec, &global()).unwrap();
        let backend = &route.spec.rules[0].backend_refs[0];
        assert_eq!(backend.kind.as_deref(), Some("InferencePool"));
        assert_eq!(backend.group.as_deref(), Some(INFERENCE_API_GROUP));
        assert_eq!(backend.name, "test-llm-inference-pool");
        assert!(backend.port.is_none());
    }

    #[test]
    fn inline_spec_is_kept_and_completed() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "router": {"route": {"http": {"spec": {
                "hostnames": ["llm.example.com"],
                "rules": [{"matches": [{"path": {"type": "PathPrefix", "value": "/v1"}}]}]
            }}}}
        }));
        let route = build_http_route(&svc, &svc.spec, &global()).unwrap();
        assert_eq!(route.spec.hostnames, vec!["llm.example.com"]);
        assert_eq!(route.spec.rules.len(), 1);
        assert!(route.spec.rules[0].filters.is_empty());
        assert_eq!(route.spec.rules[0].backend_refs.len(), 1);
        assert_eq!(route.spec.parent_refs[0].name, "kserve-ingress-gateway");
    }

    #[test]
    fn user_gateway_refs_become_parents() {
        let svc = sample_service(json!({
            "model": {"uri": "hf://org/llama"},
            "router": {
                "route": {"http": {"spec": {}}},
                "gateway": {"refs": [{"name": "edge"}, {"name": "other", "namespace": "infra"}]}
            }
        }));
        let route = build_http_route(&svc, &svc.spec, &global()).unwrap();
        let parents: Vec<_> = route
            .spec
            .parent_refs
            .iter()
            .map(|p| (p.name.as_str(), p.namespace.as_deref()))
            .collect();
        assert_eq!(
            parents,
            vec![("edge", Some("test-ns")), ("other", Some("infra"))]
        );
    }
}
