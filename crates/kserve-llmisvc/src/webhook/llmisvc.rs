//! LLMInferenceService admission rules
//!
//! Router: a gateway and a route are each either managed (empty struct) or
//! user supplied (refs). Mixing a user-supplied side with a managed side is
//! rejected, as is an HTTP route that carries both refs and an inline spec.
//!
//! Parallelism: pipeline and data parallelism exclude each other, `data`
//! and `dataLocal` come together, workers need a parallelism layout and the
//! derived group size is fixed once created.

use async_trait::async_trait;

use kserve_common::admission::{AdmissionResult, AdmissionValidator, FieldErrors, Warnings};
use kserve_common::crd::{LLMInferenceService, LLMInferenceServiceSpec, WorkloadSpec};

const ROUTER_PATH: &str = "spec.router";
const DECODE_PARALLELISM_PATH: &str = "spec.parallelism";
const PREFILL_PARALLELISM_PATH: &str = "spec.prefill.parallelism";

/// Stateless validator for LLMInferenceService
#[derive(Clone, Debug, Default)]
pub struct LLMInferenceServiceValidator;

#[async_trait]
impl AdmissionValidator<LLMInferenceService> for LLMInferenceServiceValidator {
    async fn validate_create(&self, svc: &LLMInferenceService) -> AdmissionResult {
        validate_spec(&svc.spec).into_result()?;
        Ok(Warnings::new())
    }

    async fn validate_update(
        &self,
        old: &LLMInferenceService,
        new: &LLMInferenceService,
    ) -> AdmissionResult {
        let mut errs = validate_spec(&new.spec);
        errs.extend(validate_size_unchanged(&old.spec, &new.spec));
        errs.into_result()?;
        Ok(Warnings::new())
    }

    async fn validate_delete(&self, _svc: &LLMInferenceService) -> AdmissionResult {
        Ok(Warnings::new())
    }
}

/// Every create-time rule for `spec`
pub fn validate_spec(spec: &LLMInferenceServiceSpec) -> FieldErrors {
    let mut errs = validate_router(spec);
    errs.extend(validate_parallelism(DECODE_PARALLELISM_PATH, &spec.workload));
    if let Some(prefill) = &spec.prefill {
        errs.extend(validate_parallelism(PREFILL_PARALLELISM_PATH, prefill));
    }
    errs
}

/// Managed versus user-supplied gateway and route combinations
pub fn validate_router(spec: &LLMInferenceServiceSpec) -> FieldErrors {
    let mut errs = FieldErrors::new();
    let Some(router) = &spec.router else {
        return errs;
    };

    let gateway_refs = router.gateway.as_ref().is_some_and(|g| g.has_refs());
    let managed_gateway = router.gateway.as_ref().is_some_and(|g| !g.has_refs());
    let http = router.route.as_ref().and_then(|r| r.http.as_ref());
    let route_refs = http.is_some_and(|h| h.has_refs());
    let route_spec = http.is_some_and(|h| h.spec.is_some());

    if router.route.as_ref().is_some_and(|r| r.is_managed()) && gateway_refs {
        errs.push(
            format!("{ROUTER_PATH}.gateway.refs"),
            "unsupported configuration: custom gateway refs cannot be used with managed route",
        );
    }
    if route_refs && route_spec {
        errs.push(
            format!("{ROUTER_PATH}.route.http"),
            "unsupported configuration: cannot use both refs and spec in route.http",
        );
    }
    if route_refs && managed_gateway {
        errs.push(
            format!("{ROUTER_PATH}.route.http.refs"),
            "unsupported configuration: custom route refs cannot be used with a managed gateway",
        );
    }
    if route_spec && gateway_refs {
        errs.push(
            format!("{ROUTER_PATH}.route.http.spec"),
            "unsupported configuration: managed route spec cannot be used with custom gateway refs",
        );
    }
    errs
}

/// Parallelism rules for one role rooted at `path`
pub fn validate_parallelism(path: &str, workload: &WorkloadSpec) -> FieldErrors {
    let mut errs = FieldErrors::new();

    if let Some(p) = &workload.parallelism {
        if p.is_pipeline_parallel() && p.is_data_parallel() {
            errs.push(
                path,
                "cannot set both pipeline parallelism and data parallelism",
            );
        }
        if p.data.is_some() && p.data_local.is_none() {
            errs.push(format!("{path}.dataLocal"), "dataLocal must be set when data is set");
        }
        if p.data_local.is_some() && p.data.is_none() {
            errs.push(format!("{path}.data"), "data must be set when dataLocal is set");
        }
    }

    if workload.worker.is_some() && !(workload.is_pipeline_parallel() || workload.is_data_parallel()) {
        errs.push(path, "when worker is specified, parallelism must be configured");
    }
    errs
}

/// The derived group size of decode and prefill must not change
pub fn validate_size_unchanged(
    old: &LLMInferenceServiceSpec,
    new: &LLMInferenceServiceSpec,
) -> FieldErrors {
    let mut errs = FieldErrors::new();

    let (old_size, new_size) = (old.workload.size(), new.workload.size());
    if old_size != new_size {
        errs.push(
            DECODE_PARALLELISM_PATH,
            size_changed_message(old_size, new_size),
        );
    }

    let old_prefill = old.prefill.as_ref().and_then(WorkloadSpec::size);
    let new_prefill = new.prefill.as_ref().and_then(WorkloadSpec::size);
    if old_prefill != new_prefill {
        errs.push(
            PREFILL_PARALLELISM_PATH,
            size_changed_message(old_prefill, new_prefill),
        );
    }
    errs
}

fn size_changed_message(old: Option<i32>, new: Option<i32>) -> String {
    let show = |s: Option<i32>| s.map_or_else(|| "unset".to_string(), |s| s.to_string());
    format!(
        "parallelism size cannot be changed (from {} to {})",
        show(old),
        show(new)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    fn sample_service(spec: Value) -> LLMInferenceService {
        let mut spec = spec;
        if let Some(obj) = spec.as_object_mut() {
            obj.entry("model")
                .or_insert_with(|| json!({"uri": "hf://facebook/opt-125m"}));
        }
        serde_json::from_value(json!({
            "apiVersion": "serving.kserve.io/v1alpha1",
            "kind": "LLMInferenceService",
            "metadata": {"name": "llm", "namespace": "ns"},
            "spec": spec
        }))
        .unwrap()
    }

    fn messages(errs: &FieldErrors) -> Vec<String> {
        errs.iter().map(|e| e.message.clone()).collect()
    }

    // =========================================================================
    // Router exclusivity grid
    // =========================================================================

    mod router {
        use super::*;

        fn gateway(kind: &str) -> Option<Value> {
            match kind {
                "nil" => None,
                "managed" => Some(json!({})),
                "refs" => Some(json!({"refs": [{"name": "gw", "namespace": "infra"}]})),
                _ => unreachable!(),
            }
        }

        fn route(kind: &str) -> Option<Value> {
            match kind {
                "nil" => None,
                "empty" => Some(json!({})),
                "refs" => Some(json!({"http": {"refs": [{"name": "my-route"}]}})),
                "spec" => Some(json!({"http": {"spec": {"hostnames": ["llm.example.com"]}}})),
                "both" => Some(json!({"http": {"refs": [{"name": "my-route"}], "spec": {}}})),
                _ => unreachable!(),
            }
        }

        fn router_errors(gw: &str, rt: &str) -> FieldErrors {
            let mut router = serde_json::Map::new();
            if let Some(g) = gateway(gw) {
                router.insert("gateway".into(), g);
            }
            if let Some(r) = route(rt) {
                router.insert("route".into(), r);
            }
            let svc = sample_service(json!({"router": router}));
            validate_router(&svc.spec)
        }

        #[test]
        fn exactly_the_mixed_combinations_are_rejected() {
            let rejected = [
                ("refs", "empty"),
                ("managed", "refs"),
                ("refs", "spec"),
            ];
            for gw in ["nil", "managed", "refs"] {
                for rt in ["nil", "empty", "refs", "spec"] {
                    let errs = router_errors(gw, rt);
                    let expect_rejected = rejected.contains(&(gw, rt));
                    assert_eq!(
                        !errs.is_empty(),
                        expect_rejected,
                        "gateway={gw} route={rt}: {errs}"
                    );
                    if expect_rejected {
                        assert!(errs.to_string().contains("unsupported configuration"));
                    }
                }
            }
        }

        #[test]
        fn refs_and_spec_together_are_rejected_for_any_gateway() {
            for gw in ["nil", "managed", "refs"] {
                let errs = router_errors(gw, "both");
                assert!(
                    messages(&errs)
                        .iter()
                        .any(|m| m.contains("cannot use both refs and spec")),
                    "gateway={gw}: {errs}"
                );
            }
        }

        #[test]
        fn messages_name_the_conflict() {
            assert!(router_errors("refs", "empty")
                .to_string()
                .contains("cannot be used with managed route"));
            assert!(router_errors("managed", "refs")
                .to_string()
                .contains("cannot be used with a managed gateway"));
        }
    }

    // =========================================================================
    // Parallelism
    // =========================================================================

    mod parallelism {
        use super::*;

        fn errors(parallelism: Value) -> Vec<String> {
            let svc = sample_service(json!({"parallelism": parallelism}));
            messages(&validate_spec(&svc.spec))
        }

        #[test]
        fn pipeline_and_data_are_exclusive() {
            let msgs = errors(json!({"pipeline": 2, "data": 4, "dataLocal": 2}));
            assert_eq!(msgs, vec!["cannot set both pipeline parallelism and data parallelism"]);
        }

        #[test]
        fn data_and_data_local_come_together() {
            assert_eq!(errors(json!({"data": 4})), vec!["dataLocal must be set when data is set"]);
            assert_eq!(
                errors(json!({"dataLocal": 2})),
                vec!["data must be set when dataLocal is set"]
            );
            assert!(errors(json!({"data": 4, "dataLocal": 2})).is_empty());
        }

        #[test]
        fn worker_requires_parallelism() {
            let svc = sample_service(json!({"worker": {"containers": []}}));
            let errs = validate_spec(&svc.spec);
            assert_eq!(
                messages(&errs),
                vec!["when worker is specified, parallelism must be configured"]
            );

            let svc = sample_service(json!({"worker": {"containers": []}, "parallelism": {"pipeline": 2}}));
            assert!(validate_spec(&svc.spec).is_empty());
        }

        #[test]
        fn prefill_is_checked_under_its_own_path() {
            let svc = sample_service(json!({"prefill": {"parallelism": {"data": 2}}}));
            let errs = validate_spec(&svc.spec);
            let paths: Vec<_> = errs.iter().map(|e| e.path.as_str()).collect();
            assert_eq!(paths, vec!["spec.prefill.parallelism.dataLocal"]);
        }
    }

    // =========================================================================
    // Update Stories
    // =========================================================================

    #[tokio::test]
    async fn story_changing_decode_size_is_rejected() {
        let old = sample_service(json!({"parallelism": {"data": 1, "dataLocal": 8}}));
        let new = sample_service(json!({"parallelism": {"data": 8, "dataLocal": 1}}));

        let err = LLMInferenceServiceValidator
            .validate_update(&old, &new)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("parallelism size cannot be changed"));
    }

    #[tokio::test]
    async fn story_changing_prefill_size_is_rejected() {
        let old = sample_service(json!({"prefill": {"parallelism": {"pipeline": 2}}}));
        let new = sample_service(json!({"prefill": {"parallelism": {"pipeline": 4}}}));

        let err = LLMInferenceServiceValidator
            .validate_update(&old, &new)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("spec.prefill.parallelism"));
    }

    #[tokio::test]
    async fn story_same_size_update_is_allowed() {
        let old = sample_service(json!({"parallelism": {"data": 8, "dataLocal": 2}, "replicas": 1}));
        let new = sample_service(json!({"parallelism": {"data": 16, "dataLocal": 4}, "replicas": 3}));

        let warnings = LLMInferenceServiceValidator
            .validate_update(&old, &new)
            .await
            .unwrap();
        assert!(warnings.is_empty());
    }

    #[tokio::test]
    async fn story_delete_is_always_allowed() {
        let svc = sample_service(json!({"router": {"gateway": {}, "route": {"http": {"refs": [{"name": "r"}]}}}}));
        assert!(LLMInferenceServiceValidator.validate_delete(&svc).await.is_ok());
    }
}
