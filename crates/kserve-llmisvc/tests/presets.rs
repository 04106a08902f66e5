//! Shipped LLMInferenceServiceConfig presets
//!
//! Every YAML under `config/llmisvc` must parse, render against a service and
//! combine into a plan the reconciler can apply.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::{json, Value};

use kserve_common::config::StorageInitializerConfig;
use kserve_common::crd::{LLMInferenceService, LLMInferenceServiceConfig};
use kserve_llmisvc::config_merge::{
    combine_base_refs_config, replace_variables, ConfigLookup, GlobalConfig, WellKnownConfigs,
    CONFIG_WORKER_PIPELINE_PARALLEL,
};
use kserve_llmisvc::controller::plan_children;

fn presets_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../../config/llmisvc")
}

fn load_presets() -> BTreeMap<String, LLMInferenceServiceConfig> {
    let mut presets = BTreeMap::new();
    for entry in std::fs::read_dir(presets_dir()).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
            continue;
        }
        let raw = std::fs::read_to_string(&path).unwrap();
        let mut cfg: LLMInferenceServiceConfig = serde_yaml::from_str(&raw)
            .unwrap_or_else(|e| panic!("{} does not parse: {e}", path.display()));
        cfg.metadata.namespace = Some("kserve".to_string());
        let name = cfg.metadata.name.clone().unwrap();
        presets.insert(name, cfg);
    }
    presets
}

fn sample_global() -> GlobalConfig {
    GlobalConfig {
        system_namespace: "kserve".to_string(),
        ingress_gateway_name: "kserve-ingress-gateway".to_string(),
        ingress_gateway_namespace: "kserve".to_string(),
    }
}

fn sample_service(spec: Value) -> LLMInferenceService {
    serde_json::from_value(json!({
        "apiVersion": "serving.kserve.io/v1alpha1",
        "kind": "LLMInferenceService",
        "metadata": {"name": "test-llm-preset", "namespace": "llm-ns", "uid": "uid-presets"},
        "spec": spec
    }))
    .unwrap()
}

/// Serves presets from the KServe namespace only
struct PresetLookup(BTreeMap<String, LLMInferenceServiceConfig>);

#[async_trait]
impl ConfigLookup for PresetLookup {
    async fn get_config(
        &self,
        name: &str,
        namespace: &str,
    ) -> kserve_common::Result<Option<LLMInferenceServiceConfig>> {
        if namespace != "kserve" {
            return Ok(None);
        }
        Ok(self.0.get(name).cloned())
    }
}

// =============================================================================
// Parsing and rendering
// =============================================================================

#[test]
fn every_well_known_config_is_shipped() {
    let presets = load_presets();
    for name in WellKnownConfigs::default().iter() {
        assert!(presets.contains_key(name), "missing preset {name}");
    }
    assert!(presets.contains_key(CONFIG_WORKER_PIPELINE_PARALLEL));
}

#[test]
fn every_preset_renders_without_leftover_expressions() {
    let svc = sample_service(json!({"model": {"uri": "hf://facebook/opt-125m", "name": "facebook/opt-125m"}}));
    for (name, cfg) in load_presets() {
        let rendered = replace_variables(&svc, &cfg, &sample_global())
            .unwrap_or_else(|e| panic!("{name} does not render: {e}"));
        let text = serde_json::to_string(&rendered).unwrap();
        assert!(!text.contains("{{"), "{name} still has template actions: {text}");
    }
}

#[test]
fn route_preset_targets_the_ingress_gateway() {
    let presets = load_presets();
    let svc = sample_service(json!({"model": {"uri": "hf://m"}}));
    let rendered = replace_variables(&svc, &presets["kserve-config-llm-router-route"], &sample_global()).unwrap();

    let spec = rendered.spec.service.router.unwrap().route.unwrap().http.unwrap().spec.unwrap();
    assert_eq!(spec.parent_refs[0].name, "kserve-ingress-gateway");
    assert_eq!(spec.parent_refs[0].namespace.as_deref(), Some("kserve"));
    assert_eq!(
        spec.rules[0].matches[0].path.as_ref().unwrap().value.as_deref(),
        Some("/llm-ns/test-llm-preset")
    );
}

// =============================================================================
// Story: a minimal service picks up the default presets
// =============================================================================

#[tokio::test]
async fn story_minimal_service_combines_into_full_plan() {
    let lookup = PresetLookup(load_presets());
    let svc = sample_service(json!({
        "model": {"uri": "hf://facebook/opt-125m", "name": "facebook/opt-125m"},
        "router": {"route": {}, "gateway": {}, "scheduler": {}}
    }));

    let combined = combine_base_refs_config(&lookup, &svc, &sample_global())
        .await
        .unwrap();
    let spec = combined.spec.service;

    let main = spec.workload.template.as_ref().unwrap().containers[0].clone();
    assert_eq!(main.name, "main");
    let args = main.args.unwrap();
    assert!(args.contains(&"facebook/opt-125m".to_string()), "{args:?}");

    let plan = plan_children(&svc, &spec, &StorageInitializerConfig::default(), &sample_global()).unwrap();
    let kinds: Vec<(&str, &str)> = plan
        .apply
        .iter()
        .map(|c| (c.kind.as_str(), c.name.as_str()))
        .collect();
    assert!(kinds.contains(&("Deployment", "test-llm-preset-kserve")), "{kinds:?}");
    assert!(kinds.contains(&("Deployment", "test-llm-preset-kserve-router-scheduler")), "{kinds:?}");
    assert!(kinds.contains(&("InferencePool", "test-llm-preset-inference-pool")), "{kinds:?}");
    assert!(kinds.contains(&("HTTPRoute", "test-llm-preset-kserve-route")), "{kinds:?}");
    assert_eq!(plan.routes, vec!["test-llm-preset-kserve-route".to_string()]);
    assert_eq!(plan.scheduler.as_deref(), Some("test-llm-preset-kserve-router-scheduler"));
}

#[tokio::test]
async fn story_pipeline_parallel_service_gets_leader_worker_set() {
    let lookup = PresetLookup(load_presets());
    let svc = sample_service(json!({
        "model": {"uri": "hf://facebook/opt-125m"},
        "parallelism": {"pipeline": 2, "tensor": 1},
        "worker": {"containers": []}
    }));

    let combined = combine_base_refs_config(&lookup, &svc, &sample_global())
        .await
        .unwrap();
    let plan = plan_children(
        &svc,
        &combined.spec.service,
        &StorageInitializerConfig::default(),
        &sample_global(),
    )
    .unwrap();

    assert!(plan
        .apply
        .iter()
        .any(|c| c.kind == "LeaderWorkerSet" && c.name == "test-llm-preset-kserve-mn"));
    assert!(plan
        .delete
        .iter()
        .any(|c| c.kind == "Deployment" && c.name == "test-llm-preset-kserve"));
}
