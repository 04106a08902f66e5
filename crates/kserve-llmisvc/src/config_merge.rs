//! Preset selection, spec merging and template substitution
//!
//! An LLMInferenceService is never reconciled from its own spec alone. The
//! effective spec is built by layering, lowest priority first:
//!
//! 1. well-known presets implied by the service shape (scheduler, route,
//!    one workload template)
//! 2. the service's explicit `baseRefs`
//! 3. the service spec itself
//!
//! and then substituting `{{ ... }}` expressions against the service.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use schemars::JsonSchema;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kserve_common::config::IngressConfig;
use kserve_common::crd::{
    LLMInferenceService, LLMInferenceServiceConfig, LLMInferenceServiceSpec,
    LLMInferenceServiceStatus, LocalObjectReference,
};
use kserve_common::kube_utils::child_name;
use kserve_common::template::TemplateEngine;
use kserve_common::{Error, Result};

use crate::workload::inference_pool_selector;

// =============================================================================
// Preset names
// =============================================================================

/// Single-node workload
pub const CONFIG_TEMPLATE: &str = "kserve-config-llm-template";
/// Single-node decode workload when prefill is disaggregated
pub const CONFIG_DECODE_TEMPLATE: &str = "kserve-config-llm-decode-template";
/// Single-node prefill workload
pub const CONFIG_PREFILL_TEMPLATE: &str = "kserve-config-llm-prefill-template";
/// Multi-node data parallel workload
pub const CONFIG_WORKER_DATA_PARALLEL: &str = "kserve-config-llm-worker-data-parallel";
/// Multi-node data parallel decode workload
pub const CONFIG_DECODE_WORKER_DATA_PARALLEL: &str =
    "kserve-config-llm-decode-worker-data-parallel";
/// Multi-node data parallel prefill workload
pub const CONFIG_PREFILL_WORKER_DATA_PARALLEL: &str =
    "kserve-config-llm-prefill-worker-data-parallel";
/// Multi-node pipeline parallel workload
pub const CONFIG_WORKER_PIPELINE_PARALLEL: &str = "kserve-config-llm-worker-pipeline-parallel";
/// Multi-node pipeline parallel decode workload
pub const CONFIG_DECODE_WORKER_PIPELINE_PARALLEL: &str =
    "kserve-config-llm-decode-worker-pipeline-parallel";
/// Multi-node pipeline parallel prefill workload
pub const CONFIG_PREFILL_WORKER_PIPELINE_PARALLEL: &str =
    "kserve-config-llm-prefill-worker-pipeline-parallel";
/// Endpoint-picker scheduler
pub const CONFIG_ROUTER_SCHEDULER: &str = "kserve-config-llm-scheduler";
/// Managed HTTPRoute
pub const CONFIG_ROUTER_ROUTE: &str = "kserve-config-llm-router-route";

/// Presets shipped with KServe whose modification deserves a warning.
///
/// The pipeline parallel presets are selectable but not yet part of the set.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WellKnownConfigs(BTreeSet<String>);

impl WellKnownConfigs {
    /// Set containing exactly `names`
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    /// Whether `name` is a shipped preset
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains(name)
    }

    /// Preset names in sorted order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl Default for WellKnownConfigs {
    fn default() -> Self {
        Self::new([
            CONFIG_TEMPLATE,
            CONFIG_DECODE_TEMPLATE,
            CONFIG_WORKER_DATA_PARALLEL,
            CONFIG_DECODE_WORKER_DATA_PARALLEL,
            CONFIG_PREFILL_TEMPLATE,
            CONFIG_PREFILL_WORKER_DATA_PARALLEL,
            CONFIG_ROUTER_SCHEDULER,
            CONFIG_ROUTER_ROUTE,
        ])
    }
}

// =============================================================================
// Template data
// =============================================================================

/// Operator-wide values exposed to templates as `.GlobalConfig`
#[derive(Clone, Debug, Default, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GlobalConfig {
    /// Namespace KServe runs in
    pub system_namespace: String,
    /// Name of the managed ingress Gateway
    pub ingress_gateway_name: String,
    /// Namespace of the managed ingress Gateway
    pub ingress_gateway_namespace: String,
}

impl GlobalConfig {
    /// Derive from the `ingress` ConfigMap section
    pub fn from_ingress(ingress: &IngressConfig, system_namespace: impl Into<String>) -> Result<Self> {
        let (ingress_gateway_namespace, ingress_gateway_name) = ingress.ingress_gateway()?;
        Ok(Self {
            system_namespace: system_namespace.into(),
            ingress_gateway_name,
            ingress_gateway_namespace,
        })
    }
}

/// Document templates are evaluated against
#[derive(Serialize, JsonSchema)]
struct TemplateData {
    #[serde(rename = "ObjectMeta")]
    object_meta: ObjectMeta,
    #[serde(rename = "Spec")]
    spec: LLMInferenceServiceSpec,
    #[serde(rename = "Status")]
    status: LLMInferenceServiceStatus,
    #[serde(rename = "GlobalConfig")]
    global_config: GlobalConfig,
}

static ENGINE: LazyLock<TemplateEngine> = LazyLock::new(|| {
    TemplateEngine::new(schemars::schema_for!(TemplateData), "LLMInferenceService")
        .with_promoted("ObjectMeta")
});

/// Substitute every `{{ ... }}` expression in `config` using `svc`.
///
/// Syntax errors surface as "failed to parse template config", evaluation
/// errors (unknown fields included) as "failed to merge config".
pub fn replace_variables(
    svc: &LLMInferenceService,
    config: &LLMInferenceServiceConfig,
    global: &GlobalConfig,
) -> Result<LLMInferenceServiceConfig> {
    let doc = serde_json::to_value(config)
        .map_err(|e| Error::serialization_for("LLMInferenceServiceConfig", e.to_string()))?;
    let data = serde_json::to_value(TemplateData {
        object_meta: svc.metadata.clone(),
        spec: svc.spec.clone(),
        status: svc.status.clone().unwrap_or_default(),
        global_config: global.clone(),
    })
    .map_err(|e| Error::serialization_for("LLMInferenceService", e.to_string()))?;

    let rendered = ENGINE.render_document("config", doc, &data).map_err(|e| {
        if e.is_parse() {
            Error::template(format!("failed to parse template config: {e}"))
        } else {
            Error::template(format!("failed to merge config: {e}"))
        }
    })?;

    serde_json::from_value(rendered).map_err(|e| {
        Error::template(format!("failed to unmarshal config from template: {e}"))
    })
}

// =============================================================================
// Merging
// =============================================================================

/// List fields merged element-wise, with the key identifying an element
const MERGE_KEYS: &[(&str, &str)] = &[
    ("containers", "name"),
    ("initContainers", "name"),
    ("volumes", "name"),
    ("env", "name"),
    ("volumeMounts", "mountPath"),
    ("ports", "containerPort"),
];

/// Recursively merge `overlay` onto `base`.
///
/// Objects merge key by key. Lists named in the merge table merge element by
/// key and append unknown elements. Every other value in `overlay` replaces
/// the one in `base`. Nulls in `overlay` are ignored.
pub fn merge_json(base: &mut Value, overlay: Value) {
    merge_value(base, overlay, None);
}

fn merge_value(base: &mut Value, overlay: Value, field: Option<&str>) {
    match (base, overlay) {
        (_, Value::Null) => {}
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_value(existing, value, Some(&key)),
                    None if value.is_null() => {}
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (Value::Array(base_items), Value::Array(overlay_items)) => {
            match field.and_then(merge_key) {
                Some(key) if keyed(base_items, key) && keyed(&overlay_items, key) => {
                    for item in overlay_items {
                        let pos = base_items.iter().position(|b| b.get(key) == item.get(key));
                        match pos {
                            Some(i) => merge_value(&mut base_items[i], item, None),
                            None => base_items.push(item),
                        }
                    }
                }
                _ => *base_items = overlay_items,
            }
        }
        (base, overlay) => *base = overlay,
    }
}

fn merge_key(field: &str) -> Option<&'static str> {
    MERGE_KEYS
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, key)| *key)
}

fn keyed(items: &[Value], key: &str) -> bool {
    items.iter().all(|i| i.get(key).is_some())
}

/// Merge `specs` in order, later entries winning
pub fn merge_specs<'a, I>(specs: I) -> Result<LLMInferenceServiceSpec>
where
    I: IntoIterator<Item = &'a LLMInferenceServiceSpec>,
{
    let mut merged = Value::Object(Default::default());
    for spec in specs {
        let overlay = serde_json::to_value(spec)
            .map_err(|e| Error::serialization_for("LLMInferenceServiceSpec", e.to_string()))?;
        merge_json(&mut merged, overlay);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::serialization_for("LLMInferenceServiceSpec", format!("failed to merge specs: {e}")))
}

// =============================================================================
// Config lookup
// =============================================================================

/// Read access to LLMInferenceServiceConfig objects
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ConfigLookup: Send + Sync {
    /// Get a config by name and namespace, `None` if absent
    async fn get_config(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Option<LLMInferenceServiceConfig>>;
}

/// Fetch `name` from the service namespace, falling back to the KServe namespace
async fn get_config(
    lookup: &dyn ConfigLookup,
    name: &str,
    namespace: &str,
    system_namespace: &str,
) -> Result<LLMInferenceServiceConfig> {
    if let Some(cfg) = lookup.get_config(name, namespace).await? {
        return Ok(cfg);
    }
    if let Some(cfg) = lookup.get_config(name, system_namespace).await? {
        return Ok(cfg);
    }
    Err(Error::config(format!(
        "failed to get LLMInferenceServiceConfig {name:?} from namespaces [{namespace:?}, {system_namespace:?}]"
    )))
}

/// Presets implied by the shape of `spec`, in merge order
pub fn implicit_presets(spec: &LLMInferenceServiceSpec) -> Vec<&'static str> {
    let mut refs = Vec::new();

    if spec.scheduler().is_some_and(|s| !s.has_pool_ref()) {
        refs.push(CONFIG_ROUTER_SCHEDULER);
    }
    if spec
        .route()
        .is_some_and(|r| !r.http.as_ref().is_some_and(|h| h.has_refs()))
    {
        refs.push(CONFIG_ROUTER_ROUTE);
    }

    match &spec.prefill {
        Some(prefill) if prefill.worker.is_none() => {
            refs.push(CONFIG_PREFILL_TEMPLATE);
            refs.push(CONFIG_DECODE_TEMPLATE);
        }
        Some(prefill) if prefill.is_pipeline_parallel() => {
            refs.push(CONFIG_DECODE_WORKER_PIPELINE_PARALLEL);
            refs.push(CONFIG_PREFILL_WORKER_PIPELINE_PARALLEL);
        }
        Some(prefill) if prefill.is_data_parallel() => {
            refs.push(CONFIG_DECODE_WORKER_DATA_PARALLEL);
            refs.push(CONFIG_PREFILL_WORKER_DATA_PARALLEL);
        }
        _ if spec.workload.worker.is_some() && spec.workload.is_pipeline_parallel() => {
            refs.push(CONFIG_WORKER_PIPELINE_PARALLEL);
        }
        _ if spec.workload.worker.is_some() && spec.workload.is_data_parallel() => {
            refs.push(CONFIG_WORKER_DATA_PARALLEL);
        }
        _ => refs.push(CONFIG_TEMPLATE),
    }

    refs
}

/// Build the effective config for `svc`.
///
/// Explicit `baseRefs` are merged first to learn which features are enabled,
/// which decides the implicit presets. The final merge order is implicit
/// presets, then `baseRefs`, then the service spec. Defaults that depend on
/// the service name are filled in before templates are substituted.
pub async fn combine_base_refs_config(
    lookup: &dyn ConfigLookup,
    svc: &LLMInferenceService,
    global: &GlobalConfig,
) -> Result<LLMInferenceServiceConfig> {
    let name = svc.name_any();
    let namespace = svc.namespace().unwrap_or_default();
    let system_namespace = global.system_namespace.as_str();

    let mut base_configs = Vec::with_capacity(svc.spec.base_refs.len());
    for base_ref in &svc.spec.base_refs {
        base_configs.push(get_config(lookup, &base_ref.name, &namespace, system_namespace).await?);
    }

    let resolved = merge_specs(
        std::iter::once(&svc.spec).chain(base_configs.iter().map(|c| &c.spec.service)),
    )?;

    let mut svc = svc.clone();
    if resolved.model.name.is_some() {
        svc.spec.model.name = resolved.model.name.clone();
    }

    let refs: Vec<LocalObjectReference> = implicit_presets(&resolved)
        .into_iter()
        .map(LocalObjectReference::new)
        .chain(svc.spec.base_refs.iter().cloned())
        .collect();
    debug!(service = %name, presets = ?refs.iter().map(|r| &r.name).collect::<Vec<_>>(), "merging presets");

    let mut layers = Vec::with_capacity(refs.len());
    for r in &refs {
        layers.push(get_config(lookup, &r.name, &namespace, system_namespace).await?);
    }
    let mut spec = merge_specs(
        layers
            .iter()
            .map(|c| &c.spec.service)
            .chain(std::iter::once(&svc.spec)),
    )?;

    apply_name_defaults(&name, &mut spec);

    let combined = LLMInferenceServiceConfig {
        metadata: svc.metadata.clone(),
        spec: spec.into(),
    };
    replace_variables(&svc, &combined, global)
}

/// Fill in defaults derived from the service name
fn apply_name_defaults(name: &str, spec: &mut LLMInferenceServiceSpec) {
    let Some(scheduler) = spec.router.as_mut().and_then(|r| r.scheduler.as_mut()) else {
        return;
    };

    if let Some(pool_spec) = scheduler.pool.as_mut().and_then(|p| p.spec.as_mut()) {
        if pool_spec.selector.is_empty() {
            pool_spec.selector = inference_pool_selector(name);
        }
    }

    if let Some(template) = scheduler.template.as_mut() {
        if template
            .service_account_name
            .as_deref()
            .map_or(true, str::is_empty)
        {
            template.service_account_name = Some(child_name(name, "-epp-sa"));
        }
    }
}
