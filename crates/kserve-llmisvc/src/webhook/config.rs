//! LLMInferenceServiceConfig admission rules
//!
//! Templates in a config must render against a canonical service before the
//! config is stored. Changing or deleting a shipped preset is allowed but
//! answered with a warning.

use std::sync::Arc;

use async_trait::async_trait;
use kube::ResourceExt;
use serde_json::Value;
use tracing::debug;

use kserve_common::admission::{AdmissionResult, AdmissionValidator, Warnings};
use kserve_common::config::ConfigMapReader;
use kserve_common::crd::{
    LLMInferenceService, LLMInferenceServiceConfig, LLMInferenceServiceSpec, LLMModelSpec,
};
use kserve_common::Error;

use crate::config_merge::{replace_variables, GlobalConfig, WellKnownConfigs};

/// Validator for LLMInferenceServiceConfig
pub struct LLMInferenceServiceConfigValidator {
    config_map: Arc<dyn ConfigMapReader>,
    well_known: WellKnownConfigs,
    system_namespace: String,
}

impl LLMInferenceServiceConfigValidator {
    /// Validator reading the operator ConfigMap through `config_map`
    pub fn new(
        config_map: Arc<dyn ConfigMapReader>,
        well_known: WellKnownConfigs,
        system_namespace: impl Into<String>,
    ) -> Self {
        Self {
            config_map,
            well_known,
            system_namespace: system_namespace.into(),
        }
    }

    /// Render every template of `config` against a canonical service
    async fn check_templates(&self, config: &LLMInferenceServiceConfig) -> AdmissionResult {
        let cfg = self.config_map.inference_service_config().await?;
        let global = GlobalConfig::from_ingress(&cfg.ingress, self.system_namespace.as_str())?;
        let sample = canonical_service(config.namespace().as_deref());

        replace_variables(&sample, config, &global)?;
        debug!(config = %config.name_any(), "config templates render");
        Ok(Warnings::new())
    }

    fn well_known_warning(&self, name: &str, action: &str) -> Option<String> {
        self.well_known.contains(name).then(|| {
            format!(
                "{action} well-known LLMInferenceServiceConfig {name:?} is not recommended; \
                 it is managed by KServe and may be overwritten on upgrade"
            )
        })
    }
}

/// Service the config templates are rendered against at admission time
fn canonical_service(namespace: Option<&str>) -> LLMInferenceService {
    let mut svc = LLMInferenceService::new(
        "sample-llm",
        LLMInferenceServiceSpec {
            model: LLMModelSpec {
                uri: "hf://sample/model".to_string(),
                name: Some("sample/model".to_string()),
                ..Default::default()
            },
            ..Default::default()
        },
    );
    svc.metadata.namespace = Some(namespace.unwrap_or("default").to_string());
    svc.metadata.uid = Some("00000000-0000-0000-0000-000000000000".to_string());
    svc
}

/// Whether every field set in `new` carries the same value in `old`.
///
/// Null, empty strings, empty lists and empty objects in `new` count as unset.
/// Set lists must match `old` element by element.
fn is_derivative(new: &Value, old: &Value) -> bool {
    match (new, old) {
        (Value::Null, _) => true,
        (Value::String(n), _) if n.is_empty() => true,
        (Value::Array(n), _) if n.is_empty() => true,
        (Value::Object(n), _) if n.is_empty() => true,
        (Value::Array(n), Value::Array(o)) => {
            n.len() == o.len() && n.iter().zip(o).all(|(n, o)| is_derivative(n, o))
        }
        (Value::Object(n), Value::Object(o)) => n
            .iter()
            .all(|(key, n)| is_derivative(n, o.get(key).unwrap_or(&Value::Null))),
        (n, o) => n == o,
    }
}

fn spec_changed(old: &LLMInferenceServiceConfig, new: &LLMInferenceServiceConfig) -> Result<bool, Error> {
    let to_value = |config: &LLMInferenceServiceConfig| {
        serde_json::to_value(&config.spec)
            .map_err(|e| Error::serialization_for("LLMInferenceServiceConfig", e.to_string()))
    };
    Ok(!is_derivative(&to_value(new)?, &to_value(old)?))
}

#[async_trait]
impl AdmissionValidator<LLMInferenceServiceConfig> for LLMInferenceServiceConfigValidator {
    async fn validate_create(&self, config: &LLMInferenceServiceConfig) -> AdmissionResult {
        self.check_templates(config).await
    }

    async fn validate_update(
        &self,
        old: &LLMInferenceServiceConfig,
        new: &LLMInferenceServiceConfig,
    ) -> AdmissionResult {
        let mut warnings = self.check_templates(new).await?;
        if spec_changed(old, new)? {
            warnings.extend(self.well_known_warning(&new.name_any(), "modifying"));
        }
        Ok(warnings)
    }

    async fn validate_delete(&self, config: &LLMInferenceServiceConfig) -> AdmissionResult {
        Ok(self
            .well_known_warning(&config.name_any(), "deleting")
            .into_iter()
            .collect())
    }
}
