//! Operator configuration from the `inferenceservice-config` ConfigMap
//!
//! Each key of the ConfigMap holds a JSON document. Missing keys fall back to
//! defaults; present but malformed keys are configuration errors.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{Error, Result, INFERENCE_SERVICE_CONFIG_MAP_NAME};

/// ConfigMap key holding [`IngressConfig`]
pub const INGRESS_CONFIG_KEY: &str = "ingress";
/// ConfigMap key holding [`StorageInitializerConfig`]
pub const STORAGE_INITIALIZER_CONFIG_KEY: &str = "storageInitializer";
/// ConfigMap key holding [`LocalModelConfig`]
pub const LOCAL_MODEL_CONFIG_KEY: &str = "localModel";

const DEFAULT_INGRESS_GATEWAY: &str = "kserve/kserve-ingress-gateway";
const DEFAULT_STORAGE_INITIALIZER_IMAGE: &str = "kserve/storage-initializer:latest";
const DEFAULT_LOCAL_MODEL_AGENT_IMAGE: &str = "kserve/kserve-localmodelnode-agent:latest";

/// Ingress settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IngressConfig {
    /// Gateway API gateway used for managed routes, as `namespace/name`
    #[serde(default = "default_ingress_gateway")]
    pub kserve_ingress_gateway: String,
    /// Base domain for generated hostnames
    #[serde(default)]
    pub ingress_domain: String,
    /// Extra domains served alongside `ingress_domain`
    #[serde(default)]
    pub additional_ingress_domains: Vec<String>,
    /// Scheme of advertised URLs
    #[serde(default = "default_url_scheme")]
    pub url_scheme: String,
    /// Hostname template for generated routes
    #[serde(default)]
    pub domain_template: Option<String>,
    /// Path template for path-based routing
    #[serde(default)]
    pub path_template: Option<String>,
    /// Whether Gateway API resources are used for ingress
    #[serde(default, rename = "enableGatewayApi")]
    pub enable_gateway_api: bool,
}

fn default_ingress_gateway() -> String {
    DEFAULT_INGRESS_GATEWAY.to_string()
}

fn default_url_scheme() -> String {
    "http".to_string()
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            kserve_ingress_gateway: default_ingress_gateway(),
            ingress_domain: String::new(),
            additional_ingress_domains: Vec::new(),
            url_scheme: default_url_scheme(),
            domain_template: None,
            path_template: None,
            enable_gateway_api: false,
        }
    }
}

impl IngressConfig {
    /// Split `kserveIngressGateway` into `(namespace, name)`
    pub fn ingress_gateway(&self) -> Result<(String, String)> {
        let invalid = || {
            Error::config(format!(
                "invalid kserveIngressGateway {:?}: expected namespace/name",
                self.kserve_ingress_gateway
            ))
        };
        let (namespace, name) = self
            .kserve_ingress_gateway
            .split_once('/')
            .ok_or_else(invalid)?;
        if !is_dns1123_label(namespace) || !is_dns1123_label(name) {
            return Err(invalid());
        }
        Ok((namespace.to_string(), name.to_string()))
    }

    fn validate(&self) -> Result<()> {
        if self.path_template.as_deref().is_some_and(|p| !p.is_empty())
            && self.ingress_domain.is_empty()
        {
            return Err(Error::config(
                "ingressDomain is required if pathTemplate is given",
            ));
        }
        if self.enable_gateway_api {
            if self.kserve_ingress_gateway.is_empty() {
                return Err(Error::config(
                    "kserveIngressGateway is required when Gateway API is enabled",
                ));
            }
            self.ingress_gateway()?;
        }
        Ok(())
    }
}

/// Storage initializer settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StorageInitializerConfig {
    /// Image of the model download init container
    #[serde(default = "default_storage_initializer_image")]
    pub image: String,
    /// CPU request of the init container
    #[serde(default)]
    pub cpu_request: Option<String>,
    /// CPU limit of the init container
    #[serde(default)]
    pub cpu_limit: Option<String>,
    /// Memory request of the init container
    #[serde(default)]
    pub memory_request: Option<String>,
    /// Memory limit of the init container
    #[serde(default)]
    pub memory_limit: Option<String>,
    /// Whether `oci://` model URIs are mounted as image volumes
    #[serde(default)]
    pub enable_oci_image_source: bool,
}

fn default_storage_initializer_image() -> String {
    DEFAULT_STORAGE_INITIALIZER_IMAGE.to_string()
}

impl Default for StorageInitializerConfig {
    fn default() -> Self {
        Self {
            image: default_storage_initializer_image(),
            cpu_request: None,
            cpu_limit: None,
            memory_request: None,
            memory_limit: None,
            enable_oci_image_source: false,
        }
    }
}

/// LocalModel cache settings
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LocalModelConfig {
    /// Whether local model caching is enabled
    #[serde(default)]
    pub enabled: bool,
    /// Namespace download jobs run in
    #[serde(default)]
    pub job_namespace: String,
    /// Image of download jobs
    #[serde(default)]
    pub default_job_image: String,
    /// fsGroup of download job pods
    #[serde(default, rename = "fsGroup")]
    pub fs_group: Option<i64>,
    /// TTL of finished download jobs
    #[serde(default, rename = "jobTTLSecondsAfterFinished")]
    pub job_ttl_seconds_after_finished: Option<i32>,
    /// Node agent reconcile period
    #[serde(default)]
    pub reconcilation_frequency_in_secs: Option<i64>,
    /// Skip PV/PVC creation for node groups
    #[serde(default)]
    pub disable_volume_management: bool,
    /// Image of the node agent DaemonSet
    #[serde(default = "default_local_model_agent_image")]
    pub local_model_agent_image: String,
    /// Image pull policy of the node agent
    #[serde(default = "default_pull_policy")]
    pub local_model_agent_image_pull_policy: String,
    /// CPU request of the node agent
    #[serde(default = "default_agent_cpu_request")]
    pub local_model_agent_cpu_request: String,
    /// CPU limit of the node agent
    #[serde(default = "default_agent_cpu_limit")]
    pub local_model_agent_cpu_limit: String,
    /// Memory request of the node agent
    #[serde(default = "default_agent_memory_request")]
    pub local_model_agent_memory_request: String,
    /// Memory limit of the node agent
    #[serde(default = "default_agent_memory_limit")]
    pub local_model_agent_memory_limit: String,
}

fn default_local_model_agent_image() -> String {
    DEFAULT_LOCAL_MODEL_AGENT_IMAGE.to_string()
}

fn default_pull_policy() -> String {
    "IfNotPresent".to_string()
}

fn default_agent_cpu_request() -> String {
    "100m".to_string()
}

fn default_agent_cpu_limit() -> String {
    "100m".to_string()
}

fn default_agent_memory_request() -> String {
    "200Mi".to_string()
}

fn default_agent_memory_limit() -> String {
    "300Mi".to_string()
}

impl Default for LocalModelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            job_namespace: String::new(),
            default_job_image: String::new(),
            fs_group: None,
            job_ttl_seconds_after_finished: None,
            reconcilation_frequency_in_secs: None,
            disable_volume_management: false,
            local_model_agent_image: default_local_model_agent_image(),
            local_model_agent_image_pull_policy: default_pull_policy(),
            local_model_agent_cpu_request: default_agent_cpu_request(),
            local_model_agent_cpu_limit: default_agent_cpu_limit(),
            local_model_agent_memory_request: default_agent_memory_request(),
            local_model_agent_memory_limit: default_agent_memory_limit(),
        }
    }
}

/// All typed sections of the `inferenceservice-config` ConfigMap
#[derive(Clone, Debug, Default, PartialEq)]
pub struct InferenceServiceConfig {
    /// `ingress` key
    pub ingress: IngressConfig,
    /// `storageInitializer` key
    pub storage_initializer: StorageInitializerConfig,
    /// `localModel` key
    pub local_model: LocalModelConfig,
}

impl InferenceServiceConfig {
    /// Parse every known key of the ConfigMap
    pub fn from_config_map(cm: &ConfigMap) -> Result<Self> {
        let data = cm.data.clone().unwrap_or_default();
        Ok(Self {
            ingress: IngressConfig::from_data(&data)?,
            storage_initializer: StorageInitializerConfig::from_data(&data)?,
            local_model: LocalModelConfig::from_data(&data)?,
        })
    }
}

// =============================================================================
// ConfigMap access
// =============================================================================

/// Source of the parsed `inferenceservice-config` ConfigMap.
///
/// Webhooks and reconcilers go through this seam so tests can hand in a
/// fixed configuration.
#[async_trait]
pub trait ConfigMapReader: Send + Sync {
    /// Load and parse the operator ConfigMap
    async fn inference_service_config(&self) -> Result<InferenceServiceConfig>;
}

/// Reads the ConfigMap from the KServe namespace on every call
pub struct KubeConfigMapReader {
    client: Client,
    namespace: String,
}

impl KubeConfigMapReader {
    /// Reader for `inferenceservice-config` in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl ConfigMapReader for KubeConfigMapReader {
    async fn inference_service_config(&self) -> Result<InferenceServiceConfig> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), &self.namespace);
        let cm = api.get(INFERENCE_SERVICE_CONFIG_MAP_NAME).await?;
        InferenceServiceConfig::from_config_map(&cm)
    }
}

impl IngressConfig {
    /// Parse the `ingress` key
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> {
        let cfg: Self = parse_key(data, INGRESS_CONFIG_KEY)?;
        cfg.validate()?;
        Ok(cfg)
    }
}

impl StorageInitializerConfig {
    /// Parse the `storageInitializer` key
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> {
        parse_key(data, STORAGE_INITIALIZER_CONFIG_KEY)
    }
}

impl LocalModelConfig {
    /// Parse the `localModel` key
    pub fn from_data(data: &BTreeMap<String, String>) -> Result<Self> {
        parse_key(data, LOCAL_MODEL_CONFIG_KEY)
    }

    /// Parse the `localModel` key of a ConfigMap
    pub fn from_config_map(cm: &ConfigMap) -> Result<Self> {
        Self::from_data(&cm.data.clone().unwrap_or_default())
    }
}

fn parse_key<T: DeserializeOwned + Default>(data: &BTreeMap<String, String>, key: &str) -> Result<T> {
    match data.get(key) {
        Some(raw) if !raw.trim().is_empty() => serde_json::from_str(raw).map_err(|e| {
            Error::config(format!("unable to parse {key} config json: {e}"))
        }),
        _ => Ok(T::default()),
    }
}

fn is_dns1123_label(s: &str) -> bool {
    !s.is_empty()
        && s.len() <= 63
        && s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && !s.starts_with('-')
        && !s.ends_with('-')
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn missing_keys_use_defaults() {
        let cfg = InferenceServiceConfig::from_config_map(&ConfigMap::default()).unwrap();
        assert_eq!(cfg, InferenceServiceConfig::default());
        assert!(!cfg.local_model.enabled);
        assert!(cfg.local_model.job_namespace.is_empty());
        assert_eq!(cfg.ingress.url_scheme, "http");
    }

    #[test]
    fn local_model_fields_parse() {
        let cfg = LocalModelConfig::from_data(&data(&[(
            LOCAL_MODEL_CONFIG_KEY,
            r#"{
                "enabled": true,
                "jobNamespace": "test-ns",
                "defaultJobImage": "test-image",
                "fsGroup": 1000,
                "jobTTLSecondsAfterFinished": 3600,
                "reconcilationFrequencyInSecs": 60,
                "disableVolumeManagement": true,
                "localModelAgentImage": "agent:v1"
            }"#,
        )]))
        .unwrap();
        assert!(cfg.enabled);
        assert_eq!(cfg.job_namespace, "test-ns");
        assert_eq!(cfg.fs_group, Some(1000));
        assert_eq!(cfg.job_ttl_seconds_after_finished, Some(3600));
        assert_eq!(cfg.reconcilation_frequency_in_secs, Some(60));
        assert!(cfg.disable_volume_management);
        assert_eq!(cfg.local_model_agent_image, "agent:v1");
        assert_eq!(cfg.local_model_agent_memory_limit, "300Mi");
    }

    #[test]
    fn malformed_json_is_a_config_error() {
        let err = LocalModelConfig::from_data(&data(&[(LOCAL_MODEL_CONFIG_KEY, "invalid-json")]))
            .unwrap_err();
        assert!(err.to_string().contains("unable to parse localModel config json"));
    }

    #[test]
    fn ingress_gateway_splits_namespace_and_name() {
        let cfg = IngressConfig::from_data(&data(&[(
            INGRESS_CONFIG_KEY,
            r#"{"kserveIngressGateway": "kserve/kserve-ingress-gateway", "ingressDomain": "example.com", "urlScheme": "https"}"#,
        )]))
        .unwrap();
        assert_eq!(
            cfg.ingress_gateway().unwrap(),
            ("kserve".to_string(), "kserve-ingress-gateway".to_string())
        );
        assert_eq!(cfg.url_scheme, "https");
    }

    #[test]
    fn ingress_gateway_format_is_checked() {
        for bad in ["invalid-format", "invalid_namespace/gw", "kserve/invalid_name"] {
            let cfg = IngressConfig {
                kserve_ingress_gateway: bad.to_string(),
                ..Default::default()
            };
            assert!(cfg.ingress_gateway().is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn path_template_requires_domain() {
        let err = IngressConfig::from_data(&data(&[(
            INGRESS_CONFIG_KEY,
            r#"{"pathTemplate": "/serving/{{ .Namespace }}/{{ .Name }}"}"#,
        )]))
        .unwrap_err();
        assert!(err
            .to_string()
            .contains("ingressDomain is required if pathTemplate is given"));
    }

    #[test]
    fn storage_initializer_oci_flag() {
        let cfg = StorageInitializerConfig::from_data(&data(&[(
            STORAGE_INITIALIZER_CONFIG_KEY,
            r#"{"image": "si:v1", "enableOciImageSource": true}"#,
        )]))
        .unwrap();
        assert_eq!(cfg.image, "si:v1");
        assert!(cfg.enable_oci_image_source);
    }
}
