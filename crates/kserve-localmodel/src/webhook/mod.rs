//! Validating webhooks for LocalModelCache and LocalModelNamespaceCache

mod cache;

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::admission::AdmissionReview;
use kube::Client;
use serde_json::Value;

#[cfg(test)]
use mockall::automock;

use kserve_common::admission::{parse_review, review, WebhookError};
use kserve_common::crd::{InferenceService, LocalModelCache, LocalModelNamespaceCache, LocalModelNodeGroup};
use kserve_common::kube_utils::{ignore_not_found, HasApiResource};
use kserve_common::{Error, Result};

pub use cache::{LocalModelCacheValidator, LocalModelNamespaceCacheValidator};

/// Path of the LocalModelCache validating webhook
pub const LOCAL_MODEL_CACHE_WEBHOOK_PATH: &str = "/validate-serving-kserve-io-v1alpha1-localmodelcache";
/// Path of the LocalModelNamespaceCache validating webhook
pub const LOCAL_MODEL_NAMESPACE_CACHE_WEBHOOK_PATH: &str =
    "/validate-serving-kserve-io-v1alpha1-localmodelnamespacecache";

/// Cluster reads needed by the cache validators
#[cfg_attr(test, automock)]
#[async_trait]
pub trait LocalModelReader: Send + Sync {
    /// Every LocalModelCache in the cluster
    async fn list_caches(&self) -> Result<Vec<LocalModelCache>>;

    /// Every LocalModelNamespaceCache in `namespace`
    async fn list_namespace_caches(&self, namespace: &str) -> Result<Vec<LocalModelNamespaceCache>>;

    /// Get an InferenceService, `None` if absent
    async fn get_inference_service(&self, name: &str, namespace: &str) -> Result<Option<InferenceService>>;

    /// Get a LocalModelNodeGroup, `None` if absent
    async fn get_node_group(&self, name: &str) -> Result<Option<LocalModelNodeGroup>>;
}

/// Real Kubernetes reader
pub struct LocalModelReaderImpl {
    client: Client,
}

impl LocalModelReaderImpl {
    /// Create a reader wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LocalModelReader for LocalModelReaderImpl {
    async fn list_caches(&self) -> Result<Vec<LocalModelCache>> {
        let api: Api<LocalModelCache> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_namespace_caches(&self, namespace: &str) -> Result<Vec<LocalModelNamespaceCache>> {
        let api: Api<LocalModelNamespaceCache> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_inference_service(&self, name: &str, namespace: &str) -> Result<Option<InferenceService>> {
        let ar = InferenceService::api_resource();
        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        let Some(obj) = ignore_not_found(api.get(name).await)? else {
            return Ok(None);
        };
        let value = serde_json::to_value(&obj).map_err(|e| Error::serialization_for(&ar.kind, e.to_string()))?;
        let isvc = serde_json::from_value(value).map_err(|e| Error::serialization_for(&ar.kind, e.to_string()))?;
        Ok(Some(isvc))
    }

    async fn get_node_group(&self, name: &str) -> Result<Option<LocalModelNodeGroup>> {
        let api: Api<LocalModelNodeGroup> = Api::all(self.client.clone());
        Ok(ignore_not_found(api.get(name).await)?)
    }
}

/// Validators shared by the webhook handlers
pub struct LocalModelWebhookState {
    /// LocalModelCache rules
    pub cache: LocalModelCacheValidator,
    /// LocalModelNamespaceCache rules
    pub namespace_cache: LocalModelNamespaceCacheValidator,
}

impl LocalModelWebhookState {
    /// Build both validators over one reader
    pub fn new(reader: Arc<dyn LocalModelReader>) -> Self {
        Self {
            cache: LocalModelCacheValidator::new(reader.clone()),
            namespace_cache: LocalModelNamespaceCacheValidator::new(reader),
        }
    }
}

/// Routes for both validators
pub fn webhook_routes(state: Arc<LocalModelWebhookState>) -> Router {
    Router::new()
        .route(LOCAL_MODEL_CACHE_WEBHOOK_PATH, post(validate_cache_handler))
        .route(LOCAL_MODEL_NAMESPACE_CACHE_WEBHOOK_PATH, post(validate_namespace_cache_handler))
        .with_state(state)
}

type ReviewResponse = std::result::Result<Json<AdmissionReview<DynamicObject>>, WebhookError>;

async fn validate_cache_handler(
    State(state): State<Arc<LocalModelWebhookState>>,
    Json(body): Json<Value>,
) -> ReviewResponse {
    let review_body = parse_review(body)?;
    Ok(Json(review::<LocalModelCache, _>(&state.cache, review_body).await))
}

async fn validate_namespace_cache_handler(
    State(state): State<Arc<LocalModelWebhookState>>,
    Json(body): Json<Value>,
) -> ReviewResponse {
    let review_body = parse_review(body)?;
    Ok(Json(
        review::<LocalModelNamespaceCache, _>(&state.namespace_cache, review_body).await,
    ))
}
