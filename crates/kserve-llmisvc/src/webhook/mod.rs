//! Validating webhooks for LLMInferenceService and LLMInferenceServiceConfig

mod config;
mod llmisvc;

use std::sync::Arc;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use kube::api::DynamicObject;
use kube::core::admission::AdmissionReview;
use serde_json::Value;

use kserve_common::admission::{parse_review, review, WebhookError};
use kserve_common::crd::{LLMInferenceService, LLMInferenceServiceConfig};

pub use config::LLMInferenceServiceConfigValidator;
pub use llmisvc::{
    validate_parallelism, validate_router, validate_size_unchanged, validate_spec,
    LLMInferenceServiceValidator,
};

/// Path of the LLMInferenceService validating webhook
pub const LLMISVC_WEBHOOK_PATH: &str = "/validate-serving-kserve-io-v1alpha1-llminferenceservice";
/// Path of the LLMInferenceServiceConfig validating webhook
pub const LLMISVC_CONFIG_WEBHOOK_PATH: &str =
    "/validate-serving-kserve-io-v1alpha1-llminferenceserviceconfig";

/// Validators shared by the webhook handlers
pub struct LlmWebhookState {
    /// LLMInferenceService rules
    pub service: LLMInferenceServiceValidator,
    /// LLMInferenceServiceConfig rules
    pub config: LLMInferenceServiceConfigValidator,
}

/// Routes for both validators
pub fn webhook_routes(state: Arc<LlmWebhookState>) -> Router {
    Router::new()
        .route(LLMISVC_WEBHOOK_PATH, post(validate_service_handler))
        .route(LLMISVC_CONFIG_WEBHOOK_PATH, post(validate_config_handler))
        .with_state(state)
}

type ReviewResponse = Result<Json<AdmissionReview<DynamicObject>>, WebhookError>;

async fn validate_service_handler(
    State(state): State<Arc<LlmWebhookState>>,
    Json(body): Json<Value>,
) -> ReviewResponse {
    let review_body = parse_review(body)?;
    Ok(Json(review::<LLMInferenceService, _>(&state.service, review_body).await))
}

async fn validate_config_handler(
    State(state): State<Arc<LlmWebhookState>>,
    Json(body): Json<Value>,
) -> ReviewResponse {
    let review_body = parse_review(body)?;
    Ok(Json(review::<LLMInferenceServiceConfig, _>(&state.config, review_body).await))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use kserve_common::config::{ConfigMapReader, InferenceServiceConfig};
    use serde_json::json;
    use tower::ServiceExt;

    use crate::config_merge::{WellKnownConfigs, CONFIG_ROUTER_ROUTE};

    struct StaticConfigMap;

    #[async_trait]
    impl ConfigMapReader for StaticConfigMap {
        async fn inference_service_config(&self) -> kserve_common::Result<InferenceServiceConfig> {
            Ok(InferenceServiceConfig::default())
        }
    }

    fn router() -> Router {
        webhook_routes(Arc::new(LlmWebhookState {
            service: LLMInferenceServiceValidator,
            config: LLMInferenceServiceConfigValidator::new(
                Arc::new(StaticConfigMap),
                WellKnownConfigs::default(),
                "kserve",
            ),
        }))
    }

    fn review_request(path: &str, kind: &str, operation: &str, object: Value, old: Value) -> Request<Body> {
        let body = json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "3c7a2f8e",
                "kind": {"group": "serving.kserve.io", "version": "v1alpha1", "kind": kind},
                "resource": {"group": "serving.kserve.io", "version": "v1alpha1", "resource": format!("{}s", kind.to_lowercase())},
                "name": "test",
                "namespace": "models",
                "operation": operation,
                "userInfo": {"username": "admin"},
                "object": object,
                "oldObject": old,
                "dryRun": false
            }
        });
        Request::builder()
            .method("POST")
            .uri(path)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(request: Request<Body>) -> Value {
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        serde_json::from_slice::<Value>(&bytes).unwrap()["response"].clone()
    }

    fn service(spec: Value) -> Value {
        json!({
            "apiVersion": "serving.kserve.io/v1alpha1",
            "kind": "LLMInferenceService",
            "metadata": {"name": "test", "namespace": "models"},
            "spec": spec
        })
    }

    fn config(name: &str, spec: Value) -> Value {
        json!({
            "apiVersion": "serving.kserve.io/v1alpha1",
            "kind": "LLMInferenceServiceConfig",
            "metadata": {"name": name, "namespace": "kserve"},
            "spec": spec
        })
    }

    #[tokio::test]
    async fn story_refs_and_spec_on_create_is_denied() {
        let svc = service(json!({
            "model": {"uri": "hf://facebook/opt-125m"},
            "router": {"route": {"http": {
                "refs": [{"name": "test-route"}],
                "spec": {"rules": [{"matches": [{"path": {"type": "PathPrefix", "value": "/test"}}]}]}
            }}}
        }));
        let response = send(review_request(LLMISVC_WEBHOOK_PATH, "LLMInferenceService", "CREATE", svc, Value::Null)).await;

        assert_eq!(response["allowed"], false);
        assert_eq!(response["uid"], "3c7a2f8e");
        let message = response["status"]["message"].as_str().unwrap();
        assert!(message.contains("unsupported configuration"), "{message}");
    }

    #[tokio::test]
    async fn story_parallelism_size_change_on_update_is_denied() {
        let old = service(json!({"model": {"uri": "hf://m"}, "parallelism": {"data": 1, "dataLocal": 8}}));
        let new = service(json!({"model": {"uri": "hf://m"}, "parallelism": {"data": 8, "dataLocal": 1}}));
        let response = send(review_request(LLMISVC_WEBHOOK_PATH, "LLMInferenceService", "UPDATE", new, old)).await;

        assert_eq!(response["allowed"], false);
        assert!(response["status"]["message"]
            .as_str()
            .unwrap()
            .contains("parallelism size cannot be changed"));
    }

    #[tokio::test]
    async fn story_valid_service_is_allowed() {
        let svc = service(json!({"model": {"uri": "hf://facebook/opt-125m"}, "router": {"route": {}, "gateway": {}}}));
        let response = send(review_request(LLMISVC_WEBHOOK_PATH, "LLMInferenceService", "CREATE", svc, Value::Null)).await;
        assert_eq!(response["allowed"], true);
    }

    #[tokio::test]
    async fn story_well_known_config_delete_warns() {
        let cfg = config(CONFIG_ROUTER_ROUTE, json!({}));
        let response = send(review_request(
            LLMISVC_CONFIG_WEBHOOK_PATH,
            "LLMInferenceServiceConfig",
            "DELETE",
            Value::Null,
            cfg,
        ))
        .await;

        assert_eq!(response["allowed"], true);
        let warnings = response["warnings"].as_array().unwrap();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].as_str().unwrap().contains("not recommended"));
    }

    #[tokio::test]
    async fn story_wrong_kind_is_denied() {
        let cfg = config("custom", json!({}));
        let response = send(review_request(LLMISVC_WEBHOOK_PATH, "LLMInferenceService", "CREATE", cfg, Value::Null)).await;
        assert_eq!(response["allowed"], false);
        assert_eq!(response["status"]["message"], "expected LLMInferenceService");
    }

    #[tokio::test]
    async fn non_review_body_is_a_bad_request() {
        let request = Request::builder()
            .method("POST")
            .uri(LLMISVC_CONFIG_WEBHOOK_PATH)
            .header("content-type", "application/json")
            .body(Body::from(r#"{"request": "nope"}"#))
            .unwrap();
        let response = router().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn malformed_body_is_rejected_by_extractor() {
        let request = Request::builder()
            .method("POST")
            .uri(LLMISVC_WEBHOOK_PATH)
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = router().oneshot(request).await.unwrap();
        assert!(response.status().is_client_error());
    }
}
