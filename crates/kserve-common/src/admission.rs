//! Validating admission webhook plumbing
//!
//! Validators implement [`AdmissionValidator`] against a typed object and
//! [`review`] adapts them to `AdmissionReview` requests: it decodes the
//! object (and old object), dispatches on the operation and turns the
//! outcome into an allow with warnings or a deny.

use std::fmt;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use kube::api::DynamicObject;
use kube::core::admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation};
use kube::Resource;
use serde::de::DeserializeOwned;
use tracing::{debug, error, info};

/// Advisory messages returned with an allowed request
pub type Warnings = Vec<String>;

/// Outcome of a validator call
pub type AdmissionResult = Result<Warnings, AdmissionError>;

// =============================================================================
// Field errors
// =============================================================================

/// One invalid field
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldError {
    /// Dotted path, e.g. `spec.router.route`
    pub path: String,
    /// What is wrong with it
    pub message: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Every invalid field of an object, reported together
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldErrors(Vec<FieldError>);

impl FieldErrors {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an invalid field
    pub fn push(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.0.push(FieldError {
            path: path.into(),
            message: message.into(),
        });
    }

    /// Append every error of `other`
    pub fn extend(&mut self, other: FieldErrors) {
        self.0.extend(other.0);
    }

    /// Whether nothing was recorded
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of recorded errors
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Recorded errors in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// `Ok(())` when empty, the whole list as an error otherwise
    pub fn into_result(self) -> Result<(), AdmissionError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(AdmissionError::Invalid(self))
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "[{}]", joined.join(", "))
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Why a request was denied
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// One or more fields are invalid
    #[error("{0}")]
    Invalid(FieldErrors),

    /// The request conflicts with cluster state
    #[error("{0}")]
    Denied(String),

    /// The object is not of the kind this validator handles
    #[error("expected {0}")]
    WrongKind(String),

    /// A lookup or template evaluation failed
    #[error(transparent)]
    Internal(#[from] crate::Error),
}

/// Transport-level webhook failures, answered with a non-2xx status
#[derive(Debug, thiserror::Error)]
pub enum WebhookError {
    /// The body is not an admission review
    #[error("invalid admission review: {0}")]
    InvalidReview(String),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::InvalidReview(_) => StatusCode::BAD_REQUEST,
        };

        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

/// Decode a request body into an `AdmissionReview`
pub fn parse_review(body: serde_json::Value) -> Result<AdmissionReview<DynamicObject>, WebhookError> {
    serde_json::from_value(body).map_err(|e| {
        debug!(error = %e, "request body is not an admission review");
        WebhookError::InvalidReview(e.to_string())
    })
}

// =============================================================================
// Validator seam
// =============================================================================

/// Create/update/delete validation for one resource kind
#[async_trait]
pub trait AdmissionValidator<K>: Send + Sync {
    /// Validate a new object
    async fn validate_create(&self, obj: &K) -> AdmissionResult;

    /// Validate a change from `old` to `new`
    async fn validate_update(&self, old: &K, new: &K) -> AdmissionResult;

    /// Validate removal of `obj`
    async fn validate_delete(&self, obj: &K) -> AdmissionResult;
}

/// Decode an admitted object into `K`, checking its kind first
pub fn decode_object<K>(obj: &DynamicObject) -> Result<K, AdmissionError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let expected = K::kind(&());
    if let Some(types) = &obj.types {
        if types.kind != expected {
            return Err(AdmissionError::WrongKind(expected.into_owned()));
        }
    }
    let value = serde_json::to_value(obj).map_err(|_| AdmissionError::WrongKind(expected.to_string()))?;
    serde_json::from_value(value).map_err(|e| {
        debug!(error = %e, kind = %expected, "admitted object does not decode");
        AdmissionError::WrongKind(expected.into_owned())
    })
}

fn required<'a>(
    obj: Option<&'a DynamicObject>,
    field: &str,
) -> Result<&'a DynamicObject, AdmissionError> {
    obj.ok_or_else(|| AdmissionError::Denied(format!("admission request has no {field}")))
}

/// Run `validator` against an already parsed request
pub async fn validate_request<K, V>(validator: &V, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse
where
    K: Resource<DynamicType = ()> + DeserializeOwned + Send + Sync,
    V: AdmissionValidator<K> + ?Sized,
{
    let outcome = async {
        match req.operation {
            Operation::Create => {
                let obj = decode_object::<K>(required(req.object.as_ref(), "object")?)?;
                validator.validate_create(&obj).await
            }
            Operation::Update => {
                let new = decode_object::<K>(required(req.object.as_ref(), "object")?)?;
                let old = decode_object::<K>(required(req.old_object.as_ref(), "oldObject")?)?;
                validator.validate_update(&old, &new).await
            }
            Operation::Delete => {
                let old = decode_object::<K>(required(req.old_object.as_ref(), "oldObject")?)?;
                validator.validate_delete(&old).await
            }
            Operation::Connect => Ok(Warnings::new()),
        }
    }
    .await;

    let response = AdmissionResponse::from(req);
    match outcome {
        Ok(warnings) => {
            debug!(uid = %req.uid, name = %req.name, warnings = warnings.len(), "admission allowed");
            let mut response = response;
            if !warnings.is_empty() {
                response.warnings = Some(warnings);
            }
            response
        }
        Err(e) => {
            info!(uid = %req.uid, name = %req.name, operation = ?req.operation, reason = %e, "admission denied");
            response.deny(e.to_string())
        }
    }
}

/// Turn an `AdmissionReview` into its answer using `validator`
pub async fn review<K, V>(
    validator: &V,
    body: AdmissionReview<DynamicObject>,
) -> AdmissionReview<DynamicObject>
where
    K: Resource<DynamicType = ()> + DeserializeOwned + Send + Sync,
    V: AdmissionValidator<K> + ?Sized,
{
    let req: AdmissionRequest<DynamicObject> = match body.try_into() {
        Ok(req) => req,
        Err(e) => {
            error!(error = %e, "failed to parse admission request");
            return AdmissionResponse::invalid(e.to_string()).into_review();
        }
    };
    validate_request::<K, V>(validator, &req).await.into_review()
}
