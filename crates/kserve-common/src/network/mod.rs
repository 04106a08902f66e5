//! External CRD types consumed or produced by the LLM controller
//!
//! These are plain serde structs rather than `kube::CustomResource` derives
//! because KServe does not own their definitions.

pub mod gateway_api;
pub mod inference;
pub mod lws;

pub use gateway_api::{
    BackendRef, Gateway, GatewayListener, GatewaySpec, GatewayStatus, GatewayStatusAddress,
    HttpPathMatch, HttpRoute, HttpRouteMatch, HttpRouteRule, HttpRouteSpec, HttpRouteStatus,
    ParentRef, GATEWAY_API_GROUP,
};
pub use inference::{
    ExtensionReference, InferenceModel, InferenceModelSpec, InferencePool, InferencePoolSpec,
    PoolObjectReference, INFERENCE_API_GROUP,
};
pub use lws::{LeaderWorkerSet, LeaderWorkerSetSpec, LeaderWorkerTemplate};
