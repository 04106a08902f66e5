//! LLMInferenceService support for KServe
//!
//! - **config_merge**: preset selection, spec merging and template substitution
//! - **workload / scheduler / router**: builders for the child objects of a service
//! - **discovery**: URL discovery from HTTPRoutes and their parent Gateways
//! - **controller**: the LLMInferenceService reconciler
//! - **webhook**: admission validators for LLMInferenceService and LLMInferenceServiceConfig

pub mod config_merge;
pub mod controller;
pub mod discovery;
pub mod router;
pub mod scheduler;
pub mod webhook;
pub mod workload;

