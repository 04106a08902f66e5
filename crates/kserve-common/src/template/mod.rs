//! Go-style `{{ ... }}` templating for LLMInferenceServiceConfig presets
//!
//! Config presets carry expressions such as `{{ .ObjectMeta.Name }}` or
//! `{{ ChildName .Name "-epp-sa" }}` in their string fields. The accepted
//! language is a small whitelist:
//!
//! - field paths (`.Spec.Model.Name`), type-checked against the JSON schema
//!   of the data document before anything renders
//! - string literals (`"..."` or `` `...` ``)
//! - `ChildName parent suffix` and `or a b ...`
//! - `{{ if }}` / `{{ else }}` / `{{ end }}`
//!
//! Checked templates are lowered to minijinja and rendered against the data.

mod engine;
mod error;
mod parser;
mod schema;

pub use engine::TemplateEngine;
pub use error::TemplateError;
pub use parser::{has_actions, Template};
pub use schema::PathResolver;
