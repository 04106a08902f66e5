//! Template engine for `{{ ... }}` config templates
//!
//! Templates are parsed by [`super::parser`], every field path is checked
//! against the JSON schema of the data document, and the checked template is
//! lowered to minijinja source for rendering.

use minijinja::{Environment, UndefinedBehavior};
use schemars::schema::RootSchema;
use serde_json::Value;

use super::error::TemplateError;
use super::parser::{self, Expr, Func, Node, Template};
use super::schema::PathResolver;
use crate::kube_utils::child_name;

/// Renders Go-style config templates against a typed data document
pub struct TemplateEngine {
    env: Environment<'static>,
    schema: RootSchema,
    root_type: String,
    promoted: Option<String>,
}

impl TemplateEngine {
    /// Engine for data documents described by `schema`.
    ///
    /// `root_type` names the top-level type in error messages.
    pub fn new(schema: RootSchema, root_type: impl Into<String>) -> Self {
        let mut env = Environment::new();
        env.set_undefined_behavior(UndefinedBehavior::Chainable);
        env.set_keep_trailing_newline(true);
        env.add_function("ChildName", |parent: String, suffix: String| {
            child_name(&parent, &suffix)
        });

        Self {
            env,
            schema,
            root_type: root_type.into(),
            promoted: None,
        }
    }

    /// Make the fields of top-level property `key` reachable from the root
    pub fn with_promoted(mut self, key: impl Into<String>) -> Self {
        self.promoted = Some(key.into());
        self
    }

    /// Parse `src` without evaluating it
    pub fn parse(&self, name: &str, src: &str) -> Result<Template, TemplateError> {
        parser::parse(name, src)
    }

    /// Render a parsed template against `data`
    pub fn render(&self, template: &Template, data: &Value) -> Result<String, TemplateError> {
        if let [Node::Text(text)] = template.nodes.as_slice() {
            return Ok(text.clone());
        }
        if template.nodes.is_empty() {
            return Ok(String::new());
        }

        let mut resolver = PathResolver::new(&self.schema, self.root_type.clone());
        if let Some(promoted) = &self.promoted {
            resolver = resolver.with_promoted(promoted.clone());
        }

        let mut source = String::new();
        lower_nodes(&template.name, &template.nodes, &resolver, &mut source)?;

        self.env
            .render_str(&source, minijinja::Value::from_serialize(data))
            .map_err(|e| TemplateError::Exec {
                template: template.name.clone(),
                action: String::new(),
                message: e.to_string(),
            })
    }

    /// Parse and render a single string
    pub fn render_str(&self, name: &str, src: &str, data: &Value) -> Result<String, TemplateError> {
        let template = self.parse(name, src)?;
        self.render(&template, data)
    }

    /// Substitute templates in every string (keys included) of `doc`.
    ///
    /// All strings are parsed before any is rendered, so a syntax error
    /// anywhere is reported ahead of evaluation errors.
    pub fn render_document(
        &self,
        name: &str,
        doc: Value,
        data: &Value,
    ) -> Result<Value, TemplateError> {
        let mut parsed = Vec::new();
        collect_templates(name, &doc, self, &mut parsed)?;
        let mut rendered = parsed
            .into_iter()
            .map(|t| self.render(&t, data))
            .collect::<Result<Vec<_>, _>>()?
            .into_iter();
        Ok(substitute(doc, &mut rendered))
    }
}

fn collect_templates(
    name: &str,
    doc: &Value,
    engine: &TemplateEngine,
    out: &mut Vec<Template>,
) -> Result<(), TemplateError> {
    match doc {
        Value::String(s) if parser::has_actions(s) => out.push(engine.parse(name, s)?),
        Value::Array(items) => {
            for item in items {
                collect_templates(name, item, engine, out)?;
            }
        }
        Value::Object(map) => {
            for (key, value) in map {
                if parser::has_actions(key) {
                    out.push(engine.parse(name, key)?);
                }
                collect_templates(name, value, engine, out)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Replace templated strings in `doc`, consuming renders in traversal order
fn substitute(doc: Value, rendered: &mut impl Iterator<Item = String>) -> Value {
    match doc {
        Value::String(s) if parser::has_actions(&s) => {
            Value::String(rendered.next().unwrap_or(s))
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| substitute(item, rendered))
                .collect(),
        ),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, value) in map {
                let key = if parser::has_actions(&key) {
                    rendered.next().unwrap_or(key)
                } else {
                    key
                };
                let value = substitute(value, rendered);
                out.insert(key, value);
            }
            Value::Object(out)
        }
        other => other,
    }
}

fn lower_nodes(
    name: &str,
    nodes: &[Node],
    resolver: &PathResolver<'_>,
    out: &mut String,
) -> Result<(), TemplateError> {
    for node in nodes {
        match node {
            Node::Text(text) => push_literal(text, out),
            Node::Output { expr, source } => {
                let lowered = lower_expr(expr, resolver).map_err(|message| TemplateError::Exec {
                    template: name.to_string(),
                    action: source.clone(),
                    message,
                })?;
                out.push_str("{{ ");
                out.push_str(&lowered);
                out.push_str(" }}");
            }
            Node::If {
                cond,
                source,
                then,
                otherwise,
            } => {
                let lowered = lower_expr(cond, resolver).map_err(|message| TemplateError::Exec {
                    template: name.to_string(),
                    action: format!("if {}", source.trim_start_matches("if").trim()),
                    message,
                })?;
                out.push_str("{% if ");
                out.push_str(&lowered);
                out.push_str(" %}");
                lower_nodes(name, then, resolver, out)?;
                if !otherwise.is_empty() {
                    out.push_str("{% else %}");
                    lower_nodes(name, otherwise, resolver, out)?;
                }
                out.push_str("{% endif %}");
            }
        }
    }
    Ok(())
}

fn lower_expr(expr: &Expr, resolver: &PathResolver<'_>) -> Result<String, String> {
    match expr {
        Expr::Str(s) => Ok(quote(s)),
        Expr::Path(segments) => {
            let keys = resolver.resolve(segments)?;
            let mut iter = keys.iter();
            let mut out = match iter.next() {
                Some(first) => first.clone(),
                None => return Err("empty field path".to_string()),
            };
            for key in iter {
                out.push('[');
                out.push_str(&quote(key));
                out.push(']');
            }
            Ok(out)
        }
        Expr::Call { func, args } => {
            let lowered = args
                .iter()
                .map(|a| lower_expr(a, resolver))
                .collect::<Result<Vec<_>, _>>()?;
            match func {
                Func::ChildName => {
                    if lowered.len() != 2 {
                        return Err(format!(
                            "wrong number of args for {}: want 2 got {}",
                            func.name(),
                            lowered.len()
                        ));
                    }
                    Ok(format!("ChildName({}, {})", lowered[0], lowered[1]))
                }
                Func::Or => {
                    if lowered.is_empty() {
                        return Err("wrong number of args for or: want at least 1 got 0".into());
                    }
                    Ok(format!("({})", lowered.join(" or ")))
                }
            }
        }
    }
}

/// Emit literal text, shielding anything minijinja would interpret
fn push_literal(text: &str, out: &mut String) {
    if text.contains("{{") || text.contains("{%") || text.contains("{#") {
        out.push_str("{% raw %}");
        out.push_str(text);
        out.push_str("{% endraw %}");
    } else {
        out.push_str(text);
    }
}

fn quote(s: &str) -> String {
    // JSON string escapes are a subset of what minijinja accepts
    serde_json::Value::String(s.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;
    use serde::Serialize;
    use serde_json::json;

    #[derive(Serialize, JsonSchema)]
    struct Meta {
        name: String,
        namespace: String,
    }

    #[derive(Serialize, JsonSchema)]
    struct Model {
        name: Option<String>,
    }

    #[derive(Serialize, JsonSchema)]
    struct Spec {
        model: Model,
    }

    #[derive(Serialize, JsonSchema)]
    #[allow(non_snake_case)]
    struct Root {
        ObjectMeta: Meta,
        Spec: Spec,
    }

    fn engine() -> TemplateEngine {
        TemplateEngine::new(schemars::schema_for!(Root), "Root").with_promoted("ObjectMeta")
    }

    fn data(model_name: Option<&str>) -> Value {
        json!({
            "ObjectMeta": {"name": "test-llm", "namespace": "test-ns"},
            "Spec": {"model": model_name.map(|n| json!({"name": n})).unwrap_or(json!({}))}
        })
    }

    #[test]
    fn renders_paths_and_literals() {
        let out = engine()
            .render_str("config", "{{ .Namespace }}/{{ .Name }}.yaml", &data(None))
            .unwrap();
        assert_eq!(out, "test-ns/test-llm.yaml");
    }

    #[test]
    fn renders_child_name() {
        let out = engine()
            .render_str("config", "{{ ChildName .ObjectMeta.Name `-sa` }}", &data(None))
            .unwrap();
        assert_eq!(out, "test-llm-sa");
    }

    #[test]
    fn conditional_falls_back_when_value_absent() {
        let tpl = "{{ if .Spec.Model.Name }}{{ .Spec.Model.Name }}{{ else }}default-model{{ end }}";
        assert_eq!(
            engine().render_str("config", tpl, &data(None)).unwrap(),
            "default-model"
        );
        assert_eq!(
            engine().render_str("config", tpl, &data(Some("llama"))).unwrap(),
            "llama"
        );
    }

    #[test]
    fn or_picks_first_non_empty() {
        let out = engine()
            .render_str("config", r#"{{ or .Spec.Model.Name "fallback" }}"#, &data(None))
            .unwrap();
        assert_eq!(out, "fallback");
    }

    #[test]
    fn literal_jinja_syntax_is_not_interpreted() {
        let out = engine()
            .render_str("config", "{% raw %} {{ .Name }}", &data(None))
            .unwrap();
        assert_eq!(out, "{% raw %} test-llm");
    }

    #[test]
    fn unknown_field_is_an_exec_error() {
        let err = engine()
            .render_str("config", "{{ .NonExistentField }}", &data(None))
            .unwrap_err();
        assert!(!err.is_parse());
        assert!(err
            .to_string()
            .contains("can't evaluate field NonExistentField in type Root"));
    }

    #[test]
    fn child_name_arity_is_checked() {
        let err = engine()
            .render_str("config", "{{ ChildName .Name }}", &data(None))
            .unwrap_err();
        assert!(err.to_string().contains("wrong number of args"));
    }

    #[test]
    fn document_rendering_covers_keys_and_arrays() {
        let doc = json!({
            "args": ["--model-name={{ .Name }}", "--static"],
            "params": {"{{ .Namespace }}-key": "{{ .Name }}"},
            "replicas": 2
        });
        let out = engine().render_document("config", doc, &data(None)).unwrap();
        assert_eq!(
            out,
            json!({
                "args": ["--model-name=test-llm", "--static"],
                "params": {"test-ns-key": "test-llm"},
                "replicas": 2
            })
        );
    }

    #[test]
    fn document_syntax_errors_win_over_exec_errors() {
        let doc = json!({"a": "{{ .Missing }}", "b": "{{ .Name"});
        let err = engine().render_document("config", doc, &data(None)).unwrap_err();
        assert!(err.is_parse());
    }
}
