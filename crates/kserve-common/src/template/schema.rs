//! Field-path type checking against a JSON schema
//!
//! Template paths name Rust struct fields the way they appear in Go-style
//! templates (`.Spec.Model.Name`). Each segment must match a property of
//! the schema at that point (ASCII case-insensitively) and start with an
//! uppercase letter, or index into a map. Unconstrained values (arbitrary
//! JSON) accept any remaining path.

use schemars::schema::{InstanceType, RootSchema, Schema, SchemaObject, SingleOrVec};

const MAX_REF_DEPTH: usize = 32;

/// Outcome of expanding a schema node
enum Shape<'s> {
    /// Arbitrary JSON
    Any,
    /// Concrete alternatives with a display name
    Typed(Vec<&'s SchemaObject>, String),
}

/// Resolves template field paths to JSON key paths
pub struct PathResolver<'s> {
    root: &'s RootSchema,
    root_type: String,
    promoted: Option<String>,
}

impl<'s> PathResolver<'s> {
    /// Resolver over `root`, whose top-level type is displayed as `root_type`
    pub fn new(root: &'s RootSchema, root_type: impl Into<String>) -> Self {
        Self {
            root,
            root_type: root_type.into(),
            promoted: None,
        }
    }

    /// Fields of the top-level property `key` are also reachable from the root
    pub fn with_promoted(mut self, key: impl Into<String>) -> Self {
        self.promoted = Some(key.into());
        self
    }

    /// Map `segments` onto the JSON keys of the data document.
    ///
    /// Errors use the wording "can't evaluate field X in type Y".
    pub fn resolve(&self, segments: &[String]) -> Result<Vec<String>, String> {
        let mut keys = Vec::with_capacity(segments.len() + 1);
        let mut shape = Shape::Typed(vec![&self.root.schema], self.root_type.clone());

        for (i, segment) in segments.iter().enumerate() {
            let (candidates, type_name) = match shape {
                Shape::Any => {
                    keys.extend(segments[i..].iter().cloned());
                    return Ok(keys);
                }
                Shape::Typed(c, t) => (c, t),
            };

            let cant = || format!("can't evaluate field {} in type {}", segment, type_name);

            if let Some((key, schema)) = find_property(&candidates, segment) {
                if !starts_uppercase(segment) {
                    return Err(cant());
                }
                keys.push(key.to_string());
                shape = self.expand(schema, 0);
                continue;
            }

            if i == 0 {
                if let Some(promoted) = &self.promoted {
                    if let Some((pkey, pschema)) = find_property(&candidates, promoted) {
                        if let Shape::Typed(inner, _) = self.expand(pschema, 0) {
                            if let Some((key, schema)) = find_property(&inner, segment) {
                                if !starts_uppercase(segment) {
                                    return Err(cant());
                                }
                                keys.push(pkey.to_string());
                                keys.push(key.to_string());
                                shape = self.expand(schema, 0);
                                continue;
                            }
                        }
                    }
                }
            }

            if let Some(value_schema) = candidates.iter().find_map(|c| map_values(c)) {
                keys.push(segment.clone());
                shape = self.expand(value_schema, 0);
                continue;
            }

            return Err(cant());
        }

        Ok(keys)
    }

    fn expand(&self, schema: &'s Schema, depth: usize) -> Shape<'s> {
        let obj = match schema {
            Schema::Bool(true) => return Shape::Any,
            Schema::Bool(false) => return Shape::Typed(Vec::new(), "invalid".to_string()),
            Schema::Object(obj) => obj,
        };
        if depth > MAX_REF_DEPTH {
            return Shape::Typed(Vec::new(), "recursive".to_string());
        }

        if let Some(reference) = &obj.reference {
            let root: &'s RootSchema = self.root;
            let name = reference.rsplit('/').next().unwrap_or(reference.as_str());
            return match root.definitions.get(name) {
                Some(def) => match self.expand(def, depth + 1) {
                    Shape::Typed(c, _) => Shape::Typed(c, name.to_string()),
                    any => any,
                },
                None => Shape::Typed(Vec::new(), name.to_string()),
            };
        }

        let mut out = Vec::new();
        let mut name = type_name(obj);
        if let Some(sub) = &obj.subschemas {
            let alternatives = sub
                .all_of
                .iter()
                .chain(sub.any_of.iter())
                .chain(sub.one_of.iter())
                .flatten();
            for alt in alternatives {
                if is_null(alt) {
                    continue;
                }
                match self.expand(alt, depth + 1) {
                    Shape::Any => return Shape::Any,
                    Shape::Typed(c, n) => {
                        if !c.is_empty() {
                            name = n;
                        }
                        out.extend(c);
                    }
                }
            }
        }

        if obj.object.is_some() || is_object_type(obj) {
            out.push(obj);
        } else if out.is_empty() && is_unconstrained(obj) {
            return Shape::Any;
        }
        Shape::Typed(out, name)
    }
}

fn find_property<'s>(
    candidates: &[&'s SchemaObject],
    segment: &str,
) -> Option<(&'s str, &'s Schema)> {
    candidates.iter().find_map(|c| {
        c.object.as_ref().and_then(|o| {
            o.properties
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(segment))
                .map(|(k, v)| (k.as_str(), v))
        })
    })
}

fn map_values<'s>(obj: &'s SchemaObject) -> Option<&'s Schema> {
    obj.object
        .as_ref()
        .and_then(|o| o.additional_properties.as_deref())
        .filter(|s| !matches!(s, Schema::Bool(false)))
}

fn starts_uppercase(s: &str) -> bool {
    s.chars().next().is_some_and(char::is_uppercase)
}

fn is_null(schema: &Schema) -> bool {
    matches!(
        schema,
        Schema::Object(SchemaObject {
            instance_type: Some(SingleOrVec::Single(t)),
            ..
        }) if **t == InstanceType::Null
    )
}

fn is_object_type(obj: &SchemaObject) -> bool {
    match &obj.instance_type {
        Some(SingleOrVec::Single(t)) => **t == InstanceType::Object,
        Some(SingleOrVec::Vec(ts)) => ts.contains(&InstanceType::Object),
        None => false,
    }
}

fn is_unconstrained(obj: &SchemaObject) -> bool {
    obj.instance_type.is_none()
        && obj.object.is_none()
        && obj.array.is_none()
        && obj.enum_values.is_none()
        && obj.const_value.is_none()
        && obj.subschemas.is_none()
        && obj.reference.is_none()
}

fn type_name(obj: &SchemaObject) -> String {
    let name = |t: &InstanceType| match t {
        InstanceType::Null => "nil",
        InstanceType::Boolean => "bool",
        InstanceType::Object => "struct",
        InstanceType::Array => "slice",
        InstanceType::Number => "float64",
        InstanceType::String => "string",
        InstanceType::Integer => "int",
    };
    match &obj.instance_type {
        Some(SingleOrVec::Single(t)) => name(t).to_string(),
        Some(SingleOrVec::Vec(ts)) => ts
            .iter()
            .find(|t| **t != InstanceType::Null)
            .map(|t| name(t).to_string())
            .unwrap_or_else(|| "nil".to_string()),
        None => "interface {}".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemars::JsonSchema;
    use serde::Serialize;
    use std::collections::BTreeMap;

    #[derive(Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    struct Meta {
        name: String,
        labels: Option<BTreeMap<String, String>>,
    }

    #[derive(Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    struct Model {
        name: Option<String>,
        uri: String,
    }

    #[derive(Serialize, JsonSchema)]
    #[serde(rename_all = "camelCase")]
    struct Spec {
        model: Model,
        service_account_name: Option<String>,
        inline: Option<serde_json::Value>,
    }

    #[derive(Serialize, JsonSchema)]
    #[allow(non_snake_case)]
    struct Root {
        ObjectMeta: Meta,
        Spec: Spec,
    }

    fn segs(path: &str) -> Vec<String> {
        path.split('.')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    fn resolve(path: &str) -> Result<Vec<String>, String> {
        let schema = schemars::schema_for!(Root);
        let resolver = PathResolver::new(&schema, "Root").with_promoted("ObjectMeta");
        resolver.resolve(&segs(path))
    }

    #[test]
    fn nested_fields_map_to_json_keys() {
        assert_eq!(resolve(".Spec.Model.Name").unwrap(), vec!["Spec", "model", "name"]);
        assert_eq!(
            resolve(".Spec.ServiceAccountName").unwrap(),
            vec!["Spec", "serviceAccountName"]
        );
        assert_eq!(resolve(".Spec.Model.URI").unwrap(), vec!["Spec", "model", "uri"]);
    }

    #[test]
    fn promoted_fields_resolve_through_metadata() {
        assert_eq!(resolve(".Name").unwrap(), vec!["ObjectMeta", "name"]);
        assert_eq!(resolve(".ObjectMeta.Name").unwrap(), vec!["ObjectMeta", "name"]);
    }

    #[test]
    fn map_keys_are_passed_through() {
        assert_eq!(
            resolve(".Labels.app").unwrap(),
            vec!["ObjectMeta", "labels", "app"]
        );
    }

    #[test]
    fn arbitrary_json_accepts_any_path() {
        assert_eq!(
            resolve(".Spec.Inline.anything.goes").unwrap(),
            vec!["Spec", "inline", "anything", "goes"]
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = resolve(".NonExistentField").unwrap_err();
        assert_eq!(err, "can't evaluate field NonExistentField in type Root");

        let err = resolve(".Spec.Model.Name.Deeper").unwrap_err();
        assert!(err.contains("can't evaluate field Deeper"));
    }

    #[test]
    fn lowercase_field_names_are_rejected() {
        assert!(resolve(".Spec.model").is_err());
    }
}
