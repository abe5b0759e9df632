//! Declarative shapes for loosely-typed declaration data.
//!
//! Stage files and job declarations arrive as raw YAML. Before the
//! generator turns them into typed jobs they are checked against a
//! [`Schema`], and every mismatch is reported with the full path to the
//! offending value rather than just the first one found.

use std::fmt;

use serde_json::Value;

use gantry_core::{Error, Result};

/// Shape of one value in a declaration tree.
#[derive(Debug, Clone)]
pub enum Schema {
    /// Accepts anything.
    Any,
    Bool,
    String,
    Number,
    /// Array with a uniform element shape.
    Array(Box<Schema>),
    /// Mapping with arbitrary string keys and a uniform value shape.
    Map(Box<Schema>),
    /// Mapping with named fields.
    Object(ObjectSchema),
    /// Either the inner shape directly, or a single-key `by_*` mapping
    /// whose alternatives each satisfy this same schema again.
    KeyedBy(Box<Schema>),
}

#[derive(Debug, Clone)]
pub struct ObjectSchema {
    fields: Vec<FieldSchema>,
    open: bool,
}

#[derive(Debug, Clone)]
pub struct FieldSchema {
    name: String,
    required: bool,
    schema: Schema,
}

impl Schema {
    /// Object that rejects keys outside `fields`.
    pub fn object(fields: impl IntoIterator<Item = FieldSchema>) -> Self {
        Schema::Object(ObjectSchema {
            fields: fields.into_iter().collect(),
            open: false,
        })
    }

    /// Object that tolerates keys outside `fields`.
    pub fn open_object(fields: impl IntoIterator<Item = FieldSchema>) -> Self {
        Schema::Object(ObjectSchema {
            fields: fields.into_iter().collect(),
            open: true,
        })
    }

    pub fn array(element: Schema) -> Self {
        Schema::Array(Box::new(element))
    }

    pub fn map(value: Schema) -> Self {
        Schema::Map(Box::new(value))
    }

    pub fn keyed_by(inner: Schema) -> Self {
        Schema::KeyedBy(Box::new(inner))
    }
}

impl FieldSchema {
    pub fn required(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            required: true,
            schema,
        }
    }

    pub fn optional(name: impl Into<String>, schema: Schema) -> Self {
        Self {
            name: name.into(),
            required: false,
            schema,
        }
    }
}

/// One mismatch between a value and its schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Dotted path from the document root to the offending value.
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.path.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "at {}: {}", self.path, self.message)
        }
    }
}

/// Check `value` against `schema`, collecting every violation.
pub fn validate(schema: &Schema, value: &Value, path: &str) -> Vec<SchemaViolation> {
    let mut violations = Vec::new();
    validate_into(schema, value, path, &mut violations);
    violations
}

/// Check `value` against `schema` and fail on the first batch of
/// violations, labelled with `context` (a stage or job identifier).
pub fn validate_or_error(schema: &Schema, value: &Value, context: &str) -> Result<()> {
    let violations = validate(schema, value, "");
    if violations.is_empty() {
        return Ok(());
    }
    let detail = violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    Err(Error::SchemaValidation {
        context: context.to_string(),
        detail,
    })
}

fn validate_into(schema: &Schema, value: &Value, path: &str, out: &mut Vec<SchemaViolation>) {
    match schema {
        Schema::Any => {}
        Schema::Bool => {
            if !value.is_boolean() {
                push(out, path, format!("expected a boolean, got {}", type_name(value)));
            }
        }
        Schema::String => {
            if !value.is_string() {
                push(out, path, format!("expected a string, got {}", type_name(value)));
            }
        }
        Schema::Number => {
            if !value.is_number() {
                push(out, path, format!("expected a number, got {}", type_name(value)));
            }
        }
        Schema::Array(element) => match value.as_array() {
            Some(items) => {
                for (index, item) in items.iter().enumerate() {
                    validate_into(element, item, &format!("{path}[{index}]"), out);
                }
            }
            None => push(out, path, format!("expected an array, got {}", type_name(value))),
        },
        Schema::Map(value_schema) => match value.as_object() {
            Some(map) => {
                for (key, entry) in map {
                    validate_into(value_schema, entry, &child(path, key), out);
                }
            }
            None => push(out, path, format!("expected a mapping, got {}", type_name(value))),
        },
        Schema::Object(object) => {
            let Some(map) = value.as_object() else {
                push(out, path, format!("expected a mapping, got {}", type_name(value)));
                return;
            };
            for field in &object.fields {
                match map.get(&field.name) {
                    Some(entry) => validate_into(&field.schema, entry, &child(path, &field.name), out),
                    None if field.required => {
                        push(out, path, format!("missing required key {}", field.name));
                    }
                    None => {}
                }
            }
            if !object.open {
                for key in map.keys() {
                    if !object.fields.iter().any(|field| field.name == *key) {
                        push(out, &child(path, key), "unexpected key".to_string());
                    }
                }
            }
        }
        Schema::KeyedBy(inner) => {
            // A single-key by_* mapping defers the check to each alternative,
            // nested by_* included.
            if let Some(map) = value.as_object() {
                if map.len() == 1 {
                    if let Some((key, alternatives)) = map.iter().next() {
                        if key.starts_with("by_") {
                            match alternatives.as_object() {
                                Some(entries) => {
                                    for (alternative, entry) in entries {
                                        let alt_path = child(&child(path, key), alternative);
                                        validate_into(schema, entry, &alt_path, out);
                                    }
                                }
                                None => push(
                                    out,
                                    &child(path, key),
                                    "by_* alternatives must be a mapping".to_string(),
                                ),
                            }
                            return;
                        }
                    }
                }
            }
            validate_into(inner, value, path, out);
        }
    }
}

/// Shape of a job declaration after all transforms ran. Open because
/// transforms are free to carry scratch keys that later steps consume.
pub fn job_declaration_schema() -> Schema {
    Schema::open_object([
        FieldSchema::required("label", Schema::String),
        FieldSchema::required("description", Schema::keyed_by(Schema::String)),
        FieldSchema::required("attributes", Schema::map(Schema::Any)),
        FieldSchema::required("payload", Schema::keyed_by(Schema::map(Schema::Any))),
        FieldSchema::optional(
            "optimization",
            Schema::keyed_by(Schema::object([
                FieldSchema::required("strategy", Schema::String),
                FieldSchema::optional("argument", Schema::Any),
            ])),
        ),
        FieldSchema::optional("upstream_dependencies", Schema::map(Schema::String)),
        FieldSchema::optional("soft_dependencies", Schema::array(Schema::String)),
    ])
}

fn child(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn push(out: &mut Vec<SchemaViolation>, path: &str, message: String) {
    out.push(SchemaViolation {
        path: path.to_string(),
        message,
    });
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "a mapping",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_valid_declaration_passes() {
        let declaration = json!({
            "label": "build-linux",
            "description": "Compile for linux",
            "attributes": {"platform": "linux"},
            "payload": {"command": "make"},
        });
        assert_eq!(validate(&job_declaration_schema(), &declaration, ""), vec![]);
    }

    #[test]
    fn test_missing_required_key_is_reported() {
        let declaration = json!({"label": "build-linux", "attributes": {}, "payload": {}});
        let violations = validate(&job_declaration_schema(), &declaration, "");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].message, "missing required key description");
    }

    #[test]
    fn test_every_violation_is_collected() {
        let schema = Schema::object([
            FieldSchema::required("name", Schema::String),
            FieldSchema::required("count", Schema::Number),
        ]);
        let value = json!({"name": 3, "extra": true});
        let violations = validate(&schema, &value, "");
        let messages: Vec<String> = violations.iter().map(ToString::to_string).collect();
        assert_eq!(
            messages,
            vec![
                "at name: expected a string, got a number",
                "missing required key count",
                "at extra: unexpected key",
            ]
        );
    }

    #[test]
    fn test_nested_paths_use_dots_and_indexes() {
        let schema = Schema::object([FieldSchema::required(
            "steps",
            Schema::array(Schema::object([FieldSchema::required("run", Schema::String)])),
        )]);
        let value = json!({"steps": [{"run": "make"}, {"run": 7}]});
        let violations = validate(&schema, &value, "");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "steps[1].run");
    }

    #[test]
    fn test_keyed_by_alternatives_checked_against_inner() {
        let schema = Schema::keyed_by(Schema::String);
        let good = json!({"by_platform": {"linux": "small", "default": "large"}});
        assert_eq!(validate(&schema, &good, "size"), vec![]);

        let bad = json!({"by_platform": {"linux": 12, "default": "large"}});
        let violations = validate(&schema, &bad, "size");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].path, "size.by_platform.linux");
    }

    #[test]
    fn test_nested_keyed_by_is_allowed() {
        let schema = Schema::keyed_by(Schema::String);
        let value = json!({
            "by_platform": {
                "linux": {"by_level": {"3": "large", "default": "small"}},
                "default": "small",
            }
        });
        assert_eq!(validate(&schema, &value, ""), vec![]);
    }

    #[test]
    fn test_validate_or_error_joins_violations() {
        let schema = Schema::object([FieldSchema::required("name", Schema::String)]);
        let err = validate_or_error(&schema, &json!({}), "build.stage.yml")
            .expect_err("schema error");
        let message = err.to_string();
        assert!(message.contains("build.stage.yml"), "{message}");
        assert!(message.contains("missing required key name"), "{message}");
    }

    #[test]
    fn test_map_rejects_non_mapping() {
        let violations = validate(&Schema::map(Schema::Any), &json!([1, 2]), "attributes");
        assert_eq!(violations.len(), 1);
        assert_eq!(
            violations[0].to_string(),
            "at attributes: expected a mapping, got an array"
        );
    }
}
