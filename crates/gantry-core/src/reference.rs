//! Symbolic dependency references inside job payloads.
//!
//! A payload may embed `{"job_reference": "... <dep_name> ..."}` anywhere;
//! during subgraph extraction each `<dep_name>` token is replaced by the
//! label of the surviving dependency registered under that name.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::Value;

use crate::error::{Error, Result};

const REFERENCE_KEY: &str = "job_reference";

/// Replace every `job_reference` mapping in `payload` with its resolved
/// string. `dependencies` maps dependency name to the label it resolves to;
/// a token naming anything else is fatal.
pub fn resolve_job_references(
    label: &str,
    payload: &Value,
    dependencies: &BTreeMap<String, String>,
) -> Result<Value> {
    let token = Regex::new(r"<([^>]+)>").unwrap();
    resolve_value(&token, label, payload, dependencies)
}

fn resolve_value(
    token: &Regex,
    label: &str,
    value: &Value,
    dependencies: &BTreeMap<String, String>,
) -> Result<Value> {
    match value {
        Value::Object(map) => {
            if map.len() == 1 && map.contains_key(REFERENCE_KEY) {
                return match &map[REFERENCE_KEY] {
                    Value::String(template) => Ok(Value::String(substitute(
                        token,
                        label,
                        template,
                        dependencies,
                    )?)),
                    _ => Err(Error::InvalidReference {
                        label: label.to_string(),
                    }),
                };
            }
            let mut resolved = serde_json::Map::new();
            for (key, inner) in map {
                resolved.insert(key.clone(), resolve_value(token, label, inner, dependencies)?);
            }
            Ok(Value::Object(resolved))
        }
        Value::Array(items) => items
            .iter()
            .map(|inner| resolve_value(token, label, inner, dependencies))
            .collect::<Result<Vec<Value>>>()
            .map(Value::Array),
        other => Ok(other.clone()),
    }
}

fn substitute(
    token: &Regex,
    label: &str,
    template: &str,
    dependencies: &BTreeMap<String, String>,
) -> Result<String> {
    let mut resolved = String::with_capacity(template.len());
    let mut last = 0;
    for caps in token.captures_iter(template) {
        let whole = caps.get(0).map_or(0..0, |m| m.range());
        let name = caps.get(1).map_or("", |m| m.as_str());
        let Some(dep_label) = dependencies.get(name) else {
            return Err(Error::UnresolvedReference {
                label: label.to_string(),
                token: name.to_string(),
            });
        };
        resolved.push_str(&template[last..whole.start]);
        resolved.push_str(dep_label);
        last = whole.end;
    }
    resolved.push_str(&template[last..]);
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deps(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(name, label)| (name.to_string(), label.to_string()))
            .collect()
    }

    #[test]
    fn test_reference_is_substituted() {
        let payload = json!({"image": {"job_reference": "<image>"}});
        let resolved =
            resolve_job_references("build", &payload, &deps(&[("image", "image-base")])).unwrap();
        assert_eq!(resolved, json!({"image": "image-base"}));
    }

    #[test]
    fn test_reference_inside_larger_string() {
        let payload = json!({"script": [{"job_reference": "fetch <build> artifacts"}]});
        let resolved =
            resolve_job_references("sign", &payload, &deps(&[("build", "build-linux")])).unwrap();
        assert_eq!(resolved, json!({"script": ["fetch build-linux artifacts"]}));
    }

    #[test]
    fn test_multiple_tokens_in_one_reference() {
        let payload = json!({"job_reference": "<a> then <b>"});
        let resolved =
            resolve_job_references("j", &payload, &deps(&[("a", "one"), ("b", "two")])).unwrap();
        assert_eq!(resolved, json!("one then two"));
    }

    #[test]
    fn test_unknown_token_is_fatal() {
        let payload = json!({"job_reference": "<missing>"});
        let err = resolve_job_references("build", &payload, &deps(&[])).unwrap_err();
        match err {
            Error::UnresolvedReference { label, token } => {
                assert_eq!(label, "build");
                assert_eq!(token, "missing");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_non_string_reference_is_fatal() {
        let payload = json!({"job_reference": 5});
        let err = resolve_job_references("build", &payload, &deps(&[])).unwrap_err();
        assert!(matches!(err, Error::InvalidReference { .. }));
    }

    #[test]
    fn test_plain_values_pass_through() {
        let payload = json!({
            "script": ["make"],
            "nested": {"job_reference_like": "<untouched>", "extra": true},
            "count": 3,
        });
        let resolved = resolve_job_references("j", &payload, &deps(&[])).unwrap();
        assert_eq!(resolved, payload);
    }

    #[test]
    fn test_two_key_object_is_not_a_reference() {
        let payload = json!({"job_reference": "<x>", "other": 1});
        let resolved = resolve_job_references("j", &payload, &deps(&[])).unwrap();
        assert_eq!(resolved, payload);
    }
}
