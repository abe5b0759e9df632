//! Resolution of `by_*` keyed configuration values.
//!
//! A keyed-by value lets a declaration vary a field by a named attribute:
//!
//! ```yaml
//! timeout:
//!   by_platform:
//!     linux.*: 30
//!     windows: 90
//!     default: 60
//! ```
//!
//! Keys are tried as exact matches first, then as anchored regular
//! expressions; `default` applies when nothing matches or the attribute is
//! absent. Resolution recurses while the selected value is itself another
//! `by_*` mapping.

use std::collections::BTreeMap;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// Match `key` against the keys of `alternatives`. An exact hit wins;
/// otherwise every key is tried as an anchored regular expression; if no
/// pattern matches, `default` is the fallback.
fn keymatch<'a>(alternatives: &'a Map<String, Value>, key: &str, item: &str) -> Result<Vec<&'a Value>> {
    if let Some(value) = alternatives.get(key) {
        return Ok(vec![value]);
    }
    let mut matches = Vec::new();
    for (pattern, value) in alternatives {
        let anchored = Regex::new(&format!("^(?:{pattern})$")).map_err(|_| {
            Error::KeyedByInvalidPattern {
                pattern: pattern.clone(),
                item: item.to_string(),
            }
        })?;
        if anchored.is_match(key) {
            matches.push(value);
        }
    }
    if !matches.is_empty() {
        return Ok(matches);
    }
    Ok(alternatives.get("default").map(|value| vec![value]).unwrap_or_default())
}

/// The attribute value used for key matching. Strings match as-is; numbers
/// and booleans match their canonical text form; anything else counts as an
/// absent attribute.
fn attribute_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Resolve a possibly keyed-by `value` against `attributes`, recursing
/// while the selected value is itself a `by_*` mapping. `item` names the
/// job or config entry being resolved and appears in every error message.
pub fn evaluate_keyed_by(
    value: &Value,
    item: &str,
    attributes: &BTreeMap<String, Value>,
) -> Result<Value> {
    let mut current = value;
    loop {
        let Some(object) = current.as_object() else {
            return Ok(current.clone());
        };
        if object.len() != 1 {
            return Ok(current.clone());
        }
        let Some((full_key, inner)) = object.iter().next() else {
            return Ok(current.clone());
        };
        let Some(attribute) = full_key.strip_prefix("by_") else {
            return Ok(current.clone());
        };
        let Some(alternatives) = inner.as_object() else {
            return Err(Error::KeyedByInvalidAlternatives {
                attribute: attribute.to_string(),
                item: item.to_string(),
            });
        };
        if alternatives.len() == 1 && alternatives.contains_key("default") {
            return Err(Error::KeyedByPointless {
                attribute: attribute.to_string(),
                item: item.to_string(),
            });
        }
        let key = attributes.get(attribute).and_then(attribute_key);
        let Some(key) = key else {
            match alternatives.get("default") {
                Some(default) => {
                    current = default;
                    continue;
                }
                None => {
                    return Err(Error::KeyedByMissingAttribute {
                        attribute: attribute.to_string(),
                        item: item.to_string(),
                    });
                }
            }
        };
        let matches = keymatch(alternatives, &key, item)?;
        if matches.len() > 1 {
            return Err(Error::KeyedByAmbiguous {
                attribute: attribute.to_string(),
                key,
                item: item.to_string(),
            });
        }
        match matches.first() {
            Some(matched) => current = *matched,
            None => {
                return Err(Error::KeyedByNoMatch {
                    attribute: attribute.to_string(),
                    key,
                    item: item.to_string(),
                });
            }
        }
    }
}

/// Resolve an optionally keyed-by field of a job declaration in place.
///
/// `field` is a dotted path into the declaration; a missing field is left
/// alone. The attribute environment is the declaration's own top-level
/// entries plus `extra` (which wins on collision), so a declaration can key
/// off e.g. its own `platform` or a run parameter.
pub fn resolve_keyed_by(
    item: &mut Value,
    field: &str,
    item_name: &str,
    extra: &BTreeMap<String, Value>,
) -> Result<()> {
    let mut attributes: BTreeMap<String, Value> = match item.as_object() {
        Some(object) => object.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
        None => BTreeMap::new(),
    };
    for (key, value) in extra {
        attributes.insert(key.clone(), value.clone());
    }
    let Some(slot) = lookup_path_mut(item, field) else {
        return Ok(());
    };
    let resolved = evaluate_keyed_by(slot, &format!("{item_name}.{field}"), &attributes)?;
    *slot = resolved;
    Ok(())
}

fn lookup_path_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = value;
    for part in path.split('.') {
        current = current.as_object_mut()?.get_mut(part)?;
    }
    Some(current)
}
