//! Declaration transforms.
//!
//! Each stage names an ordered list of transforms. A transform wraps a
//! lazy stream of declarations and yields the reworked ones; nothing runs
//! until the generator drains the final stream, and an error anywhere in
//! the chain surfaces as the stream item for the declaration that caused
//! it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use gantry_core::keyed_by::evaluate_keyed_by;
use gantry_core::{Error, Job, Parameters, Result};

use crate::config::GraphConfig;
use crate::schema::{job_declaration_schema, validate_or_error, Schema};
use crate::stage::StageConfig;

/// Everything a transform may consult while reworking declarations.
pub struct TransformContext<'a> {
    pub stage: &'a StageConfig,
    pub graph_config: &'a GraphConfig,
    pub parameters: &'a Parameters,
    /// Jobs generated by the stages this stage depends on.
    pub upstream_jobs: &'a [Job],
}

/// A lazy stream of job declarations.
pub type JobStream<'a> = Box<dyn Iterator<Item = Result<Value>> + 'a>;

/// One step of a stage's declaration pipeline. The input stream is
/// consumed exactly once, in order.
pub trait Transform: Send + Sync {
    fn apply<'a>(&'a self, cx: &'a TransformContext<'a>, jobs: JobStream<'a>) -> JobStream<'a>;
}

impl fmt::Debug for dyn Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<dyn Transform>")
    }
}

/// Check each declaration against the job declaration schema.
pub struct ValidateTransform {
    schema: Schema,
}

impl ValidateTransform {
    pub fn new() -> Self {
        Self {
            schema: job_declaration_schema(),
        }
    }
}

impl Default for ValidateTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl Transform for ValidateTransform {
    fn apply<'a>(&'a self, cx: &'a TransformContext<'a>, jobs: JobStream<'a>) -> JobStream<'a> {
        Box::new(jobs.map(move |item| {
            let item = item?;
            let label = declaration_label(&item).unwrap_or("<unlabeled>");
            validate_or_error(&self.schema, &item, &format!("{}.{label}", cx.stage.name))?;
            Ok(item)
        }))
    }
}

/// Fill each declaration with stage-level then graph-level defaults.
/// The declaration's own values always win, and stage defaults beat
/// graph-wide ones.
pub struct JobDefaultsTransform;

impl Transform for JobDefaultsTransform {
    fn apply<'a>(&'a self, cx: &'a TransformContext<'a>, jobs: JobStream<'a>) -> JobStream<'a> {
        Box::new(jobs.map(move |item| {
            let mut item = item?;
            for defaults in [&cx.stage.job_defaults, &cx.graph_config.config.job_defaults] {
                if !defaults.is_null() {
                    merge_defaults(defaults, &mut item);
                }
            }
            Ok(item)
        }))
    }
}

/// Recursively fill `target` with entries from `defaults` that it does
/// not set itself. Only mappings merge; arrays and scalars in the
/// declaration win outright.
pub fn merge_defaults(defaults: &Value, target: &mut Value) {
    if let (Some(default_map), Some(target_map)) = (defaults.as_object(), target.as_object_mut()) {
        for (key, default_value) in default_map {
            match target_map.get_mut(key) {
                Some(existing) => merge_defaults(default_value, existing),
                None => {
                    target_map.insert(key.clone(), default_value.clone());
                }
            }
        }
    }
}

/// Resolve every `by_*` mapping anywhere in each declaration.
///
/// The attribute environment is the run parameters' scalar fields plus
/// the declaration's own top-level entries, declaration entries winning.
pub struct ResolveKeyedByTransform;

impl Transform for ResolveKeyedByTransform {
    fn apply<'a>(&'a self, cx: &'a TransformContext<'a>, jobs: JobStream<'a>) -> JobStream<'a> {
        Box::new(jobs.map(move |item| {
            let item = item?;
            let label = declaration_label(&item).unwrap_or("<unlabeled>").to_string();
            let attributes = keyed_attributes(&item, cx.parameters)?;
            resolve_tree(&item, &label, &attributes)
        }))
    }
}

fn keyed_attributes(item: &Value, parameters: &Parameters) -> Result<BTreeMap<String, Value>> {
    let mut attributes: BTreeMap<String, Value> = BTreeMap::new();
    if let Value::Object(map) = serde_json::to_value(parameters)? {
        for (key, value) in map {
            if matches!(value, Value::String(_) | Value::Number(_) | Value::Bool(_)) {
                attributes.insert(key, value);
            }
        }
    }
    if let Some(map) = item.as_object() {
        for (key, value) in map {
            attributes.insert(key.clone(), value.clone());
        }
    }
    Ok(attributes)
}

fn resolve_tree(value: &Value, path: &str, attributes: &BTreeMap<String, Value>) -> Result<Value> {
    let resolved = evaluate_keyed_by(value, path, attributes)?;
    match resolved {
        Value::Object(map) => {
            let mut rebuilt = serde_json::Map::new();
            for (key, entry) in map {
                let entry = resolve_tree(&entry, &format!("{path}.{key}"), attributes)?;
                rebuilt.insert(key, entry);
            }
            Ok(Value::Object(rebuilt))
        }
        Value::Array(items) => {
            let mut rebuilt = Vec::with_capacity(items.len());
            for (index, entry) in items.iter().enumerate() {
                rebuilt.push(resolve_tree(entry, &format!("{path}[{index}]"), attributes)?);
            }
            Ok(Value::Array(rebuilt))
        }
        other => Ok(other),
    }
}

pub fn declaration_label(item: &Value) -> Option<&str> {
    item.get("label").and_then(Value::as_str)
}

/// Transforms addressable from stage files.
pub struct TransformRegistry {
    transforms: BTreeMap<String, Arc<dyn Transform>>,
}

impl TransformRegistry {
    pub fn new() -> Self {
        Self {
            transforms: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("validate", Arc::new(ValidateTransform::new()));
        registry.register("job_defaults", Arc::new(JobDefaultsTransform));
        registry.register("resolve_keyed_by", Arc::new(ResolveKeyedByTransform));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, transform: Arc<dyn Transform>) {
        self.transforms.insert(name.into(), transform);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Transform>> {
        self.transforms
            .get(name)
            .ok_or_else(|| Error::UnknownTransform(name.to_string()))
    }
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// A stage's transform chain, resolved from the registry.
#[derive(Debug)]
pub struct TransformPipeline {
    transforms: Vec<Arc<dyn Transform>>,
}

impl TransformPipeline {
    /// Look up `names` in declaration order; an unknown name is fatal.
    pub fn from_names(registry: &TransformRegistry, names: &[String]) -> Result<Self> {
        let transforms = names
            .iter()
            .map(|name| registry.get(name).cloned())
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { transforms })
    }

    /// Compose the chain over `declarations`. Nothing runs until the
    /// returned stream is consumed.
    pub fn apply<'a>(&'a self, cx: &'a TransformContext<'a>, declarations: Vec<Value>) -> JobStream<'a> {
        let mut stream: JobStream<'a> = Box::new(declarations.into_iter().map(Ok));
        for transform in &self.transforms {
            stream = transform.apply(cx, stream);
        }
        stream
    }
}
