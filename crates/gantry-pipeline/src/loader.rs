//! Stage loaders.
//!
//! A loader turns one stage's configuration into raw job declarations.
//! The built-in `declarations` loader reads them straight out of the
//! stage file; extensions register richer ones (directory scans, build
//! matrix expansion) under their own names.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use gantry_core::{Error, Job, Parameters, Result};

use crate::stage::StageConfig;

/// Produces the raw declarations for one stage.
///
/// `upstream_jobs` holds the jobs already generated by the stages this
/// stage declares as upstream dependencies.
pub trait Loader: Send + Sync {
    fn load(
        &self,
        stage: &StageConfig,
        parameters: &Parameters,
        upstream_jobs: &[Job],
    ) -> Result<Vec<Value>>;
}

impl fmt::Debug for dyn Loader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<dyn Loader>")
    }
}

/// Built-in loader yielding the stage file's inline `jobs` mapping, in
/// name order, with each job's name written into its `label`. The stage's
/// `label_prefix`, when set, qualifies every label. Declarations without
/// an `attributes` mapping get an empty one, so loader output always
/// carries the full required key set.
pub struct DeclarationLoader;

impl Loader for DeclarationLoader {
    fn load(
        &self,
        stage: &StageConfig,
        _parameters: &Parameters,
        _upstream_jobs: &[Job],
    ) -> Result<Vec<Value>> {
        let mut declarations = Vec::new();
        for (name, body) in &stage.jobs {
            let mut declaration = body.clone();
            let Some(map) = declaration.as_object_mut() else {
                return Err(Error::SchemaValidation {
                    context: format!("{}.jobs.{name}", stage.name),
                    detail: "declaration must be a mapping".to_string(),
                });
            };
            let label = match &stage.label_prefix {
                Some(prefix) => format!("{prefix}{name}"),
                None => name.clone(),
            };
            map.insert("label".to_string(), Value::String(label));
            map.entry("attributes")
                .or_insert_with(|| Value::Object(serde_json::Map::new()));
            declarations.push(declaration);
        }
        Ok(declarations)
    }
}

/// Loaders addressable from stage files.
pub struct LoaderRegistry {
    loaders: BTreeMap<String, Arc<dyn Loader>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self {
            loaders: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("declarations", Arc::new(DeclarationLoader));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, loader: Arc<dyn Loader>) {
        self.loaders.insert(name.into(), loader);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Loader>> {
        self.loaders
            .get(name)
            .ok_or_else(|| Error::UnknownLoader(name.to_string()))
    }
}

impl Default for LoaderRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
