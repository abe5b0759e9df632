//! Gantry pipeline
//!
//! Turns a directory of stage definitions into an optimized job graph:
//! stage loading, declaration transforms, target filtering, the phased
//! generator, optimization strategies and the final pipeline document.

pub mod config;
pub mod filter;
pub mod generator;
pub mod loader;
pub mod optimize;
pub mod render;
pub mod schema;
pub mod stage;
pub mod transform;

use std::collections::BTreeMap;
use std::sync::Arc;

use gantry_core::{Error, Result};

pub use config::{ConfigFile, GraphConfig};
pub use generator::{Generator, ParametersInput, Phase};
pub use render::{render_pipeline, PipelineDocument};

/// Everything pluggable, bundled. Populated once at startup, handed to
/// the generator, and extended by the activated extension before any
/// stage loads.
pub struct Registries {
    pub loaders: loader::LoaderRegistry,
    pub transforms: transform::TransformRegistry,
    pub filters: filter::FilterRegistry,
    pub strategies: optimize::StrategyRegistry,
    pub extensions: ExtensionRegistry,
}

impl Registries {
    /// Every built-in registered, no extensions.
    pub fn with_builtins() -> Self {
        Self {
            loaders: loader::LoaderRegistry::with_builtins(),
            transforms: transform::TransformRegistry::with_builtins(),
            filters: filter::FilterRegistry::with_builtins(),
            strategies: optimize::StrategyRegistry::with_builtins(),
            extensions: ExtensionRegistry::new(),
        }
    }
}

impl Default for Registries {
    fn default() -> Self {
        Self::with_builtins()
    }
}

/// Hook run once the graph configuration is loaded, before any stage.
/// An extension may register additional loaders, transforms, filters or
/// strategies under its own names.
pub trait Extension: Send + Sync {
    fn activate(&self, graph_config: &GraphConfig, registries: &mut Registries) -> Result<()>;
}

/// Extensions selectable from `config.yml`.
pub struct ExtensionRegistry {
    extensions: BTreeMap<String, Arc<dyn Extension>>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self {
            extensions: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, extension: Arc<dyn Extension>) {
        self.extensions.insert(name.into(), extension);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Extension>> {
        self.extensions
            .get(name)
            .ok_or_else(|| Error::UnknownExtension(name.to_string()))
    }
}

impl Default for ExtensionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
