//! Static graph configuration.
//!
//! A graph definition lives in a directory tree: `config.yml` at the root
//! describes graph-wide settings, and each subdirectory with a `stage.yml`
//! contributes one stage. This module owns the root file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use gantry_core::{Error, Result};

use crate::schema::{validate_or_error, FieldSchema, Schema};

pub const CONFIG_FILE: &str = "config.yml";

/// Contents of `config.yml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Stage every other stage implicitly depends on. Its jobs are pulled
    /// into every target graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_stage: Option<String>,
    /// Extension activated before any stage loads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// Defaults merged beneath every job declaration in every stage.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub job_defaults: Value,
    /// Free-form sections readable by filters, strategies and extensions.
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// The loaded configuration plus the directory it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphConfig {
    pub root_dir: PathBuf,
    pub config: ConfigFile,
}

impl GraphConfig {
    /// Load and validate `<root>/config.yml`.
    pub fn load(root_dir: impl Into<PathBuf>) -> Result<Self> {
        let root_dir = root_dir.into();
        let path = root_dir.join(CONFIG_FILE);
        let text = fs::read_to_string(&path).map_err(|e| {
            Error::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let value = parse_yaml(&text, &path)?;
        validate_or_error(&config_schema(), &value, &path.display().to_string())?;
        let config: ConfigFile = serde_json::from_value(value)?;
        Ok(Self { root_dir, config })
    }

    /// Wrap an already-built configuration, for embedders and tests.
    pub fn new(root_dir: impl Into<PathBuf>, config: ConfigFile) -> Self {
        Self {
            root_dir: root_dir.into(),
            config,
        }
    }

    pub fn root_stage(&self) -> Option<&str> {
        self.config.root_stage.as_deref()
    }
}

fn parse_yaml(text: &str, path: &Path) -> Result<Value> {
    serde_yaml::from_str(text).map_err(|e| {
        Error::InvalidConfig(format!("cannot parse {}: {e}", path.display()))
    })
}

fn config_schema() -> Schema {
    Schema::open_object([
        FieldSchema::optional("root_stage", Schema::String),
        FieldSchema::optional("extension", Schema::String),
        FieldSchema::optional("job_defaults", Schema::map(Schema::Any)),
    ])
}
