//! Run parameters.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

fn default_filters() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_optimize_target_jobs() -> bool {
    true
}

fn default_build_date() -> DateTime<Utc> {
    Utc::now()
}

/// Externally supplied inputs for one generation run.
///
/// Every field has a default so a partial parameters file is enough to run
/// with. Keys not named here are kept in `extra`, so extensions and custom
/// filters can define their own parameters without changes to this struct.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    #[serde(default)]
    pub base_repository: String,
    #[serde(default)]
    pub base_rev: String,
    #[serde(default = "default_build_date")]
    pub build_date: DateTime<Utc>,
    /// Labels exempt from removal and replacement regardless of strategy
    /// outcome.
    #[serde(default)]
    pub do_not_optimize: Vec<String>,
    /// Paths touched by the change under consideration. VCS integration
    /// lives outside the compiler, so the change arrives as data.
    #[serde(default)]
    pub files_changed: Vec<String>,
    /// Ordered target filter names applied when computing the target job
    /// set. An empty list keeps every job.
    #[serde(default = "default_filters")]
    pub filters: Vec<String>,
    #[serde(default)]
    pub head_ref: String,
    #[serde(default)]
    pub head_repository: String,
    #[serde(default)]
    pub head_rev: String,
    #[serde(default)]
    pub head_tag: String,
    /// When false, every job in the target set joins `do_not_optimize`.
    #[serde(default = "default_optimize_target_jobs")]
    pub optimize_target_jobs: bool,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub pipeline_source: String,
    /// Limit generation to this stage and its ancestry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_stage: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            base_repository: String::new(),
            base_rev: String::new(),
            build_date: default_build_date(),
            do_not_optimize: Vec::new(),
            files_changed: Vec::new(),
            filters: default_filters(),
            head_ref: String::new(),
            head_repository: String::new(),
            head_rev: String::new(),
            head_tag: String::new(),
            optimize_target_jobs: default_optimize_target_jobs(),
            owner: String::new(),
            pipeline_source: String::new(),
            target_stage: None,
            extra: BTreeMap::new(),
        }
    }
}

impl Parameters {
    /// Load parameters from a YAML or JSON file, or defaults for the
    /// literal spec `defaults`.
    pub fn load(spec: &str) -> Result<Parameters> {
        if spec == "defaults" {
            return Ok(Parameters::default());
        }
        let path = Path::new(spec);
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yml") | Some("yaml") => Ok(serde_yaml::from_str(&fs::read_to_string(path)?)?),
            Some("json") => Ok(serde_json::from_str(&fs::read_to_string(path)?)?),
            _ => Err(Error::ParameterFormat(spec.to_string())),
        }
    }

    /// Shape checks beyond what deserialization enforces.
    pub fn check(&self) -> Result<()> {
        if self.filters.iter().any(String::is_empty) {
            return Err(Error::InvalidParameters(
                "filters must not contain empty names".to_string(),
            ));
        }
        if matches!(&self.target_stage, Some(stage) if stage.is_empty()) {
            return Err(Error::InvalidParameters(
                "target_stage must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Stable short identifier for this parameter set: the first 12 hex
    /// characters of the SHA-256 of the canonical JSON form. Used to key
    /// artifact directories and log lines.
    pub fn id(&self) -> Result<String> {
        let canonical = serde_json::to_string(self)?;
        let digest = Sha256::digest(canonical.as_bytes());
        Ok(hex::encode(&digest[..6]))
    }
}
