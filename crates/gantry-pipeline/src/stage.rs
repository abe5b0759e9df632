//! Stage configuration, discovery and load ordering.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use gantry_core::{Error, Result};

pub const STAGE_FILE: &str = "stage.yml";

/// Contents of one `<stage>/stage.yml`, plus the stage name taken from
/// the directory it was found in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    #[serde(skip)]
    pub name: String,
    /// Registered loader producing the stage's raw declarations.
    #[serde(default = "default_loader")]
    pub loader: String,
    /// Registered transforms applied to every declaration, in order.
    #[serde(default)]
    pub transforms: Vec<String>,
    /// Stages whose jobs must be loaded first; their jobs are handed to
    /// this stage's loader and transforms as context.
    #[serde(default)]
    pub upstream_dependencies: Vec<String>,
    /// Defaults merged beneath each declaration, above graph-wide ones.
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub job_defaults: Value,
    /// Prefix prepended to every declared job name to form its label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_prefix: Option<String>,
    /// Inline declarations for the built-in loader: job name to body.
    #[serde(default)]
    pub jobs: BTreeMap<String, Value>,
}

fn default_loader() -> String {
    "declarations".to_string()
}

impl StageConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            loader: default_loader(),
            transforms: Vec::new(),
            upstream_dependencies: Vec::new(),
            job_defaults: Value::Null,
            label_prefix: None,
            jobs: BTreeMap::new(),
        }
    }

    /// Parse `path` as a stage file named after its directory.
    pub fn load(name: &str, path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut config: StageConfig = serde_yaml::from_str(&text).map_err(|e| {
            Error::InvalidConfig(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.name = name.to_string();
        Ok(config)
    }
}

/// Find every direct subdirectory of `root_dir` carrying a stage file,
/// in name order.
pub fn discover_stages(root_dir: &Path) -> Result<Vec<StageConfig>> {
    let mut names = Vec::new();
    for entry in fs::read_dir(root_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.join(STAGE_FILE).is_file() {
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                names.push(name.to_string());
            }
        }
    }
    names.sort();

    let mut stages = Vec::new();
    for name in names {
        let path = root_dir.join(&name).join(STAGE_FILE);
        let stage = StageConfig::load(&name, &path).map_err(|e| Error::StageLoad {
            stage: name.clone(),
            source: Box::new(e),
        })?;
        stages.push(stage);
    }
    Ok(stages)
}

/// Topological load order over the stages, dependencies first. The root
/// stage, when configured, is an implicit dependency of every other stage.
pub fn stage_load_order<'a>(
    stages: &'a [StageConfig],
    root_stage: Option<&str>,
) -> Result<Vec<&'a StageConfig>> {
    let mut graph: DiGraph<&'a StageConfig, ()> = DiGraph::new();
    let mut indices: BTreeMap<&str, NodeIndex> = BTreeMap::new();

    // Insertion in name order keeps the resulting order stable across runs.
    let mut ordered: Vec<&StageConfig> = stages.iter().collect();
    ordered.sort_by(|a, b| a.name.cmp(&b.name));
    for stage in &ordered {
        let index = graph.add_node(*stage);
        indices.insert(stage.name.as_str(), index);
    }

    let root_index = match root_stage {
        Some(root) => match indices.get(root) {
            Some(&index) => Some(index),
            None => {
                return Err(Error::InvalidConfig(format!(
                    "root_stage {root} has no stage directory"
                )));
            }
        },
        None => None,
    };

    for stage in &ordered {
        let Some(&stage_index) = indices.get(stage.name.as_str()) else {
            return Err(Error::Internal(format!("stage {} not indexed", stage.name)));
        };
        for dependency in &stage.upstream_dependencies {
            let Some(&dep_index) = indices.get(dependency.as_str()) else {
                return Err(Error::UnknownStage {
                    stage: stage.name.clone(),
                    dependency: dependency.clone(),
                });
            };
            graph.add_edge(dep_index, stage_index, ());
        }
        if let Some(root_index) = root_index {
            if Some(stage.name.as_str()) != root_stage {
                graph.add_edge(root_index, stage_index, ());
            }
        }
    }

    let sorted = toposort(&graph, None).map_err(|_| {
        Error::CycleDetected(ordered.iter().map(|s| s.name.clone()).collect())
    })?;
    Ok(sorted.into_iter().map(|index| graph[index]).collect())
}

/// Stages in the dependency ancestry of `target`, target included, plus
/// the root stage when one is configured.
pub fn stage_ancestry(
    stages: Vec<StageConfig>,
    target: &str,
    root_stage: Option<&str>,
) -> Result<Vec<StageConfig>> {
    let by_name: BTreeMap<&str, &StageConfig> =
        stages.iter().map(|s| (s.name.as_str(), s)).collect();
    if !by_name.contains_key(target) {
        return Err(Error::InvalidParameters(format!(
            "target_stage {target} does not match any stage"
        )));
    }

    let mut keep: BTreeSet<String> = BTreeSet::new();
    let mut queue: Vec<&str> = vec![target];
    if let Some(root) = root_stage {
        if by_name.contains_key(root) {
            queue.push(root);
        }
    }
    while let Some(name) = queue.pop() {
        if !keep.insert(name.to_string()) {
            continue;
        }
        if let Some(stage) = by_name.get(name) {
            for dependency in &stage.upstream_dependencies {
                queue.push(dependency);
            }
        }
    }

    Ok(stages.into_iter().filter(|s| keep.contains(&s.name)).collect())
}
