//! Job value objects.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Optimization directive attached to a job: the strategy to consult and an
/// opaque argument handed through to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Optimization {
    pub strategy: String,
    #[serde(default)]
    pub argument: Value,
}

impl Optimization {
    pub fn new(strategy: impl Into<String>, argument: Value) -> Self {
        Self {
            strategy: strategy.into(),
            argument,
        }
    }
}

/// One schedulable CI unit.
///
/// A job is created during stage loading and is immutable afterwards, apart
/// from the optimizer's payload rewrite when the final subgraph is cut.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub stage: String,
    pub label: String,
    pub description: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
    /// Dependency name -> label of the job it resolves to. After a
    /// `JobGraph` is built, the graph's named edges are the source of truth
    /// for this mapping.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub upstream_dependencies: BTreeMap<String, String>,
    /// Best-effort dependencies: contribute "needs" entries only while the
    /// target survives optimization, and never create graph edges.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub soft_dependencies: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization: Option<Optimization>,
    /// Provider job body, carried opaquely and rendered as-is into the
    /// final pipeline.
    pub payload: Value,
}

impl Job {
    /// Build a job, mirroring `stage` into `attributes["stage"]` so that
    /// attribute-driven machinery (filters, keyed-by) can see it.
    pub fn new(
        stage: impl Into<String>,
        label: impl Into<String>,
        description: impl Into<String>,
        attributes: BTreeMap<String, Value>,
        payload: Value,
    ) -> Self {
        let mut job = Self {
            stage: stage.into(),
            label: label.into(),
            description: description.into(),
            attributes,
            upstream_dependencies: BTreeMap::new(),
            soft_dependencies: Vec::new(),
            optimization: None,
            payload,
        };
        job.sync_stage_attribute();
        job
    }

    pub fn with_upstream_dependencies(mut self, dependencies: BTreeMap<String, String>) -> Self {
        self.upstream_dependencies = dependencies;
        self
    }

    pub fn with_soft_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.soft_dependencies = dependencies;
        self
    }

    pub fn with_optimization(mut self, optimization: Optimization) -> Self {
        self.optimization = Some(optimization);
        self
    }

    /// True when the job asks to be pulled into the target graph even if no
    /// filter selected it.
    pub fn always_target(&self) -> bool {
        matches!(self.attributes.get("always_target"), Some(Value::Bool(true)))
    }

    /// Re-establish the stage attribute, e.g. after deserialization.
    pub(crate) fn sync_stage_attribute(&mut self) {
        self.attributes
            .insert("stage".to_string(), Value::String(self.stage.clone()));
    }
}
