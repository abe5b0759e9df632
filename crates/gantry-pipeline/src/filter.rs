//! Target filters.
//!
//! Filters narrow the full job set down to the jobs a run actually wants.
//! The run parameters name them in order; each filter sees the jobs still
//! standing and returns the labels it keeps, so applying several filters
//! intersects their selections.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value;

use gantry_core::jobgraph::JobGraph;
use gantry_core::{Error, Job, Parameters, Result};

use crate::config::GraphConfig;

/// Selects the labels to keep from the jobs still standing.
pub trait TargetFilter: Send + Sync {
    fn select(
        &self,
        job_graph: &JobGraph,
        parameters: &Parameters,
        graph_config: &GraphConfig,
    ) -> Result<Vec<String>>;
}

impl fmt::Debug for dyn TargetFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<dyn TargetFilter>")
    }
}

/// Keep jobs whose run-on attributes accept this run.
///
/// `run_on_pipeline_sources` and `run_on_git_branches` are lists in the
/// job's attributes; an absent list accepts everything and the entry
/// `"all"` is a wildcard. Branch rules match the head ref as an anchored
/// regular expression and never apply to merge request runs.
pub struct DefaultFilter;

impl TargetFilter for DefaultFilter {
    fn select(
        &self,
        job_graph: &JobGraph,
        parameters: &Parameters,
        _graph_config: &GraphConfig,
    ) -> Result<Vec<String>> {
        let mut selected = Vec::new();
        for job in job_graph.jobs() {
            if run_on_matches(job, parameters)? {
                selected.push(job.label.clone());
            }
        }
        Ok(selected)
    }
}

fn run_on_matches(job: &Job, parameters: &Parameters) -> Result<bool> {
    if let Some(sources) = string_list(job.attributes.get("run_on_pipeline_sources")) {
        if !sources.iter().any(|s| s == "all" || *s == parameters.pipeline_source) {
            return Ok(false);
        }
    }
    if parameters.pipeline_source != "merge_request_event" {
        if let Some(patterns) = string_list(job.attributes.get("run_on_git_branches")) {
            let branch = parameters
                .head_ref
                .strip_prefix("refs/heads/")
                .unwrap_or(&parameters.head_ref);
            if !branch_matches(&patterns, branch, &job.label)? {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

fn branch_matches(patterns: &[String], branch: &str, label: &str) -> Result<bool> {
    for pattern in patterns {
        if pattern == "all" {
            return Ok(true);
        }
        let anchored = Regex::new(&format!("^(?:{pattern})$")).map_err(|_| {
            Error::SchemaValidation {
                context: label.to_string(),
                detail: format!("invalid run_on_git_branches pattern {pattern:?}"),
            }
        })?;
        if anchored.is_match(branch) {
            return Ok(true);
        }
    }
    Ok(false)
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    let entries = value?.as_array()?;
    Some(
        entries
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
    )
}

/// Keep exactly the labels listed in the `target_labels` parameter.
pub struct TargetLabelsFilter;

impl TargetFilter for TargetLabelsFilter {
    fn select(
        &self,
        job_graph: &JobGraph,
        parameters: &Parameters,
        _graph_config: &GraphConfig,
    ) -> Result<Vec<String>> {
        let requested = match parameters.extra.get("target_labels") {
            Some(value) => string_list(Some(value)).unwrap_or_default(),
            None => Vec::new(),
        };
        Ok(requested
            .into_iter()
            .filter(|label| job_graph.contains(label))
            .collect())
    }
}

/// Keep nothing. Useful for runs that only want always-target jobs.
pub struct NothingFilter;

impl TargetFilter for NothingFilter {
    fn select(
        &self,
        _job_graph: &JobGraph,
        _parameters: &Parameters,
        _graph_config: &GraphConfig,
    ) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Filters addressable from run parameters.
pub struct FilterRegistry {
    filters: BTreeMap<String, Arc<dyn TargetFilter>>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self {
            filters: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("default", Arc::new(DefaultFilter));
        registry.register("target_labels", Arc::new(TargetLabelsFilter));
        registry.register("nothing", Arc::new(NothingFilter));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, filter: Arc<dyn TargetFilter>) {
        self.filters.insert(name.into(), filter);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn TargetFilter>> {
        self.filters
            .get(name)
            .ok_or_else(|| Error::UnknownFilter(name.to_string()))
    }
}

impl Default for FilterRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigFile;
    use gantry_core::graph::Graph;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn make_job(label: &str, attributes: Value) -> Job {
        let attributes = match attributes {
            Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        Job::new("build", label, "a job", attributes, json!({}))
    }

    fn make_job_graph(jobs: Vec<Job>) -> JobGraph {
        let table: BTreeMap<String, Job> =
            jobs.into_iter().map(|j| (j.label.clone(), j)).collect();
        let nodes: BTreeSet<String> = table.keys().cloned().collect();
        let graph = Graph::new(nodes, BTreeSet::new()).expect("graph");
        JobGraph::new(table, graph).expect("job graph")
    }

    fn select(
        filter: &dyn TargetFilter,
        job_graph: &JobGraph,
        parameters: &Parameters,
    ) -> Vec<String> {
        let graph_config = GraphConfig::new("gantry", ConfigFile::default());
        let mut labels = filter
            .select(job_graph, parameters, &graph_config)
            .expect("filter");
        labels.sort();
        labels
    }

    #[test]
    fn test_default_filter_keeps_unannotated_jobs() {
        let job_graph = make_job_graph(vec![make_job("plain", json!({}))]);
        let selected = select(&DefaultFilter, &job_graph, &Parameters::default());
        assert_eq!(selected, vec!["plain"]);
    }

    #[test]
    fn test_default_filter_honors_pipeline_sources() {
        let job_graph = make_job_graph(vec![
            make_job("cron-only", json!({"run_on_pipeline_sources": ["cron"]})),
            make_job("any-source", json!({"run_on_pipeline_sources": ["all"]})),
        ]);
        let parameters = Parameters {
            pipeline_source: "push".to_string(),
            ..Parameters::default()
        };
        let selected = select(&DefaultFilter, &job_graph, &parameters);
        assert_eq!(selected, vec!["any-source"]);
    }

    #[test]
    fn test_default_filter_matches_branches_as_anchored_patterns() {
        let job_graph = make_job_graph(vec![
            make_job("main-only", json!({"run_on_git_branches": ["main"]})),
            make_job("release", json!({"run_on_git_branches": ["release/.*"]})),
        ]);
        let parameters = Parameters {
            head_ref: "refs/heads/release/v2".to_string(),
            ..Parameters::default()
        };
        let selected = select(&DefaultFilter, &job_graph, &parameters);
        assert_eq!(selected, vec!["release"]);
    }

    #[test]
    fn test_default_filter_skips_branch_rules_for_merge_requests() {
        let job_graph = make_job_graph(vec![make_job(
            "main-only",
            json!({"run_on_git_branches": ["main"]}),
        )]);
        let parameters = Parameters {
            pipeline_source: "merge_request_event".to_string(),
            head_ref: "refs/heads/topic".to_string(),
            ..Parameters::default()
        };
        let selected = select(&DefaultFilter, &job_graph, &parameters);
        assert_eq!(selected, vec!["main-only"]);
    }

    #[test]
    fn test_default_filter_reports_bad_branch_pattern() {
        let job_graph = make_job_graph(vec![make_job(
            "broken",
            json!({"run_on_git_branches": ["("]}),
        )]);
        let graph_config = GraphConfig::new("gantry", ConfigFile::default());
        let err = DefaultFilter
            .select(&job_graph, &Parameters::default(), &graph_config)
            .expect_err("bad pattern");
        assert!(err.to_string().contains("broken"), "{err}");
    }

    #[test]
    fn test_target_labels_filter_keeps_only_known_requested_labels() {
        let job_graph = make_job_graph(vec![
            make_job("build-linux", json!({})),
            make_job("build-macos", json!({})),
        ]);
        let mut parameters = Parameters::default();
        parameters.extra.insert(
            "target_labels".to_string(),
            json!(["build-linux", "missing-job"]),
        );
        let selected = select(&TargetLabelsFilter, &job_graph, &parameters);
        assert_eq!(selected, vec!["build-linux"]);
    }

    #[test]
    fn test_nothing_filter_selects_nothing() {
        let job_graph = make_job_graph(vec![make_job("a", json!({}))]);
        let selected = select(&NothingFilter, &job_graph, &Parameters::default());
        assert_eq!(selected, Vec::<String>::new());
    }

    #[test]
    fn test_registry_rejects_unknown_filter() {
        let registry = FilterRegistry::with_builtins();
        let err = registry.get("nonesuch").expect_err("unknown filter");
        assert!(matches!(err, Error::UnknownFilter(_)), "{err}");
    }
}
