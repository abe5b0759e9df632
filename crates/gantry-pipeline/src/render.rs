//! Pipeline rendering.
//!
//! The last step folds an optimized job graph into a provider-neutral
//! document: the surviving stages in a valid execution order, plus each
//! job's payload keyed by label. What a CI provider makes of the payloads
//! is its own business.

use std::collections::{BTreeMap, BTreeSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use gantry_core::jobgraph::JobGraph;
use gantry_core::{Error, Result};

/// The rendered pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDocument {
    /// Stage names, dependencies first.
    pub stages: Vec<String>,
    /// Label -> provider payload.
    pub jobs: BTreeMap<String, Value>,
}

/// Fold `job_graph` into the final pipeline document.
pub fn render_pipeline(job_graph: &JobGraph) -> Result<PipelineDocument> {
    let stages = order_stages(job_graph)?;
    let jobs = job_graph
        .job_table()
        .iter()
        .map(|(label, job)| (label.clone(), job.payload.clone()))
        .collect();
    Ok(PipelineDocument { stages, jobs })
}

/// Topological order over the stage graph induced by job edges that cross
/// stage boundaries. Stages without cross-stage edges still appear.
fn order_stages(job_graph: &JobGraph) -> Result<Vec<String>> {
    let mut stage_of: BTreeMap<&str, &str> = BTreeMap::new();
    for job in job_graph.jobs() {
        stage_of.insert(job.label.as_str(), job.stage.as_str());
    }
    let stage_names: BTreeSet<&str> = stage_of.values().copied().collect();

    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut indices: BTreeMap<&str, NodeIndex> = BTreeMap::new();
    // Insertion in name order keeps the resulting order stable across runs.
    for stage in &stage_names {
        let index = graph.add_node(*stage);
        indices.insert(*stage, index);
    }

    let mut seen: BTreeSet<(&str, &str)> = BTreeSet::new();
    for edge in job_graph.graph().edges() {
        let Some(&dependent_stage) = stage_of.get(edge.from.as_str()) else {
            return Err(Error::Internal(format!("edge endpoint {} has no job", edge.from)));
        };
        let Some(&dependency_stage) = stage_of.get(edge.to.as_str()) else {
            return Err(Error::Internal(format!("edge endpoint {} has no job", edge.to)));
        };
        if dependency_stage != dependent_stage && seen.insert((dependency_stage, dependent_stage)) {
            graph.add_edge(indices[dependency_stage], indices[dependent_stage], ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|_| {
        Error::CycleDetected(stage_names.iter().map(|s| s.to_string()).collect())
    })?;
    Ok(sorted.into_iter().map(|index| graph[index].to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::graph::{Edge, Graph};
    use gantry_core::Job;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn make_job(stage: &str, label: &str, payload: Value) -> Job {
        Job::new(stage, label, "a job", BTreeMap::new(), payload)
    }

    fn make_job_graph(jobs: Vec<Job>, edges: &[(&str, &str)]) -> JobGraph {
        let table: BTreeMap<String, Job> =
            jobs.into_iter().map(|j| (j.label.clone(), j)).collect();
        let nodes: BTreeSet<String> = table.keys().cloned().collect();
        let edge_set: BTreeSet<Edge> = edges
            .iter()
            .map(|(from, to)| Edge::new(*from, *to, "dep"))
            .collect();
        let graph = Graph::new(nodes, edge_set).expect("graph");
        JobGraph::new(table, graph).expect("job graph")
    }

    #[test]
    fn test_stages_are_ordered_dependencies_first() {
        let job_graph = make_job_graph(
            vec![
                make_job("test", "test-linux", json!({})),
                make_job("build", "build-linux", json!({})),
                make_job("images", "image-base", json!({})),
            ],
            &[
                ("test-linux", "build-linux"),
                ("build-linux", "image-base"),
            ],
        );
        let document = render_pipeline(&job_graph).expect("render");
        assert_eq!(document.stages, vec!["images", "build", "test"]);
    }

    #[test]
    fn test_isolated_stages_still_appear() {
        let job_graph = make_job_graph(
            vec![
                make_job("build", "build-linux", json!({})),
                make_job("lint", "lint-rs", json!({})),
            ],
            &[],
        );
        let document = render_pipeline(&job_graph).expect("render");
        let mut stages = document.stages.clone();
        stages.sort();
        assert_eq!(stages, vec!["build", "lint"]);
    }

    #[test]
    fn test_jobs_carry_payloads_by_label() {
        let job_graph = make_job_graph(
            vec![make_job("build", "build-linux", json!({"script": ["make"]}))],
            &[],
        );
        let document = render_pipeline(&job_graph).expect("render");
        assert_eq!(document.jobs["build-linux"], json!({"script": ["make"]}));
    }

    #[test]
    fn test_same_stage_edges_do_not_order_stages() {
        let job_graph = make_job_graph(
            vec![
                make_job("build", "build-a", json!({})),
                make_job("build", "build-b", json!({})),
            ],
            &[("build-b", "build-a")],
        );
        let document = render_pipeline(&job_graph).expect("render");
        assert_eq!(document.stages, vec!["build"]);
    }

    #[test]
    fn test_document_serializes_stably() {
        let job_graph = make_job_graph(
            vec![
                make_job("build", "build-linux", json!({"script": ["make"]})),
                make_job("test", "test-linux", json!({"script": ["make test"]})),
            ],
            &[("test-linux", "build-linux")],
        );
        let first = serde_yaml::to_string(&render_pipeline(&job_graph).expect("render"))
            .expect("serialize");
        let second = serde_yaml::to_string(&render_pipeline(&job_graph).expect("render"))
            .expect("serialize");
        assert_eq!(first, second);
    }
}
