//! Job table paired with its dependency graph.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{Edge, Graph};
use crate::job::Job;

/// A label -> `Job` table together with the `Graph` over exactly those
/// labels. The two views are kept consistent by construction: the table
/// keys and the graph nodes must match exactly.
#[derive(Debug, Clone, PartialEq)]
pub struct JobGraph {
    jobs: BTreeMap<String, Job>,
    graph: Graph,
}

impl JobGraph {
    pub fn new(jobs: BTreeMap<String, Job>, graph: Graph) -> Result<Self> {
        let labels: BTreeSet<&str> = jobs.keys().map(String::as_str).collect();
        let nodes: BTreeSet<&str> = graph.nodes().collect();
        if labels != nodes {
            let jobless: Vec<&&str> = nodes.difference(&labels).collect();
            let nodeless: Vec<&&str> = labels.difference(&nodes).collect();
            return Err(Error::NodeMismatch(format!(
                "nodes without a job {jobless:?}, jobs without a node {nodeless:?}"
            )));
        }
        Ok(Self { jobs, graph })
    }

    /// An empty job graph.
    pub fn empty() -> Self {
        Self {
            jobs: BTreeMap::new(),
            graph: Graph::empty(),
        }
    }

    pub fn get(&self, label: &str) -> Option<&Job> {
        self.jobs.get(label)
    }

    pub fn contains(&self, label: &str) -> bool {
        self.jobs.contains_key(label)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.jobs.keys().map(String::as_str)
    }

    pub fn label_set(&self) -> BTreeSet<String> {
        self.jobs.keys().cloned().collect()
    }

    pub fn job_table(&self) -> &BTreeMap<String, Job> {
        &self.jobs
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Jobs in dependency order: every job is yielded after the jobs it
    /// depends on.
    pub fn postorder(&self) -> impl Iterator<Item = Result<&Job>> {
        self.graph.visit_postorder().map(|label| {
            label.and_then(|l| {
                self.jobs
                    .get(l)
                    .ok_or_else(|| Error::Internal(format!("graph node without a job: {l}")))
            })
        })
    }

    /// Serializable form: label -> job, with each job's
    /// `upstream_dependencies` re-emitted from the graph's named edges. The
    /// graph, not the job field, is the source of truth for dependencies.
    pub fn to_document(&self) -> BTreeMap<String, Job> {
        let named_links = self.graph.named_links_dict();
        self.jobs
            .iter()
            .map(|(label, job)| {
                let mut job = job.clone();
                job.upstream_dependencies = named_links
                    .get(label.as_str())
                    .map(|deps| {
                        deps.iter()
                            .map(|(name, to)| ((*name).to_string(), (*to).to_string()))
                            .collect()
                    })
                    .unwrap_or_default();
                (label.clone(), job)
            })
            .collect()
    }

    /// Rebuild a `JobGraph` from its serialized form, reconstructing edges
    /// from each job's `upstream_dependencies`.
    pub fn from_document(document: BTreeMap<String, Job>) -> Result<Self> {
        let mut jobs = BTreeMap::new();
        let mut nodes = BTreeSet::new();
        let mut edges = BTreeSet::new();
        for (label, mut job) in document {
            job.sync_stage_attribute();
            nodes.insert(label.clone());
            for (name, to) in &job.upstream_dependencies {
                edges.insert(Edge::new(label.clone(), to.clone(), name.clone()));
            }
            jobs.insert(label, job);
        }
        let graph = Graph::new(nodes, edges)?;
        JobGraph::new(jobs, graph)
    }
}

impl Serialize for JobGraph {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_document().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for JobGraph {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let document = BTreeMap::<String, Job>::deserialize(deserializer)?;
        JobGraph::from_document(document).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn make_job(stage: &str, label: &str) -> Job {
        Job::new(stage, label, "", BTreeMap::new(), json!({}))
    }

    fn make_job_graph(entries: &[(&str, &str)], edges: &[(&str, &str, &str)]) -> JobGraph {
        let jobs: BTreeMap<String, Job> = entries
            .iter()
            .map(|(stage, label)| {
                let deps: BTreeMap<String, String> = edges
                    .iter()
                    .filter(|(from, _, _)| *from == *label)
                    .map(|(_, to, name)| (name.to_string(), to.to_string()))
                    .collect();
                (
                    label.to_string(),
                    make_job(stage, label).with_upstream_dependencies(deps),
                )
            })
            .collect();
        let graph = Graph::new(
            entries.iter().map(|(_, label)| label.to_string()).collect(),
            edges
                .iter()
                .map(|(from, to, name)| Edge::new(*from, *to, *name))
                .collect(),
        )
        .unwrap();
        JobGraph::new(jobs, graph).unwrap()
    }

    #[test]
    fn test_construction_requires_matching_labels() {
        let jobs: BTreeMap<String, Job> =
            [("a".to_string(), make_job("build", "a"))].into_iter().collect();
        let graph = Graph::new(
            ["a".to_string(), "b".to_string()].into_iter().collect(),
            BTreeSet::new(),
        )
        .unwrap();
        let err = JobGraph::new(jobs, graph).unwrap_err();
        assert!(matches!(err, Error::NodeMismatch(_)));
    }

    #[test]
    fn test_document_dependencies_come_from_graph_edges() {
        // the job's own field says nothing; the edges decide
        let jobs: BTreeMap<String, Job> = [
            ("a".to_string(), make_job("build", "a")),
            ("b".to_string(), make_job("test", "b")),
        ]
        .into_iter()
        .collect();
        let graph = Graph::new(
            ["a".to_string(), "b".to_string()].into_iter().collect(),
            [Edge::new("b", "a", "build")].into_iter().collect(),
        )
        .unwrap();
        let job_graph = JobGraph::new(jobs, graph).unwrap();
        let document = job_graph.to_document();
        assert_eq!(document["b"].upstream_dependencies["build"], "a");
        assert!(document["a"].upstream_dependencies.is_empty());
    }

    #[test]
    fn test_round_trip_through_json() {
        let job_graph = make_job_graph(
            &[("images", "img"), ("build", "b"), ("test", "t")],
            &[("b", "img", "image"), ("t", "b", "build"), ("t", "img", "image")],
        );
        let text = serde_json::to_string(&job_graph).unwrap();
        let restored: JobGraph = serde_json::from_str(&text).unwrap();
        assert_eq!(restored, job_graph);
    }

    #[test]
    fn test_round_trip_through_yaml() {
        let job_graph = make_job_graph(
            &[("build", "b"), ("test", "t")],
            &[("t", "b", "build")],
        );
        let text = serde_yaml::to_string(&job_graph).unwrap();
        let restored: JobGraph = serde_yaml::from_str(&text).unwrap();
        assert_eq!(restored, job_graph);
    }

    #[test]
    fn test_postorder_jobs() {
        let job_graph = make_job_graph(
            &[("build", "b"), ("test", "t")],
            &[("t", "b", "build")],
        );
        let labels: Vec<&str> = job_graph
            .postorder()
            .map(|job| job.unwrap().label.as_str())
            .collect();
        assert_eq!(labels, vec!["b", "t"]);
    }

    #[test]
    fn test_serialized_output_is_stable() {
        let job_graph = make_job_graph(
            &[("build", "b"), ("test", "t")],
            &[("t", "b", "build")],
        );
        let first = serde_json::to_string(&job_graph).unwrap();
        let second = serde_json::to_string(&job_graph).unwrap();
        assert_eq!(first, second);
    }
}
