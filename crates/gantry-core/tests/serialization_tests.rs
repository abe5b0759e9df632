//! Serialization roundtrip tests for gantry-core types.

use std::collections::BTreeMap;

use gantry_core::graph::{Edge, Graph};
use gantry_core::job::{Job, Optimization};
use gantry_core::jobgraph::JobGraph;
use serde_json::json;

fn make_full_job(stage: &str, label: &str, deps: &[(&str, &str)]) -> Job {
    let mut attributes = BTreeMap::new();
    attributes.insert("platform".to_string(), json!("linux"));
    Job::new(
        stage,
        label,
        format!("{label} job"),
        attributes,
        json!({"script": ["make", label], "tags": ["docker"]}),
    )
    .with_upstream_dependencies(
        deps.iter()
            .map(|(name, to)| (name.to_string(), to.to_string()))
            .collect(),
    )
    .with_optimization(Optimization::new(
        "skip_unless_changed",
        json!(["src/**"]),
    ))
}

fn make_job_graph() -> JobGraph {
    let jobs: BTreeMap<String, Job> = [
        ("image".to_string(), make_full_job("images", "image", &[])),
        (
            "build".to_string(),
            make_full_job("build", "build", &[("image", "image")]),
        ),
        (
            "test".to_string(),
            make_full_job("test", "test", &[("build", "build"), ("image", "image")]),
        ),
    ]
    .into_iter()
    .collect();
    let graph = Graph::new(
        ["image".to_string(), "build".to_string(), "test".to_string()]
            .into_iter()
            .collect(),
        [
            Edge::new("build", "image", "image"),
            Edge::new("test", "build", "build"),
            Edge::new("test", "image", "image"),
        ]
        .into_iter()
        .collect(),
    )
    .expect("valid graph");
    JobGraph::new(jobs, graph).expect("valid job graph")
}

#[test]
fn test_job_roundtrip_keeps_every_field() {
    let job = make_full_job("build", "build-linux", &[("image", "image-base")])
        .with_soft_dependencies(vec!["lint".to_string()]);
    let text = serde_json::to_string(&job).expect("serialize");
    let parsed: Job = serde_json::from_str(&text).expect("deserialize");
    assert_eq!(parsed, job);
}

#[test]
fn test_job_graph_roundtrip_json() {
    let job_graph = make_job_graph();
    let text = serde_json::to_string(&job_graph).expect("serialize");
    let parsed: JobGraph = serde_json::from_str(&text).expect("deserialize");
    assert_eq!(parsed, job_graph);
}

#[test]
fn test_job_graph_roundtrip_yaml() {
    let job_graph = make_job_graph();
    let text = serde_yaml::to_string(&job_graph).expect("serialize");
    let parsed: JobGraph = serde_yaml::from_str(&text).expect("deserialize");
    assert_eq!(parsed, job_graph);
}

#[test]
fn test_job_graph_document_shape() {
    let job_graph = make_job_graph();
    let doc = serde_json::to_value(&job_graph).expect("serialize");
    let test_job = &doc["test"];
    assert_eq!(test_job["stage"], json!("test"));
    assert_eq!(test_job["label"], json!("test"));
    assert_eq!(
        test_job["upstream_dependencies"],
        json!({"build": "build", "image": "image"})
    );
    assert_eq!(test_job["attributes"]["stage"], json!("test"));
    assert_eq!(
        test_job["optimization"],
        json!({"strategy": "skip_unless_changed", "argument": ["src/**"]})
    );
}

#[test]
fn test_serialized_bytes_are_deterministic() {
    let first = serde_yaml::to_string(&make_job_graph()).expect("serialize");
    let second = serde_yaml::to_string(&make_job_graph()).expect("serialize");
    assert_eq!(first, second);
}

#[test]
fn test_deserialization_restores_stage_attribute() {
    let doc = json!({
        "solo": {
            "stage": "build",
            "label": "solo",
            "description": "",
            "attributes": {},
            "payload": {},
        }
    });
    let job_graph: JobGraph = serde_json::from_value(doc).expect("deserialize");
    let job = job_graph.get("solo").expect("job present");
    assert_eq!(job.attributes["stage"], json!("build"));
}
