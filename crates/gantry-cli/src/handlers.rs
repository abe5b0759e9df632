//! Command handlers.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use console::style;
use regex::Regex;

use gantry_core::{Error, Graph, Job, JobGraph, Parameters};
use gantry_pipeline::{render_pipeline, Generator, Phase, Registries};

use crate::commands::ShowFormat;

const CONFIG_TEMPLATE: &str = r#"job_defaults:
  attributes:
    owner: ci
"#;

const BUILD_STAGE_TEMPLATE: &str = r#"transforms:
  - job_defaults
  - resolve_keyed_by
  - validate

jobs:
  build:
    description: Build the project
    payload:
      command: make build
"#;

const TEST_STAGE_TEMPLATE: &str = r#"upstream_dependencies:
  - build

transforms:
  - job_defaults
  - resolve_keyed_by
  - validate

jobs:
  unit-tests:
    description: Run the unit test suite
    payload:
      command: make test
    upstream_dependencies:
      build: build
"#;

/// Scaffold a graph definition directory.
pub fn init(root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = root.join("config.yml");
    if config_path.exists() {
        println!(
            "{} {} already exists",
            style("!").yellow(),
            config_path.display()
        );
        return Ok(());
    }

    std::fs::create_dir_all(root.join("build"))?;
    std::fs::create_dir_all(root.join("test"))?;
    std::fs::write(&config_path, CONFIG_TEMPLATE)?;
    std::fs::write(root.join("build").join("stage.yml"), BUILD_STAGE_TEMPLATE)?;
    std::fs::write(root.join("test").join("stage.yml"), TEST_STAGE_TEMPLATE)?;

    println!(
        "{} Created graph definition at {}",
        style("✓").green(),
        root.display()
    );
    println!("  - config.yml");
    println!("  - build/stage.yml");
    println!("  - test/stage.yml");
    Ok(())
}

/// Validate a graph definition.
pub fn validate(root: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let mut generator = Generator::new(root, Parameters::default(), Registries::with_builtins());
    let job_graph = generator.full_job_graph()?;

    println!(
        "{} Graph definition at {} is valid",
        style("✓").green(),
        root.display()
    );
    println!("  Jobs: {}", job_graph.len());
    println!("  Dependencies: {}", job_graph.graph().edge_count());

    let mut stages: BTreeMap<&str, usize> = BTreeMap::new();
    for job in job_graph.jobs() {
        *stages.entry(job.stage.as_str()).or_default() += 1;
    }
    println!("  Stages: {}", stages.len());
    for (stage, count) in &stages {
        println!("    - {} ({} jobs)", stage, count);
    }
    Ok(())
}

/// Generate one phase and print it, once per parameter set.
pub fn show(
    phase_name: &str,
    root: &Path,
    parameters_specs: &[String],
    format: ShowFormat,
    jobs_regex: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(phase) = Phase::from_name(phase_name) else {
        let known = Phase::ALL
            .iter()
            .map(|phase| phase.name())
            .collect::<Vec<_>>()
            .join(", ");
        return Err(format!("unknown phase {phase_name}, expected one of: {known}").into());
    };

    if parameters_specs.len() <= 1 {
        let spec = parameters_specs
            .first()
            .map(String::as_str)
            .unwrap_or("defaults");
        let text = phase_text(root, spec, phase, format, jobs_regex)?;
        println!("{}", text.trim_end_matches('\n'));
        return Ok(());
    }

    // One generation per parameter set; each run is independent, so they
    // can proceed in parallel while output stays in argument order.
    let outputs = std::thread::scope(|scope| {
        let handles: Vec<_> = parameters_specs
            .iter()
            .map(|spec| {
                scope.spawn(move || {
                    phase_text(root, spec, phase, format, jobs_regex)
                        .map_err(|e| e.to_string())
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err("generation thread panicked".to_string()))
            })
            .collect::<Vec<_>>()
    });

    let mut failures = 0;
    for (spec, output) in parameters_specs.iter().zip(outputs) {
        println!("{} {}", style("▶").cyan(), style(spec).bold());
        match output {
            Ok(text) => println!("{}", text.trim_end_matches('\n')),
            Err(message) => {
                failures += 1;
                println!("{} {}", style("!").yellow(), message);
            }
        }
    }
    if failures > 0 {
        return Err(format!("{failures} parameter set(s) failed").into());
    }
    Ok(())
}

/// Generate every phase and write the decision artifacts.
pub fn decision(
    root: &Path,
    spec: &str,
    output_dir: &Path,
) -> Result<(), Box<dyn std::error::Error>> {
    let parameters = Parameters::load(spec)?;
    let mut generator = Generator::new(root, parameters, Registries::with_builtins());

    std::fs::create_dir_all(output_dir)?;
    println!(
        "{} Writing decision artifacts to {}",
        style("▶").cyan(),
        output_dir.display()
    );

    let parameters = generator.parameters()?;
    write_artifact(output_dir, "parameters.yml", &serde_yaml::to_string(parameters)?)?;

    let full_job_graph = generator.full_job_graph()?;
    write_artifact(
        output_dir,
        "full-job-graph.yml",
        &serde_yaml::to_string(full_job_graph)?,
    )?;

    let target_job_set = generator.target_job_set()?;
    let target_labels: Vec<&str> = target_job_set.labels().collect();
    write_artifact(
        output_dir,
        "target-jobs.yml",
        &serde_yaml::to_string(&target_labels)?,
    )?;

    let optimized = generator.optimized_job_graph()?;
    write_artifact(
        output_dir,
        "optimized-job-graph.yml",
        &serde_yaml::to_string(optimized)?,
    )?;

    let pipeline = render_pipeline(optimized)?;
    write_artifact(output_dir, "pipeline.yml", &serde_yaml::to_string(&pipeline)?)?;

    println!(
        "{} Decision complete, {} jobs scheduled",
        style("✓").green(),
        optimized.len()
    );
    Ok(())
}

fn write_artifact(output_dir: &Path, name: &str, contents: &str) -> std::io::Result<()> {
    std::fs::write(output_dir.join(name), contents)?;
    println!("  - {name}");
    Ok(())
}

/// Render a single phase to text for one parameter set.
pub(crate) fn phase_text(
    root: &Path,
    spec: &str,
    phase: Phase,
    format: ShowFormat,
    jobs_regex: Option<&str>,
) -> gantry_core::Result<String> {
    let parameters = Parameters::load(spec)?;
    let mut generator = Generator::new(root, parameters, Registries::with_builtins());

    match phase {
        Phase::GraphConfig => {
            let graph_config = generator.graph_config()?;
            config_text(&serde_json::to_value(&graph_config.config)?, format)
        }
        Phase::Parameters => {
            let parameters = generator.parameters()?;
            config_text(&serde_json::to_value(parameters)?, format)
        }
        _ => {
            let job_graph = generator.job_graph(phase)?;
            let narrowed;
            let shown = match jobs_regex {
                Some(pattern) => {
                    narrowed = matching_jobs(job_graph, pattern)?;
                    &narrowed
                }
                None => job_graph,
            };
            match format {
                ShowFormat::Labels => Ok(shown.labels().collect::<Vec<_>>().join("\n")),
                ShowFormat::Json => Ok(serde_json::to_string_pretty(shown)?),
                ShowFormat::Yaml => Ok(serde_yaml::to_string(shown)?),
            }
        }
    }
}

// The two configuration phases have no labels to list, so the labels
// format falls back to YAML for them.
fn config_text(value: &serde_json::Value, format: ShowFormat) -> gantry_core::Result<String> {
    match format {
        ShowFormat::Json => Ok(serde_json::to_string_pretty(value)?),
        ShowFormat::Labels | ShowFormat::Yaml => Ok(serde_yaml::to_string(value)?),
    }
}

/// The subgraph of jobs whose label matches `pattern`, keeping edges
/// whose endpoints both survive.
fn matching_jobs(job_graph: &JobGraph, pattern: &str) -> gantry_core::Result<JobGraph> {
    let matcher = Regex::new(pattern).map_err(|e| {
        Error::InvalidParameters(format!("invalid jobs filter {pattern:?}: {e}"))
    })?;

    let keep: BTreeSet<String> = job_graph
        .labels()
        .filter(|label| matcher.is_match(label))
        .map(str::to_string)
        .collect();
    let jobs: BTreeMap<String, Job> = job_graph
        .job_table()
        .iter()
        .filter(|(label, _)| keep.contains(*label))
        .map(|(label, job)| (label.clone(), job.clone()))
        .collect();

    let edges = job_graph
        .graph()
        .edges()
        .filter(|edge| keep.contains(&edge.from) && keep.contains(&edge.to))
        .cloned()
        .collect();

    JobGraph::new(jobs, Graph::new(keep, edges)?)
}
