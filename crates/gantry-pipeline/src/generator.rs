//! Phased job-graph generation.
//!
//! A [`Generator`] drives the pipeline from configuration to the final
//! optimized graph in fixed phases, each consuming its predecessors:
//!
//! 1. `graph_config` - load and validate `config.yml`, activate the
//!    configured extension
//! 2. `parameters` - obtain and check the run parameters
//! 3. `full_job_set` - load every stage in dependency order
//! 4. `full_job_graph` - connect jobs along their declared dependencies
//! 5. `target_job_set` - narrow to the jobs the run wants
//! 6. `target_job_graph` - close over dependencies, root stage and
//!    always-target jobs
//! 7. `optimized_job_graph` - prune what provably need not run
//!
//! Phases run lazily: asking for a result runs everything up to it, once,
//! and the first failure is definitive.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, error, info};

use gantry_core::graph::{Edge, Graph};
use gantry_core::jobgraph::JobGraph;
use gantry_core::{Error, Job, Optimization, Parameters, Result};

use crate::config::GraphConfig;
use crate::optimize;
use crate::stage::{self, StageConfig};
use crate::transform::{TransformContext, TransformPipeline};
use crate::Registries;

/// One generation phase, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    GraphConfig,
    Parameters,
    FullJobSet,
    FullJobGraph,
    TargetJobSet,
    TargetJobGraph,
    OptimizedJobGraph,
}

impl Phase {
    pub const ALL: [Phase; 7] = [
        Phase::GraphConfig,
        Phase::Parameters,
        Phase::FullJobSet,
        Phase::FullJobGraph,
        Phase::TargetJobSet,
        Phase::TargetJobGraph,
        Phase::OptimizedJobGraph,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Phase::GraphConfig => "graph_config",
            Phase::Parameters => "parameters",
            Phase::FullJobSet => "full_job_set",
            Phase::FullJobGraph => "full_job_graph",
            Phase::TargetJobSet => "target_job_set",
            Phase::TargetJobGraph => "target_job_graph",
            Phase::OptimizedJobGraph => "optimized_job_graph",
        }
    }

    /// Parse a phase name; hyphens and underscores are interchangeable.
    pub fn from_name(name: &str) -> Option<Self> {
        let normalized = name.replace('-', "_");
        Phase::ALL.into_iter().find(|phase| phase.name() == normalized)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Run parameters, either ready-made or loaded once the graph
/// configuration is known.
pub enum ParametersInput {
    Value(Parameters),
    Loader(Box<dyn FnOnce(&GraphConfig) -> Result<Parameters> + Send>),
}

impl ParametersInput {
    pub fn from_loader(
        loader: impl FnOnce(&GraphConfig) -> Result<Parameters> + Send + 'static,
    ) -> Self {
        Self::Loader(Box::new(loader))
    }
}

impl From<Parameters> for ParametersInput {
    fn from(parameters: Parameters) -> Self {
        Self::Value(parameters)
    }
}

#[derive(Default)]
struct PhaseStore {
    graph_config: Option<GraphConfig>,
    parameters: Option<Parameters>,
    full_job_set: Option<JobGraph>,
    full_job_graph: Option<JobGraph>,
    target_job_set: Option<JobGraph>,
    target_job_graph: Option<JobGraph>,
    optimized_job_graph: Option<JobGraph>,
}

impl PhaseStore {
    fn is_set(&self, phase: Phase) -> bool {
        match phase {
            Phase::GraphConfig => self.graph_config.is_some(),
            Phase::Parameters => self.parameters.is_some(),
            Phase::FullJobSet => self.full_job_set.is_some(),
            Phase::FullJobGraph => self.full_job_graph.is_some(),
            Phase::TargetJobSet => self.target_job_set.is_some(),
            Phase::TargetJobGraph => self.target_job_graph.is_some(),
            Phase::OptimizedJobGraph => self.optimized_job_graph.is_some(),
        }
    }
}

fn phase_order() -> Error {
    Error::Internal("generation phase ran out of order".to_string())
}

/// Drives generation from configuration to the optimized job graph.
pub struct Generator {
    root_dir: Option<PathBuf>,
    prebuilt_config: Option<GraphConfig>,
    stage_configs: Option<Vec<StageConfig>>,
    parameters_input: Option<ParametersInput>,
    registries: Registries,
    phases: PhaseStore,
}

impl Generator {
    /// Generate from `<root_dir>/config.yml` and the stage directories
    /// beneath it.
    pub fn new(
        root_dir: impl Into<PathBuf>,
        parameters: impl Into<ParametersInput>,
        registries: Registries,
    ) -> Self {
        Self {
            root_dir: Some(root_dir.into()),
            prebuilt_config: None,
            stage_configs: None,
            parameters_input: Some(parameters.into()),
            registries,
            phases: PhaseStore::default(),
        }
    }

    /// Generate from pre-built configuration, touching no filesystem.
    pub fn from_stage_configs(
        graph_config: GraphConfig,
        stages: Vec<StageConfig>,
        parameters: impl Into<ParametersInput>,
        registries: Registries,
    ) -> Self {
        Self {
            root_dir: None,
            prebuilt_config: Some(graph_config),
            stage_configs: Some(stages),
            parameters_input: Some(parameters.into()),
            registries,
            phases: PhaseStore::default(),
        }
    }

    pub fn graph_config(&mut self) -> Result<&GraphConfig> {
        self.run_until(Phase::GraphConfig)?;
        self.phases.graph_config.as_ref().ok_or_else(phase_order)
    }

    pub fn parameters(&mut self) -> Result<&Parameters> {
        self.run_until(Phase::Parameters)?;
        self.phases.parameters.as_ref().ok_or_else(phase_order)
    }

    pub fn full_job_set(&mut self) -> Result<&JobGraph> {
        self.job_graph(Phase::FullJobSet)
    }

    pub fn full_job_graph(&mut self) -> Result<&JobGraph> {
        self.job_graph(Phase::FullJobGraph)
    }

    pub fn target_job_set(&mut self) -> Result<&JobGraph> {
        self.job_graph(Phase::TargetJobSet)
    }

    pub fn target_job_graph(&mut self) -> Result<&JobGraph> {
        self.job_graph(Phase::TargetJobGraph)
    }

    pub fn optimized_job_graph(&mut self) -> Result<&JobGraph> {
        self.job_graph(Phase::OptimizedJobGraph)
    }

    /// The job graph computed by `phase`; the two configuration phases
    /// have no job graph.
    pub fn job_graph(&mut self, phase: Phase) -> Result<&JobGraph> {
        self.run_until(phase)?;
        let slot = match phase {
            Phase::FullJobSet => &self.phases.full_job_set,
            Phase::FullJobGraph => &self.phases.full_job_graph,
            Phase::TargetJobSet => &self.phases.target_job_set,
            Phase::TargetJobGraph => &self.phases.target_job_graph,
            Phase::OptimizedJobGraph => &self.phases.optimized_job_graph,
            Phase::GraphConfig | Phase::Parameters => {
                return Err(Error::Internal(format!("phase {phase} is not a job graph")));
            }
        };
        slot.as_ref().ok_or_else(phase_order)
    }

    /// Run everything and take ownership of the final graph.
    pub fn into_optimized_job_graph(mut self) -> Result<JobGraph> {
        self.run_until(Phase::OptimizedJobGraph)?;
        self.phases.optimized_job_graph.take().ok_or_else(phase_order)
    }

    fn run_until(&mut self, upto: Phase) -> Result<()> {
        loop {
            let next = Phase::ALL
                .into_iter()
                .take_while(|phase| *phase <= upto)
                .find(|phase| !self.phases.is_set(*phase));
            let Some(next) = next else {
                return Ok(());
            };
            debug!(phase = %next, "Running generation phase");
            self.run_phase(next)?;
        }
    }

    fn run_phase(&mut self, phase: Phase) -> Result<()> {
        match phase {
            Phase::GraphConfig => self.run_graph_config(),
            Phase::Parameters => self.run_parameters(),
            Phase::FullJobSet => self.run_full_job_set(),
            Phase::FullJobGraph => self.run_full_job_graph(),
            Phase::TargetJobSet => self.run_target_job_set(),
            Phase::TargetJobGraph => self.run_target_job_graph(),
            Phase::OptimizedJobGraph => self.run_optimized_job_graph(),
        }
    }

    fn run_graph_config(&mut self) -> Result<()> {
        let graph_config = match self.prebuilt_config.take() {
            Some(config) => config,
            None => {
                let root_dir = self
                    .root_dir
                    .as_ref()
                    .ok_or_else(|| Error::Internal("generator has no configuration source".to_string()))?;
                GraphConfig::load(root_dir)?
            }
        };
        if let Some(name) = graph_config.config.extension.clone() {
            info!(extension = %name, "Activating extension");
            let extension = self.registries.extensions.get(&name)?.clone();
            extension.activate(&graph_config, &mut self.registries)?;
        }
        self.phases.graph_config = Some(graph_config);
        Ok(())
    }

    fn run_parameters(&mut self) -> Result<()> {
        let input = self
            .parameters_input
            .take()
            .ok_or_else(|| Error::Internal("run parameters were already consumed".to_string()))?;
        let graph_config = self.phases.graph_config.as_ref().ok_or_else(phase_order)?;
        let parameters = match input {
            ParametersInput::Value(parameters) => parameters,
            ParametersInput::Loader(load) => load(graph_config)?,
        };
        parameters.check()?;
        info!(parameters = %parameters.id()?, "Generating with parameters");
        self.phases.parameters = Some(parameters);
        Ok(())
    }

    fn run_full_job_set(&mut self) -> Result<()> {
        let stages = match self.stage_configs.take() {
            Some(stages) => stages,
            None => {
                let root_dir = self
                    .root_dir
                    .as_ref()
                    .ok_or_else(|| Error::Internal("generator has no stage source".to_string()))?;
                stage::discover_stages(root_dir)?
            }
        };
        let graph_config = self.phases.graph_config.as_ref().ok_or_else(phase_order)?;
        let parameters = self.phases.parameters.as_ref().ok_or_else(phase_order)?;

        let stages = match parameters.target_stage.as_deref() {
            Some(target) => {
                info!(target_stage = %target, "Limiting generation to the target stage ancestry");
                stage::stage_ancestry(stages, target, graph_config.root_stage())?
            }
            None => stages,
        };
        let ordered = stage::stage_load_order(&stages, graph_config.root_stage())?;

        let mut all_jobs: BTreeMap<String, Job> = BTreeMap::new();
        for stage_config in ordered {
            let upstream_jobs: Vec<Job> = all_jobs
                .values()
                .filter(|job| stage_config.upstream_dependencies.contains(&job.stage))
                .cloned()
                .collect();
            let loaded = self
                .load_stage(stage_config, graph_config, parameters, &upstream_jobs)
                .map_err(|e| {
                    error!(stage = %stage_config.name, error = %e, "Failed to load stage");
                    Error::StageLoad {
                        stage: stage_config.name.clone(),
                        source: Box::new(e),
                    }
                })?;
            info!(stage = %stage_config.name, count = loaded.len(), "Generated jobs for stage");
            for job in loaded {
                if all_jobs.contains_key(&job.label) {
                    return Err(Error::DuplicateLabel(job.label));
                }
                all_jobs.insert(job.label.clone(), job);
            }
        }

        let nodes: BTreeSet<String> = all_jobs.keys().cloned().collect();
        let job_graph = JobGraph::new(all_jobs, Graph::new(nodes, BTreeSet::new())?)?;
        info!(jobs = job_graph.len(), "Generated full job set");
        self.phases.full_job_set = Some(job_graph);
        Ok(())
    }

    fn load_stage(
        &self,
        stage_config: &StageConfig,
        graph_config: &GraphConfig,
        parameters: &Parameters,
        upstream_jobs: &[Job],
    ) -> Result<Vec<Job>> {
        let loader = self.registries.loaders.get(&stage_config.loader)?;
        let declarations = loader.load(stage_config, parameters, upstream_jobs)?;
        let pipeline = TransformPipeline::from_names(&self.registries.transforms, &stage_config.transforms)?;
        let context = TransformContext {
            stage: stage_config,
            graph_config,
            parameters,
            upstream_jobs,
        };
        let mut jobs = Vec::new();
        for item in pipeline.apply(&context, declarations) {
            jobs.push(job_from_declaration(&stage_config.name, item?)?);
        }
        Ok(jobs)
    }

    fn run_full_job_graph(&mut self) -> Result<()> {
        let full_job_set = self.phases.full_job_set.as_ref().ok_or_else(phase_order)?;
        let mut edges: BTreeSet<Edge> = BTreeSet::new();
        for job in full_job_set.jobs() {
            for (dep_name, dep_label) in &job.upstream_dependencies {
                if !full_job_set.contains(dep_label) {
                    return Err(Error::UnknownDependency {
                        label: job.label.clone(),
                        dep_name: dep_name.clone(),
                        dependency: dep_label.clone(),
                    });
                }
                edges.insert(Edge::new(job.label.clone(), dep_label.clone(), dep_name.clone()));
            }
        }
        let graph = Graph::new(full_job_set.label_set(), edges)?;
        let job_graph = JobGraph::new(full_job_set.job_table().clone(), graph)?;
        info!(
            jobs = job_graph.len(),
            dependencies = job_graph.graph().edge_count(),
            "Connected full job graph"
        );
        self.phases.full_job_graph = Some(job_graph);
        Ok(())
    }

    fn run_target_job_set(&mut self) -> Result<()> {
        let graph_config = self.phases.graph_config.as_ref().ok_or_else(phase_order)?;
        let parameters = self.phases.parameters.as_ref().ok_or_else(phase_order)?;
        let full_job_graph = self.phases.full_job_graph.as_ref().ok_or_else(phase_order)?;

        let mut surviving: BTreeSet<String> = full_job_graph.label_set();
        for filter_name in &parameters.filters {
            let filter = self.registries.filters.get(filter_name)?;
            let candidate = narrowed(full_job_graph, &surviving)?;
            let selected: BTreeSet<String> = filter
                .select(&candidate, parameters, graph_config)?
                .into_iter()
                .collect();
            let before = surviving.len();
            surviving.retain(|label| selected.contains(label));
            info!(
                filter = %filter_name,
                pruned = before - surviving.len(),
                remain = surviving.len(),
                "Applied target filter"
            );
        }

        let target_set = narrowed(full_job_graph, &surviving)?;
        self.phases.target_job_set = Some(target_set);
        Ok(())
    }

    fn run_target_job_graph(&mut self) -> Result<()> {
        let graph_config = self.phases.graph_config.as_ref().ok_or_else(phase_order)?;
        let full_job_graph = self.phases.full_job_graph.as_ref().ok_or_else(phase_order)?;
        let target_job_set = self.phases.target_job_set.as_ref().ok_or_else(phase_order)?;

        let mut roots: BTreeSet<String> = target_job_set.label_set();
        if let Some(root_stage) = graph_config.root_stage() {
            for job in full_job_graph.jobs() {
                if job.stage == root_stage {
                    roots.insert(job.label.clone());
                }
            }
        }
        let always_target: Vec<String> = full_job_graph
            .jobs()
            .filter(|job| job.always_target())
            .map(|job| job.label.clone())
            .collect();
        let added = always_target
            .iter()
            .filter(|label| !roots.contains(label.as_str()))
            .count();
        if added > 0 {
            info!(count = added, "Adding always_target jobs to the target graph");
        }
        roots.extend(always_target);

        let closure = full_job_graph.graph().transitive_closure(&roots)?;
        let jobs: BTreeMap<String, Job> = full_job_graph
            .job_table()
            .iter()
            .filter(|(label, _)| closure.contains(label))
            .map(|(label, job)| (label.clone(), job.clone()))
            .collect();
        let target_graph = JobGraph::new(jobs, closure)?;
        info!(jobs = target_graph.len(), "Computed target job graph");
        self.phases.target_job_graph = Some(target_graph);
        Ok(())
    }

    fn run_optimized_job_graph(&mut self) -> Result<()> {
        let parameters = self.phases.parameters.as_ref().ok_or_else(phase_order)?;
        let target_job_set = self.phases.target_job_set.as_ref().ok_or_else(phase_order)?;
        let target_job_graph = self.phases.target_job_graph.as_ref().ok_or_else(phase_order)?;

        let mut do_not_optimize: BTreeSet<String> =
            parameters.do_not_optimize.iter().cloned().collect();
        if !parameters.optimize_target_jobs {
            do_not_optimize.extend(target_job_set.labels().map(str::to_string));
        }
        let optimized = optimize::optimize_job_graph(
            target_job_graph,
            parameters,
            &do_not_optimize,
            &self.registries.strategies,
        )?;
        self.phases.optimized_job_graph = Some(optimized);
        Ok(())
    }
}

/// The subset of `job_graph` with the `keep` labels and no edges. Filters
/// judge jobs in isolation; dependency context comes back in the target
/// job graph phase.
fn narrowed(job_graph: &JobGraph, keep: &BTreeSet<String>) -> Result<JobGraph> {
    let jobs: BTreeMap<String, Job> = job_graph
        .job_table()
        .iter()
        .filter(|(label, _)| keep.contains(*label))
        .map(|(label, job)| (label.clone(), job.clone()))
        .collect();
    JobGraph::new(jobs, Graph::new(keep.clone(), BTreeSet::new())?)
}

/// Convert a fully transformed declaration into a job.
fn job_from_declaration(stage: &str, declaration: Value) -> Result<Job> {
    #[derive(Deserialize)]
    struct Declaration {
        label: String,
        description: String,
        #[serde(default)]
        attributes: BTreeMap<String, Value>,
        payload: Value,
        #[serde(default)]
        optimization: Option<Optimization>,
        #[serde(default)]
        upstream_dependencies: BTreeMap<String, String>,
        #[serde(default)]
        soft_dependencies: Vec<String>,
    }

    let declared: Declaration = serde_json::from_value(declaration).map_err(|e| {
        Error::SchemaValidation {
            context: format!("stage {stage}"),
            detail: e.to_string(),
        }
    })?;
    let job = Job::new(
        stage,
        declared.label,
        declared.description,
        declared.attributes,
        declared.payload,
    )
    .with_upstream_dependencies(declared.upstream_dependencies)
    .with_soft_dependencies(declared.soft_dependencies);
    Ok(match declared.optimization {
        Some(optimization) => job.with_optimization(optimization),
        None => job,
    })
}
