//! Strategy-driven graph pruning.
//!
//! Optimization shrinks the target job graph in two passes. The removal
//! pass walks dependents-first and drops every job whose strategy agrees,
//! but never a job that a surviving dependent still needs. The optional
//! replacement pass walks dependencies-first and lets a strategy swap a
//! job for a previously produced result. Finally the surviving subgraph
//! is cut: payload references are resolved against the survivors, "needs"
//! lists are materialized, and every edge with a pruned endpoint is
//! dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use gantry_core::graph::{Edge, Graph};
use gantry_core::jobgraph::JobGraph;
use gantry_core::reference::resolve_job_references;
use gantry_core::{Error, Job, Parameters, Result};

static NULL_ARGUMENT: Value = Value::Null;

/// Outcome of a replacement probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Replacement {
    /// Leave the job in the graph.
    Keep,
    /// Drop the job outright.
    Remove,
    /// Substitute the job with an already-produced result. Dependents
    /// resolve their references to this identifier instead of a label.
    WithId(String),
}

/// Policy deciding whether a job can be dropped from, or substituted in,
/// the final graph.
///
/// Implementations may probe external state (artifact caches, change
/// indexes). Probe failures should fail open: answer "keep" rather than
/// error, so a flaky probe never skips a job that had to run.
pub trait OptimizationStrategy: Send + Sync {
    fn should_remove(&self, job: &Job, parameters: &Parameters, argument: &Value) -> Result<bool> {
        let _ = (job, parameters, argument);
        Ok(false)
    }

    fn should_replace(
        &self,
        job: &Job,
        parameters: &Parameters,
        argument: &Value,
    ) -> Result<Replacement> {
        let _ = (job, parameters, argument);
        Ok(Replacement::Keep)
    }
}

/// Never removes anything. Jobs without a directive get this strategy.
pub struct NeverStrategy;

impl OptimizationStrategy for NeverStrategy {}

/// Always removable; the job runs only when a dependent needs it.
pub struct AlwaysStrategy;

impl OptimizationStrategy for AlwaysStrategy {
    fn should_remove(&self, _job: &Job, _parameters: &Parameters, _argument: &Value) -> Result<bool> {
        Ok(true)
    }
}

/// Remove the job unless one of the changed files matches one of the
/// argument's path patterns. An empty change list keeps the job.
pub struct SkipUnlessChanged;

impl OptimizationStrategy for SkipUnlessChanged {
    fn should_remove(&self, job: &Job, parameters: &Parameters, argument: &Value) -> Result<bool> {
        if parameters.files_changed.is_empty() {
            return Ok(false);
        }
        let patterns = patterns_from_argument(argument, &job.label)?;
        let touched = parameters
            .files_changed
            .iter()
            .any(|file| patterns.iter().any(|pattern| glob_match(pattern, file)));
        if !touched {
            debug!(job = %job.label, "No changed file matches, job removable");
        }
        Ok(!touched)
    }
}

fn patterns_from_argument(argument: &Value, label: &str) -> Result<Vec<String>> {
    let bad = || Error::SchemaValidation {
        context: label.to_string(),
        detail: "skip_unless_changed takes a path pattern or a list of them".to_string(),
    };
    match argument {
        Value::String(pattern) => Ok(vec![pattern.clone()]),
        Value::Array(entries) => entries
            .iter()
            .map(|entry| entry.as_str().map(str::to_string).ok_or_else(bad))
            .collect(),
        _ => Err(bad()),
    }
}

/// Match `path` against a glob-ish `pattern`: `*` spans one path segment,
/// `**` spans any depth.
fn glob_match(pattern: &str, path: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix("/**") {
        return path == prefix || path.starts_with(&format!("{prefix}/"));
    }
    if let Some(prefix) = pattern.strip_suffix("/*") {
        return path
            .strip_prefix(&format!("{prefix}/"))
            .is_some_and(|rest| !rest.contains('/'));
    }
    if let Some(star) = pattern.find('*') {
        let prefix = &pattern[..star];
        let suffix = &pattern[star + 1..];
        return path.len() >= prefix.len() + suffix.len()
            && path.starts_with(prefix)
            && path.ends_with(suffix);
    }
    pattern == path
}

/// Delegate to sub-strategies; the first non-default answer wins.
///
/// By default every sub-strategy sees the whole argument; an argument
/// splitter can fan it out instead, one slice per sub-strategy.
pub struct CompositeStrategy {
    strategies: Vec<Arc<dyn OptimizationStrategy>>,
    split_args: Option<ArgumentSplitter>,
}

type ArgumentSplitter = Box<dyn Fn(&Value, usize) -> Vec<Value> + Send + Sync>;

impl CompositeStrategy {
    pub fn new(strategies: Vec<Arc<dyn OptimizationStrategy>>) -> Self {
        Self {
            strategies,
            split_args: None,
        }
    }

    pub fn with_argument_splitter(
        mut self,
        splitter: impl Fn(&Value, usize) -> Vec<Value> + Send + Sync + 'static,
    ) -> Self {
        self.split_args = Some(Box::new(splitter));
        self
    }

    fn arguments(&self, argument: &Value) -> Result<Vec<Value>> {
        let arguments = match &self.split_args {
            Some(split) => split(argument, self.strategies.len()),
            None => vec![argument.clone(); self.strategies.len()],
        };
        if arguments.len() != self.strategies.len() {
            return Err(Error::Internal(format!(
                "argument splitter produced {} slices for {} strategies",
                arguments.len(),
                self.strategies.len()
            )));
        }
        Ok(arguments)
    }
}

impl OptimizationStrategy for CompositeStrategy {
    fn should_remove(&self, job: &Job, parameters: &Parameters, argument: &Value) -> Result<bool> {
        let arguments = self.arguments(argument)?;
        for (strategy, argument) in self.strategies.iter().zip(&arguments) {
            if strategy.should_remove(job, parameters, argument)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn should_replace(
        &self,
        job: &Job,
        parameters: &Parameters,
        argument: &Value,
    ) -> Result<Replacement> {
        let arguments = self.arguments(argument)?;
        for (strategy, argument) in self.strategies.iter().zip(&arguments) {
            let replacement = strategy.should_replace(job, parameters, argument)?;
            if replacement != Replacement::Keep {
                return Ok(replacement);
            }
        }
        Ok(Replacement::Keep)
    }
}

/// Strategies addressable from job optimization directives.
pub struct StrategyRegistry {
    strategies: BTreeMap<String, Arc<dyn OptimizationStrategy>>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self {
            strategies: BTreeMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("never", Arc::new(NeverStrategy));
        registry.register("always", Arc::new(AlwaysStrategy));
        registry.register("skip_unless_changed", Arc::new(SkipUnlessChanged));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, strategy: Arc<dyn OptimizationStrategy>) {
        self.strategies.insert(name.into(), strategy);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn OptimizationStrategy>> {
        self.strategies
            .get(name)
            .ok_or_else(|| Error::UnknownStrategy(name.to_string()))
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn directive(job: &Job) -> (&str, &Value) {
    match &job.optimization {
        Some(optimization) => (optimization.strategy.as_str(), &optimization.argument),
        None => ("never", &NULL_ARGUMENT),
    }
}

/// Prune `target_graph` and rewrite the survivors' payloads.
pub fn optimize_job_graph(
    target_graph: &JobGraph,
    parameters: &Parameters,
    do_not_optimize: &BTreeSet<String>,
    strategies: &StrategyRegistry,
) -> Result<JobGraph> {
    let mut removed = remove_jobs(target_graph, parameters, do_not_optimize, strategies)?;
    let replacements = replace_jobs(target_graph, parameters, do_not_optimize, strategies, &mut removed)?;
    let subgraph = get_subgraph(target_graph, &removed, &replacements)?;
    info!(
        before = target_graph.len(),
        after = subgraph.len(),
        "Optimization complete"
    );
    Ok(subgraph)
}

/// Dependents-first removal. A job is only removed once every dependent
/// has been removed, so a kept job never loses a dependency here.
fn remove_jobs(
    target_graph: &JobGraph,
    parameters: &Parameters,
    do_not_optimize: &BTreeSet<String>,
    strategies: &StrategyRegistry,
) -> Result<BTreeSet<String>> {
    let mut removed: BTreeSet<String> = BTreeSet::new();
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let reverse_links = target_graph.graph().reverse_links_dict();

    for label in target_graph.graph().visit_preorder() {
        let label = label?;
        if do_not_optimize.contains(label) {
            continue;
        }
        let blocked = reverse_links
            .get(label)
            .is_some_and(|dependents| dependents.iter().any(|d| !removed.contains(*d)));
        if blocked {
            continue;
        }
        let job = target_graph
            .get(label)
            .ok_or_else(|| Error::Internal(format!("job {label} missing from target graph")))?;
        let (name, argument) = directive(job);
        let strategy = strategies.get(name)?;
        if strategy.should_remove(job, parameters, argument)? {
            removed.insert(label.to_string());
            *counts.entry(name.to_string()).or_insert(0) += 1;
        }
    }

    for (strategy, count) in &counts {
        info!(strategy = %strategy, count, "Removed jobs during optimization");
    }
    Ok(removed)
}

/// Dependencies-first replacement. A job is only eligible once all of its
/// dependencies were removed or replaced, so a replacement identifier can
/// stand in for the whole subtree beneath it.
fn replace_jobs(
    target_graph: &JobGraph,
    parameters: &Parameters,
    do_not_optimize: &BTreeSet<String>,
    strategies: &StrategyRegistry,
    removed: &mut BTreeSet<String>,
) -> Result<BTreeMap<String, String>> {
    let mut replacements: BTreeMap<String, String> = BTreeMap::new();
    let links = target_graph.graph().links_dict();

    for label in target_graph.graph().visit_postorder() {
        let label = label?;
        if do_not_optimize.contains(label) || removed.contains(label) {
            continue;
        }
        let blocked = links.get(label).is_some_and(|dependencies| {
            dependencies
                .iter()
                .any(|d| !removed.contains(*d) && !replacements.contains_key(*d))
        });
        if blocked {
            continue;
        }
        let job = target_graph
            .get(label)
            .ok_or_else(|| Error::Internal(format!("job {label} missing from target graph")))?;
        let (name, argument) = directive(job);
        let strategy = strategies.get(name)?;
        match strategy.should_replace(job, parameters, argument)? {
            Replacement::Keep => {}
            Replacement::Remove => {
                removed.insert(label.to_string());
            }
            Replacement::WithId(id) => {
                replacements.insert(label.to_string(), id);
            }
        }
    }

    if !replacements.is_empty() {
        info!(replaced = replacements.len(), "Replaced jobs during optimization");
    }
    Ok(replacements)
}

/// Cut the surviving subgraph and rewrite each survivor's payload:
/// references resolve to surviving labels or replacement identifiers,
/// "needs" collects every resolved dependency, and the job's stage is
/// stamped into the payload.
fn get_subgraph(
    target_graph: &JobGraph,
    removed: &BTreeSet<String>,
    replacements: &BTreeMap<String, String>,
) -> Result<JobGraph> {
    let omitted = |label: &str| removed.contains(label) || replacements.contains_key(label);

    let mut bad_edges: Vec<String> = Vec::new();
    for edge in target_graph.graph().edges() {
        if !omitted(&edge.from) && removed.contains(&edge.to) && !replacements.contains_key(&edge.to) {
            bad_edges.push(format!(
                "{} depends on {} as {} but it has been removed",
                edge.from, edge.to, edge.name
            ));
        }
    }
    if !bad_edges.is_empty() {
        return Err(Error::DependsOnRemoved(bad_edges.join("\n")));
    }

    let named_links = target_graph.graph().named_links_dict();
    let mut jobs: BTreeMap<String, Job> = BTreeMap::new();
    let mut nodes: BTreeSet<String> = BTreeSet::new();

    for (label, job) in target_graph.job_table() {
        if omitted(label) {
            continue;
        }

        // Dependency name -> surviving label or replacement identifier.
        let mut resolved: BTreeMap<String, String> = BTreeMap::new();
        let mut surviving: BTreeMap<String, String> = BTreeMap::new();
        if let Some(dependencies) = named_links.get(label.as_str()) {
            for (name, to) in dependencies {
                match replacements.get(*to) {
                    Some(id) => {
                        resolved.insert((*name).to_string(), id.clone());
                    }
                    None => {
                        resolved.insert((*name).to_string(), (*to).to_string());
                        surviving.insert((*name).to_string(), (*to).to_string());
                    }
                }
            }
        }

        let mut needs: BTreeSet<String> = resolved.values().cloned().collect();
        for soft in &job.soft_dependencies {
            if target_graph.contains(soft) && !omitted(soft) {
                needs.insert(soft.clone());
            }
        }

        let mut payload = resolve_job_references(label, &job.payload, &resolved)?;
        if let Some(map) = payload.as_object_mut() {
            if let Some(Value::Array(existing)) = map.get("needs") {
                for entry in existing {
                    if let Value::String(need) = entry {
                        needs.insert(need.clone());
                    }
                }
            }
            if !needs.is_empty() {
                map.insert(
                    "needs".to_string(),
                    Value::Array(needs.into_iter().map(Value::String).collect()),
                );
            }
            map.insert("stage".to_string(), Value::String(job.stage.clone()));
        }

        let mut survivor = job.clone();
        survivor.upstream_dependencies = surviving;
        survivor.payload = payload;
        nodes.insert(label.clone());
        jobs.insert(label.clone(), survivor);
    }

    let mut edges: BTreeSet<Edge> = BTreeSet::new();
    for edge in target_graph.graph().edges() {
        if nodes.contains(&edge.from) && nodes.contains(&edge.to) {
            edges.insert(edge.clone());
        }
    }

    JobGraph::new(jobs, Graph::new(nodes, edges)?)
}
