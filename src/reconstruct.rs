//! Orchestrate a reconstruction run: load, cluster, schedule, export.

use std::path::{Path, PathBuf};

use tracing::info;

use crate::cluster::Clusterer;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::export::ImportPlan;
use crate::graph::{GraphDocument, LoadOptions, VersionGraph};
use crate::hierarchy::BranchHierarchy;
use crate::report::Report;
use crate::scheduler::{History, Scheduler};
use crate::state::Snapshot;

/// Everything a run produces.
#[derive(Debug)]
pub struct Reconstruction {
    pub history: History,
    pub hierarchy: BranchHierarchy,
    pub plan: ImportPlan,
    /// State to hand to the next run.
    pub snapshot: Snapshot,
}

/// Reconstruct the history of `graph`, continuing from `previous` when
/// given: only versions it has not processed are considered.
pub fn reconstruct(graph: &mut VersionGraph, config: &Config, previous: Option<&Snapshot>) -> Result<Reconstruction> {
    let roots = config.roots();
    let filter = config.branch_filter()?;
    let new_versions = previous.map(|snapshot| snapshot.new_versions(graph));
    if let Some(new_versions) = &new_versions {
        info!(versions = new_versions.len(), "resuming from snapshot");
    }

    let raw = Clusterer::new(&roots, &filter, config.max_delay()).build(
        graph,
        new_versions.as_ref(),
        previous.map(|snapshot| &snapshot.hierarchy),
    )?;
    let graph: &VersionGraph = graph;

    let mut scheduler = Scheduler::new(
        graph,
        &raw.hierarchy,
        &roots,
        config.label_lateness(),
        raw.changesets,
        raw.labels,
    );
    if let Some(previous) = previous {
        scheduler = scheduler.with_previous(previous.replay_state(graph));
    }
    let history = scheduler.run()?;

    let report = Report::new(graph, &roots, &history, &raw.hierarchy, raw.filtered_branches);
    report.log_summary();
    let plan = ImportPlan::new(graph, &history, &raw.hierarchy, report);
    let snapshot = Snapshot::capture(graph, &raw.hierarchy, &history.state, graph.version_ids());

    Ok(Reconstruction {
        history,
        hierarchy: raw.hierarchy,
        plan,
        snapshot,
    })
}

/// Branch hierarchy of the branches inside the configured roots, after
/// filtering.
pub fn infer_hierarchy(graph: &VersionGraph, config: &Config) -> Result<BranchHierarchy> {
    let roots = config.roots();
    let filter = config.branch_filter()?;
    let full_names: Vec<&str> = graph
        .elements()
        .filter(|(_, element)| roots.contains(&element.name))
        .flat_map(|(_, element)| element.branches().iter().map(|b| b.full_name.as_str()))
        .collect();
    let mut hierarchy = BranchHierarchy::infer(full_names);
    hierarchy.filter(&filter);
    Ok(hierarchy)
}

/// Read the adapter's graph document.
pub fn load_graph(path: &Path, options: &LoadOptions) -> Result<VersionGraph> {
    let content = std::fs::read_to_string(path).map_err(|e| Error::Read {
        path: path.display().to_string(),
        source: e,
    })?;
    let document: GraphDocument = serde_json::from_str(&content).map_err(|e| Error::Decode {
        path: path.display().to_string(),
        source: e,
    })?;
    let graph = VersionGraph::from_document(document, options)?;
    info!(path = %path.display(), "loaded version graph");
    Ok(graph)
}

/// Files of a command line run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub graph: PathBuf,
    pub config: Option<PathBuf>,
    /// Snapshot to resume from if it exists, rewritten at the end.
    pub state: Option<PathBuf>,
    /// Where to write the plan; the caller prints it otherwise.
    pub output: Option<PathBuf>,
}

/// Run a reconstruction from files.
pub fn run(options: &RunOptions) -> Result<Reconstruction> {
    let config = match &options.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    let mut graph = load_graph(&options.graph, &config.load_options())?;

    let previous = match &options.state {
        Some(path) if path.exists() => Some(Snapshot::load(path)?),
        _ => None,
    };
    let reconstruction = reconstruct(&mut graph, &config, previous.as_ref())?;

    if let Some(path) = &options.output {
        write(path, &reconstruction.plan.to_json()?)?;
        info!(path = %path.display(), commits = reconstruction.plan.commits.len(), "wrote import plan");
    }
    if let Some(path) = &options.state {
        reconstruction.snapshot.save(path)?;
        info!(path = %path.display(), last_id = reconstruction.snapshot.last_id, "saved snapshot");
    }
    Ok(reconstruction)
}

fn write(path: &Path, content: &str) -> Result<()> {
    std::fs::write(path, content).map_err(|e| Error::Write {
        path: path.display().to_string(),
        source: e,
    })
}
