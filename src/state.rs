//! Persisted state for incremental runs.
//!
//! Everything a later run needs to continue the history: numbering, branch
//! starts and tips, and the tree state of every branch. Elements are keyed
//! by [`Oid`] so the snapshot survives a reload of the graph.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::graph::{Oid, VersionGraph, VersionId, VersionRef};
use crate::hierarchy::BranchHierarchy;
use crate::resolver::BranchState;
use crate::scheduler::ReplayState;

/// Version of the snapshot layout written by this crate.
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub last_id: usize,
    pub hierarchy: BranchHierarchy,
    pub started_branches: BTreeMap<String, Option<usize>>,
    pub branch_tips: BTreeMap<String, usize>,
    /// Visible paths of each element, per branch.
    pub names: BTreeMap<String, BTreeMap<Oid, Vec<String>>>,
    /// Current version of each element, per branch.
    pub versions: BTreeMap<String, BTreeMap<Oid, VersionRef>>,
    /// Every version already handed to the scheduler.
    pub processed: BTreeSet<VersionRef>,
}

impl Snapshot {
    /// Capture the state at the end of a run.
    pub fn capture(
        graph: &VersionGraph,
        hierarchy: &BranchHierarchy,
        state: &ReplayState,
        processed: impl IntoIterator<Item = VersionId>,
    ) -> Self {
        let mut names = BTreeMap::new();
        let mut versions = BTreeMap::new();
        for (branch, branch_state) in &state.branches {
            let branch_names: BTreeMap<Oid, Vec<String>> = branch_state
                .names
                .iter()
                .map(|(element, paths)| (graph.element(*element).oid.clone(), paths.iter().cloned().collect()))
                .collect();
            let branch_versions: BTreeMap<Oid, VersionRef> = branch_state
                .versions
                .iter()
                .map(|(element, version)| (graph.element(*element).oid.clone(), graph.reference(*version)))
                .collect();
            names.insert(branch.clone(), branch_names);
            versions.insert(branch.clone(), branch_versions);
        }

        Self {
            format_version: FORMAT_VERSION,
            last_id: state.last_id,
            hierarchy: hierarchy.clone(),
            started_branches: state.started.clone(),
            branch_tips: state.tips.clone(),
            names,
            versions,
            processed: processed.into_iter().map(|v| graph.reference(v)).collect(),
        }
    }

    pub fn from_json(content: &str, path: &Path) -> Result<Self> {
        let snapshot: Self = serde_json::from_str(content).map_err(|e| Error::Decode {
            path: path.display().to_string(),
            source: e,
        })?;
        if snapshot.format_version != FORMAT_VERSION {
            return Err(Error::SnapshotFormat {
                found: snapshot.format_version,
                expected: FORMAT_VERSION,
            });
        }
        Ok(snapshot)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Encode {
            what: "snapshot",
            source: e,
        })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let snapshot = Self::from_json(&content, path)?;
        info!(
            path = %path.display(),
            last_id = snapshot.last_id,
            processed = snapshot.processed.len(),
            "loaded snapshot"
        );
        Ok(snapshot)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = self.to_json()?;
        std::fs::write(path, content).map_err(|e| Error::Write {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Replay state against a freshly loaded `graph`. Elements or versions
    /// the graph no longer knows are skipped.
    pub fn replay_state(&self, graph: &VersionGraph) -> ReplayState {
        let mut branches: HashMap<String, BranchState> = HashMap::new();
        for (branch, names) in &self.names {
            let state = branches.entry(branch.clone()).or_default();
            for (oid, paths) in names {
                match graph.element_by_oid(oid) {
                    Some(element) => {
                        state.names.insert(element, paths.iter().cloned().collect());
                    }
                    None => warn!(%oid, branch = %branch, "snapshot names an unknown element"),
                }
            }
        }
        for (branch, versions) in &self.versions {
            let state = branches.entry(branch.clone()).or_default();
            for (oid, reference) in versions {
                let resolved = graph
                    .element_by_oid(oid)
                    .zip(graph.resolve(reference));
                match resolved {
                    Some((element, version)) => {
                        state.versions.insert(element, version);
                    }
                    None => warn!(version = %reference, branch = %branch, "snapshot refers to an unknown version"),
                }
            }
        }

        ReplayState {
            last_id: self.last_id,
            started: self.started_branches.clone(),
            tips: self.branch_tips.clone(),
            branches,
        }
    }

    /// Versions of `graph` not processed by a previous run.
    pub fn new_versions(&self, graph: &VersionGraph) -> HashSet<VersionId> {
        let processed: HashSet<VersionId> = self
            .processed
            .iter()
            .filter_map(|reference| graph.resolve(reference))
            .collect();
        graph
            .version_ids()
            .filter(|v| !processed.contains(v))
            .collect()
    }
}
