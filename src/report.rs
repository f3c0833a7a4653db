//! Irregularities found while reconstructing history.
//!
//! None of these abort a run; each one was already logged when found.

use serde::Serialize;
use tracing::{info, warn};

use crate::config::Roots;
use crate::graph::VersionGraph;
use crate::hierarchy::{AmbiguousParent, BranchHierarchy};
use crate::labels::LabelState;
use crate::merges::IncompleteMerge;
use crate::scheduler::History;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Report {
    /// Versions never visible in any imported directory version.
    pub lost_versions: Vec<LostVersion>,
    /// Versions that completed a label while not visible anywhere.
    pub labeled_orphans: Vec<String>,
    /// Labels never emitted.
    pub incomplete_labels: Vec<IncompleteLabel>,
    /// Emitted labels whose tree differs from the labeled versions.
    pub broken_labels: Vec<BrokenLabel>,
    pub incomplete_merges: Vec<IncompleteMerge>,
    pub ambiguous_parents: Vec<AmbiguousParent>,
    /// Branches removed by the branch filter.
    pub filtered_branches: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LostVersion {
    pub version: String,
    /// Lost inside the imported roots rather than merely outside them.
    pub inside_roots: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncompleteLabel {
    pub name: String,
    pub state: LabelState,
    pub missing: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokenLabel {
    pub name: String,
    pub mismatches: Vec<LabelMismatch>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelMismatch {
    pub expected: String,
    /// `None` when the element was not visible at all.
    pub actual: Option<String>,
}

impl Report {
    pub fn new(
        graph: &VersionGraph,
        roots: &Roots,
        history: &History,
        hierarchy: &BranchHierarchy,
        filtered_branches: Vec<String>,
    ) -> Self {
        let lost_versions = history
            .lost_versions
            .iter()
            .map(|v| LostVersion {
                version: graph.describe(*v),
                inside_roots: roots.contains(&graph.element_of(*v).name),
            })
            .collect();

        let mut incomplete_labels = Vec::new();
        let mut broken_labels = Vec::new();
        for label in history.labels.iter() {
            if label.state != LabelState::Applied {
                incomplete_labels.push(IncompleteLabel {
                    name: label.name.clone(),
                    state: label.state,
                    missing: label.missing.values().flatten().map(|v| graph.describe(*v)).collect(),
                });
            } else if !label.possibly_broken.is_empty() {
                broken_labels.push(BrokenLabel {
                    name: label.name.clone(),
                    mismatches: label
                        .possibly_broken
                        .iter()
                        .map(|(expected, actual)| LabelMismatch {
                            expected: graph.describe(*expected),
                            actual: actual.map(|a| graph.describe(a)),
                        })
                        .collect(),
                });
            }
        }

        Self {
            lost_versions,
            labeled_orphans: history.labeled_orphans.iter().map(|v| graph.describe(*v)).collect(),
            incomplete_labels,
            broken_labels,
            incomplete_merges: history.incomplete_merges.clone(),
            ambiguous_parents: hierarchy.ambiguous().to_vec(),
            filtered_branches,
        }
    }

    /// Whether nothing irregular was found. Versions lost outside the roots
    /// and filtered branches are expected and do not count.
    pub fn is_clean(&self) -> bool {
        self.lost_versions.iter().all(|v| !v.inside_roots)
            && self.labeled_orphans.is_empty()
            && self.incomplete_labels.is_empty()
            && self.broken_labels.is_empty()
            && self.incomplete_merges.is_empty()
            && self.ambiguous_parents.is_empty()
    }

    pub fn log_summary(&self) {
        if self.is_clean() {
            info!("no irregularities found");
            return;
        }
        warn!(
            lost_versions = self.lost_versions.iter().filter(|v| v.inside_roots).count(),
            labeled_orphans = self.labeled_orphans.len(),
            incomplete_labels = self.incomplete_labels.len(),
            broken_labels = self.broken_labels.len(),
            incomplete_merges = self.incomplete_merges.len(),
            ambiguous_parents = self.ambiguous_parents.len(),
            "history reconstructed with irregularities"
        );
    }
}
