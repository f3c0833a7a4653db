//! Label bookkeeping.
//!
//! A label is complete once every version it covers has been replayed.
//! Until then it is pending, and the scheduler tries not to move past a
//! state the label still needs.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::graph::{VersionGraph, VersionId};

/// Label metadata supplied by the adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelMeta {
    pub name: String,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub author_login: String,
    #[serde(default)]
    pub created: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelState {
    /// Some versions have not been replayed yet.
    Pending,
    /// Emitted on a changeset.
    Applied,
    /// Given up on, never emitted.
    Dropped,
}

#[derive(Debug, Clone)]
pub struct LabelInfo {
    pub name: String,
    /// Every version the label covers.
    pub versions: Vec<VersionId>,
    /// Versions not replayed yet, by branch. Branches with nothing missing
    /// have no entry.
    pub missing: BTreeMap<String, BTreeSet<VersionId>>,
    /// `(expected, actual)` mismatches found when the label completed.
    pub possibly_broken: Vec<(VersionId, Option<VersionId>)>,
    pub state: LabelState,
}

impl LabelInfo {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            versions: Vec::new(),
            missing: BTreeMap::new(),
            possibly_broken: Vec::new(),
            state: LabelState::Pending,
        }
    }

    /// Recompute the missing versions from the covered ones. Versions 0
    /// are never replayed, so they are never missing.
    pub fn reset(&mut self, graph: &VersionGraph) {
        self.missing.clear();
        for version in &self.versions {
            let v = graph.version(*version);
            if v.number != 0 {
                self.missing
                    .entry(v.branch.clone())
                    .or_default()
                    .insert(*version);
            }
        }
    }

    pub fn is_missing_on(&self, branch: &str) -> bool {
        self.missing.contains_key(branch)
    }

    pub fn missing_count(&self) -> usize {
        self.missing.values().map(BTreeSet::len).sum()
    }

    /// Mark `version` as replayed. Returns whether nothing is missing anymore.
    pub fn observe(&mut self, graph: &VersionGraph, version: VersionId) -> bool {
        remove_missing(&mut self.missing, &graph.version(version).branch, version);
        self.missing.is_empty()
    }

    /// Stop requiring `version` at all.
    pub fn forget(&mut self, graph: &VersionGraph, version: VersionId) {
        self.versions.retain(|v| *v != version);
        remove_missing(&mut self.missing, &graph.version(version).branch, version);
    }
}

fn remove_missing(
    missing: &mut BTreeMap<String, BTreeSet<VersionId>>,
    branch: &str,
    version: VersionId,
) {
    if let Some(versions) = missing.get_mut(branch) {
        versions.remove(&version);
        if versions.is_empty() {
            missing.remove(branch);
        }
    }
}

/// All labels of a run, whatever their state.
#[derive(Debug, Clone, Default)]
pub struct LabelRegistry {
    labels: BTreeMap<String, LabelInfo>,
}

impl LabelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The label named `name`, created on first use.
    pub fn entry(&mut self, name: &str) -> &mut LabelInfo {
        self.labels
            .entry(name.to_string())
            .or_insert_with(|| LabelInfo::new(name))
    }

    pub fn get(&self, name: &str) -> Option<&LabelInfo> {
        self.labels.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut LabelInfo> {
        self.labels.get_mut(name)
    }

    /// The label named `name`, if it is still pending.
    pub fn pending(&self, name: &str) -> Option<&LabelInfo> {
        self.labels
            .get(name)
            .filter(|l| l.state == LabelState::Pending)
    }

    pub fn pending_mut(&mut self, name: &str) -> Option<&mut LabelInfo> {
        self.labels
            .get_mut(name)
            .filter(|l| l.state == LabelState::Pending)
    }

    pub fn iter_pending(&self) -> impl Iterator<Item = &LabelInfo> {
        self.labels
            .values()
            .filter(|l| l.state == LabelState::Pending)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LabelInfo> {
        self.labels.values()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&LabelInfo) -> bool) {
        self.labels.retain(|_, label| keep(label));
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn reset_all(&mut self, graph: &VersionGraph) {
        for label in self.labels.values_mut() {
            label.reset(graph);
        }
    }
}
