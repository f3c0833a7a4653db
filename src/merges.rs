//! Cross-branch merge synthesis.
//!
//! Merge links are recorded between versions. They are paired up into
//! changeset-to-changeset edges once every changeset has been replayed.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use serde::Serialize;
use tracing::{debug, warn};

use crate::changeset::{ChangeSet, ChangeSetKey};
use crate::graph::{VersionGraph, VersionId};
use crate::hierarchy::BranchHierarchy;

/// A branch pair whose merge links could not all be paired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IncompleteMerge {
    pub from: String,
    pub to: String,
    pub missing_from: Vec<String>,
    pub missing_to: Vec<String>,
}

/// Merge links from a branch into its parent.
#[derive(Debug, Clone)]
pub struct MergeInfo {
    pub from: String,
    pub to: String,
    seen_from: HashSet<VersionId>,
    seen_to: HashSet<VersionId>,
    /// Source versions not replayed yet, with the changeset of their target.
    missing_from: BTreeMap<VersionId, ChangeSetKey>,
    /// Target versions not replayed yet, with the changeset of their source.
    missing_to: BTreeMap<VersionId, ChangeSetKey>,
    missing_to_by_changeset: BTreeMap<ChangeSetKey, BTreeSet<VersionId>>,
    /// Source changeset → target changeset.
    merges: BTreeMap<ChangeSetKey, ChangeSetKey>,
}

impl MergeInfo {
    fn new(from: &str, to: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            seen_from: HashSet::new(),
            seen_to: HashSet::new(),
            missing_from: BTreeMap::new(),
            missing_to: BTreeMap::new(),
            missing_to_by_changeset: BTreeMap::new(),
            merges: BTreeMap::new(),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.missing_from.is_empty() && self.missing_to.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct MergeTracker {
    merges: BTreeMap<(String, String), MergeInfo>,
}

impl MergeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the merge links of the versions of `changesets[key]`,
    /// ignoring `lost` versions.
    pub fn record(
        &mut self,
        graph: &VersionGraph,
        hierarchy: &BranchHierarchy,
        changesets: &[ChangeSet],
        key: ChangeSetKey,
        lost: &HashSet<VersionId>,
    ) {
        let ctx = Pairing {
            graph,
            hierarchy,
            changesets,
            key,
            lost,
        };
        let changeset = &changesets[key.0];
        for named in &changeset.versions {
            let version = graph.version(named.version);
            for to in &version.merges_to {
                ctx.pair(self, named.version, *to, false);
            }
            for from in &version.merges_from {
                ctx.pair(self, *from, named.version, true);
            }
        }
        // merges into a superseded version still count
        for skipped in &changeset.skipped_versions {
            for from in &graph.version(*skipped).merges_from {
                ctx.pair(self, *from, *skipped, true);
            }
        }
    }

    /// Turn the paired links into merge edges on the changesets.
    ///
    /// `branch_origins` gives, per branch, the id of the changeset it was
    /// spawned from. Returns the branch pairs left incomplete.
    pub fn resolve(
        &self,
        graph: &VersionGraph,
        changesets: &mut [ChangeSet],
        branch_origins: &HashMap<String, Option<usize>>,
    ) -> Vec<IncompleteMerge> {
        let mut incomplete = Vec::new();
        for info in self.merges.values() {
            let id = |key: &ChangeSetKey| changesets[key.0].id;
            let mut sources: Vec<ChangeSetKey> = info.merges.keys().copied().collect();
            sources.sort_by_key(|k| std::cmp::Reverse(id(k)));

            let mut edges = Vec::new();
            let mut current_to = usize::MAX;
            for from in &sources {
                let target = sources
                    .iter()
                    .filter(|c| id(c) <= id(from))
                    .map(|c| info.merges[c])
                    .max_by_key(|t| id(t));
                let Some(to) = target else {
                    continue;
                };
                if id(&to) >= current_to {
                    continue;
                }
                let origin = branch_origins
                    .get(&changesets[from.0].branch)
                    .copied()
                    .flatten()
                    .unwrap_or(0);
                if id(&to) <= origin {
                    warn!(
                        from = %changesets[from.0],
                        to = %changesets[to.0],
                        branch = %info.from,
                        "invalid merge: branch spawned from a later changeset"
                    );
                    break;
                }
                current_to = id(&to);
                edges.push((*from, to));
            }

            for (from, to) in edges {
                debug!(from = changesets[from.0].id, to = changesets[to.0].id, "merge edge");
                if !changesets[to.0].merges.contains(&from) {
                    changesets[to.0].merges.push(from);
                }
                changesets[from.0].is_merged = true;
            }

            if !info.is_complete() {
                let missing_from: Vec<String> = info.missing_from.keys().map(|v| graph.describe(*v)).collect();
                let missing_to: Vec<String> = info.missing_to.keys().map(|v| graph.describe(*v)).collect();
                warn!(
                    from = %info.from,
                    to = %info.to,
                    missing_from = ?missing_from,
                    missing_to = ?missing_to,
                    "merge could not be completed"
                );
                incomplete.push(IncompleteMerge {
                    from: info.from.clone(),
                    to: info.to.clone(),
                    missing_from,
                    missing_to,
                });
            }
        }
        incomplete
    }
}

struct Pairing<'a> {
    graph: &'a VersionGraph,
    hierarchy: &'a BranchHierarchy,
    changesets: &'a [ChangeSet],
    key: ChangeSetKey,
    lost: &'a HashSet<VersionId>,
}

impl Pairing<'_> {
    fn pair(&self, tracker: &mut MergeTracker, from: VersionId, to: VersionId, to_in_changeset: bool) {
        let graph = self.graph;
        if self.lost.contains(&from) || self.lost.contains(&to) {
            return;
        }
        let from_branch = &graph.version(from).branch;
        let to_branch = &graph.version(to).branch;
        // merges elsewhere than into the parent branch are cherry-picks
        if self.hierarchy.parent(from_branch) != Some(to_branch.as_str()) {
            return;
        }
        // same content as the branching point
        if graph.version(from).number == 0 {
            return;
        }
        if !is_latest_merge(graph, from, to) {
            return;
        }

        let info = tracker
            .merges
            .entry((from_branch.clone(), to_branch.clone()))
            .or_insert_with(|| MergeInfo::new(from_branch, to_branch));
        let key = self.key;

        // a version is seen again when it gets a new name
        if to_in_changeset {
            if !info.seen_to.insert(to) {
                return;
            }
            match info.missing_to.remove(&to) {
                Some(from_changeset) => {
                    if let Some(waiting) = info.missing_to_by_changeset.get_mut(&from_changeset) {
                        waiting.remove(&to);
                        if waiting.is_empty() {
                            info.missing_to_by_changeset.remove(&from_changeset);
                            info.merges.insert(from_changeset, key);
                        }
                    }
                }
                None => {
                    info.missing_from.insert(from, key);
                }
            }
        } else {
            if !info.seen_from.insert(from) {
                return;
            }
            match info.missing_from.remove(&from) {
                Some(to_changeset) => {
                    let id = |k: &ChangeSetKey| self.changesets[k.0].id;
                    let replace = info
                        .merges
                        .get(&key)
                        .is_none_or(|existing| id(existing) < id(&to_changeset));
                    if replace {
                        info.merges.insert(key, to_changeset);
                    }
                }
                None => {
                    info.missing_to.insert(to, key);
                    info.missing_to_by_changeset.entry(key).or_default().insert(to);
                }
            }
        }
    }
}

/// Of several merges sharing an end, only the latest one counts.
fn is_latest_merge(graph: &VersionGraph, from: VersionId, to: VersionId) -> bool {
    let f = graph.version(from);
    let t = graph.version(to);
    let later = |candidate: &VersionId, reference: &crate::graph::Version| {
        let c = graph.version(*candidate);
        c.element == reference.element && c.branch == reference.branch && c.number > reference.number
    };
    !f.merges_to.iter().any(|v| later(v, t)) && !t.merges_from.iter().any(|v| later(v, f))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ElementKind, VersionInfo};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn latest_merge_becomes_an_edge() {
        let mut graph = VersionGraph::new();
        let file = graph.add_element("f", "f", ElementKind::File);
        graph.add_branch(file, "main", None);
        let m1 = graph.add_version(file, "main", 1, VersionInfo::new("ann", at(1))).unwrap();
        graph.add_branch(file, "main/dev", Some(m1));
        let d1 = graph.add_version(file, "dev", 1, VersionInfo::new("ann", at(2))).unwrap();
        let d2 = graph.add_version(file, "dev", 2, VersionInfo::new("ann", at(3))).unwrap();
        let m2 = graph.add_version(file, "main", 2, VersionInfo::new("ann", at(4))).unwrap();
        // d1 was merged into m2 first, then d2 superseded it
        graph.add_merge(d1, m2);
        graph.add_merge(d2, m2);
        let hierarchy = BranchHierarchy::infer(["main/dev"]);

        let mut changesets = Vec::new();
        for (i, (branch, version)) in [("main", m1), ("dev", d1), ("dev", d2), ("main", m2)].into_iter().enumerate() {
            let mut changeset = ChangeSet::new("ann", "ann", branch, at(1));
            changeset.id = i + 1;
            changeset.add(&graph, version, Some("f".to_string()), true);
            changesets.push(changeset);
        }

        let mut tracker = MergeTracker::new();
        let lost = HashSet::new();
        for key in 0..changesets.len() {
            tracker.record(&graph, &hierarchy, &changesets, ChangeSetKey(key), &lost);
        }
        let origins = HashMap::from([("dev".to_string(), Some(1))]);
        let incomplete = tracker.resolve(&graph, &mut changesets, &origins);

        assert!(incomplete.is_empty());
        assert_eq!(changesets[3].merges, vec![ChangeSetKey(2)]);
        assert!(changesets[2].is_merged);
        assert!(!changesets[1].is_merged);
    }

    #[test]
    fn unmatched_merge_is_reported() {
        let mut graph = VersionGraph::new();
        let file = graph.add_element("f", "f", ElementKind::File);
        graph.add_branch(file, "main", None);
        let m1 = graph.add_version(file, "main", 1, VersionInfo::new("ann", at(1))).unwrap();
        graph.add_branch(file, "main/dev", Some(m1));
        let d1 = graph.add_version(file, "dev", 1, VersionInfo::new("ann", at(2))).unwrap();
        let m2 = graph.add_version(file, "main", 2, VersionInfo::new("ann", at(4))).unwrap();
        graph.add_merge(d1, m2);
        let hierarchy = BranchHierarchy::infer(["main/dev"]);

        let mut changeset = ChangeSet::new("ann", "ann", "dev", at(2));
        changeset.id = 1;
        changeset.add(&graph, d1, Some("f".to_string()), true);
        let mut changesets = vec![changeset];

        let mut tracker = MergeTracker::new();
        tracker.record(&graph, &hierarchy, &changesets, ChangeSetKey(0), &HashSet::new());
        let incomplete = tracker.resolve(&graph, &mut changesets, &HashMap::new());

        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].missing_to, vec!["f@@/main/2".to_string()]);
        assert!(changesets[0].merges.is_empty());
    }
}
