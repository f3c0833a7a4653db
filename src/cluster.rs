//! Raw clustering: versions grouped per branch and author into changesets
//! by check-in time proximity.

use std::collections::{BTreeMap, HashSet};

use chrono::Duration;
use tracing::{debug, info};

use crate::changeset::ChangeSet;
use crate::config::{BranchFilter, Roots};
use crate::error::Result;
use crate::graph::{VersionGraph, VersionId};
use crate::hierarchy::BranchHierarchy;
use crate::labels::LabelRegistry;

/// Output of the clustering phase.
#[derive(Debug)]
pub struct RawHistory {
    /// Every changeset of every kept branch, sorted by start time.
    pub changesets: Vec<ChangeSet>,
    pub hierarchy: BranchHierarchy,
    pub labels: LabelRegistry,
    /// Branches removed by the branch filter.
    pub filtered_branches: Vec<String>,
}

/// Changesets of one branch, by author login, each list sorted by start.
type AuthorChangeSets = BTreeMap<String, Vec<ChangeSet>>;

pub struct Clusterer<'a> {
    roots: &'a Roots,
    filter: &'a BranchFilter,
    max_delay: Duration,
}

impl<'a> Clusterer<'a> {
    pub fn new(roots: &'a Roots, filter: &'a BranchFilter, max_delay: Duration) -> Self {
        Self {
            roots,
            filter,
            max_delay,
        }
    }

    /// Cluster the whole graph, or only `new_versions` when resuming.
    ///
    /// Labels found on a skipped version 0 are moved to the version it
    /// branches from, which is the one mutation applied to `graph`.
    pub fn build(
        &self,
        graph: &mut VersionGraph,
        new_versions: Option<&HashSet<VersionId>>,
        previous: Option<&BranchHierarchy>,
    ) -> Result<RawHistory> {
        let (versions, full_names) = self.collect(graph, new_versions);
        info!(versions = versions.len(), "creating raw changesets");

        let mut labels = LabelRegistry::new();
        for version in &versions {
            move_labels(graph, *version, new_versions, &mut labels);
        }

        let mut by_branch: BTreeMap<String, AuthorChangeSets> = BTreeMap::new();
        for version in versions {
            let v = graph.version(version);
            if v.number == 0 && !graph.is_solo(v.element) {
                continue;
            }
            let authors = by_branch.entry(v.branch.clone()).or_default();
            let changesets = authors.entry(v.author_login.clone()).or_default();
            add_version(changesets, graph, version, self.max_delay);
        }

        let mut hierarchy = BranchHierarchy::infer(full_names.iter().map(String::as_str));
        if let Some(previous) = previous {
            hierarchy = hierarchy.merge_previous(previous)?;
        }
        let filtered_branches = hierarchy.filter(self.filter);
        for branch in &filtered_branches {
            by_branch.remove(branch);
        }

        self.filter_labels(graph, &hierarchy, &mut labels);
        labels.reset_all(graph);

        let mut changesets: Vec<ChangeSet> = by_branch
            .into_values()
            .flat_map(BTreeMap::into_values)
            .flatten()
            .collect();
        // stable: equal starts keep branch then author order
        changesets.sort_by(|a, b| a.start.cmp(&b.start));
        info!(
            changesets = changesets.len(),
            branches = hierarchy.len(),
            labels = labels.len(),
            "raw changesets created"
        );

        Ok(RawHistory {
            changesets,
            hierarchy,
            labels,
            filtered_branches,
        })
    }

    /// Versions to cluster and the full names of their branches, both in a
    /// deterministic order.
    fn collect(
        &self,
        graph: &VersionGraph,
        new_versions: Option<&HashSet<VersionId>>,
    ) -> (Vec<VersionId>, Vec<String>) {
        let mut versions = Vec::new();
        let mut full_names = Vec::new();
        let mut seen_names = HashSet::new();
        let mut add_branch = |full_name: &str| {
            if seen_names.insert(full_name.to_string()) {
                full_names.push(full_name.to_string());
            }
        };

        match new_versions {
            Some(new_versions) => {
                let mut sorted: Vec<VersionId> = new_versions.iter().copied().collect();
                sorted.sort();
                for version in sorted {
                    let element = graph.element_of(version);
                    if !self.roots.contains(&element.name) {
                        debug!(version = %graph.describe(version), "skipping version outside roots");
                        continue;
                    }
                    add_branch(graph.full_branch_name(version));
                    versions.push(version);
                }
            }
            None => {
                for (_, element) in graph.elements() {
                    if !self.roots.contains(&element.name) {
                        debug!(element = %element.name, "skipping element outside roots");
                        continue;
                    }
                    for branch in element.branches() {
                        add_branch(&branch.full_name);
                        versions.extend(branch.versions.iter().copied());
                    }
                }
            }
        }
        (versions, full_names)
    }

    fn filter_labels(&self, graph: &VersionGraph, hierarchy: &BranchHierarchy, labels: &mut LabelRegistry) {
        labels.retain(|label| {
            let on_removed_branch = label
                .versions
                .iter()
                .any(|v| !hierarchy.contains(&graph.version(*v).branch));
            if on_removed_branch {
                info!(label = %label.name, "label filtered: was on a filtered out branch");
                return false;
            }
            let inside_roots = label
                .versions
                .iter()
                .any(|v| self.roots.contains(&graph.element_of(*v).name));
            if !inside_roots {
                info!(label = %label.name, "label filtered: not used in any root");
            }
            inside_roots
        });
    }
}

/// Register the labels of `version`, moving them off a version 0 to the
/// version it branches from.
fn move_labels(
    graph: &mut VersionGraph,
    version: VersionId,
    new_versions: Option<&HashSet<VersionId>>,
    labels: &mut LabelRegistry,
) {
    let mut target = version;
    while graph.version(target).number == 0 {
        let v = graph.version(target);
        let Some(point) = graph
            .element(v.element)
            .branch(&v.branch)
            .and_then(|b| b.branching_point)
        else {
            break;
        };
        target = point;
    }

    // labels on versions from a previous run are assumed to be settled
    if new_versions.is_none_or(|n| n.contains(&target)) {
        for label in graph.version(version).labels.clone() {
            let info = labels.entry(&label);
            if !info.versions.contains(&target) {
                info.versions.push(target);
            }
            if target != version {
                let moved = &mut graph.version_mut(target).labels;
                if !moved.contains(&label) {
                    moved.push(label);
                }
            }
        }
    }
    if target != version {
        graph.version_mut(version).labels.clear();
    }
}

/// Sliding-window insertion into a start-sorted list of changesets.
fn add_version(changesets: &mut Vec<ChangeSet>, graph: &VersionGraph, version: VersionId, max_delay: Duration) {
    let v = graph.version(version);
    let date = v.date;
    let create = || {
        let mut changeset = ChangeSet::new(&v.author_name, &v.author_login, &v.branch, date);
        changeset.add(graph, version, None, true);
        changeset
    };

    let index = match changesets.binary_search_by(|c| c.start.cmp(&date)) {
        Ok(index) => {
            changesets[index].add(graph, version, None, true);
            return;
        }
        Err(index) => index,
    };

    if changesets.is_empty() {
        changesets.push(create());
        return;
    }
    if index == changesets.len() {
        let last = index - 1;
        if date <= changesets[last].finish + max_delay {
            changesets[last].add(graph, version, None, true);
        } else {
            changesets.push(create());
        }
        return;
    }
    if index == 0 {
        if date >= changesets[0].start - max_delay {
            changesets[0].add(graph, version, None, true);
        } else {
            changesets.insert(0, create());
        }
        return;
    }

    let near_previous = date <= changesets[index - 1].finish + max_delay;
    let near_next = date >= changesets[index].start - max_delay;
    match (near_previous, near_next) {
        (true, false) => {
            changesets[index - 1].add(graph, version, None, true);
        }
        (false, true) => {
            changesets[index].add(graph, version, None, true);
        }
        (false, false) => changesets.insert(index, create()),
        (true, true) => {
            // the version links both neighbours
            changesets[index - 1].add(graph, version, None, true);
            let next = changesets.remove(index);
            changesets[index - 1].absorb(graph, next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ElementKind, VersionInfo};
    use chrono::{DateTime, TimeZone, Utc};

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, hour, minute, 0).unwrap()
    }

    fn cluster(graph: &mut VersionGraph) -> RawHistory {
        let roots = Roots::new(&[]);
        let filter = BranchFilter::default();
        Clusterer::new(&roots, &filter, Duration::minutes(30))
            .build(graph, None, None)
            .unwrap()
    }

    fn file_with_versions(graph: &mut VersionGraph, oid: &str, times: &[DateTime<Utc>]) -> Vec<VersionId> {
        let element = graph.add_element(oid, oid, ElementKind::File);
        graph.add_branch(element, "main", None);
        times
            .iter()
            .enumerate()
            .map(|(i, t)| {
                graph
                    .add_version(element, "main", i as u32 + 1, VersionInfo::new("ann", *t))
                    .unwrap()
            })
            .collect()
    }

    #[test]
    fn bridging_version_merges_neighbours() {
        let mut graph = VersionGraph::new();
        file_with_versions(&mut graph, "a", &[at(10, 0)]);
        file_with_versions(&mut graph, "b", &[at(10, 50)]);
        file_with_versions(&mut graph, "c", &[at(10, 25)]);

        let history = cluster(&mut graph);
        assert_eq!(history.changesets.len(), 1);
        let changeset = &history.changesets[0];
        assert_eq!(changeset.versions.len(), 3);
        assert_eq!((changeset.start, changeset.finish), (at(10, 0), at(10, 50)));
    }

    #[test]
    fn authors_are_clustered_separately() {
        let mut graph = VersionGraph::new();
        file_with_versions(&mut graph, "a", &[at(10, 0)]);
        let bob = graph.add_element("b", "b", ElementKind::File);
        graph.add_branch(bob, "main", None);
        graph.add_version(bob, "main", 1, VersionInfo::new("bob", at(10, 5))).unwrap();

        let history = cluster(&mut graph);
        let authors: Vec<&str> = history.changesets.iter().map(|c| c.author_login.as_str()).collect();
        assert_eq!(authors, vec!["ann", "bob"]);
    }

    #[test]
    fn labels_move_off_version_zero() {
        let mut graph = VersionGraph::new();
        let element = graph.add_element("f", "f.c", ElementKind::File);
        graph.add_branch(element, "main", None);
        let m1 = graph.add_version(element, "main", 1, VersionInfo::new("ann", at(9, 0))).unwrap();
        graph.add_branch(element, "main/dev", Some(m1));
        let d0 = graph
            .add_version(element, "dev", 0, VersionInfo::new("ann", at(9, 30)).label("REL"))
            .unwrap();

        let history = cluster(&mut graph);
        assert!(graph.version(d0).labels.is_empty());
        assert_eq!(graph.version(m1).labels, vec!["REL".to_string()]);
        assert_eq!(history.labels.get("REL").unwrap().versions, vec![m1]);
        // version 0 of a branch is not clustered
        assert_eq!(history.changesets.len(), 1);
        assert_eq!(history.hierarchy.parent("dev"), Some("main"));
    }

    #[test]
    fn versions_outside_roots_are_ignored() {
        let mut graph = VersionGraph::new();
        file_with_versions(&mut graph, "src/a.c", &[at(10, 0)]);
        file_with_versions(&mut graph, "doc/b.txt", &[at(10, 0)]);

        let roots = Roots::new(&["src".to_string()]);
        let filter = BranchFilter::default();
        let history = Clusterer::new(&roots, &filter, Duration::minutes(30))
            .build(&mut graph, None, None)
            .unwrap();
        assert_eq!(history.changesets.len(), 1);
        assert_eq!(history.changesets[0].versions.len(), 1);
    }
}
