//! Global branch hierarchy.
//!
//! Branches are per element in the legacy system, so the same branch name
//! may be spawned from different parents by different elements. The
//! hierarchy settles on one parent per branch name.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::BranchFilter;
use crate::error::{Error, Result};
use crate::graph::{BRANCH_SEPARATOR, MAIN_BRANCH};

/// A branch whose parent had to be picked among equally deep candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AmbiguousParent {
    pub branch: String,
    pub candidates: Vec<String>,
    pub chosen: String,
}

/// Parent of every branch; `main` is the only branch without one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchHierarchy {
    parents: BTreeMap<String, Option<String>>,
    #[serde(skip)]
    ambiguous: Vec<AmbiguousParent>,
}

impl Default for BranchHierarchy {
    fn default() -> Self {
        Self {
            parents: BTreeMap::from([(MAIN_BRANCH.to_string(), None)]),
            ambiguous: Vec::new(),
        }
    }
}

type PotentialParents = BTreeMap<String, Vec<String>>;

impl BranchHierarchy {
    /// Infer the hierarchy from fully qualified branch names such as
    /// `main/dev/fix`.
    pub fn infer<'a>(full_names: impl IntoIterator<Item = &'a str>) -> Self {
        let mut potential: PotentialParents = BTreeMap::new();
        for full_name in full_names {
            let segments: Vec<&str> = full_name.split(BRANCH_SEPARATOR).collect();
            // every level, so that a branch is known even without versions of its own
            for pair in segments.windows(2) {
                let (parent, child) = (pair[0], pair[1]);
                if child == MAIN_BRANCH {
                    continue;
                }
                let parents = potential.entry(child.to_string()).or_default();
                if !parents.iter().any(|p| p == parent) {
                    parents.push(parent.to_string());
                }
            }
        }

        remove_cycles(&mut potential);

        let mut depths: BTreeMap<&str, usize> = potential.keys().map(|k| (k.as_str(), 0)).collect();
        depths.insert(MAIN_BRANCH, 1);
        let mut finished = false;
        while !finished {
            finished = true;
            for (branch, parents) in &potential {
                let depth = parents
                    .iter()
                    .map(|p| depths.get(p.as_str()).copied().unwrap_or(0))
                    .max()
                    .unwrap_or(0)
                    + 1;
                if depth > depths[branch.as_str()] {
                    depths.insert(branch.as_str(), depth);
                    finished = false;
                }
            }
        }

        let mut hierarchy = Self::default();
        for (branch, parents) in &potential {
            let depth_of = |p: &String| depths.get(p.as_str()).copied().unwrap_or(0);
            let Some(max_depth) = parents.iter().map(depth_of).max() else {
                warn!(branch = %branch, "branch has no parent left after breaking cycles");
                hierarchy.parents.insert(branch.clone(), None);
                continue;
            };
            let candidates: Vec<String> = parents
                .iter()
                .filter(|p| depth_of(p) == max_depth)
                .cloned()
                .collect();
            let chosen = candidates[0].clone();
            if candidates.len() > 1 {
                warn!(
                    branch = %branch,
                    candidates = %candidates.join(" and "),
                    chosen = %chosen,
                    "branch parent is ambiguous"
                );
                hierarchy.ambiguous.push(AmbiguousParent {
                    branch: branch.clone(),
                    candidates,
                    chosen: chosen.clone(),
                });
            }
            hierarchy.parents.insert(branch.clone(), Some(chosen));
        }
        hierarchy
    }

    pub fn contains(&self, branch: &str) -> bool {
        self.parents.contains_key(branch)
    }

    /// Parent of `branch`; `None` for `main` and unknown branches.
    pub fn parent(&self, branch: &str) -> Option<&str> {
        self.parents.get(branch).and_then(|p| p.as_deref())
    }

    /// Parent of a branch that must have one.
    pub fn require_parent(&self, branch: &str) -> Result<&str> {
        self.parent(branch).ok_or_else(|| Error::UnknownParentBranch {
            branch: branch.to_string(),
        })
    }

    pub fn branches(&self) -> impl Iterator<Item = &str> {
        self.parents.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.parents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn ambiguous(&self) -> &[AmbiguousParent] {
        &self.ambiguous
    }

    /// Remove the branches rejected by `filter`, except those another kept
    /// branch spawns from. Returns the removed branches.
    pub fn filter(&mut self, filter: &BranchFilter) -> Vec<String> {
        if filter.is_empty() {
            return Vec::new();
        }
        let candidates: Vec<String> = self
            .parents
            .keys()
            .filter(|b| !filter.matches(b))
            .cloned()
            .collect();
        let mut removed = Vec::new();
        let mut finished = false;
        while !finished {
            finished = true;
            for branch in &candidates {
                if !self.parents.contains_key(branch) {
                    continue;
                }
                let is_parent = self.parents.values().any(|p| p.as_deref() == Some(branch.as_str()));
                if !is_parent {
                    info!(branch = %branch, "branch filtered out");
                    self.parents.remove(branch);
                    removed.push(branch.clone());
                    finished = false;
                }
            }
        }
        for branch in candidates.iter().filter(|b| self.parents.contains_key(*b)) {
            info!(branch = %branch, "branch kept: other branches spawn from it");
        }
        removed
    }

    /// Combine with the hierarchy of a previous run. A branch may not change
    /// parent between runs.
    pub fn merge_previous(self, previous: &BranchHierarchy) -> Result<Self> {
        let mut merged = previous.clone();
        merged.ambiguous = self.ambiguous;
        for (branch, parent) in self.parents {
            match merged.parents.get(&branch) {
                Some(existing) if *existing != parent => {
                    return Err(Error::InconsistentBranchParent {
                        branch,
                        previous: existing.clone().unwrap_or_default(),
                        current: parent.unwrap_or_default(),
                    });
                }
                Some(_) => {}
                None => {
                    merged.parents.insert(branch, parent);
                }
            }
        }
        Ok(merged)
    }

    /// New names for branches that differ from another only by case, since
    /// the target system stores branches as files.
    pub fn case_collision_renames(&self) -> BTreeMap<String, String> {
        let existing: HashSet<String> = self.parents.keys().map(|b| b.to_lowercase()).collect();
        let mut seen: HashSet<String> = HashSet::new();
        let mut renames = BTreeMap::new();
        for branch in self.parents.keys() {
            if seen.insert(branch.to_lowercase()) {
                continue;
            }
            let mut n = 1;
            let renamed = loop {
                let candidate = format!("{branch}_{n}").to_lowercase();
                if !seen.contains(&candidate) && !existing.contains(&candidate) {
                    break format!("{branch}_{n}");
                }
                n += 1;
            };
            seen.insert(renamed.to_lowercase());
            renames.insert(branch.clone(), renamed);
        }
        renames
    }
}

/// Break parent cycles, removing as few potential-parent links as possible.
fn remove_cycles(potential: &mut PotentialParents) {
    loop {
        let cycles = find_all_cycles(potential);
        if cycles.is_empty() {
            return;
        }

        let mut counts: BTreeMap<(String, String), usize> = BTreeMap::new();
        for cycle in &cycles {
            for (i, child) in cycle.iter().enumerate() {
                let parent = &cycle[(i + 1) % cycle.len()];
                *counts.entry((child.clone(), parent.clone())).or_default() += 1;
            }
        }
        let most = counts.values().copied().max().unwrap_or(0);
        let parent_count = |child: &str| potential.get(child).map_or(0, Vec::len);
        let mut best: Option<&(String, String)> = None;
        for (link, count) in &counts {
            if *count != most {
                continue;
            }
            if best.is_none_or(|b| parent_count(&link.0) > parent_count(&b.0)) {
                best = Some(link);
            }
        }
        let Some((child, parent)) = best.cloned() else {
            return;
        };

        let rendered: Vec<String> = cycles
            .iter()
            .map(|c| format!("{} -> {}", c.join(" -> "), c[0]))
            .collect();
        warn!(
            cycles = %rendered.join(" ; "),
            "branch cycles, removing {parent} as a potential parent of {child}"
        );
        if let Some(parents) = potential.get_mut(&child) {
            parents.retain(|p| *p != parent);
        }
    }
}

/// Every elementary cycle of the child → parent relation, each rotated to
/// start at its smallest branch.
fn find_all_cycles(potential: &PotentialParents) -> BTreeSet<Vec<String>> {
    let mut cycles = BTreeSet::new();
    for start in potential.keys() {
        let mut stack: Vec<(&str, Vec<&str>)> = vec![(start.as_str(), Vec::new())];
        while let Some((branch, chain)) = stack.pop() {
            if branch == MAIN_BRANCH {
                continue;
            }
            if let Some(position) = chain.iter().position(|b| *b == branch) {
                let mut cycle: Vec<String> = chain[position..].iter().map(|b| b.to_string()).collect();
                if let Some(min) = cycle.iter().enumerate().min_by_key(|(_, b)| *b).map(|(i, _)| i) {
                    cycle.rotate_left(min);
                }
                cycles.insert(cycle);
                continue;
            }
            let Some(parents) = potential.get(branch) else {
                continue;
            };
            let mut chain = chain;
            chain.push(branch);
            for parent in parents.iter().rev() {
                stack.push((parent.as_str(), chain.clone()));
            }
        }
    }
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deepest_parent_wins() {
        let hierarchy = BranchHierarchy::infer([
            "main",
            "main/dev",
            "main/dev/fix",
            // also seen directly on main for some elements
            "main/fix",
        ]);
        assert_eq!(hierarchy.parent("dev"), Some("main"));
        assert_eq!(hierarchy.parent("fix"), Some("dev"));
        assert_eq!(hierarchy.parent("main"), None);
        assert!(hierarchy.ambiguous().is_empty());
    }

    #[test]
    fn ambiguous_parent_picks_first_candidate() {
        let hierarchy = BranchHierarchy::infer(["main/a/x", "main/b/x"]);
        assert_eq!(hierarchy.parent("x"), Some("a"));
        assert_eq!(hierarchy.ambiguous().len(), 1);
        assert_eq!(hierarchy.ambiguous()[0].candidates, vec!["a", "b"]);
    }

    #[test]
    fn cycles_are_broken() {
        // a and b each appear as the parent of the other
        let hierarchy = BranchHierarchy::infer(["main/a/b", "main/b/a"]);
        let a = hierarchy.parent("a");
        let b = hierarchy.parent("b");
        assert!(
            (a == Some("main") && b == Some("a")) || (b == Some("main") && a == Some("b")),
            "a: {a:?}, b: {b:?}"
        );
    }

    #[test]
    fn filter_keeps_branches_with_kept_children() {
        let mut hierarchy = BranchHierarchy::infer(["main/int/rel_1", "main/feature", "main/int/wip"]);
        let filter = BranchFilter::new(&["^rel_".to_string()]).unwrap();
        let mut removed = hierarchy.filter(&filter);
        removed.sort();

        assert_eq!(removed, vec!["feature", "wip"]);
        assert!(hierarchy.contains("int"));
        assert!(hierarchy.contains("rel_1"));
    }

    #[test]
    fn previous_parents_must_agree() {
        let previous = BranchHierarchy::infer(["main/dev"]);
        let merged = BranchHierarchy::infer(["main/fix"]).merge_previous(&previous).unwrap();
        assert!(merged.contains("dev") && merged.contains("fix"));

        let err = BranchHierarchy::infer(["main/fix/dev"])
            .merge_previous(&previous)
            .unwrap_err();
        assert!(matches!(err, Error::InconsistentBranchParent { branch, .. } if branch == "dev"));
    }

    #[test]
    fn case_collisions_are_renamed() {
        let hierarchy = BranchHierarchy::infer(["main/Dev", "main/dev", "main/dev_1"]);
        let renames = hierarchy.case_collision_renames();
        assert_eq!(renames.len(), 1);
        assert_eq!(renames.get("dev").map(String::as_str), Some("dev_2"));
    }
}
