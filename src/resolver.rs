//! Tree resolution for a single changeset.
//!
//! Directory versions are diffed against what the branch currently shows,
//! turning content changes into tree operations and giving every version
//! of the changeset the paths it is visible under.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::{debug, info, warn};

use crate::changeset::{ChangeSet, NamedVersion};
use crate::config::{child_path, normalize_path, Roots};
use crate::error::{Error, Result};
use crate::graph::{ElementId, ElementKind, MAIN_BRANCH, VersionGraph, VersionId};

/// What one branch shows at the current point of the replay.
#[derive(Debug, Clone, Default)]
pub struct BranchState {
    /// Every path an element is visible under. Elements without a visible
    /// path have no entry.
    pub names: HashMap<ElementId, BTreeSet<String>>,
    /// Version of each element in effect.
    pub versions: HashMap<ElementId, VersionId>,
}

/// A version waiting for a visible path.
#[derive(Debug, Clone)]
pub struct Orphan {
    pub branch: String,
    pub version: NamedVersion,
}

/// Orphans of every branch, by element.
pub type OrphanRegistry = BTreeMap<ElementId, Vec<Orphan>>;

/// Resolve the tree operations and names of `changeset`, updating `state`.
///
/// Returns the versions that became orphans in this changeset.
pub fn resolve(
    graph: &VersionGraph,
    changeset: &mut ChangeSet,
    state: &mut BranchState,
    orphans: &mut OrphanRegistry,
    roots: &Roots,
) -> Result<Vec<VersionId>> {
    TreeResolver {
        graph,
        changeset,
        state,
        orphans,
        roots,
        old_versions: HashMap::new(),
        new_orphans: Vec::new(),
    }
    .run()
}

/// Ordered `child → [(parent, name)]` placements found while diffing.
#[derive(Debug, Default)]
struct Placements(Vec<(ElementId, Vec<(ElementId, String)>)>);

impl Placements {
    fn add(&mut self, child: ElementId, parent: ElementId, name: &str) {
        let entry = (parent, name.to_string());
        match self.0.iter_mut().find(|(c, _)| *c == child) {
            Some((_, placements)) => placements.push(entry),
            None => self.0.push((child, vec![entry])),
        }
    }

    fn remove(&mut self, child: ElementId, parent: ElementId, name: &str) -> bool {
        let Some(index) = self.0.iter().position(|(c, _)| *c == child) else {
            return false;
        };
        let placements = &mut self.0[index].1;
        let Some(position) = placements
            .iter()
            .position(|(p, n)| *p == parent && n == name)
        else {
            return false;
        };
        placements.remove(position);
        if placements.is_empty() {
            self.0.remove(index);
        }
        true
    }

    fn contains(&self, child: ElementId) -> bool {
        self.0.iter().any(|(c, _)| *c == child)
    }

    fn take(&mut self, child: ElementId) -> Vec<(ElementId, String)> {
        match self.0.iter().position(|(c, _)| *c == child) {
            Some(index) => self.0.remove(index).1,
            None => Vec::new(),
        }
    }
}

struct TreeResolver<'a> {
    graph: &'a VersionGraph,
    changeset: &'a mut ChangeSet,
    state: &'a mut BranchState,
    orphans: &'a mut OrphanRegistry,
    roots: &'a Roots,
    /// Version in effect before this changeset; `None` when the element
    /// had none.
    old_versions: HashMap<ElementId, Option<VersionId>>,
    new_orphans: Vec<VersionId>,
}

impl TreeResolver<'_> {
    fn run(mut self) -> Result<Vec<VersionId>> {
        let graph = self.graph;
        for named in &self.changeset.versions {
            let element = graph.version(named.version).element;
            let old = self.state.versions.get(&element).copied();
            self.old_versions.entry(element).or_insert(old);
            self.state.versions.insert(element, named.version);
        }

        self.process_directory_changes()?;

        let versions: Vec<VersionId> = self.changeset.versions.iter().map(|n| n.version).collect();
        for version in versions {
            let element = graph.version(version).element;
            let solo = graph.is_solo(element);
            let Some(index) = self
                .changeset
                .versions
                .iter()
                .position(|n| n.version == version)
            else {
                continue;
            };
            // named by a directory change; solo versions still get every name
            if !self.changeset.versions[index].names.is_empty() && !solo {
                continue;
            }
            if let Some(names) = self.state.names.get(&element) {
                let named = &mut self.changeset.versions[index];
                for name in names {
                    if !named.names.contains(name) {
                        named.names.push(name.clone());
                    }
                }
                continue;
            }
            if let Some(name) = self.changeset.versions[index].names.first() {
                return Err(Error::MissingName {
                    version: graph.describe(version),
                    name: name.clone(),
                });
            }
            if graph.version(version).number == 0 && !solo {
                continue;
            }
            debug!(version = %graph.describe(version), "version not yet visible in any directory version");
            let named = self.changeset.versions.remove(index);
            self.orphans.entry(element).or_default().push(Orphan {
                branch: self.changeset.branch.clone(),
                version: named,
            });
            self.new_orphans.push(version);
        }
        Ok(self.new_orphans)
    }

    fn process_directory_changes(&mut self) -> Result<()> {
        let graph = self.graph;
        let ordered = self.order_directories()?;

        let mut removed = Placements::default();
        let mut added = Placements::default();
        for &version in &ordered {
            if graph.version(version).number == 0 {
                continue;
            }
            self.compute_diff(version, &mut removed, &mut added)?;
        }
        reconcile(&mut removed, &mut added);

        let renamed = self.process_remove(&removed, &added);

        for &version in &ordered {
            let v = graph.version(version);
            // only the latest version of a directory in this changeset
            let superseded = ordered.iter().any(|o| {
                let other = graph.version(*o);
                other.element == v.element && other.number > v.number
            });
            if superseded {
                continue;
            }
            if !self.state.names.contains_key(&v.element) {
                let name = &graph.element(v.element).name;
                if !self.roots.is_root(name) {
                    // removed by one of the changes
                    continue;
                }
                self.state
                    .names
                    .insert(v.element, BTreeSet::from([normalize_path(name)]));
            }
            let bases: Vec<String> = self.state.names[&v.element].iter().cloned().collect();
            for base in bases {
                self.update_child_names(version, &base);
            }
        }

        self.process_rename(renamed, &mut added);

        for (element, placements) in std::mem::take(&mut added.0) {
            for (parent, name) in placements {
                match self.state.names.get(&parent) {
                    Some(bases) => {
                        let bases: Vec<String> = bases.iter().cloned().collect();
                        for base in bases {
                            self.add_element(element, Some(child_path(&base, &name)))?;
                        }
                    }
                    None => self.add_element(element, None)?,
                }
            }
        }
        Ok(())
    }

    /// Directory versions of the changeset, parents before children.
    fn order_directories(&self) -> Result<Vec<VersionId>> {
        let graph = self.graph;
        let mut unordered: Vec<VersionId> = self
            .changeset
            .versions
            .iter()
            .map(|n| n.version)
            .filter(|v| graph.element_of(*v).is_directory())
            .collect();
        let mut ordered = Vec::with_capacity(unordered.len());
        while !unordered.is_empty() {
            let (roots, rest): (Vec<VersionId>, Vec<VersionId>) =
                unordered.iter().copied().partition(|v| {
                    let element = graph.version(*v).element;
                    !unordered
                        .iter()
                        .any(|parent| graph.version(*parent).content().iter().any(|(_, c)| *c == element))
                });
            if roots.is_empty() {
                return Err(Error::DirectoryCycle {
                    changeset: self.changeset.to_string(),
                });
            }
            ordered.extend(roots);
            unordered = rest;
        }
        Ok(ordered)
    }

    fn compute_diff(
        &self,
        version: VersionId,
        removed: &mut Placements,
        added: &mut Placements,
    ) -> Result<()> {
        let graph = self.graph;
        let v = graph.version(version);
        let mut previous = graph.previous_version(version);
        if previous.is_none() && v.branch != MAIN_BRANCH {
            return Err(Error::MissingPredecessor {
                version: graph.describe(version),
            });
        }
        // a branch is spawned per element: what the branch showed before
        // may differ from the branching point
        if previous.is_some_and(|p| graph.version(p).number == 0) {
            previous = self.old_versions.get(&v.element).copied().flatten();
        }
        let before: &[(String, ElementId)] = match previous {
            Some(p) => graph.version(p).content(),
            None => &[],
        };
        let after = v.content();

        for (name, child) in before {
            if after.iter().any(|(n, c)| n == name && c == child) {
                continue;
            }
            if !added.remove(*child, v.element, name) {
                removed.add(*child, v.element, name);
            }
        }
        for (name, child) in after {
            if !before.iter().any(|(n, c)| n == name && c == child) {
                added.add(*child, v.element, name);
            }
        }
        Ok(())
    }

    /// Emit removals, dropping the old names. Elements that are also added
    /// elsewhere are returned with their first visible old path, to be
    /// renamed instead.
    fn process_remove(&mut self, removed: &Placements, added: &Placements) -> Vec<(ElementId, String)> {
        let graph = self.graph;
        let mut renamed: Vec<(ElementId, String)> = Vec::new();
        let mut removed_names: HashMap<ElementId, BTreeSet<String>> = HashMap::new();
        for (element, placements) in &removed.0 {
            let element = *element;
            let is_symlink = graph.element(element).is_symlink();
            let never_committed = !self.state.versions.contains_key(&element)
                || self.old_versions.get(&element) == Some(&None);
            let is_rename = !is_symlink && !never_committed && added.contains(element);

            for (parent, name) in placements {
                let Some(parent_names) = self
                    .state
                    .names
                    .get(parent)
                    .or_else(|| removed_names.get(parent))
                    .cloned()
                else {
                    continue;
                };
                for parent_name in parent_names {
                    let path = child_path(&parent_name, name);
                    if !is_symlink && never_committed {
                        info!(element = %graph.element(element).name, "element removed before any version was committed");
                    } else if is_rename && !renamed.iter().any(|(e, _)| *e == element) {
                        renamed.push((element, path.clone()));
                    } else if !self.was_empty_directory(element) && !self.is_under_removed(&path) {
                        self.changeset.removed.push(path.clone());
                    }
                    self.remove_element_name(element, &path, &mut removed_names);
                }
            }
        }
        renamed
    }

    fn process_rename(&mut self, renamed: Vec<(ElementId, String)>, added: &mut Placements) {
        let graph = self.graph;
        for (element, old_name) in renamed {
            if let Some(names) = self.state.names.get_mut(&element) {
                names.remove(&old_name);
            }

            // earlier renames in this changeset apply first
            let mut old_name = old_name;
            let mut conflicting = None;
            for (i, (from, to)) in self.changeset.renamed.iter().enumerate() {
                if let Some(rest) = old_name.strip_prefix(&format!("{from}/")) {
                    old_name = format!("{to}/{rest}");
                }
                if *to == old_name {
                    conflicting = Some(i);
                }
            }

            let is_empty = self.was_empty_directory(element);
            let mut renamed_to: Option<String> = None;
            for (parent, name) in added.take(element) {
                debug!(element = %graph.element(element).name, old = %old_name, new = %name, "renamed element");
                let Some(parent_names) = self.state.names.get(&parent).cloned() else {
                    // destination not visible yet
                    continue;
                };
                if is_empty {
                    continue;
                }
                for parent_name in parent_names {
                    let target = child_path(&parent_name, &name);
                    self.redirect_into(&target, &old_name);
                    match renamed_to.clone() {
                        None => {
                            self.push_rename(&old_name, &target, conflicting);
                            renamed_to = Some(target.clone());
                        }
                        Some(source) => {
                            self.changeset.copied.push((source, target.clone()));
                        }
                    }
                    // the rename replaces whatever was there
                    self.changeset.removed.retain(|r| *r != target);
                }
            }

            if renamed_to.is_none() && !is_empty && !self.is_under_removed(&old_name) {
                self.changeset.removed.push(old_name);
            }
        }
    }

    /// Operations writing below `target` would be overwritten by the move of
    /// `old_name` onto it: write below `old_name` instead.
    fn redirect_into(&mut self, target: &str, old_name: &str) {
        let prefix = format!("{target}/");
        let ops = self
            .changeset
            .renamed
            .iter_mut()
            .chain(self.changeset.copied.iter_mut());
        for (_, to) in ops {
            if let Some(rest) = to.strip_prefix(&prefix) {
                let redirected = format!("{old_name}/{rest}");
                *to = redirected;
            }
        }
    }

    fn push_rename(&mut self, old_name: &str, target: &str, conflicting: Option<usize>) {
        let renames = &mut self.changeset.renamed;
        match conflicting {
            None => renames.push((old_name.to_string(), target.to_string())),
            Some(i) if renames[i].0 != target => {
                // another element moves onto old_name: move this one away first
                renames.insert(i, (old_name.to_string(), target.to_string()));
            }
            Some(i) => {
                // two names are exchanged
                let temporary = format!("{old_name}.swap-{}", self.changeset.id);
                renames[i] = (target.to_string(), temporary.clone());
                renames.push((old_name.to_string(), target.to_string()));
                renames.push((temporary, old_name.to_string()));
            }
        }
    }

    fn update_child_names(&mut self, version: VersionId, base: &str) {
        let graph = self.graph;
        let mut stack = vec![(version, base.to_string(), vec![graph.version(version).element])];
        while let Some((directory, base, ancestors)) = stack.pop() {
            for (name, child) in graph.version(directory).content() {
                let path = child_path(&base, name);
                self.state.names.entry(*child).or_default().insert(path.clone());
                if !graph.element(*child).is_directory() {
                    continue;
                }
                if ancestors.contains(child) {
                    warn!(path = %path, "directory contains itself");
                    continue;
                }
                if let Some(child_version) = self.state.versions.get(child) {
                    let mut ancestors = ancestors.clone();
                    ancestors.push(*child);
                    stack.push((*child_version, path, ancestors));
                }
            }
        }
    }

    /// Make `element` visible at `path`, or record it as an orphan when
    /// `path` is `None`.
    fn add_element(&mut self, element: ElementId, path: Option<String>) -> Result<()> {
        let graph = self.graph;
        let mut stack = vec![(element, path)];
        while let Some((element, path)) = stack.pop() {
            let e = graph.element(element);
            if let ElementKind::SymLink { target, .. } = &e.kind {
                if let Some(path) = path {
                    self.changeset
                        .symlinks
                        .push((path, target.replace('\\', "/")));
                }
                continue;
            }

            let current = match self.state.versions.get(&element) {
                Some(current) => *current,
                // otherwise assumed to be an empty version 0
                None if graph.is_solo(element) => match graph.find_version(element, MAIN_BRANCH, 0) {
                    Some(v) => v,
                    None => continue,
                },
                None => continue,
            };

            if e.is_directory() {
                // pushed in reverse to visit entries in content order
                for (name, child) in graph.version(current).content().iter().rev() {
                    stack.push((*child, path.as_ref().map(|p| child_path(p, name))));
                }
                continue;
            }

            let existing: Vec<usize> = self
                .changeset
                .versions
                .iter()
                .enumerate()
                .filter(|(_, n)| graph.version(n.version).element == element)
                .map(|(i, _)| i)
                .collect();
            match existing.as_slice() {
                [] => {}
                [index] => {
                    let expected = self.changeset.versions[*index].version;
                    if expected != current {
                        return Err(Error::VersionMismatch {
                            element: e.name.clone(),
                            changeset: self.changeset.to_string(),
                            expected: graph.describe(expected),
                            actual: graph.describe(current),
                        });
                    }
                    let named = &mut self.changeset.versions[*index];
                    if let Some(path) = path {
                        if !named.names.contains(&path) {
                            named.names.push(path);
                            if named.names.len() > 1 {
                                debug!(version = %graph.describe(current), names = ?named.names, "version has several names");
                            }
                        }
                    }
                    continue;
                }
                _ => {
                    return Err(Error::DuplicateFileVersion {
                        element: e.name.clone(),
                        count: existing.len(),
                        changeset: self.changeset.to_string(),
                    });
                }
            }

            let Some(path) = path else {
                self.orphans.entry(element).or_default().push(Orphan {
                    branch: self.changeset.branch.clone(),
                    version: NamedVersion::new(current, None, false),
                });
                self.new_orphans.push(current);
                continue;
            };

            self.changeset.add(graph, current, Some(path), false);

            // a name was found: adopt the matching orphan
            let branch = &self.changeset.branch;
            if let Some(waiting) = self.orphans.get_mut(&element) {
                waiting.retain(|o| !(o.branch == *branch && o.version.version == current));
                if waiting.is_empty() {
                    self.orphans.remove(&element);
                }
            }
            self.new_orphans.retain(|v| *v != current);
        }
        Ok(())
    }

    fn remove_element_name(
        &mut self,
        element: ElementId,
        name: &str,
        removed_names: &mut HashMap<ElementId, BTreeSet<String>>,
    ) {
        let graph = self.graph;
        let mut stack = vec![(element, name.to_string())];
        while let Some((element, name)) = stack.pop() {
            if let Some(names) = self.state.names.get_mut(&element) {
                names.remove(&name);
                if names.is_empty() {
                    self.state.names.remove(&element);
                }
            }
            if !graph.element(element).is_directory() {
                continue;
            }
            // so that children removed later still find this parent
            removed_names.entry(element).or_default().insert(name.clone());
            let Some(version) = self.version_before(element) else {
                continue;
            };
            for (child_name, child) in graph.version(version).content() {
                stack.push((*child, child_path(&name, child_name)));
            }
        }
    }

    /// Version in effect before this changeset, falling back to the current
    /// one for elements it does not touch.
    fn version_before(&self, element: ElementId) -> Option<VersionId> {
        match self.old_versions.get(&element) {
            Some(old) => *old,
            None => self.state.versions.get(&element).copied(),
        }
    }

    /// Directories holding no file, at any depth, produce no operation.
    fn was_empty_directory(&self, element: ElementId) -> bool {
        let graph = self.graph;
        let mut stack = vec![element];
        let mut seen = BTreeSet::new();
        while let Some(element) = stack.pop() {
            if !graph.element(element).is_directory() {
                return false;
            }
            if !seen.insert(element) {
                continue;
            }
            if let Some(version) = self.version_before(element) {
                stack.extend(graph.version(version).content().iter().map(|(_, c)| *c));
            }
        }
        true
    }

    fn is_under_removed(&self, path: &str) -> bool {
        self.changeset
            .removed
            .iter()
            .any(|r| path.starts_with(&format!("{r}/")))
    }
}

/// An element removed from and added back to the same directory under the
/// same name did not move.
fn reconcile(removed: &mut Placements, added: &mut Placements) {
    let candidates: Vec<(ElementId, ElementId, String)> = added
        .0
        .iter()
        .flat_map(|(child, placements)| {
            placements
                .iter()
                .map(move |(parent, name)| (*child, *parent, name.clone()))
        })
        .collect();
    for (child, parent, name) in candidates {
        if removed.remove(child, parent, &name) {
            debug!(?child, name = %name, "element removed and added back in the same changeset");
            added.remove(child, parent, &name);
        }
    }
}
