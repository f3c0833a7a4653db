//! History scheduler.
//!
//! Replays the clustered changesets in chronological order, reordering
//! when a label would otherwise be broken, and turns them into the final
//! sequence: merge edges, emission order, cleanup and numbering.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use crate::changeset::{ChangeSet, ChangeSetKey};
use crate::config::Roots;
use crate::error::{Error, Result};
use crate::graph::{ElementId, MAIN_BRANCH, VersionGraph, VersionId};
use crate::hierarchy::BranchHierarchy;
use crate::labels::{LabelRegistry, LabelState};
use crate::merges::{IncompleteMerge, MergeTracker};
use crate::resolver::{self, BranchState, OrphanRegistry};

/// Replay state carried from one run to the next.
#[derive(Debug, Clone, Default)]
pub struct ReplayState {
    pub last_id: usize,
    /// Id of the changeset each started branch was spawned from; `None` for
    /// `main`.
    pub started: BTreeMap<String, Option<usize>>,
    /// Id of the last changeset of each branch.
    pub tips: BTreeMap<String, usize>,
    pub branches: HashMap<String, BranchState>,
}

/// The reconstructed history of a run.
#[derive(Debug)]
pub struct History {
    /// Every changeset of the run, emitted or not.
    pub changesets: Vec<ChangeSet>,
    /// Changesets to import, in order.
    pub emitted: Vec<ChangeSetKey>,
    pub state: ReplayState,
    pub labels: LabelRegistry,
    /// Versions never visible in any directory.
    pub lost_versions: Vec<VersionId>,
    /// Versions that completed a label while orphaned.
    pub labeled_orphans: Vec<VersionId>,
    pub incomplete_merges: Vec<IncompleteMerge>,
}

impl History {
    pub fn get(&self, key: ChangeSetKey) -> &ChangeSet {
        &self.changesets[key.0]
    }

    /// Emitted changesets, in order.
    pub fn iter(&self) -> impl Iterator<Item = &ChangeSet> {
        self.emitted.iter().map(|k| &self.changesets[k.0])
    }

    pub fn len(&self) -> usize {
        self.emitted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emitted.is_empty()
    }
}

pub struct Scheduler<'a> {
    graph: &'a VersionGraph,
    hierarchy: &'a BranchHierarchy,
    roots: &'a Roots,
    label_lateness: Duration,

    /// Arena; [`ChangeSetKey`]s index into it.
    changesets: Vec<ChangeSet>,
    /// Changesets of a previous run, standing in for branch tips and
    /// branching points. Never emitted.
    stubs: HashSet<ChangeSetKey>,
    /// Chronological changesets still to replay.
    pending: Vec<Option<ChangeSetKey>>,
    cursor: usize,

    labels: LabelRegistry,
    branches: HashMap<String, BranchState>,
    started: HashMap<String, Option<ChangeSetKey>>,
    tips: HashMap<String, ChangeSetKey>,
    first_id: usize,
    last_id: usize,
    /// Replay order.
    order: Vec<ChangeSetKey>,

    orphans: OrphanRegistry,
    labeled_orphans: BTreeSet<VersionId>,
}

impl<'a> Scheduler<'a> {
    pub fn new(
        graph: &'a VersionGraph,
        hierarchy: &'a BranchHierarchy,
        roots: &'a Roots,
        label_lateness: Duration,
        changesets: Vec<ChangeSet>,
        labels: LabelRegistry,
    ) -> Self {
        let pending = (0..changesets.len()).map(|i| Some(ChangeSetKey(i))).collect();
        Self {
            graph,
            hierarchy,
            roots,
            label_lateness,
            changesets,
            stubs: HashSet::new(),
            pending,
            cursor: 0,
            labels,
            branches: HashMap::new(),
            started: HashMap::new(),
            tips: HashMap::new(),
            first_id: 0,
            last_id: 0,
            order: Vec::new(),
            orphans: OrphanRegistry::new(),
            labeled_orphans: BTreeSet::new(),
        }
    }

    /// Continue from the state of a previous run.
    pub fn with_previous(mut self, previous: ReplayState) -> Self {
        self.first_id = previous.last_id;
        self.last_id = previous.last_id;
        self.branches = previous.branches;

        let mut by_id: HashMap<usize, ChangeSetKey> = HashMap::new();
        for (branch, id) in &previous.tips {
            let key = self.stub(&mut by_id, branch, *id);
            self.tips.insert(branch.clone(), key);
        }
        for (branch, origin) in &previous.started {
            let origin = origin.map(|id| {
                let parent = self.hierarchy.parent(branch).unwrap_or(MAIN_BRANCH).to_string();
                self.stub(&mut by_id, &parent, id)
            });
            self.started.insert(branch.clone(), origin);
        }
        self
    }

    fn stub(&mut self, by_id: &mut HashMap<usize, ChangeSetKey>, branch: &str, id: usize) -> ChangeSetKey {
        *by_id.entry(id).or_insert_with(|| {
            let key = ChangeSetKey(self.changesets.len());
            let mut stub = ChangeSet::new("", "", branch, DateTime::<Utc>::default());
            stub.id = id;
            self.changesets.push(stub);
            self.stubs.insert(key);
            key
        })
    }

    pub fn run(mut self) -> Result<History> {
        info!(changesets = self.pending.len(), "replaying changesets");
        loop {
            let batch = self.find_next_changesets()?;
            if batch.is_empty() {
                break;
            }
            for key in batch {
                self.process(key)?;
            }
        }
        self.finish()
    }

    // =========================================================================
    // Replay
    // =========================================================================

    fn process(&mut self, key: ChangeSetKey) -> Result<()> {
        self.last_id += 1;
        self.changesets[key.0].id = self.last_id;
        self.order.push(key);
        if self.order.len() % 1000 == 0 {
            info!(changeset = %self.changesets[key.0], "replaying");
        }

        let branch = self.changesets[key.0].branch.clone();
        self.tips.insert(branch.clone(), key);
        if !self.started.contains_key(&branch) {
            self.spawn(key, &branch)?;
        }

        let Some(state) = self.branches.get_mut(&branch) else {
            return Err(Error::UnknownParentBranch { branch });
        };
        let orphans = resolver::resolve(
            self.graph,
            &mut self.changesets[key.0],
            state,
            &mut self.orphans,
            self.roots,
        )?;
        self.process_labels(key, &orphans);
        debug!(changeset = %self.changesets[key.0], "replayed");
        Ok(())
    }

    /// Start `branch` for its first changeset `key`, bootstrapping unstarted
    /// ancestors with empty changesets.
    fn spawn(&mut self, key: ChangeSetKey, branch: &str) -> Result<()> {
        if branch == MAIN_BRANCH {
            self.branches.insert(MAIN_BRANCH.to_string(), BranchState::default());
            self.started.insert(MAIN_BRANCH.to_string(), None);
            return Ok(());
        }
        let parent = self.hierarchy.require_parent(branch)?.to_string();
        loop {
            let mut to_start: Option<String> = None;
            let mut current = parent.clone();
            while !self.started.contains_key(&current) && current != MAIN_BRANCH {
                to_start = Some(current.clone());
                current = self.hierarchy.require_parent(&current)?.to_string();
            }

            if current == MAIN_BRANCH && !self.started.contains_key(MAIN_BRANCH) {
                warn!("main has not been started, creating an empty changeset");
                let first = &self.changesets[key.0];
                let main = ChangeSet::new(&first.author_name, &first.author_login, MAIN_BRANCH, first.finish);
                let main_key = self.insert_before(key, main);
                self.tips.insert(MAIN_BRANCH.to_string(), main_key);
                self.branches.insert(MAIN_BRANCH.to_string(), BranchState::default());
                self.started.insert(MAIN_BRANCH.to_string(), None);
            }

            let Some(to_start) = to_start else {
                break;
            };
            let origin = self.tip(&current)?;
            self.changesets[origin.0].is_branching_point = true;
            let from = &self.changesets[origin.0];
            let mut bridge = ChangeSet::new(&from.author_name, &from.author_login, &to_start, from.finish);
            bridge.branching_point = Some(origin);
            info!(branch = %to_start, parent = %current, "starting branch with an empty changeset");
            let bridge_key = self.insert_before(key, bridge);

            let state = self.branches.get(&current).cloned().unwrap_or_default();
            self.branches.insert(to_start.clone(), state);
            self.started.insert(to_start.clone(), Some(origin));
            self.tips.insert(to_start, bridge_key);
        }

        let origin = self.tip(&parent)?;
        self.changesets[origin.0].is_branching_point = true;
        self.changesets[key.0].branching_point = Some(origin);
        let state = self.branches.get(&parent).cloned().unwrap_or_default();
        self.branches.insert(branch.to_string(), state);
        self.started.insert(branch.to_string(), Some(origin));
        Ok(())
    }

    fn tip(&self, branch: &str) -> Result<ChangeSetKey> {
        self.tips
            .get(branch)
            .copied()
            .ok_or_else(|| Error::UnknownParentBranch {
                branch: branch.to_string(),
            })
    }

    /// Replay `changeset` just before `key`, the changeset being replayed.
    fn insert_before(&mut self, key: ChangeSetKey, mut changeset: ChangeSet) -> ChangeSetKey {
        let inserted = ChangeSetKey(self.changesets.len());
        changeset.id = self.changesets[key.0].id;
        self.changesets.push(changeset);
        self.last_id += 1;
        self.changesets[key.0].id = self.last_id;
        let position = self.order.len().saturating_sub(1);
        self.order.insert(position, inserted);
        inserted
    }

    // =========================================================================
    // Label-consistent ordering
    // =========================================================================

    fn find_next_changesets(&mut self) -> Result<Vec<ChangeSetKey>> {
        while self.cursor < self.pending.len() && self.pending[self.cursor].is_none() {
            self.cursor += 1;
        }
        let Some(Some(key)) = self.pending.get(self.cursor).copied() else {
            return Ok(Vec::new());
        };

        let would_break = self.would_break_labels(key);
        for (label, branch) in would_break {
            let missing = match self.labels.pending(&label) {
                // already handled for another branch
                None => continue,
                Some(info) => info.missing.get(&branch).cloned(),
            };
            let Some(mut missing) = missing else {
                // a branch the label needs must be spawned first
                let spawning = self.find_branch_to_spawn(&label, &branch)?;
                info!(
                    changeset = %self.changesets[spawning.0],
                    before = %self.changesets[key.0],
                    "applying changeset early to start its branch"
                );
                return Ok(vec![spawning]);
            };

            self.drop_late_versions(&label, key, &mut missing);
            if missing.is_empty() {
                self.complete_on_tip(&label, &branch);
                continue;
            }

            let mut remaining = missing.clone();
            let mut needed = BTreeSet::new();
            let mut index = self.cursor;
            while !remaining.is_empty() && index < self.pending.len() {
                if let Some(candidate) = self.pending[index] {
                    let changeset = &self.changesets[candidate.0];
                    if changeset.branch == branch {
                        for named in &changeset.versions {
                            if remaining.remove(&named.version) {
                                needed.insert(index);
                            }
                        }
                    }
                }
                index += 1;
            }
            if !remaining.is_empty() {
                let versions: Vec<String> = remaining.iter().map(|v| self.graph.describe(*v)).collect();
                warn!(
                    label = %label,
                    branch = %branch,
                    versions = ?versions,
                    "label broken: versions not in any further changeset, dropping it"
                );
                if let Some(info) = self.labels.get_mut(&label) {
                    info.state = LabelState::Dropped;
                }
                continue;
            }

            if !self.add_dependencies(&mut needed, &label, index) {
                info!(label = %label, at = %self.changesets[key.0], "label inconsistent, force applying anyway");
            }
            let batch: Vec<ChangeSetKey> = needed
                .iter()
                .filter_map(|i| self.pending[*i].take())
                .collect();
            info!(
                count = batch.len(),
                before = %self.changesets[key.0],
                label = %label,
                "applying changesets early to complete label"
            );
            return Ok(batch);
        }

        self.pending[self.cursor] = None;
        self.cursor += 1;
        Ok(vec![key])
    }

    /// Labels (with the branch concerned) that would be left incomplete for
    /// good once `key` is replayed.
    fn would_break_labels(&self, key: ChangeSetKey) -> BTreeSet<(String, String)> {
        let graph = self.graph;
        let changeset = &self.changesets[key.0];
        let branch = &changeset.branch;
        let mut result = BTreeSet::new();

        if !self.started.contains_key(branch) {
            // any label on the new branch not complete on an ancestor
            for ancestor in self.ancestors(branch) {
                for label in self.labels.iter_pending() {
                    if label.is_missing_on(branch) && label.is_missing_on(ancestor) {
                        result.insert((label.name.clone(), ancestor.to_string()));
                    }
                }
            }
        }

        for named in &changeset.versions {
            let mut previous = graph.previous_version(named.version);
            while let Some(p) = previous.filter(|p| graph.version(*p).number == 0) {
                previous = graph.previous_version(p);
            }
            let Some(previous) = previous else {
                continue;
            };
            for label in &graph.version(previous).labels {
                let Some(info) = self.labels.pending(label) else {
                    continue;
                };
                let breaks = info.is_missing_on(branch)
                    || info
                        .missing
                        .keys()
                        .any(|missing| self.unstarted_child_towards(missing, branch).is_some());
                if breaks {
                    result.insert((label.clone(), branch.clone()));
                }
            }
        }
        result
    }

    /// Strict ancestors of `branch`, closest first.
    fn ancestors<'b>(&'b self, branch: &'b str) -> impl Iterator<Item = &'b str> + 'b {
        let mut current = self.hierarchy.parent(branch);
        let mut budget = self.hierarchy.len();
        std::iter::from_fn(move || {
            let this = current?;
            if budget == 0 {
                return None;
            }
            budget -= 1;
            current = self.hierarchy.parent(this);
            Some(this)
        })
    }

    /// The unstarted branch spawning directly from `parent` on the way from
    /// `branch` up to it, if any.
    fn unstarted_child_towards<'b>(&'b self, branch: &'b str, parent: &str) -> Option<&'b str> {
        let mut current = branch;
        let mut budget = self.hierarchy.len();
        while !self.started.contains_key(current) && budget > 0 {
            let up = self.hierarchy.parent(current)?;
            if up == parent {
                return Some(current);
            }
            current = up;
            budget -= 1;
        }
        None
    }

    fn find_branch_to_spawn(&mut self, label: &str, branch: &str) -> Result<ChangeSetKey> {
        let missing_branch = self.labels.get(label).and_then(|info| {
            info.missing
                .keys()
                .find_map(|missing| self.unstarted_child_towards(missing, branch))
                .map(str::to_string)
        });
        let Some(missing_branch) = missing_branch else {
            return Err(Error::SpawningPoint {
                label: label.to_string(),
                branch: branch.to_string(),
            });
        };
        for index in self.cursor..self.pending.len() {
            if let Some(key) = self.pending[index] {
                if self.changesets[key.0].branch == missing_branch {
                    self.pending[index] = None;
                    return Ok(key);
                }
            }
        }
        Err(Error::SpawningPoint {
            label: label.to_string(),
            branch: missing_branch,
        })
    }

    /// Give up on the latest missing versions while they lie too far past
    /// both the current changeset and the label creation.
    fn drop_late_versions(&mut self, label: &str, key: ChangeSetKey, missing: &mut BTreeSet<VersionId>) {
        let graph = self.graph;
        let finish = self.changesets[key.0].finish;
        let created = graph.label_meta(label).and_then(|m| m.created);
        while let Some(last) = missing
            .iter()
            .copied()
            .max_by_key(|v| (graph.version(*v).date, *v))
        {
            let date = graph.version(last).date;
            let too_late = finish + self.label_lateness < date
                && created.is_none_or(|c| c + self.label_lateness < date);
            if !too_late {
                break;
            }
            warn!(
                label = %label,
                at = %self.changesets[key.0],
                version = %graph.describe(last),
                %date,
                missing = missing.len(),
                "label version is too late, dropping it from the label"
            );
            if let Some(info) = self.labels.get_mut(label) {
                info.forget(graph, last);
                info.possibly_broken.push((last, None));
            }
            missing.remove(&last);
        }
    }

    /// A label with nothing left missing after dropping late versions is
    /// complete at the current tip of `branch`. An unstarted branch would
    /// start from the tip of its closest started ancestor, so the label
    /// goes there.
    fn complete_on_tip(&mut self, label: &str, branch: &str) {
        let complete = self
            .labels
            .pending(label)
            .is_some_and(|info| info.missing.is_empty());
        if !complete {
            return;
        }
        let tip = std::iter::once(branch)
            .chain(self.ancestors(branch))
            .find_map(|b| self.tips.get(b).copied());
        let Some(tip) = tip else {
            warn!(label = %label, branch = %branch, "no changeset to apply label to, dropping it");
            if let Some(info) = self.labels.get_mut(label) {
                info.state = LabelState::Dropped;
            }
            return;
        };
        if self.changesets[tip.0].branch != branch {
            warn!(
                label = %label,
                branch = %branch,
                on = %self.changesets[tip.0],
                "branch not started yet, applying label where it will start"
            );
        }
        self.check_label(label, tip);
        self.changesets[tip.0].labels.push(label.to_string());
    }

    /// Extend `needed` (indices into `pending`) with the earlier changesets
    /// they depend on. Returns false if one of them breaks `label`.
    fn add_dependencies(&self, needed: &mut BTreeSet<usize>, label: &str, index: usize) -> bool {
        let graph = self.graph;
        let mut new_versions: HashMap<ElementId, Vec<VersionId>> = HashMap::new();
        for i in needed.iter() {
            if let Some(key) = self.pending[*i] {
                for named in &self.changesets[key.0].versions {
                    new_versions
                        .entry(graph.version(named.version).element)
                        .or_default()
                        .push(named.version);
                }
            }
        }

        for i in (self.cursor..index).rev() {
            let Some(key) = self.pending[i] else {
                continue;
            };
            let breaks = || self.would_break_labels(key).iter().any(|(l, _)| l == label);
            if needed.contains(&i) {
                if breaks() {
                    return false;
                }
                continue;
            }
            let changeset = &self.changesets[key.0];
            let is_dependency = changeset.versions.iter().any(|named| {
                new_versions
                    .get(&graph.version(named.version).element)
                    .is_some_and(|later| later.iter().any(|l| graph.is_ancestor(named.version, *l)))
            });
            if !is_dependency {
                continue;
            }
            if breaks() {
                return false;
            }
            needed.insert(i);
            for named in &changeset.versions {
                new_versions
                    .entry(graph.version(named.version).element)
                    .or_default()
                    .push(named.version);
            }
        }
        true
    }

    // =========================================================================
    // Labels
    // =========================================================================

    fn process_labels(&mut self, key: ChangeSetKey, orphans: &[VersionId]) {
        let mut applied = Vec::new();
        for orphan in orphans {
            let completed = self.observe(key, *orphan);
            if !completed.is_empty() {
                warn!(
                    labels = ?completed,
                    version = %self.graph.describe(*orphan),
                    "label completed with an orphan version"
                );
                self.labeled_orphans.insert(*orphan);
            }
            applied.extend(completed);
        }
        let versions: Vec<VersionId> = self.changesets[key.0].versions.iter().map(|n| n.version).collect();
        for version in versions {
            applied.extend(self.observe(key, version));
        }
        self.changesets[key.0].labels.extend(applied);
    }

    /// Mark `version` as replayed, returning the labels it completes.
    fn observe(&mut self, key: ChangeSetKey, version: VersionId) -> Vec<String> {
        let graph = self.graph;
        let mut completed = Vec::new();
        for label in &graph.version(version).labels {
            let Some(info) = self.labels.pending_mut(label) else {
                continue;
            };
            if !info.observe(graph, version) {
                continue;
            }
            debug!(label = %label, version = %graph.describe(version), "label completed");
            self.check_label(label, key);
            completed.push(label.clone());
        }
        completed
    }

    /// Compare a completed label with what the branch of `key` shows. The
    /// label is applied either way; mismatches are kept for the report.
    fn check_label(&mut self, label: &str, key: ChangeSetKey) {
        let graph = self.graph;
        let Some(info) = self.labels.get_mut(label) else {
            return;
        };
        info.state = LabelState::Applied;
        let branch = self.changesets[key.0].branch.clone();
        let state = self.branches.get(&branch);

        let mut consistent = true;
        for expected in info.versions.clone() {
            let element = graph.version(expected).element;
            let current = state.and_then(|s| s.versions.get(&element)).copied();
            let matches = match current {
                None => graph.version(expected).number == 0,
                Some(current) => current == expected,
            };
            if matches {
                continue;
            }
            consistent = false;
            match current {
                Some(current) if graph.version(current).number == 0 => {
                    warn!(
                        label = %label,
                        expected = %graph.describe(expected),
                        actual = %graph.describe(current),
                        "label inconsistent, removing element"
                    );
                    info.versions.retain(|v| *v != current);
                    self.changesets[key.0].versions.retain(|n| n.version != current);
                }
                _ => debug!(
                    label = %label,
                    expected = %graph.describe(expected),
                    actual = ?current.map(|c| graph.describe(c)),
                    "label inconsistent"
                ),
            }
            info.possibly_broken.push((expected, current));
        }
        if !consistent {
            info!(label = %label, "label was inconsistent, force applying anyway");
        }
    }

    // =========================================================================
    // Final passes
    // =========================================================================

    fn finish(mut self) -> Result<History> {
        let graph = self.graph;

        let mut lost_versions: Vec<VersionId> = self
            .orphans
            .values()
            .flatten()
            .map(|o| o.version.version)
            .collect();
        lost_versions.sort();
        lost_versions.dedup();
        for version in &lost_versions {
            self.labeled_orphans.remove(version);
            if self.roots.contains(&graph.element_of(*version).name) {
                warn!(version = %graph.describe(*version), "version has not been visible in any imported directory version");
            }
        }
        let lost: HashSet<VersionId> = lost_versions.iter().copied().collect();

        let mut tracker = MergeTracker::new();
        for key in &self.order {
            tracker.record(graph, self.hierarchy, &self.changesets, *key, &lost);
        }
        let origins: HashMap<String, Option<usize>> = self
            .started
            .iter()
            .map(|(branch, origin)| (branch.clone(), origin.map(|k| self.changesets[k.0].id)))
            .collect();
        let incomplete_merges = tracker.resolve(graph, &mut self.changesets, &origins);

        for orphan in &self.labeled_orphans {
            warn!(version = %graph.describe(*orphan), "version has been labeled while an orphan");
        }
        for label in self.labels.iter_pending() {
            for version in label.missing.values().flatten() {
                debug!(label = %label.name, version = %graph.describe(*version), "labeled version not seen");
            }
            warn!(label = %label.name, missing = label.missing_count(), "label has missing versions: not applied");
        }

        let emitted = self.emission_order();
        let dropped = self.cleanup(&emitted);
        let emitted: Vec<ChangeSetKey> = emitted.into_iter().filter(|k| !dropped.contains(k)).collect();

        let stub_labels: Vec<String> = self
            .stubs
            .iter()
            .flat_map(|k| self.changesets[k.0].labels.iter().cloned())
            .collect();
        for label in stub_labels {
            warn!(label = %label, "label belongs to a previous run, dropping it");
            if let Some(info) = self.labels.get_mut(&label) {
                info.state = LabelState::Dropped;
            }
        }

        let mut id = self.first_id;
        for key in &emitted {
            id += 1;
            self.changesets[key.0].id = id;
        }
        self.last_id = id;

        let tips = self
            .tips
            .iter()
            .filter_map(|(branch, tip)| {
                let surviving = self.surviving(*tip, &dropped)?;
                Some((branch.clone(), self.changesets[surviving.0].id))
            })
            .collect();
        let started = self
            .started
            .iter()
            .map(|(branch, origin)| (branch.clone(), origin.map(|k| self.changesets[k.0].id)))
            .collect();
        info!(
            replayed = self.order.len(),
            emitted = emitted.len(),
            last_id = self.last_id,
            "history reconstructed"
        );

        Ok(History {
            changesets: self.changesets,
            emitted,
            state: ReplayState {
                last_id: self.last_id,
                started,
                tips,
                branches: self.branches,
            },
            labels: self.labels,
            lost_versions,
            labeled_orphans: self.labeled_orphans.into_iter().collect(),
            incomplete_merges,
        })
    }

    /// Replay order, adjusted so that every changeset comes after its
    /// branching point, the merge sources it references, and the earlier
    /// changesets of their branches.
    fn emission_order(&self) -> Vec<ChangeSetKey> {
        let order = &self.order;
        let position: HashMap<ChangeSetKey, usize> = order.iter().enumerate().map(|(i, k)| (*k, i)).collect();
        let branch_of = |i: usize| &self.changesets[order[i].0].branch;
        let mut done = vec![false; order.len()];
        let mut expanding = vec![false; order.len()];
        let mut emitted = Vec::with_capacity(order.len());
        let mut first_pending = 0;

        for start in 0..order.len() {
            let mut stack = vec![(start, false)];
            while let Some((i, expanded)) = stack.pop() {
                if done[i] {
                    continue;
                }
                if expanded {
                    done[i] = true;
                    emitted.push(order[i]);
                    continue;
                }
                if expanding[i] {
                    continue;
                }
                expanding[i] = true;
                stack.push((i, true));

                let changeset = &self.changesets[order[i].0];
                let mut dependencies = Vec::new();
                if let Some(point) = changeset.branching_point.and_then(|k| position.get(&k)) {
                    dependencies.push(*point);
                }
                dependencies.extend((first_pending..i).filter(|j| !done[*j] && branch_of(*j) == &changeset.branch));
                for from in &changeset.merges {
                    let Some(&source) = position.get(from) else {
                        continue;
                    };
                    if done[source] {
                        continue;
                    }
                    info!(
                        source = %self.changesets[from.0],
                        target = %changeset,
                        "reordering: merge source must be imported first"
                    );
                    let source_branch = &self.changesets[from.0].branch;
                    dependencies.extend((first_pending..=source).filter(|j| !done[*j] && branch_of(*j) == source_branch));
                }
                for dependency in dependencies.into_iter().rev() {
                    if dependency != i && !done[dependency] {
                        stack.push((dependency, false));
                    }
                }
            }
            while first_pending < order.len() && done[first_pending] {
                first_pending += 1;
            }
        }
        emitted
    }

    /// Drop changesets that change nothing, moving their labels to the
    /// closest kept predecessor. Returns the dropped changesets.
    fn cleanup(&mut self, emitted: &[ChangeSetKey]) -> HashSet<ChangeSetKey> {
        let graph = self.graph;
        info!(changesets = emitted.len(), "cleaning up history");
        let mut by_branch: HashMap<String, Vec<ChangeSetKey>> = HashMap::new();
        for key in emitted {
            by_branch
                .entry(self.changesets[key.0].branch.clone())
                .or_default()
                .push(*key);
        }

        let mut dropped = HashSet::new();
        for key in emitted {
            let changeset = &self.changesets[key.0];
            let droppable = changeset.is_empty_commit(graph) && !changeset.is_branching_point && !changeset.is_merged;
            if !droppable {
                continue;
            }
            let siblings = &by_branch[&changeset.branch];
            let Some(index) = siblings.iter().position(|k| k == key) else {
                continue;
            };

            if !changeset.labels.is_empty() {
                let labels = std::mem::take(&mut self.changesets[key.0].labels);
                match self.label_target(*key, siblings, &dropped) {
                    Some(target) => {
                        debug!(labels = ?labels, from = %self.changesets[key.0], to = %self.changesets[target.0], "moving labels");
                        self.changesets[target.0].labels.extend(labels);
                    }
                    None => {
                        warn!(labels = ?labels, "dropping labels: no changeset to move them to");
                        for label in &labels {
                            if let Some(info) = self.labels.get_mut(label) {
                                info.state = LabelState::Dropped;
                            }
                        }
                    }
                }
            }

            // the next changeset now starts the branch
            if let (Some(point), Some(next)) = (self.changesets[key.0].branching_point, siblings.get(index + 1)) {
                self.changesets[next.0].branching_point = Some(point);
            }
            debug!(changeset = %self.changesets[key.0], "dropping changeset without changes");
            dropped.insert(*key);
        }
        info!(dropped = dropped.len(), "history cleaned up");
        dropped
    }

    /// Closest kept predecessor of `key` on its branch, then up through
    /// branching points.
    fn label_target(
        &self,
        key: ChangeSetKey,
        siblings: &[ChangeSetKey],
        dropped: &HashSet<ChangeSetKey>,
    ) -> Option<ChangeSetKey> {
        let index = siblings.iter().position(|k| *k == key)?;
        if let Some(previous) = siblings[..index].iter().rev().find(|k| !dropped.contains(*k)) {
            return Some(*previous);
        }
        let mut point = self.changesets[key.0].branching_point;
        while let Some(candidate) = point {
            if self.stubs.contains(&candidate) {
                return None;
            }
            if !dropped.contains(&candidate) {
                info!(branch = %self.changesets[candidate.0].branch, "moving labels to the parent branch");
                return Some(candidate);
            }
            point = self.changesets[candidate.0].branching_point;
        }
        None
    }

    /// `key` if kept, else its closest kept predecessor.
    fn surviving(&self, key: ChangeSetKey, dropped: &HashSet<ChangeSetKey>) -> Option<ChangeSetKey> {
        let mut current = key;
        for _ in 0..=self.order.len() {
            if !dropped.contains(&current) {
                return Some(current);
            }
            let branch = &self.changesets[current.0].branch;
            let position = self.order.iter().position(|k| *k == current)?;
            current = match self.order[..position]
                .iter()
                .rev()
                .find(|k| self.changesets[k.0].branch == *branch)
            {
                Some(previous) => *previous,
                None => self.changesets[current.0].branching_point?,
            };
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Clusterer;
    use crate::config::BranchFilter;
    use crate::graph::{ElementKind, VersionInfo};
    use crate::report::{BrokenLabel, IncompleteLabel, LabelMismatch, LostVersion, Report};
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, hour, minute, 0).unwrap()
    }

    fn schedule(graph: &mut VersionGraph) -> History {
        let roots = Roots::new(&[]);
        let filter = BranchFilter::default();
        let raw = Clusterer::new(&roots, &filter, Duration::minutes(30))
            .build(graph, None, None)
            .unwrap();
        Scheduler::new(graph, &raw.hierarchy, &roots, Duration::hours(8), raw.changesets, raw.labels)
            .run()
            .unwrap()
    }

    fn summary(history: &History) -> Vec<(usize, String, Option<usize>, Vec<String>)> {
        history
            .iter()
            .map(|c| {
                (
                    c.id,
                    c.branch.clone(),
                    c.branching_point.map(|k| history.get(k).id),
                    c.labels.clone(),
                )
            })
            .collect()
    }

    #[test]
    fn unstarted_parent_gets_a_bridging_changeset() {
        let mut graph = VersionGraph::new();
        let root = graph.add_element("r", ".", ElementKind::Directory);
        let file = graph.add_element("f", "f", ElementKind::File);
        graph.add_branch(root, "main", None);
        let r1 = graph.add_version(root, "main", 1, VersionInfo::new("ann", at(9, 0))).unwrap();
        graph.set_content(r1, vec![("f".to_string(), file)]);
        graph.add_branch(file, "main", None);
        let f1 = graph.add_version(file, "main", 1, VersionInfo::new("ann", at(9, 0))).unwrap();
        graph.add_branch(file, "main/parent", Some(f1));
        let p0 = graph.add_version(file, "parent", 0, VersionInfo::new("ann", at(9, 30))).unwrap();
        graph.add_branch(file, "main/parent/child", Some(p0));
        graph.add_version(file, "child", 0, VersionInfo::new("bob", at(9, 40))).unwrap();
        graph.add_version(file, "child", 1, VersionInfo::new("bob", at(10, 0))).unwrap();

        let history = schedule(&mut graph);
        assert_eq!(
            summary(&history),
            vec![
                (1, "main".to_string(), None, vec![]),
                (2, "parent".to_string(), Some(1), vec![]),
                (3, "child".to_string(), Some(2), vec![]),
            ]
        );
        assert_eq!(history.state.started.get("child"), Some(&Some(2)));
        assert_eq!(history.state.tips.get("parent"), Some(&2));
        assert_eq!(history.state.last_id, 3);
    }

    #[test]
    fn label_is_completed_before_it_breaks() {
        let mut graph = VersionGraph::new();
        let root = graph.add_element("r", ".", ElementKind::Directory);
        let f = graph.add_element("f", "f", ElementKind::File);
        let g = graph.add_element("g", "g", ElementKind::File);
        graph.add_branch(root, "main", None);
        let r1 = graph.add_version(root, "main", 1, VersionInfo::new("ann", at(10, 0))).unwrap();
        graph.set_content(r1, vec![("f".to_string(), f), ("g".to_string(), g)]);
        graph.add_branch(f, "main", None);
        graph
            .add_version(f, "main", 1, VersionInfo::new("ann", at(10, 0)).label("REL"))
            .unwrap();
        graph.add_version(f, "main", 2, VersionInfo::new("ann", at(11, 0))).unwrap();
        graph.add_branch(g, "main", None);
        graph
            .add_version(g, "main", 1, VersionInfo::new("bob", at(11, 30)).label("REL"))
            .unwrap();

        let history = schedule(&mut graph);
        let sequence: Vec<(String, DateTime<Utc>, Vec<String>)> = history
            .iter()
            .map(|c| (c.author_login.clone(), c.start, c.labels.clone()))
            .collect();
        assert_eq!(
            sequence,
            vec![
                ("ann".to_string(), at(10, 0), vec![]),
                ("bob".to_string(), at(11, 30), vec!["REL".to_string()]),
                ("ann".to_string(), at(11, 0), vec![]),
            ]
        );
        assert_eq!(history.labels.get("REL").unwrap().state, LabelState::Applied);
    }

    #[test]
    fn empty_changesets_are_dropped_and_labels_moved() {
        let mut graph = VersionGraph::new();
        let root = graph.add_element("r", ".", ElementKind::Directory);
        let f = graph.add_element("f", "f", ElementKind::File);
        graph.add_branch(root, "main", None);
        let r1 = graph.add_version(root, "main", 1, VersionInfo::new("ann", at(9, 0))).unwrap();
        graph.set_content(r1, vec![("f".to_string(), f)]);
        graph.add_branch(f, "main", None);
        graph.add_version(f, "main", 1, VersionInfo::new("ann", at(9, 10))).unwrap();
        // directory version with unchanged content, labeled
        let r2 = graph
            .add_version(root, "main", 2, VersionInfo::new("bob", at(12, 0)).label("TAG"))
            .unwrap();
        graph.set_content(r2, vec![("f".to_string(), f)]);

        let history = schedule(&mut graph);
        assert_eq!(history.len(), 1);
        let only = history.iter().next().unwrap();
        assert_eq!(only.id, 1);
        assert_eq!(only.labels, vec!["TAG".to_string()]);
    }

    #[test]
    fn resumes_numbering_from_previous_state() {
        let mut graph = VersionGraph::new();
        let root = graph.add_element("r", ".", ElementKind::Directory);
        let f = graph.add_element("f", "f", ElementKind::File);
        graph.add_branch(root, "main", None);
        let r1 = graph.add_version(root, "main", 1, VersionInfo::new("ann", at(9, 0))).unwrap();
        graph.set_content(r1, vec![("f".to_string(), f)]);
        graph.add_branch(f, "main", None);
        let f1 = graph.add_version(f, "main", 1, VersionInfo::new("ann", at(9, 0))).unwrap();

        let mut branches = HashMap::new();
        let mut main = BranchState::default();
        main.names.insert(root, BTreeSet::from([".".to_string()]));
        main.names.insert(f, BTreeSet::from(["f".to_string()]));
        main.versions.insert(root, r1);
        main.versions.insert(f, f1);
        branches.insert(MAIN_BRANCH.to_string(), main);
        let previous = ReplayState {
            last_id: 7,
            started: BTreeMap::from([(MAIN_BRANCH.to_string(), None)]),
            tips: BTreeMap::from([(MAIN_BRANCH.to_string(), 7)]),
            branches,
        };

        let f2 = graph.add_version(f, "main", 2, VersionInfo::new("ann", at(12, 0))).unwrap();
        let mut changeset = ChangeSet::new("ann", "ann", MAIN_BRANCH, at(12, 0));
        changeset.add(&graph, f2, None, true);
        let hierarchy = BranchHierarchy::default();
        let roots = Roots::new(&[]);
        let history = Scheduler::new(&graph, &hierarchy, &roots, Duration::hours(8), vec![changeset], LabelRegistry::new())
            .with_previous(previous)
            .run()
            .unwrap();

        assert_eq!(history.len(), 1);
        let only = history.iter().next().unwrap();
        assert_eq!(only.id, 8);
        assert_eq!(only.versions[0].names, vec!["f".to_string()]);
        assert_eq!(history.state.tips.get(MAIN_BRANCH), Some(&8));
    }

    fn report(graph: &VersionGraph, history: &History) -> Report {
        Report::new(graph, &Roots::new(&[]), history, &BranchHierarchy::default(), Vec::new())
    }

    #[test]
    fn late_label_versions_are_dropped_and_reported() {
        let mut graph = VersionGraph::new();
        let root = graph.add_element("r", ".", ElementKind::Directory);
        let a = graph.add_element("a", "a", ElementKind::File);
        let b = graph.add_element("b", "b", ElementKind::File);
        graph.add_branch(root, "main", None);
        let r1 = graph.add_version(root, "main", 1, VersionInfo::new("ann", at(10, 0))).unwrap();
        graph.set_content(r1, vec![("a".to_string(), a), ("b".to_string(), b)]);
        graph.add_branch(a, "main", None);
        graph
            .add_version(a, "main", 1, VersionInfo::new("ann", at(10, 0)).label("REL"))
            .unwrap();
        graph.add_version(a, "main", 2, VersionInfo::new("ann", at(11, 0))).unwrap();
        graph.add_branch(b, "main", None);
        let b1 = graph
            .add_version(b, "main", 1, VersionInfo::new("ann", at(20, 0)).label("REL"))
            .unwrap();

        let history = schedule(&mut graph);
        assert_eq!(
            summary(&history),
            vec![
                (1, "main".to_string(), None, vec!["REL".to_string()]),
                (2, "main".to_string(), None, vec![]),
                (3, "main".to_string(), None, vec![]),
            ]
        );
        let label = history.labels.get("REL").unwrap();
        assert_eq!(label.state, LabelState::Applied);
        assert_eq!(label.possibly_broken, vec![(b1, None)]);

        let report = report(&graph, &history);
        assert_eq!(
            report.broken_labels,
            vec![BrokenLabel {
                name: "REL".to_string(),
                mismatches: vec![LabelMismatch {
                    expected: graph.describe(b1),
                    actual: None,
                }],
            }]
        );
        assert!(!report.is_clean());
    }

    #[test]
    fn late_label_on_unstarted_branch_lands_where_it_starts() {
        let mut graph = VersionGraph::new();
        let root = graph.add_element("r", ".", ElementKind::Directory);
        let a = graph.add_element("a", "a", ElementKind::File);
        let b = graph.add_element("b", "b", ElementKind::File);
        graph.add_branch(root, "main", None);
        let r1 = graph.add_version(root, "main", 1, VersionInfo::new("ann", at(10, 0))).unwrap();
        graph.set_content(r1, vec![("a".to_string(), a), ("b".to_string(), b)]);
        graph.add_branch(a, "main", None);
        let a1 = graph
            .add_version(a, "main", 1, VersionInfo::new("ann", at(10, 0)).label("REL"))
            .unwrap();
        graph.add_branch(b, "main", None);
        let b1 = graph.add_version(b, "main", 1, VersionInfo::new("ann", at(10, 0))).unwrap();
        graph.add_branch(a, "main/dev", Some(a1));
        graph.add_version(a, "dev", 1, VersionInfo::new("bob", at(10, 30))).unwrap();
        graph.add_branch(b, "main/dev", Some(b1));
        let late = graph
            .add_version(b, "dev", 1, VersionInfo::new("bob", at(20, 0)).label("REL"))
            .unwrap();

        let history = schedule(&mut graph);
        assert_eq!(
            summary(&history),
            vec![
                (1, "main".to_string(), None, vec!["REL".to_string()]),
                (2, "dev".to_string(), Some(1), vec![]),
                (3, "dev".to_string(), None, vec![]),
            ]
        );
        let label = history.labels.get("REL").unwrap();
        assert_eq!(label.state, LabelState::Applied);
        assert_eq!(label.possibly_broken, vec![(late, None)]);
    }

    #[test]
    fn label_on_a_superseded_version_is_dropped() {
        let mut graph = VersionGraph::new();
        let root = graph.add_element("r", ".", ElementKind::Directory);
        let a = graph.add_element("a", "a", ElementKind::File);
        graph.add_branch(root, "main", None);
        let r1 = graph.add_version(root, "main", 1, VersionInfo::new("ann", at(10, 0))).unwrap();
        graph.set_content(r1, vec![("a".to_string(), a)]);
        graph.add_branch(a, "main", None);
        // replaced by main/2 within the same changeset, never replayed
        let a1 = graph
            .add_version(a, "main", 1, VersionInfo::new("ann", at(10, 0)).label("REL"))
            .unwrap();
        graph.add_version(a, "main", 2, VersionInfo::new("ann", at(10, 10))).unwrap();

        let history = schedule(&mut graph);
        assert_eq!(summary(&history), vec![(1, "main".to_string(), None, vec![])]);
        assert_eq!(history.labels.get("REL").unwrap().state, LabelState::Dropped);

        let report = report(&graph, &history);
        assert_eq!(
            report.incomplete_labels,
            vec![IncompleteLabel {
                name: "REL".to_string(),
                state: LabelState::Dropped,
                missing: vec![graph.describe(a1)],
            }]
        );
    }

    #[test]
    fn inconsistent_label_is_force_applied() {
        let mut graph = VersionGraph::new();
        let root = graph.add_element("r", ".", ElementKind::Directory);
        let a = graph.add_element("a", "a", ElementKind::File);
        let b = graph.add_element("b", "b", ElementKind::File);
        graph.add_branch(root, "main", None);
        let r1 = graph.add_version(root, "main", 1, VersionInfo::new("ann", at(10, 0))).unwrap();
        graph.set_content(r1, vec![("a".to_string(), a), ("b".to_string(), b)]);
        graph.add_branch(a, "main", None);
        let a1 = graph
            .add_version(a, "main", 1, VersionInfo::new("ann", at(10, 0)).label("REL"))
            .unwrap();
        // the change after the label comes with the last labeled version
        let a2 = graph.add_version(a, "main", 2, VersionInfo::new("ann", at(11, 0))).unwrap();
        graph.add_branch(b, "main", None);
        graph
            .add_version(b, "main", 1, VersionInfo::new("ann", at(11, 10)).label("REL"))
            .unwrap();

        let history = schedule(&mut graph);
        assert_eq!(
            summary(&history),
            vec![
                (1, "main".to_string(), None, vec![]),
                (2, "main".to_string(), None, vec!["REL".to_string()]),
            ]
        );
        let label = history.labels.get("REL").unwrap();
        assert_eq!(label.state, LabelState::Applied);
        assert_eq!(label.possibly_broken, vec![(a1, Some(a2))]);
    }

    #[test]
    fn version_zero_mismatch_is_removed_from_the_labeled_changeset() {
        let mut graph = VersionGraph::new();
        let a = graph.add_element("a", "a", ElementKind::File);
        graph.add_branch(a, "main", None);
        let a0 = graph.add_version(a, "main", 0, VersionInfo::new("ann", at(9, 0))).unwrap();
        let a1 = graph.add_version(a, "main", 1, VersionInfo::new("ann", at(10, 0))).unwrap();

        let mut changeset = ChangeSet::new("ann", "ann", MAIN_BRANCH, at(9, 0));
        changeset.add(&graph, a0, Some("a".to_string()), true);
        let mut labels = LabelRegistry::new();
        labels.entry("REL").versions = vec![a1];
        labels.reset_all(&graph);

        let hierarchy = BranchHierarchy::default();
        let roots = Roots::new(&[]);
        let mut scheduler =
            Scheduler::new(&graph, &hierarchy, &roots, Duration::hours(8), vec![changeset], labels);
        let mut main = BranchState::default();
        main.versions.insert(a, a0);
        scheduler.branches.insert(MAIN_BRANCH.to_string(), main);

        scheduler.check_label("REL", ChangeSetKey(0));
        assert!(scheduler.changesets[0].versions.is_empty());
        let label = scheduler.labels.get("REL").unwrap();
        assert_eq!(label.state, LabelState::Applied);
        assert_eq!(label.possibly_broken, vec![(a1, Some(a0))]);
    }

    #[test]
    fn orphans_are_reported() {
        let mut graph = VersionGraph::new();
        let root = graph.add_element("r", ".", ElementKind::Directory);
        let f = graph.add_element("f", "f", ElementKind::File);
        let g = graph.add_element("g", "g", ElementKind::File);
        graph.add_branch(f, "main", None);
        let f1 = graph
            .add_version(f, "main", 1, VersionInfo::new("ann", at(9, 0)).label("REL"))
            .unwrap();
        // never listed by any directory version
        graph.add_branch(g, "main", None);
        let g1 = graph.add_version(g, "main", 1, VersionInfo::new("ann", at(9, 5))).unwrap();
        graph.add_branch(root, "main", None);
        let r1 = graph.add_version(root, "main", 1, VersionInfo::new("bob", at(12, 0))).unwrap();
        graph.set_content(r1, vec![("f".to_string(), f)]);

        let history = schedule(&mut graph);
        assert_eq!(history.len(), 1);
        let only = history.iter().next().unwrap();
        assert_eq!(only.author_login, "bob");
        assert!(only.versions.iter().any(|n| n.version == f1));
        assert_eq!(history.labeled_orphans, vec![f1]);
        assert_eq!(history.lost_versions, vec![g1]);

        let report = report(&graph, &history);
        assert_eq!(report.labeled_orphans, vec![graph.describe(f1)]);
        assert_eq!(
            report.lost_versions,
            vec![LostVersion {
                version: graph.describe(g1),
                inside_roots: true,
            }]
        );
    }
}
