//! The legacy version graph: elements, their branches and versions.
//!
//! Entities live in flat arenas and refer to each other through
//! [`ElementId`] / [`VersionId`] handles. The adapter hands the graph over
//! as a [`GraphDocument`], where references use the stable element
//! [`Oid`] instead.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::labels::LabelMeta;

/// Name of the root branch of every element.
pub const MAIN_BRANCH: &str = "main";

/// Separator between the segments of a fully qualified branch name.
pub const BRANCH_SEPARATOR: char = '/';

/// Opaque, stable identity of an element.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Oid(pub String);

impl From<&str> for Oid {
    fn from(value: &str) -> Self {
        Oid(value.to_string())
    }
}

impl fmt::Display for Oid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle of an element in a [`VersionGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(usize);

/// Handle of a version in a [`VersionGraph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionId(usize);

/// Reference to a version by stable identity, used wherever the graph is
/// not in memory (input documents, persisted snapshots).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct VersionRef {
    pub oid: Oid,
    pub branch: String,
    pub number: u32,
}

impl fmt::Display for VersionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.oid, self.branch, self.number)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementKind {
    File,
    Directory,
    /// Has no versions of its own; only ever seen as directory content.
    SymLink { target: String, directory: ElementId },
}

#[derive(Debug, Clone)]
pub struct Element {
    pub oid: Oid,
    /// Last known path, relative to the repository root.
    pub name: String,
    pub kind: ElementKind,
    branches: Vec<ElementBranch>,
}

impl Element {
    pub fn is_directory(&self) -> bool {
        self.kind == ElementKind::Directory
    }

    pub fn is_symlink(&self) -> bool {
        matches!(self.kind, ElementKind::SymLink { .. })
    }

    pub fn branch(&self, name: &str) -> Option<&ElementBranch> {
        self.branches.iter().find(|b| b.name == name)
    }

    pub fn branches(&self) -> &[ElementBranch] {
        &self.branches
    }
}

/// One line of versions of an element.
#[derive(Debug, Clone)]
pub struct ElementBranch {
    /// Short name, e.g. `fix`.
    pub name: String,
    /// Parent-encoded name, e.g. `main/dev/fix`.
    pub full_name: String,
    /// Version of the parent branch this branch forks from (`None` on main).
    pub branching_point: Option<VersionId>,
    /// Ordered by increasing version number.
    pub versions: Vec<VersionId>,
}

#[derive(Debug, Clone)]
pub struct Version {
    pub element: ElementId,
    pub branch: String,
    pub number: u32,
    pub author_name: String,
    pub author_login: String,
    pub date: DateTime<Utc>,
    pub comment: String,
    pub activity: String,
    pub labels: Vec<String>,
    pub merges_to: Vec<VersionId>,
    pub merges_from: Vec<VersionId>,
    pub payload: VersionPayload,
}

impl Version {
    /// Directory content, empty for files.
    pub fn content(&self) -> &[(String, ElementId)] {
        match &self.payload {
            VersionPayload::Directory(content) => content,
            VersionPayload::File => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionPayload {
    File,
    /// Ordered `(child name, child element)` entries.
    Directory(Vec<(String, ElementId)>),
}

/// Metadata of a new version, for [`VersionGraph::add_version`].
#[derive(Debug, Clone)]
pub struct VersionInfo {
    pub author_name: String,
    pub author_login: String,
    pub date: DateTime<Utc>,
    pub comment: String,
    pub activity: String,
    pub labels: Vec<String>,
}

impl VersionInfo {
    pub fn new(author: &str, date: DateTime<Utc>) -> Self {
        Self {
            author_name: author.to_string(),
            author_login: author.to_string(),
            date,
            comment: String::new(),
            activity: String::new(),
            labels: Vec::new(),
        }
    }

    pub fn comment(mut self, comment: &str) -> Self {
        self.comment = comment.to_string();
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.labels.push(label.to_string());
        self
    }
}

/// Arena holding the whole version graph.
#[derive(Debug, Clone, Default)]
pub struct VersionGraph {
    elements: Vec<Element>,
    versions: Vec<Version>,
    by_oid: HashMap<Oid, ElementId>,
    label_metas: BTreeMap<String, LabelMeta>,
}

impl VersionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn element(&self, id: ElementId) -> &Element {
        &self.elements[id.0]
    }

    pub fn version(&self, id: VersionId) -> &Version {
        &self.versions[id.0]
    }

    pub fn version_mut(&mut self, id: VersionId) -> &mut Version {
        &mut self.versions[id.0]
    }

    pub fn element_of(&self, id: VersionId) -> &Element {
        self.element(self.version(id).element)
    }

    pub fn element_by_oid(&self, oid: &Oid) -> Option<ElementId> {
        self.by_oid.get(oid).copied()
    }

    /// Elements in insertion order.
    pub fn elements(&self) -> impl Iterator<Item = (ElementId, &Element)> {
        self.elements
            .iter()
            .enumerate()
            .map(|(i, e)| (ElementId(i), e))
    }

    pub fn version_ids(&self) -> impl Iterator<Item = VersionId> + '_ {
        (0..self.versions.len()).map(VersionId)
    }

    pub fn label_meta(&self, label: &str) -> Option<&LabelMeta> {
        self.label_metas.get(label)
    }

    pub fn add_label_meta(&mut self, meta: LabelMeta) {
        self.label_metas.insert(meta.name.clone(), meta);
    }

    /// Add an element, or return the existing one with the same oid.
    pub fn add_element(&mut self, oid: impl Into<Oid>, name: &str, kind: ElementKind) -> ElementId {
        let oid = oid.into();
        if let Some(id) = self.by_oid.get(&oid) {
            return *id;
        }
        let id = ElementId(self.elements.len());
        self.elements.push(Element {
            oid: oid.clone(),
            name: name.to_string(),
            kind,
            branches: Vec::new(),
        });
        self.by_oid.insert(oid, id);
        id
    }

    /// Add a branch to an element; its short name is the last segment of
    /// `full_name`.
    pub fn add_branch(
        &mut self,
        element: ElementId,
        full_name: &str,
        branching_point: Option<VersionId>,
    ) {
        let name = short_branch_name(full_name).to_string();
        let branches = &mut self.elements[element.0].branches;
        if branches.iter().any(|b| b.name == name) {
            return;
        }
        branches.push(ElementBranch {
            name,
            full_name: full_name.to_string(),
            branching_point,
            versions: Vec::new(),
        });
    }

    /// Append a version to an existing branch of `element`.
    pub fn add_version(
        &mut self,
        element: ElementId,
        branch: &str,
        number: u32,
        info: VersionInfo,
    ) -> Result<VersionId> {
        let payload = if self.element(element).is_directory() {
            VersionPayload::Directory(Vec::new())
        } else {
            VersionPayload::File
        };
        let Some(index) = self.elements[element.0]
            .branches
            .iter()
            .position(|b| b.name == branch)
        else {
            return Err(Error::UnknownBranch {
                element: self.elements[element.0].name.clone(),
                branch: branch.to_string(),
            });
        };
        let id = VersionId(self.versions.len());
        let versions = &self.versions;
        let element_branch = &mut self.elements[element.0].branches[index];
        let position = element_branch
            .versions
            .partition_point(|v| versions[v.0].number < number);
        element_branch.versions.insert(position, id);
        self.versions.push(Version {
            element,
            branch: branch.to_string(),
            number,
            author_name: info.author_name,
            author_login: info.author_login,
            date: info.date,
            comment: info.comment,
            activity: info.activity,
            labels: info.labels,
            merges_to: Vec::new(),
            merges_from: Vec::new(),
            payload,
        });
        Ok(id)
    }

    /// Replace the content of a directory version.
    pub fn set_content(&mut self, version: VersionId, content: Vec<(String, ElementId)>) {
        self.versions[version.0].payload = VersionPayload::Directory(content);
    }

    /// Record that `from` was merged into `to`.
    pub fn add_merge(&mut self, from: VersionId, to: VersionId) {
        if !self.versions[from.0].merges_to.contains(&to) {
            self.versions[from.0].merges_to.push(to);
        }
        if !self.versions[to.0].merges_from.contains(&from) {
            self.versions[to.0].merges_from.push(from);
        }
    }

    pub fn find_version(&self, element: ElementId, branch: &str, number: u32) -> Option<VersionId> {
        self.element(element)
            .branch(branch)?
            .versions
            .iter()
            .copied()
            .find(|v| self.version(*v).number == number)
    }

    pub fn resolve(&self, reference: &VersionRef) -> Option<VersionId> {
        let element = self.element_by_oid(&reference.oid)?;
        self.find_version(element, &reference.branch, reference.number)
    }

    pub fn reference(&self, id: VersionId) -> VersionRef {
        let version = self.version(id);
        VersionRef {
            oid: self.element(version.element).oid.clone(),
            branch: version.branch.clone(),
            number: version.number,
        }
    }

    /// The version this one was derived from: the previous version on the
    /// same branch, or the branching point for the first version of a branch.
    pub fn previous_version(&self, id: VersionId) -> Option<VersionId> {
        let version = self.version(id);
        let branch = self.element(version.element).branch(&version.branch)?;
        match branch.versions.iter().position(|v| *v == id) {
            Some(0) | None => branch.branching_point,
            Some(index) => Some(branch.versions[index - 1]),
        }
    }

    /// Whether `ancestor` is a strict predecessor of `version`.
    pub fn is_ancestor(&self, ancestor: VersionId, version: VersionId) -> bool {
        if self.version(ancestor).element != self.version(version).element {
            return false;
        }
        let mut current = self.previous_version(version);
        while let Some(v) = current {
            if v == ancestor {
                return true;
            }
            current = self.previous_version(v);
        }
        false
    }

    /// An element whose only version is `main/0`.
    pub fn is_solo(&self, element: ElementId) -> bool {
        let branches = self.element(element).branches();
        branches.len() == 1
            && branches[0].name == MAIN_BRANCH
            && branches[0].versions.len() == 1
            && self.version(branches[0].versions[0]).number == 0
    }

    pub fn full_branch_name(&self, id: VersionId) -> &str {
        let version = self.version(id);
        self.element(version.element)
            .branch(&version.branch)
            .map(|b| b.full_name.as_str())
            .unwrap_or(&version.branch)
    }

    /// Human readable version path, e.g. `src/lib.c@@/main/dev/3`.
    pub fn describe(&self, id: VersionId) -> String {
        format!(
            "{}@@/{}/{}",
            self.element_of(id).name,
            self.full_branch_name(id),
            self.version(id).number
        )
    }

    /// Build the graph from the adapter's document.
    pub fn from_document(document: GraphDocument, options: &LoadOptions) -> Result<Self> {
        let mut graph = VersionGraph::new();
        let mut skipped: BTreeSet<VersionRef> = BTreeSet::new();

        for element in &document.elements {
            let kind = match &element.kind {
                ElementKindDoc::File => ElementKind::File,
                ElementKindDoc::Directory => ElementKind::Directory,
                // resolved once every element exists
                ElementKindDoc::Symlink { target, .. } => ElementKind::SymLink {
                    target: target.clone(),
                    directory: ElementId(0),
                },
            };
            graph.add_element(element.oid.clone(), &element.name, kind);
        }

        for doc in &document.elements {
            let element = graph.lookup(&doc.oid)?;
            if let ElementKindDoc::Symlink { target, directory } = &doc.kind {
                let directory = graph.lookup(directory)?;
                graph.elements[element.0].kind = ElementKind::SymLink {
                    target: target.clone(),
                    directory,
                };
                continue;
            }

            let mut branches: Vec<&BranchDoc> = doc.branches.iter().collect();
            branches.sort_by_key(|b| b.full_name.split(BRANCH_SEPARATOR).count());
            for branch in branches {
                graph.load_branch(element, doc, branch, options, &mut skipped)?;
            }
        }

        for doc in &document.elements {
            for branch in &doc.branches {
                for version in &branch.versions {
                    let this = VersionRef {
                        oid: doc.oid.clone(),
                        branch: short_branch_name(&branch.full_name).to_string(),
                        number: version.number,
                    };
                    let Some(to) = graph.resolve(&this) else {
                        continue;
                    };
                    for from in &version.merges_from {
                        // only merges between branches are interesting
                        if from.branch == this.branch {
                            continue;
                        }
                        if let Some(from) = graph.resolve_kept(from, &skipped)? {
                            graph.add_merge(from, to);
                        }
                    }
                    for target in &version.merges_to {
                        if target.branch == this.branch {
                            continue;
                        }
                        if let Some(target) = graph.resolve_kept(target, &skipped)? {
                            graph.add_merge(to, target);
                        }
                    }
                }
            }
        }

        for meta in document.labels {
            if options.retains_label(&meta.name) {
                graph.add_label_meta(meta);
            }
        }

        info!(
            elements = graph.elements.len(),
            versions = graph.versions.len(),
            skipped = skipped.len(),
            "loaded version graph"
        );
        Ok(graph)
    }

    fn lookup(&self, oid: &Oid) -> Result<ElementId> {
        self.element_by_oid(oid)
            .ok_or_else(|| Error::UnknownElement { oid: oid.0.clone() })
    }

    fn resolve_kept(
        &self,
        reference: &VersionRef,
        skipped: &BTreeSet<VersionRef>,
    ) -> Result<Option<VersionId>> {
        match self.resolve(reference) {
            Some(id) => Ok(Some(id)),
            None if skipped.contains(reference) => Ok(None),
            None => Err(Error::UnknownVersion {
                version: reference.to_string(),
            }),
        }
    }

    fn load_branch(
        &mut self,
        element: ElementId,
        doc: &ElementDoc,
        branch: &BranchDoc,
        options: &LoadOptions,
        skipped: &mut BTreeSet<VersionRef>,
    ) -> Result<()> {
        let name = short_branch_name(&branch.full_name).to_string();
        let mut versions: Vec<&VersionDoc> = branch.versions.iter().collect();
        versions.sort_by_key(|v| v.number);
        let refs = |number| VersionRef {
            oid: doc.oid.clone(),
            branch: name.clone(),
            number,
        };

        let branching_point = match &branch.branching_point {
            None => None,
            Some(reference) => match self.resolve_kept(reference, skipped)? {
                Some(id) => Some(id),
                None => {
                    debug!(element = %doc.name, branch = %name, "branch spawned from an excluded version");
                    skipped.extend(versions.iter().map(|v| refs(v.number)));
                    return Ok(());
                }
            },
        };

        let mut kept = Vec::new();
        for version in versions {
            let date = match (doc.fudge_date, version.date) {
                (false, Some(date)) => date,
                _ => options.apex_date,
            };
            if options.origin_date.is_some_and(|origin| date > origin) {
                debug!(element = %doc.name, branch = %name, number = version.number, %date, "skipping version after origin date");
                skipped.insert(refs(version.number));
                continue;
            }
            kept.push((version, date));
        }
        if kept.is_empty() {
            // do not leave an empty branch
            return Ok(());
        }

        self.add_branch(element, &branch.full_name, branching_point);
        for (version, date) in kept {
            let info = VersionInfo {
                author_name: version.author_name.clone(),
                author_login: version.author_login.clone(),
                date,
                comment: version.comment.clone(),
                activity: version.activity.clone(),
                labels: version
                    .labels
                    .iter()
                    .filter(|l| options.retains_label(l))
                    .cloned()
                    .collect(),
            };
            let id = self.add_version(element, &name, version.number, info)?;
            if self.element(element).is_directory() {
                let content = version
                    .content
                    .iter()
                    .map(|entry| Ok((entry.name.clone(), self.lookup(&entry.oid)?)))
                    .collect::<Result<Vec<_>>>()?;
                self.set_content(id, content);
            }
        }
        Ok(())
    }
}

/// Last segment of a fully qualified branch name.
pub fn short_branch_name(full_name: &str) -> &str {
    full_name
        .rsplit(BRANCH_SEPARATOR)
        .next()
        .unwrap_or(full_name)
}

/// Filters applied while loading a [`GraphDocument`].
#[derive(Debug, Clone)]
pub struct LoadOptions {
    /// Date given to versions without one, or of elements flagged `fudge_date`.
    pub apex_date: DateTime<Utc>,
    /// Versions dated after this are excluded.
    pub origin_date: Option<DateTime<Utc>>,
    /// When set, only these labels are kept.
    pub labels: Option<BTreeSet<String>>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            apex_date: DateTime::<Utc>::default(),
            origin_date: None,
            labels: None,
        }
    }
}

impl LoadOptions {
    fn retains_label(&self, label: &str) -> bool {
        self.labels.as_ref().is_none_or(|l| l.contains(label))
    }
}

// =============================================================================
// Adapter document
// =============================================================================

/// Serialized form of the version graph, as produced by the adapter.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphDocument {
    #[serde(default)]
    pub elements: Vec<ElementDoc>,
    #[serde(default)]
    pub labels: Vec<LabelMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElementDoc {
    pub oid: Oid,
    pub name: String,
    #[serde(default)]
    pub kind: ElementKindDoc,
    /// All versions get the apex date.
    #[serde(default)]
    pub fudge_date: bool,
    #[serde(default)]
    pub branches: Vec<BranchDoc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ElementKindDoc {
    #[default]
    File,
    Directory,
    Symlink { target: String, directory: Oid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BranchDoc {
    pub full_name: String,
    #[serde(default)]
    pub branching_point: Option<VersionRef>,
    #[serde(default)]
    pub versions: Vec<VersionDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionDoc {
    pub number: u32,
    pub author_name: String,
    pub author_login: String,
    #[serde(default)]
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub comment: String,
    #[serde(default)]
    pub activity: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub merges_to: Vec<VersionRef>,
    #[serde(default)]
    pub merges_from: Vec<VersionRef>,
    #[serde(default)]
    pub content: Vec<EntryDoc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryDoc {
    pub name: String,
    pub oid: Oid,
}
