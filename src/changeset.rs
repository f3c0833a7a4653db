//! Changesets: the atomic units of reconstructed history.

use std::fmt;

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::graph::{VersionGraph, VersionId};

/// Slot of a changeset in the scheduler's arena. Stable for a whole run,
/// unlike [`ChangeSet::id`], which is only assigned when it is replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeSetKey(pub usize);

/// A version together with the paths it is visible under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedVersion {
    pub version: VersionId,
    pub names: Vec<String>,
    /// Part of the clustered versions, as opposed to pulled in by a tree
    /// operation (e.g. re-adding a file under a new directory).
    pub in_raw_changeset: bool,
}

impl NamedVersion {
    pub fn new(version: VersionId, name: Option<String>, in_raw_changeset: bool) -> Self {
        Self {
            version,
            names: name.into_iter().collect(),
            in_raw_changeset,
        }
    }
}

/// Versions sharing author, branch and close check-in times, plus the tree
/// operations needed to apply them.
#[derive(Debug, Clone)]
pub struct ChangeSet {
    /// Sequence id, 0 until replayed.
    pub id: usize,
    pub author_name: String,
    pub author_login: String,
    pub branch: String,
    pub start: DateTime<Utc>,
    pub finish: DateTime<Utc>,

    pub versions: Vec<NamedVersion>,
    /// Superseded versions of a file element also in `versions`, kept only
    /// when they carry labels or merge links.
    pub skipped_versions: Vec<VersionId>,
    pub renamed: Vec<(String, String)>,
    pub removed: Vec<String>,
    pub copied: Vec<(String, String)>,
    /// `(path, target)`
    pub symlinks: Vec<(String, String)>,

    pub branching_point: Option<ChangeSetKey>,
    pub is_branching_point: bool,
    /// Changesets of child branches merged into this one.
    pub merges: Vec<ChangeSetKey>,
    pub is_merged: bool,

    pub labels: Vec<String>,
}

impl ChangeSet {
    pub fn new(author_name: &str, author_login: &str, branch: &str, time: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            author_name: author_name.to_string(),
            author_login: author_login.to_string(),
            branch: branch.to_string(),
            start: time,
            finish: time,
            versions: Vec::new(),
            skipped_versions: Vec::new(),
            renamed: Vec::new(),
            removed: Vec::new(),
            copied: Vec::new(),
            symlinks: Vec::new(),
            branching_point: None,
            is_branching_point: false,
            merges: Vec::new(),
            is_merged: false,
            labels: Vec::new(),
        }
    }

    /// Add a version, returning the index of its entry in `versions`.
    ///
    /// A file element is kept once, with its newest version: the whole
    /// changeset is on one branch.
    pub fn add(
        &mut self,
        graph: &VersionGraph,
        version: VersionId,
        name: Option<String>,
        in_raw_changeset: bool,
    ) -> usize {
        let v = graph.version(version);
        let existing = self
            .versions
            .iter()
            .position(|named| graph.version(named.version).element == v.element);

        let index = match existing {
            Some(index) if !graph.element(v.element).is_directory() => {
                let entry = &mut self.versions[index];
                if let Some(name) = name {
                    if !entry.names.is_empty() && !entry.names.contains(&name) {
                        entry.names.push(name);
                        debug!(version = %graph.describe(version), names = ?entry.names, "version has several names");
                    }
                }
                let current = graph.version(entry.version).number;
                let skipped = if current < v.number {
                    Some(std::mem::replace(&mut entry.version, version))
                } else if current > v.number {
                    Some(version)
                } else {
                    None
                };
                if let Some(skipped) = skipped {
                    let s = graph.version(skipped);
                    if !s.labels.is_empty() || !s.merges_from.is_empty() || !s.merges_to.is_empty() {
                        self.skipped_versions.push(skipped);
                    }
                }
                index
            }
            _ => {
                self.versions
                    .push(NamedVersion::new(version, name, in_raw_changeset));
                self.versions.len() - 1
            }
        };

        if in_raw_changeset {
            if v.date < self.start {
                self.start = v.date;
            }
            if v.date > self.finish {
                self.finish = v.date;
            }
        }
        index
    }

    /// Take over the versions of `other`, a changeset of the same branch and
    /// author.
    pub fn absorb(&mut self, graph: &VersionGraph, other: ChangeSet) {
        for named in other.versions {
            self.add(graph, named.version, None, named.in_raw_changeset);
        }
        for skipped in other.skipped_versions {
            if !self.skipped_versions.contains(&skipped) {
                self.skipped_versions.push(skipped);
            }
        }
        self.start = self.start.min(other.start);
        self.finish = self.finish.max(other.finish);
    }

    /// Nothing to write in the target history: no tree operation, no
    /// merge and no named file.
    pub fn is_empty_commit(&self, graph: &VersionGraph) -> bool {
        self.merges.is_empty()
            && self.renamed.is_empty()
            && self.copied.is_empty()
            && self.removed.is_empty()
            && self.symlinks.is_empty()
            && !self
                .versions
                .iter()
                .any(|v| !v.names.is_empty() && !graph.element_of(v.version).is_directory())
    }

    /// Commit message derived from the file changes and their comments.
    pub fn message(&self, graph: &VersionGraph) -> String {
        let files: Vec<&NamedVersion> = self
            .versions
            .iter()
            .filter(|v| {
                v.in_raw_changeset
                    && !v.names.is_empty()
                    && !graph.element_of(v.version).is_directory()
            })
            .collect();
        let file_changes = files.len();
        let tree_changes = self.removed.len()
            + self.renamed.len()
            + self.copied.len()
            + self.symlinks.len()
            + self
                .versions
                .iter()
                .filter(|v| {
                    !v.in_raw_changeset
                        && !v.names.is_empty()
                        && !graph.element_of(v.version).is_directory()
                })
                .count();

        if file_changes == 0 {
            return if tree_changes > 0 {
                plural(tree_changes, "tree modification")
            } else {
                "No actual change".to_string()
            };
        }

        let comments = group_by_text(&files, |v| &graph.version(v.version).comment);
        let activities = group_by_text(&files, |v| &graph.version(v.version).activity);

        let counts = if tree_changes > 0 {
            format!(
                "{} and {}",
                plural(file_changes, "file modification"),
                plural(tree_changes, "tree modification")
            )
        } else {
            plural(file_changes, "file modification")
        };
        let names: Vec<&str> = files.iter().map(|v| v.names[0].as_str()).collect();
        let file_list = display_file_names(&names, false);

        let headline = |groups: &[(String, Vec<&str>)]| {
            groups
                .first()
                .filter(|(text, names)| names.len() > file_changes / 2 && !text.contains('\n'))
                .map(|(text, _)| text.clone())
        };
        let comment = headline(&comments);
        let activity = headline(&activities);

        let mut message = match (comment, activity) {
            (Some(comment), Some(activity)) => {
                format!("{comment} {{{activity}}} ({counts}): {file_list}")
            }
            (Some(text), None) | (None, Some(text)) => format!("{text} ({counts}): {file_list}"),
            (None, None) => format!("{counts}: {file_list}"),
        };

        for groups in [&activities, &comments] {
            if groups.len() > 1 {
                message.push('\n');
                for (text, names) in groups.iter() {
                    message.push('\n');
                    message.push_str(&display_file_names(names, true));
                    message.push_str(":\n\t");
                    message.push_str(&text.replace('\n', "\n\t"));
                }
            }
        }
        message
    }
}

impl fmt::Display for ChangeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Id {}, {}@{}: {} changes between {} and {}",
            self.id,
            self.author_name,
            self.branch,
            self.versions.len() + self.renamed.len() + self.removed.len() + self.symlinks.len(),
            self.start,
            self.finish
        )
    }
}

/// Group display names by normalized text, most frequent first, ties in
/// order of first appearance. Blank texts are ignored.
fn group_by_text<'a, 'g>(
    files: &[&'a NamedVersion],
    text: impl Fn(&NamedVersion) -> &'g str,
) -> Vec<(String, Vec<&'a str>)> {
    let mut groups: Vec<(String, Vec<&'a str>)> = Vec::new();
    for file in files {
        let key = text(file).trim().replace('\r', "");
        if key.is_empty() {
            continue;
        }
        let name = file.names[0].as_str();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, names)) => names.push(name),
            None => groups.push((key, vec![name])),
        }
    }
    groups.sort_by(|a, b| b.1.len().cmp(&a.1.len()));
    groups
}

fn display_file_names(names: &[&str], show_remaining: bool) -> String {
    const DISPLAYED: usize = 3;
    let truncated = names.len() > DISPLAYED + 1;
    let shown = if truncated { DISPLAYED } else { names.len() };
    let mut result = names[..shown]
        .iter()
        .map(|n| n.rsplit('/').next().unwrap_or(n))
        .collect::<Vec<_>>()
        .join(", ");
    if truncated {
        result.push_str(", ...");
        if show_remaining {
            result.push_str(&format!(" ({} more)", names.len() - DISPLAYED));
        }
    }
    result
}

fn plural(count: usize, what: &str) -> String {
    format!("{count} {what}{}", if count > 1 { "s" } else { "" })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{ElementKind, VersionInfo};
    use chrono::TimeZone;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 1, 1, 10, minute, 0).unwrap()
    }

    fn file(graph: &mut VersionGraph, oid: &str, comment: &str, minute: u32) -> VersionId {
        let element = graph.add_element(oid, oid, ElementKind::File);
        graph.add_branch(element, "main", None);
        graph
            .add_version(element, "main", 1, VersionInfo::new("ann", at(minute)).comment(comment))
            .unwrap()
    }

    #[test]
    fn keeps_newest_file_version_and_extends_span() {
        let mut graph = VersionGraph::new();
        let element = graph.add_element("f", "f.c", ElementKind::File);
        graph.add_branch(element, "main", None);
        let v1 = graph
            .add_version(element, "main", 1, VersionInfo::new("ann", at(5)).label("L"))
            .unwrap();
        let v2 = graph.add_version(element, "main", 2, VersionInfo::new("ann", at(20))).unwrap();

        let mut cs = ChangeSet::new("ann", "ann", "main", at(5));
        cs.add(&graph, v2, None, true);
        cs.add(&graph, v1, None, true);

        assert_eq!(cs.versions.len(), 1);
        assert_eq!(cs.versions[0].version, v2);
        assert_eq!(cs.skipped_versions, vec![v1]);
        assert_eq!((cs.start, cs.finish), (at(5), at(20)));
    }

    #[test]
    fn message_uses_dominant_comment() {
        let mut graph = VersionGraph::new();
        let a = file(&mut graph, "a", "fix parser", 1);
        let b = file(&mut graph, "b", "fix parser", 2);
        let c = file(&mut graph, "c", "typo", 3);

        let mut cs = ChangeSet::new("ann", "ann", "main", at(1));
        cs.add(&graph, a, Some("src/a.c".into()), true);
        cs.add(&graph, b, Some("src/b.c".into()), true);
        cs.add(&graph, c, Some("c.c".into()), true);
        cs.removed.push("old.c".into());

        assert_eq!(
            cs.message(&graph),
            "fix parser (3 file modifications and 1 tree modification): a.c, b.c, c.c\n\
             \n\
             a.c, b.c:\n\tfix parser\n\
             c.c:\n\ttypo"
        );
    }

    #[test]
    fn message_without_comments_lists_files() {
        let mut graph = VersionGraph::new();
        let mut cs = ChangeSet::new("ann", "ann", "main", at(0));
        for (i, oid) in ["a", "b", "c", "d", "e"].iter().enumerate() {
            let v = file(&mut graph, oid, "", i as u32);
            cs.add(&graph, v, Some(format!("dir/{oid}")), true);
        }
        assert_eq!(cs.message(&graph), "5 file modifications: a, b, c, ...");
    }

    #[test]
    fn message_for_tree_only_changes() {
        let graph = VersionGraph::new();
        let mut cs = ChangeSet::new("ann", "ann", "main", at(0));
        assert_eq!(cs.message(&graph), "No actual change");
        assert!(cs.is_empty_commit(&graph));
        cs.renamed.push(("a".into(), "b".into()));
        assert_eq!(cs.message(&graph), "1 tree modification");
        assert!(!cs.is_empty_commit(&graph));
    }
}
