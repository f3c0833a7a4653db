//! The import plan handed to the target-repository serializer.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::changeset::ChangeSet;
use crate::error::{Error, Result};
use crate::graph::{MAIN_BRANCH, Oid, VersionGraph};
use crate::hierarchy::BranchHierarchy;
use crate::report::Report;
use crate::scheduler::History;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportPlan {
    pub commits: Vec<Commit>,
    /// Branches to import under another name, the target being case
    /// insensitive.
    pub branch_renames: BTreeMap<String, String>,
    pub report: Report,
}

/// One commit of the plan.
///
/// Tree operations apply in field order: `renamed`, `copied`, `removed`,
/// `symlinks`, then `files`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Commit {
    pub mark: usize,
    pub branch: String,
    pub author_name: String,
    pub author_login: String,
    pub time: DateTime<Utc>,
    /// Commit the branch starts from, for the first commit of a branch.
    pub from: Option<usize>,
    pub merges: Vec<usize>,
    pub message: String,
    pub renamed: Vec<PathPair>,
    pub copied: Vec<PathPair>,
    pub removed: Vec<String>,
    pub symlinks: Vec<Symlink>,
    pub files: Vec<FileChange>,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathPair {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Symlink {
    pub path: String,
    pub target: String,
}

/// A file to write, with the version to fetch its content from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub path: String,
    pub oid: Oid,
    pub branch: String,
    pub number: u32,
    /// `main/0`: always empty, nothing to fetch.
    pub empty: bool,
}

impl ImportPlan {
    pub fn new(graph: &VersionGraph, history: &History, hierarchy: &BranchHierarchy, report: Report) -> Self {
        let commits = history
            .iter()
            .map(|changeset| Commit::new(graph, history, changeset))
            .collect();
        Self {
            commits,
            branch_renames: hierarchy.case_collision_renames(),
            report,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| Error::Encode {
            what: "import plan",
            source: e,
        })
    }
}

impl Commit {
    fn new(graph: &VersionGraph, history: &History, changeset: &ChangeSet) -> Self {
        let pairs = |list: &[(String, String)]| {
            list.iter()
                .map(|(from, to)| PathPair {
                    from: from.clone(),
                    to: to.clone(),
                })
                .collect()
        };

        let mut files = Vec::new();
        for named in &changeset.versions {
            let element = graph.element_of(named.version);
            if element.is_directory() || element.is_symlink() {
                continue;
            }
            let version = graph.version(named.version);
            for path in &named.names {
                files.push(FileChange {
                    path: path.clone(),
                    oid: element.oid.clone(),
                    branch: version.branch.clone(),
                    number: version.number,
                    empty: version.number == 0 && version.branch == MAIN_BRANCH,
                });
            }
        }

        Self {
            mark: changeset.id,
            branch: changeset.branch.clone(),
            author_name: changeset.author_name.clone(),
            author_login: changeset.author_login.clone(),
            time: changeset.start,
            from: changeset.branching_point.map(|k| history.get(k).id),
            merges: changeset.merges.iter().map(|k| history.get(*k).id).collect(),
            message: changeset.message(graph),
            renamed: pairs(&changeset.renamed),
            copied: pairs(&changeset.copied),
            removed: changeset.removed.clone(),
            symlinks: changeset
                .symlinks
                .iter()
                .map(|(path, target)| Symlink {
                    path: path.clone(),
                    target: target.clone(),
                })
                .collect(),
            files,
            labels: changeset.labels.clone(),
        }
    }
}
