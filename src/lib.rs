//! Thucydides: reconstruct an ordered changeset history from a legacy,
//! per-element version graph.
//!
//! The legacy system versions every file and directory independently, on
//! per-element branches. Thucydides groups those versions into changesets,
//! replays them in an order that keeps labels consistent, and produces an
//! import plan a serializer can turn into commits of a snapshot-based
//! repository.
//!
//! # Architecture
//!
//! - **Graph**: the version graph arena and its input document
//! - **Cluster**: group versions into raw changesets by branch, author and time
//! - **Scheduler**: replay changesets, spawn branches, complete labels, merge
//! - **Resolver**: turn directory versions into renames, copies and removals
//! - **State**: persist what the next incremental run needs
//! - **Export**: the import plan and its report

mod changeset;
mod cluster;
mod config;
mod error;
mod export;
mod graph;
mod hierarchy;
mod labels;
mod merges;
mod reconstruct;
mod report;
mod resolver;
mod scheduler;
mod state;

pub use changeset::{ChangeSet, ChangeSetKey, NamedVersion};
pub use cluster::{Clusterer, RawHistory};
pub use config::{BranchFilter, Config, Roots};
pub use error::{Error, Result};
pub use export::{Commit, FileChange, ImportPlan, PathPair, Symlink};
pub use graph::{
    BranchDoc, Element, ElementBranch, ElementDoc, ElementId, ElementKind, ElementKindDoc, EntryDoc,
    GraphDocument, LoadOptions, MAIN_BRANCH, Oid, Version, VersionDoc, VersionGraph, VersionId, VersionPayload,
    VersionInfo, VersionRef,
};
pub use hierarchy::{AmbiguousParent, BranchHierarchy};
pub use labels::{LabelInfo, LabelMeta, LabelRegistry, LabelState};
pub use merges::{IncompleteMerge, MergeTracker};
pub use reconstruct::{Reconstruction, RunOptions, infer_hierarchy, load_graph, reconstruct, run};
pub use report::{BrokenLabel, IncompleteLabel, LabelMismatch, LostVersion, Report};
pub use resolver::BranchState;
pub use scheduler::{History, ReplayState, Scheduler};
pub use state::{FORMAT_VERSION, Snapshot};
