//! Crate error type.
//!
//! Every variant here aborts a run. Irregularities that the history is
//! allowed to contain are logged and collected in a [`crate::Report`]
//! instead.

use thiserror::Error;

/// Errors that can occur while reconstructing history.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write '{path}'")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration")]
    ParseConfig(#[from] toml::de::Error),

    #[error("failed to serialize configuration")]
    SerializeConfig(#[from] toml::ser::Error),

    #[error("invalid branch filter '{pattern}'")]
    BranchFilter {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("failed to decode '{path}'")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode {what}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("version graph refers to unknown element {oid}")]
    UnknownElement { oid: String },

    #[error("version graph refers to unknown version {version}")]
    UnknownVersion { version: String },

    #[error("element {element} has no branch '{branch}'")]
    UnknownBranch { element: String, branch: String },

    #[error("circular references between directory versions of changeset {changeset}")]
    DirectoryCycle { changeset: String },

    #[error("version {version} was named {name}, but its element has no visible name")]
    MissingName { version: String, name: String },

    #[error("version {version} has no predecessor and is not a branch origin")]
    MissingPredecessor { version: String },

    #[error("branch '{branch}' has no known parent branch")]
    UnknownParentBranch { branch: String },

    #[error("branch '{branch}' parent is '{current}' but was '{previous}' in the previous run")]
    InconsistentBranchParent {
        branch: String,
        previous: String,
        current: String,
    },

    #[error("could not find the changeset spawning branch '{branch}' for label {label}")]
    SpawningPoint { label: String, branch: String },

    #[error("file element {element} appears {count} times in changeset {changeset}")]
    DuplicateFileVersion {
        element: String,
        count: usize,
        changeset: String,
    },

    #[error("file element {element} in changeset {changeset} is {expected}, but {actual} is current")]
    VersionMismatch {
        element: String,
        changeset: String,
        expected: String,
        actual: String,
    },

    #[error("unsupported snapshot format version {found} (expected {expected})")]
    SnapshotFormat { found: u32, expected: u32 },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
