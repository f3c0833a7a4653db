//! Run configuration.
//!
//! The configuration is a TOML file; every key is optional and an empty
//! file is equivalent to [`Config::default`].

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::graph::{LoadOptions, MAIN_BRANCH};

/// Versions of one author on one branch closer than this are grouped.
pub const DEFAULT_MAX_DELAY_SECS: i64 = 30 * 60;

/// A label-completing version this far in the future is given up on.
pub const DEFAULT_LABEL_LATENESS_SECS: i64 = 8 * 60 * 60;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directories to import; `.` is always a root.
    pub roots: Vec<String>,

    /// Regular expressions selecting the branches to import. Empty keeps
    /// every branch.
    pub branches: Vec<String>,

    /// Labels to keep. `None` keeps every label.
    pub labels: Option<Vec<String>>,

    /// Date of versions needing a synthetic timestamp.
    pub apex_date: Option<DateTime<Utc>>,

    /// Versions created after this date are ignored.
    pub origin_date: Option<DateTime<Utc>>,

    pub max_delay_secs: i64,

    pub label_lateness_secs: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            roots: vec![".".to_string()],
            branches: Vec::new(),
            labels: None,
            apex_date: None,
            origin_date: None,
            max_delay_secs: DEFAULT_MAX_DELAY_SECS,
            label_lateness_secs: DEFAULT_LABEL_LATENESS_SECS,
        }
    }
}

impl Config {
    /// Parse a configuration from TOML content.
    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Serialize the configuration back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Read a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::seconds(self.max_delay_secs)
    }

    pub fn label_lateness(&self) -> Duration {
        Duration::seconds(self.label_lateness_secs)
    }

    pub fn roots(&self) -> Roots {
        Roots::new(&self.roots)
    }

    pub fn branch_filter(&self) -> Result<BranchFilter> {
        BranchFilter::new(&self.branches)
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            apex_date: self.apex_date.unwrap_or_default(),
            origin_date: self.origin_date,
            labels: self
                .labels
                .as_ref()
                .map(|labels| labels.iter().cloned().collect()),
        }
    }
}

/// Compiled branch allow-list.
#[derive(Debug, Clone, Default)]
pub struct BranchFilter {
    patterns: Vec<Regex>,
}

impl BranchFilter {
    pub fn new(patterns: &[String]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| Error::BranchFilter {
                    pattern: p.clone(),
                    source: e,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Whether `branch` is selected. `main` always is.
    pub fn matches(&self, branch: &str) -> bool {
        branch == MAIN_BRANCH || self.is_empty() || self.patterns.iter().any(|r| r.is_match(branch))
    }
}

/// The configured root directories.
///
/// Roots are directories whose parents are not imported: their own path
/// is known up front instead of coming from a parent directory version.
#[derive(Debug, Clone)]
pub struct Roots {
    all: BTreeSet<String>,
    relative: Vec<String>,
}

impl Roots {
    pub fn new(roots: &[String]) -> Self {
        let mut all = BTreeSet::from([".".to_string()]);
        let mut relative = Vec::new();
        for root in roots {
            let root = normalize_path(root);
            if root != "." && !relative.contains(&root) {
                relative.push(root.clone());
            }
            all.insert(root);
        }
        Self { all, relative }
    }

    /// Whether the element named `name` is one of the roots.
    pub fn is_root(&self, name: &str) -> bool {
        self.all.contains(&normalize_path(name))
    }

    /// Whether the element named `name` lies inside a root. Without any
    /// root but `.`, everything does.
    pub fn contains(&self, name: &str) -> bool {
        if self.relative.is_empty() {
            return true;
        }
        let name = normalize_path(name);
        name == "."
            || self
                .relative
                .iter()
                .any(|r| name == *r || name.starts_with(&format!("{r}/")))
    }
}

/// Forward slashes, no leading `./` or `/`, no trailing `/`; the
/// repository root itself is `.`.
pub fn normalize_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    let mut path = path.as_str();
    loop {
        if let Some(rest) = path.strip_prefix("./") {
            path = rest;
        } else if let Some(rest) = path.strip_prefix('/') {
            path = rest;
        } else {
            break;
        }
    }
    let path = path.trim_end_matches('/');
    if path.is_empty() {
        ".".to_string()
    } else {
        path.to_string()
    }
}

/// Path of `name` inside the directory at `parent`.
pub fn child_path(parent: &str, name: &str) -> String {
    if parent == "." {
        name.to_string()
    } else {
        format!("{parent}/{name}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_is_default() {
        assert_eq!(Config::from_toml("").unwrap(), Config::default());
    }

    #[test]
    fn parses_all_keys() {
        let config = Config::from_toml(
            r#"
            roots = ["src/app", "docs"]
            branches = ["^dev", "^rel_"]
            labels = ["REL_1"]
            origin_date = "2024-01-01T00:00:00Z"
            max_delay_secs = 600
            label_lateness_secs = 3600
            "#,
        )
        .unwrap();
        assert_eq!(config.max_delay(), Duration::minutes(10));
        assert_eq!(config.label_lateness(), Duration::hours(1));
        assert!(config.origin_date.is_some());

        let options = config.load_options();
        assert!(options.labels.unwrap().contains("REL_1"));

        let roundtrip = Config::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(roundtrip, config);
    }

    #[test]
    fn invalid_branch_filter_is_an_error() {
        let config = Config {
            branches: vec!["(".to_string()],
            ..Config::default()
        };
        assert!(matches!(config.branch_filter(), Err(Error::BranchFilter { .. })));
    }

    #[test]
    fn branch_filter_always_keeps_main() {
        let filter = BranchFilter::new(&["^dev".to_string()]).unwrap();
        assert!(filter.matches("main"));
        assert!(filter.matches("dev_2"));
        assert!(!filter.matches("feature"));
    }

    #[test]
    fn roots_contain_their_descendants() {
        let roots = Roots::new(&["./src/app/".to_string()]);
        assert!(roots.is_root("."));
        assert!(roots.is_root("src/app"));
        assert!(roots.contains("src/app/main.c"));
        assert!(roots.contains("."));
        assert!(!roots.contains("src/application.c"));
        assert!(Roots::new(&[]).contains("anything"));
    }

    #[test]
    fn paths_are_normalized() {
        assert_eq!(normalize_path(".\\src\\"), "src");
        assert_eq!(normalize_path("./"), ".");
        assert_eq!(child_path(".", "a"), "a");
        assert_eq!(child_path("a", "b"), "a/b");
    }
}
