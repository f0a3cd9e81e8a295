//! Black-box conformance suite for a single plugin binary.
//!
//! [`run_suite`] starts the plugin through a [`Supervisor`](crate::Supervisor),
//! runs the declared battery strictly in order against one
//! [`PluginClient`](crate::PluginClient), stops the plugin, and returns an
//! immutable [`ConformanceReport`]. The renderers in [`render`] are pure
//! functions of that report.

mod cases;
pub mod render;
mod report;
mod runner;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use finfocus_proto::{CommMode, ResourceDescriptor};

use crate::supervisor::SupervisorConfig;

pub use cases::{CREDENTIALS_ENV, Precondition, TestCase, battery, default_sample_resource};
pub use render::{render_json, render_junit, render_table};
pub use report::{ConformanceReport, PluginMeta, SuiteError, Summary, TestResult, TestStatus};
pub use runner::run_suite;

/// Name reported as the suite in every rendering.
pub const SUITE_NAME: &str = "finfocus-plugin-conformance";

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Protocol,
    Cost,
    Error,
    Recommendation,
    #[serde(rename = "dryrun")]
    DryRun,
}

impl Category {
    pub const ALL: [Category; 5] = [
        Category::Protocol,
        Category::Cost,
        Category::Error,
        Category::Recommendation,
        Category::DryRun,
    ];
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Protocol => "protocol",
            Self::Cost => "cost",
            Self::Error => "error",
            Self::Recommendation => "recommendation",
            Self::DryRun => "dryrun",
        };
        f.write_str(s)
    }
}

impl FromStr for Category {
    type Err = CategoryParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "protocol" => Ok(Self::Protocol),
            "cost" => Ok(Self::Cost),
            "error" => Ok(Self::Error),
            "recommendation" => Ok(Self::Recommendation),
            "dryrun" | "dry_run" | "dry-run" => Ok(Self::DryRun),
            _ => Err(CategoryParseError(s.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("invalid category {0:?} (expected protocol, cost, error, recommendation, or dryrun)")]
pub struct CategoryParseError(pub String);

// ---------------------------------------------------------------------------
// Verbosity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    Quiet,
    #[default]
    Normal,
    Verbose,
    Debug,
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Quiet => "quiet",
            Self::Normal => "normal",
            Self::Verbose => "verbose",
            Self::Debug => "debug",
        };
        f.write_str(s)
    }
}

impl FromStr for Verbosity {
    type Err = VerbosityParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "quiet" => Ok(Self::Quiet),
            "normal" => Ok(Self::Normal),
            "verbose" => Ok(Self::Verbose),
            "debug" => Ok(Self::Debug),
            other => Err(VerbosityParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("invalid verbosity {0:?} (expected quiet, normal, verbose, or debug)")]
pub struct VerbosityParseError(pub String);

// ---------------------------------------------------------------------------
// Suite configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SuiteConfig {
    pub mode: CommMode,
    /// Wall-clock budget of the whole suite, plugin start included.
    pub timeout: Duration,
    /// Upper bound of a single case.
    pub case_timeout: Duration,
    /// Categories to run; empty runs all.
    pub categories: Vec<Category>,
    /// Only cases whose name matches are run.
    pub filter: Option<Regex>,
    pub verbosity: Verbosity,
    pub supervisor: SupervisorConfig,
    /// Resource used by cost cases; defaults to [`default_sample_resource`].
    pub sample_resource: Option<ResourceDescriptor>,
}

impl Default for SuiteConfig {
    fn default() -> Self {
        Self {
            mode: CommMode::Tcp,
            timeout: Duration::from_secs(5 * 60),
            case_timeout: Duration::from_secs(30),
            categories: Vec::new(),
            filter: None,
            verbosity: Verbosity::Normal,
            supervisor: SupervisorConfig::default(),
            sample_resource: None,
        }
    }
}

impl SuiteConfig {
    pub(crate) fn selects(&self, category: Category, name: &str) -> bool {
        let category_ok = self.categories.is_empty() || self.categories.contains(&category);
        let filter_ok = self.filter.as_ref().is_none_or(|re| re.is_match(name));
        category_ok && filter_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parses_aliases() {
        assert_eq!("dryrun".parse::<Category>().unwrap(), Category::DryRun);
        assert_eq!("dry-run".parse::<Category>().unwrap(), Category::DryRun);
        assert_eq!("Protocol".parse::<Category>().unwrap(), Category::Protocol);
        assert!("billing".parse::<Category>().is_err());
        assert_eq!(serde_json::to_string(&Category::DryRun).unwrap(), "\"dryrun\"");
    }

    #[test]
    fn verbosity_orders_by_detail() {
        assert!(Verbosity::Quiet < Verbosity::Normal);
        assert!(Verbosity::Verbose < Verbosity::Debug);
        assert_eq!("verbose".parse::<Verbosity>().unwrap(), Verbosity::Verbose);
    }

    #[test]
    fn selection_combines_category_and_filter() {
        let config = SuiteConfig {
            categories: vec![Category::Protocol],
            filter: Some(Regex::new("^identity").unwrap()),
            ..SuiteConfig::default()
        };
        assert!(config.selects(Category::Protocol, "identity_responds"));
        assert!(!config.selects(Category::Protocol, "plugin_info_metadata"));
        assert!(!config.selects(Category::Cost, "identity_responds"));
        assert!(SuiteConfig::default().selects(Category::DryRun, "anything"));
    }
}
