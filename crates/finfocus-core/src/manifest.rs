//! `plugin.toml` manifests.
//!
//! A manifest describes one installed plugin version:
//!
//! ```toml
//! name = "aws-public"
//! version = "1.4.0"
//! spec_version = "1.0.0"
//! supported_providers = ["aws"]
//! resource_types = ["aws:ec2:*", "aws:rds:Instance"]  # optional
//! binary = "bin/aws-public"                            # optional
//!
//! [metadata]
//! vendor = "example"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use finfocus_proto::ResourceDescriptor;

use crate::error::HostError;

/// File name of the manifest inside a version directory.
pub const MANIFEST_FILE: &str = "plugin.toml";

/// Prefix of the conventional executable name.
pub const BINARY_PREFIX: &str = "finfocus-plugin-";

/// On-disk shape; every field optional so missing ones get a precise error.
#[derive(Debug, Deserialize)]
struct RawManifest {
    name: Option<String>,
    version: Option<String>,
    spec_version: Option<String>,
    supported_providers: Option<Vec<String>>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
    binary: Option<PathBuf>,
    #[serde(default)]
    resource_types: Vec<String>,
}

/// A validated plugin manifest. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginManifest {
    pub name: String,
    pub version: semver::Version,
    pub spec_version: String,
    pub supported_providers: Vec<String>,
    /// Absolute or install-root-relative path of the executable.
    pub binary_path: PathBuf,
    pub metadata: BTreeMap<String, String>,
    /// Resource-type patterns; empty claims every type of the providers.
    pub resource_types: Vec<String>,
    /// The version directory the manifest was read from.
    pub dir: PathBuf,
}

impl PluginManifest {
    /// Read and validate `<dir>/plugin.toml`.
    pub fn load(dir: &Path) -> Result<Self, HostError> {
        let path = dir.join(MANIFEST_FILE);
        let malformed = |reason: String| HostError::MalformedManifest {
            path: path.clone(),
            reason,
        };

        let content = std::fs::read_to_string(&path)
            .map_err(|e| malformed(format!("cannot read manifest: {e}")))?;
        let raw: RawManifest =
            toml::from_str(&content).map_err(|e| malformed(format!("invalid TOML: {e}")))?;

        let name = raw
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| malformed("missing required field `name`".to_string()))?;
        let version_str = raw
            .version
            .ok_or_else(|| malformed("missing required field `version`".to_string()))?;
        let version = semver::Version::parse(version_str.trim())
            .map_err(|e| malformed(format!("version {version_str:?} is not semver: {e}")))?;
        let spec_version = raw
            .spec_version
            .ok_or_else(|| malformed("missing required field `spec_version`".to_string()))?;
        if finfocus_proto::spec_major(&spec_version).is_none() {
            return Err(malformed(format!(
                "spec_version {spec_version:?} has no numeric major component"
            )));
        }
        let supported_providers = raw
            .supported_providers
            .filter(|p| !p.is_empty())
            .ok_or_else(|| malformed("missing required field `supported_providers`".to_string()))?;

        let binary_path = match raw.binary {
            Some(binary) => {
                let candidate = dir.join(binary);
                if !candidate.is_file() {
                    return Err(malformed(format!(
                        "declared binary {} does not exist",
                        candidate.display()
                    )));
                }
                candidate
            }
            None => locate_binary(dir, &name).ok_or_else(|| {
                malformed(format!(
                    "no executable named {BINARY_PREFIX}{name} or {name} in {}",
                    dir.display()
                ))
            })?,
        };

        Ok(Self {
            name,
            version,
            spec_version,
            supported_providers,
            binary_path,
            metadata: raw.metadata,
            resource_types: raw.resource_types,
            dir: dir.to_path_buf(),
        })
    }

    /// A synthetic manifest for a bare binary, as used by the conformance
    /// suite where no install tree exists.
    pub fn for_binary(path: &Path) -> Self {
        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "plugin".to_string());
        let name = stem.strip_prefix(BINARY_PREFIX).unwrap_or(&stem).to_string();
        // Children run with `dir` as cwd, so the binary path must not be relative.
        let binary_path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        Self {
            name,
            version: semver::Version::new(0, 0, 0),
            spec_version: finfocus_proto::SPEC_VERSION.to_string(),
            supported_providers: vec!["*".to_string()],
            binary_path: binary_path.clone(),
            metadata: BTreeMap::new(),
            resource_types: Vec::new(),
            dir: binary_path.parent().map(Path::to_path_buf).unwrap_or_default(),
        }
    }

    /// `name@version`, the unique key of an installed plugin.
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Whether this plugin claims the resource.
    pub fn matches(&self, resource: &ResourceDescriptor) -> bool {
        let provider_ok = self
            .supported_providers
            .iter()
            .any(|p| pattern_matches(p, &resource.provider));
        if !provider_ok {
            return false;
        }
        self.resource_types.is_empty()
            || self
                .resource_types
                .iter()
                .any(|t| pattern_matches(t, &resource.resource_type))
    }
}

fn locate_binary(dir: &Path, name: &str) -> Option<PathBuf> {
    [format!("{BINARY_PREFIX}{name}"), name.to_string()]
        .into_iter()
        .map(|file| dir.join(file))
        .find(|candidate| candidate.is_file())
}

/// `*` matches anything; a trailing `*` matches by prefix.
fn pattern_matches(pattern: &str, value: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some("") => true,
        Some(prefix) => value.starts_with(prefix),
        None => pattern == value,
    }
}
