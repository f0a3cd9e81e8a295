//! Scan an install root for plugin manifests.
//!
//! Layout: `<root>/<name>/<version>/plugin.toml`. Scanning never spawns a
//! process and never aborts on a bad entry; problems are collected in
//! [`DiscoveryReport::errors`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::HostError;
use crate::manifest::{MANIFEST_FILE, PluginManifest};

/// Outcome of one scan.
#[derive(Debug, Default)]
pub struct DiscoveryReport {
    /// Valid manifests in scan order.
    pub manifests: Vec<PluginManifest>,
    /// One entry per malformed manifest, unreadable plugin directory, or
    /// duplicate declaration.
    pub errors: Vec<HostError>,
}

impl DiscoveryReport {
    /// Highest version of each plugin, in the scan order of plugin names.
    pub fn latest(&self) -> Vec<&PluginManifest> {
        let mut order: Vec<&str> = Vec::new();
        let mut best: HashMap<&str, &PluginManifest> = HashMap::new();
        for manifest in &self.manifests {
            match best.get(manifest.name.as_str()) {
                None => {
                    order.push(&manifest.name);
                    best.insert(&manifest.name, manifest);
                }
                Some(current) if manifest.version > current.version => {
                    best.insert(&manifest.name, manifest);
                }
                Some(_) => {}
            }
        }
        order.into_iter().filter_map(|name| best.get(name).copied()).collect()
    }

    /// Find a manifest by plugin name, newest version first.
    pub fn find(&self, name: &str) -> Option<&PluginManifest> {
        self.latest().into_iter().find(|m| m.name == name)
    }
}

/// Scan `root`. A missing root yields an empty report.
pub fn discover(root: &Path) -> std::io::Result<DiscoveryReport> {
    let mut report = DiscoveryReport::default();
    if !root.exists() {
        debug!(root = %root.display(), "plugin root does not exist");
        return Ok(report);
    }
    // Children are spawned with the version dir as cwd; keep paths absolute.
    let root = root.canonicalize()?;
    let root = root.as_path();

    let mut seen: HashMap<(String, semver::Version), PathBuf> = HashMap::new();

    for plugin_dir in sorted_subdirs(root)? {
        let mut versions = match sorted_subdirs(&plugin_dir) {
            Ok(versions) => versions,
            Err(e) => {
                warn!(dir = %plugin_dir.display(), error = %e, "cannot read plugin directory");
                report.errors.push(HostError::MalformedManifest {
                    path: plugin_dir,
                    reason: format!("cannot read plugin directory: {e}"),
                });
                continue;
            }
        };
        versions.sort_by(|a, b| version_order(a, b));

        for version_dir in versions {
            if !version_dir.join(MANIFEST_FILE).is_file() {
                warn!(
                    dir = %version_dir.display(),
                    "version directory has no plugin.toml, ignoring"
                );
                continue;
            }
            match PluginManifest::load(&version_dir) {
                Ok(manifest) => {
                    let key = (manifest.name.clone(), manifest.version.clone());
                    if let Some(first) = seen.get(&key) {
                        warn!(
                            plugin = %manifest.name,
                            version = %manifest.version,
                            first = %first.display(),
                            second = %version_dir.display(),
                            "duplicate plugin declaration"
                        );
                        report.errors.push(HostError::VersionConflict {
                            name: manifest.name,
                            version: manifest.version.to_string(),
                            first: first.clone(),
                            second: version_dir,
                        });
                        continue;
                    }
                    debug!(
                        plugin = %manifest.name,
                        version = %manifest.version,
                        "discovered plugin"
                    );

                    seen.insert(key, version_dir);
                    report.manifests.push(manifest);
                }
                Err(e) => {
                    warn!(dir = %version_dir.display(), error = %e, "skipping malformed manifest");
                    report.errors.push(e);
                }
            }
        }
    }

    Ok(report)
}

fn sorted_subdirs(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            dirs.push(entry.path());
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Semver ascending, then non-semver directory names by name.
fn version_order(a: &Path, b: &Path) -> std::cmp::Ordering {
    let parse = |p: &Path| {
        p.file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| semver::Version::parse(n.trim_start_matches('v')).ok())
    };
    match (parse(a), parse(b)) {
        (Some(va), Some(vb)) => va.cmp(&vb).then_with(|| a.cmp(b)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_dirs_sort_semantically() {
        let mut dirs = vec![
            PathBuf::from("p/1.10.0"),
            PathBuf::from("p/nightly"),
            PathBuf::from("p/1.2.0"),
            PathBuf::from("p/v1.3.0"),
        ];
        dirs.sort_by(|a, b| version_order(a, b));
        let names: Vec<_> = dirs
            .iter()
            .map(|d| d.file_name().unwrap().to_str().unwrap())
            .collect();
        assert_eq!(names, ["1.2.0", "v1.3.0", "1.10.0", "nightly"]);
    }

    #[test]
    fn missing_root_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let report = discover(&tmp.path().join("absent")).unwrap();
        assert!(report.manifests.is_empty());
        assert!(report.errors.is_empty());
    }
}
