//! Shared test utilities for finfocus integration tests.
//!
//! Plugins under test are shell scripts written into a temp directory,
//! either standalone (to fake misbehaving processes) or as thin wrappers
//! that `exec` the `finfocus-mock-plugin` binary with a fixed `MOCK_*`
//! environment.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use finfocus_proto::{ResourceDescriptor, SPEC_VERSION};

/// Fresh, empty plugin install root.
pub fn plugin_root() -> TempDir {
    tempfile::tempdir().expect("failed to create plugin root")
}

/// Write an executable `#!/bin/sh` script to `dir/name`.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    fs::create_dir_all(dir).expect("failed to create script directory");
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("failed to write script");
    make_executable(&path).expect("failed to chmod script");
    path
}

#[cfg(unix)]
fn make_executable(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Write `root/<name>/<version>/plugin.toml` and return the version dir.
///
/// The manifest declares no `binary`, so the host looks for
/// `finfocus-plugin-<name>` in the same directory.
pub fn write_manifest(root: &Path, name: &str, version: &str, providers: &[&str]) -> PathBuf {
    let dir = root.join(name).join(version);
    fs::create_dir_all(&dir).expect("failed to create version directory");
    let providers = providers
        .iter()
        .map(|p| format!("{p:?}"))
        .collect::<Vec<_>>()
        .join(", ");
    let manifest = format!(
        "name = {name:?}\n\
         version = {version:?}\n\
         spec_version = {SPEC_VERSION:?}\n\
         supported_providers = [{providers}]\n"
    );

    fs::write(dir.join("plugin.toml"), manifest).expect("failed to write manifest");
    dir
}

/// Builder for a wrapper script around the mock plugin binary.
#[derive(Debug, Clone)]
pub struct MockPlugin {
    binary: PathBuf,
    env: BTreeMap<String, String>,
}

impl MockPlugin {
    /// `binary` is the mock plugin executable, typically
    /// `env!("CARGO_BIN_EXE_finfocus-mock-plugin")`.
    pub fn new(binary: impl Into<PathBuf>, name: &str) -> Self {
        let mut env = BTreeMap::new();
        env.insert("MOCK_PLUGIN_NAME".to_string(), name.to_string());
        Self {
            binary: binary.into(),
            env,
        }
    }

    pub fn env(mut self, key: &str, value: impl ToString) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn providers(self, providers: &str) -> Self {
        self.env("MOCK_PROVIDERS", providers)
    }

    pub fn currency(self, currency: &str) -> Self {
        self.env("MOCK_CURRENCY", currency)
    }

    pub fn unit_price(self, price: f64) -> Self {
        self.env("MOCK_UNIT_PRICE", price)
    }

    /// Write the wrapper as `dir/file_name`.
    pub fn write_to(&self, dir: &Path, file_name: &str) -> PathBuf {
        let mut body = String::new();
        for (key, value) in &self.env {
            body.push_str(&format!("export {key}='{}'\n", value.replace('\'', r"'\''")));
        }
        body.push_str(&format!("exec '{}' \"$@\"", self.binary.display()));
        write_script(dir, file_name, &body)
    }

    /// Install under `root` as a complete plugin: manifest plus
    /// `finfocus-plugin-<name>` wrapper. Returns the version dir.
    pub fn install(&self, root: &Path, version: &str) -> PathBuf {
        let name = &self.env["MOCK_PLUGIN_NAME"];
        let providers: Vec<&str> = self
            .env
            .get("MOCK_PROVIDERS")
            .map(|p| p.split(',').collect())
            .unwrap_or_else(|| vec!["aws"]);
        let dir = write_manifest(root, name, version, &providers);
        self.write_to(&dir, &format!("finfocus-plugin-{name}"));
        dir
    }
}

/// EC2 instance with the properties the mock plugin prices.
pub fn ec2_instance(id: &str) -> ResourceDescriptor {
    ResourceDescriptor::new(id, "aws", "aws:ec2:Instance")
        .with_property("instanceType", "t3.micro")
        .with_property("region", "us-east-1")
}

/// True when no process with `pid` exists.
#[cfg(unix)]
pub fn process_gone(pid: u32) -> bool {
    let status = std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stderr(std::process::Stdio::null())
        .status()
        .expect("failed to run kill");
    !status.success()
}
