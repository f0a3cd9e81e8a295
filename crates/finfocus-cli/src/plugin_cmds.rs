use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio_util::sync::CancellationToken;

use finfocus_core::{PluginClient, PluginProcess, Supervisor, discover};
use finfocus_proto::{CommMode, ResourceDescriptor};

use crate::config::FinfocusConfig;

/// List installed plugins, newest version of each first, then discovery errors.
pub fn run_list(config: &FinfocusConfig) -> Result<()> {
    let report = discover(&config.plugin_dir)
        .with_context(|| format!("failed to scan {}", config.plugin_dir.display()))?;

    if report.manifests.is_empty() && report.errors.is_empty() {
        println!(
            "No plugins found in {}. Install one under <name>/<version>/plugin.toml.",
            config.plugin_dir.display()
        );
        return Ok(());
    }

    let manifests = report.latest();
    if !manifests.is_empty() {
        let name_w = manifests.iter().map(|m| m.name.len()).max().unwrap_or(4).max(4);
        let version_w = manifests
            .iter()
            .map(|m| m.version.to_string().len())
            .max()
            .unwrap_or(7)
            .max(7);
        let providers: Vec<String> = manifests
            .iter()
            .map(|m| m.supported_providers.join(","))
            .collect();
        let providers_w = providers.iter().map(String::len).max().unwrap_or(9).max(9);

        println!(
            "{:<name_w$}  {:<version_w$}  {:<6}  {:<providers_w$}  BINARY",
            "NAME", "VERSION", "SPEC", "PROVIDERS"
        );
        for (manifest, providers) in manifests.iter().zip(&providers) {
            println!(
                "{:<name_w$}  {:<version_w$}  {:<6}  {:<providers_w$}  {}",
                manifest.name,
                manifest.version.to_string(),
                manifest.spec_version,
                providers,
                manifest.binary_path.display(),
            );
        }
    }

    if !report.errors.is_empty() {
        println!();
        println!("Errors:");
        for error in &report.errors {
            println!("  - [{}] {}", error.kind(), error);
        }
    }
    Ok(())
}

/// Start a plugin, print what it reports about itself, and optionally the
/// dry-run field mappings for one resource type.
pub async fn run_inspect(
    config: &FinfocusConfig,
    name: &str,
    resource_type: Option<&str>,
) -> Result<()> {
    let report = discover(&config.plugin_dir)
        .with_context(|| format!("failed to scan {}", config.plugin_dir.display()))?;
    let Some(manifest) = report.find(name) else {
        bail!("plugin {name:?} is not installed in {}", config.plugin_dir.display());
    };

    let supervisor = Supervisor::new(config.supervisor.clone());
    let process = supervisor
        .start(manifest, CommMode::Tcp, &CancellationToken::new())
        .await
        .with_context(|| format!("failed to start {}", manifest.key()))?;

    println!("Plugin: {}", manifest.name);
    println!("  Installed:  {}", manifest.version);
    println!("  Directory:  {}", manifest.dir.display());
    println!("  PID:        {}", process.pid().map_or("-".to_string(), |p| p.to_string()));
    println!("  Endpoint:   {}", process.endpoint());
    match process.info() {
        Some(info) => {
            println!("  Reports:    {} {}", info.name, info.version);
            println!("  Spec:       {}", info.spec_version);
            println!("  Providers:  {}", info.supported_providers.join(", "));
            if !info.capabilities.is_empty() {
                println!("  Capability: {}", info.capabilities.join(", "));
            }
            for (key, value) in &info.metadata {
                println!("  {key}: {value}");
            }
        }
        None => println!("  (legacy plugin: no GetPluginInfo)"),
    }

    let result = match resource_type {
        Some(resource_type) => print_field_mappings(&process, resource_type).await,
        None => Ok(()),
    };
    process.stop().await;
    result
}

async fn print_field_mappings(process: &Arc<PluginProcess>, resource_type: &str) -> Result<()> {
    // `aws:ec2:Instance` -> provider `aws`.
    let provider = resource_type.split(':').next().unwrap_or(resource_type);
    let resource =
        ResourceDescriptor::new(format!("inspect:{resource_type}"), provider, resource_type);


    let client = PluginClient::new(Arc::clone(process));
    let response = client
        .dry_run(&resource, BTreeMap::new(), Duration::from_secs(30))
        .await
        .with_context(|| format!("dry run of {resource_type} failed"))?;

    println!();
    println!("Field mappings for {resource_type}:");
    if response.field_mappings.is_empty() {
        println!("  (none)");
    } else {
        let field_w = response
            .field_mappings
            .iter()
            .map(|m| m.field_name.len())
            .max()
            .unwrap_or(5)
            .max(5);
        println!("  {:<field_w$}  {:<11}  {:<8}  CONDITION", "FIELD", "STATUS", "TYPE");
        for mapping in &response.field_mappings {
            println!(
                "  {:<field_w$}  {:<11}  {:<8}  {}",
                mapping.field_name,
                mapping.status.to_string(),
                mapping.expected_type,
                mapping.condition.as_deref().unwrap_or(""),
            );
        }
    }
    if !response.configuration_valid {
        println!();
        println!("Configuration errors:");
        for error in &response.configuration_errors {
            println!("  - {error}");
        }
    }
    Ok(())
}
