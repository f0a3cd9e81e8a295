use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use clap::ValueEnum;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use finfocus_core::dispatcher::BatchResult;
use finfocus_core::{Dispatcher, PluginManifest, PluginRegistry, Supervisor, discover};
use finfocus_proto::{CommMode, ResourceDescriptor, TimeWindow};

use crate::config::FinfocusConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum CostOutput {
    Table,
    Json,
}

/// Discover, start every installed plugin, and hand back a dispatcher.
async fn start_fleet(config: &FinfocusConfig) -> Result<Dispatcher> {
    let report = discover(&config.plugin_dir)
        .with_context(|| format!("failed to scan {}", config.plugin_dir.display()))?;
    for error in &report.errors {
        warn!(error = %error, "ignoring plugin");
    }
    let manifests: Vec<PluginManifest> = report.latest().into_iter().cloned().collect();
    if manifests.is_empty() {
        bail!("no plugins installed in {}", config.plugin_dir.display());
    }

    let supervisor = Supervisor::new(config.supervisor.clone());
    let registry = Arc::new(PluginRegistry::new());
    let _watcher = Arc::clone(&registry).watch(supervisor.subscribe());
    let failures = registry
        .start_all(&supervisor, &manifests, CommMode::Tcp, &CancellationToken::new())
        .await;
    if registry.is_empty() {
        let reasons: Vec<String> = failures.iter().map(ToString::to_string).collect();
        bail!("no plugin could be started:\n  {}", reasons.join("\n  "));
    }
    Ok(Dispatcher::new(registry, config.dispatch.clone()))
}

/// Read a JSON array of resource descriptors.
fn load_resources(path: &Path) -> Result<Vec<ResourceDescriptor>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read resources from {}", path.display()))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("{} is not a JSON array of resource descriptors", path.display()))
}

pub async fn run_projected(
    config: &FinfocusConfig,
    resources: &Path,
    output: CostOutput,
) -> Result<()> {
    let resources = load_resources(resources)?;
    let dispatcher = start_fleet(config).await?;
    let batch = dispatcher.projected_costs(&resources).await;
    dispatcher.registry().stop_all().await;

    match output {
        CostOutput::Json => {
            let json = serde_json::to_string_pretty(&batch).context("failed to serialize costs")?;
            println!("{json}");
        }
        CostOutput::Table => print_projected(&batch),
    }
    Ok(())
}

fn print_projected(batch: &BatchResult) {
    let id_w = batch
        .resources
        .iter()
        .map(|r| r.resource_id.len())
        .max()
        .unwrap_or(8)
        .max(8);
    let plugin_w = batch
        .resources
        .iter()
        .filter_map(|r| r.winner.as_ref().map(|w| w.plugin.len()))
        .max()
        .unwrap_or(6)
        .max(6);

    println!(
        "{:<id_w$}  {:<plugin_w$}  {:<8}  {:>12}  {:>12}",
        "RESOURCE", "PLUGIN", "CURRENCY", "UNIT", "MONTHLY"
    );
    let mut totals: BTreeMap<&str, f64> = BTreeMap::new();
    for resource in &batch.resources {
        match &resource.winner {
            Some(answer) => {
                let currency = answer.cost.currency.as_str();
                *totals.entry(currency).or_default() += answer.cost.monthly_cost;
                println!(
                    "{:<id_w$}  {:<plugin_w$}  {:<8}  {:>12.4}  {:>12.2}",
                    resource.resource_id,
                    answer.plugin,
                    answer.cost.currency,
                    answer.cost.unit_price,
                    answer.cost.monthly_cost,
                );
            }
            None => {
                let reason = if resource.matched { "no answer" } else { "unmatched" };
                println!(
                    "{:<id_w$}  {:<plugin_w$}  {:<8}  {:>12}  {:>12}",
                    resource.resource_id, "-", "-", "-", reason
                );
            }
        }
        for failure in &resource.failures {
            println!("    {} [{}]: {}", failure.plugin, failure.kind, failure.message);
        }
    }

    if !totals.is_empty() {
        println!();
        for (currency, total) in totals {
            println!("Total monthly ({currency}): {total:.2}");
        }
    }
}

pub async fn run_actual(
    config: &FinfocusConfig,
    resource_id: &str,
    from: &str,
    to: &str,
    output: CostOutput,
) -> Result<()> {
    let window = TimeWindow::new(parse_instant(from)?, parse_instant(to)?);
    if !window.is_valid() {
        bail!("--from {from} must be before --to {to}");
    }

    let dispatcher = start_fleet(config).await?;
    let summary = dispatcher.actual_costs(resource_id, window).await;
    dispatcher.registry().stop_all().await;
    let summary = summary.with_context(|| format!("no actual cost for {resource_id}"))?;

    match output {
        CostOutput::Json => {
            let json = serde_json::to_string_pretty(&summary).context("failed to serialize costs")?;
            println!("{json}");
        }
        CostOutput::Table => {
            println!("Resource: {}", summary.resource_id);
            println!("  Window: {} .. {}", window.start.to_rfc3339(), window.end.to_rfc3339());
            println!();
            println!("{:<25}  {:<16}  {:>12}", "TIMESTAMP", "PLUGIN", "COST");
            for entry in &summary.results {
                println!(
                    "{:<25}  {:<16}  {:>12.2}",
                    entry.result.timestamp.to_rfc3339(),
                    entry.plugin,
                    entry.result.cost,
                );
            }
            println!();
            println!("Total ({}): {:.2}", summary.currency, summary.total);
            for failure in &summary.failures {
                println!("    {} [{}]: {}", failure.plugin, failure.kind, failure.message);
            }
        }
    }
    Ok(())
}

/// `2026-03-01` (midnight UTC) or a full RFC 3339 timestamp.
fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .with_context(|| format!("invalid date {raw:?} (expected YYYY-MM-DD or RFC 3339)"))
}
