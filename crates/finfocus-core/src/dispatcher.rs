//! Concurrent fan-out of cost queries across the registry.
//!
//! Per-plugin failures are recorded against the resource they concern; a
//! batch never fails because one plugin did. Precedence is declaration
//! order: the answer of the earliest-declared plugin whose call succeeded
//! wins, independent of which plugin answered first.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info};

use finfocus_proto::{
    ActualCostResult, Method, ProjectedCost, Recommendation, ResourceDescriptor, TimeWindow,
};

use crate::adapter::PluginClient;
use crate::error::{ErrorKind, HostError};
use crate::registry::PluginRegistry;
use crate::supervisor::PluginProcess;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Budget of a single plugin call.
    pub per_call_timeout: Duration,
    /// Umbrella deadline of a whole batch.
    pub deadline: Duration,
    /// Calls in flight at once across all plugins.
    pub max_concurrency: usize,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            per_call_timeout: Duration::from_secs(10),
            deadline: Duration::from_secs(30),
            max_concurrency: 8,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// One plugin's failure for one resource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginFailure {
    pub plugin: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl PluginFailure {
    fn new(plugin: &str, error: &HostError) -> Self {
        Self {
            plugin: plugin.to_string(),
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CostAnswer {
    pub plugin: String,
    pub cost: ProjectedCost,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceCost {
    pub resource_id: String,
    /// Whether any live plugin claims the resource.
    pub matched: bool,
    pub winner: Option<CostAnswer>,
    pub failures: Vec<PluginFailure>,
}

/// Projected costs of a batch, in input order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchResult {
    pub resources: Vec<ResourceCost>,
}

impl BatchResult {
    pub fn get(&self, resource_id: &str) -> Option<&ResourceCost> {
        self.resources.iter().find(|r| r.resource_id == resource_id)
    }

    /// Ids of resources no plugin claimed.
    pub fn unmatched(&self) -> Vec<&str> {
        self.resources
            .iter()
            .filter(|r| !r.matched)
            .map(|r| r.resource_id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginRecommendation {
    pub plugin: String,
    pub recommendation: Recommendation,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceRecommendations {
    pub resource_id: String,
    pub matched: bool,
    pub recommendations: Vec<PluginRecommendation>,
    pub failures: Vec<PluginFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginActualCost {
    pub plugin: String,
    pub result: ActualCostResult,
}

/// Aggregated spend for one resource in a single currency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActualCostSummary {
    pub resource_id: String,
    pub currency: String,
    pub total: f64,
    pub results: Vec<PluginActualCost>,
    /// Plugins that were asked and did not answer.
    pub failures: Vec<PluginFailure>,
}

/// Sum per-plugin answers, refusing to mix currencies.
pub fn aggregate_actual(
    resource_id: &str,
    answers: Vec<(String, Vec<ActualCostResult>)>,
    failures: Vec<PluginFailure>,
) -> Result<ActualCostSummary, HostError> {
    let results: Vec<PluginActualCost> = answers
        .into_iter()
        .flat_map(|(plugin, results)| {
            results.into_iter().map(move |result| PluginActualCost {
                plugin: plugin.clone(),
                result,
            })
        })
        .collect();

    let currencies: BTreeSet<&str> = results.iter().map(|r| r.result.currency.as_str()).collect();
    let currency = match currencies.len() {
        0 => {
            return Err(HostError::NoData {
                plugin: "*".to_string(),
                message: format!("no plugin reported actual cost for {resource_id}"),
            });
        }
        1 => currencies.into_iter().next().unwrap_or_default().to_string(),
        _ => {
            return Err(HostError::MixedCurrencies {
                resource_id: resource_id.to_string(),
                currencies: currencies.into_iter().map(str::to_string).collect(),
            });
        }
    };

    let total = results.iter().map(|r| r.result.cost).sum();
    Ok(ActualCostSummary {
        resource_id: resource_id.to_string(),
        currency,
        total,
        results,
        failures,
    })
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

pub struct Dispatcher {
    registry: Arc<PluginRegistry>,
    config: DispatchConfig,
    permits: Semaphore,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.config)
            .field("plugins", &self.registry.len())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(registry: Arc<PluginRegistry>, config: DispatchConfig) -> Self {
        let permits = Semaphore::new(config.max_concurrency.max(1));
        Self {
            registry,
            config,
            permits,
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Projected cost of every resource from every matching Ready plugin.
    pub async fn projected_costs(&self, resources: &[ResourceDescriptor]) -> BatchResult {
        let deadline = Instant::now() + self.config.deadline;
        let plugins = self.registry.ready();
        info!(resources = resources.len(), plugins = plugins.len(), "dispatching projected costs");

        let per_resource = resources.iter().map(|resource| {
            let matching = matching(&plugins, resource);
            async move {
                let calls = matching.iter().map(|process| {
                    let method = Method::GetProjectedCost;
                    self.bounded(deadline, process, method, move |client, budget| async move {
                        client.get_projected_cost(resource, budget).await
                    })
                });
                let outcomes = join_all(calls).await;

                let mut winner = None;
                let mut failures = Vec::new();
                for (process, outcome) in matching.iter().zip(outcomes) {
                    match outcome {
                        Ok(cost) if winner.is_none() => {
                            winner = Some(CostAnswer {
                                plugin: process.name().to_string(),
                                cost,
                            });
                        }
                        Ok(_) => debug!(
                            plugin = process.name(),
                            resource = %resource.id,
                            "answer shadowed by earlier plugin"
                        ),
                        Err(e) => failures.push(PluginFailure::new(process.name(), &e)),
                    }
                }
                ResourceCost {
                    resource_id: resource.id.clone(),
                    matched: !matching.is_empty(),
                    winner,
                    failures,
                }
            }
        });

        BatchResult {
            resources: join_all(per_resource).await,
        }
    }

    /// Recommendations of every matching Ready plugin, merged in declaration order.
    pub async fn recommendations(
        &self,
        resources: &[ResourceDescriptor],
    ) -> Vec<ResourceRecommendations> {
        let deadline = Instant::now() + self.config.deadline;
        let plugins = self.registry.ready();

        let per_resource = resources.iter().map(|resource| {
            let matching = matching(&plugins, resource);
            async move {
                let calls = matching.iter().map(|process| {
                    let method = Method::GetRecommendations;
                    self.bounded(deadline, process, method, move |client, budget| async move {
                        client.get_recommendations(resource, budget).await
                    })
                });
                let outcomes = join_all(calls).await;

                let mut recommendations = Vec::new();
                let mut failures = Vec::new();
                for (process, outcome) in matching.iter().zip(outcomes) {
                    match outcome {
                        Ok(items) => recommendations.extend(items.into_iter().map(|recommendation| {
                            PluginRecommendation {
                                plugin: process.name().to_string(),
                                recommendation,
                            }
                        })),
                        Err(e) => failures.push(PluginFailure::new(process.name(), &e)),
                    }
                }
                ResourceRecommendations {
                    resource_id: resource.id.clone(),
                    matched: !matching.is_empty(),
                    recommendations,
                    failures,
                }
            }
        });

        join_all(per_resource).await
    }

    /// Actual spend of one resource from every Ready plugin, aggregated.
    pub async fn actual_costs(
        &self,
        resource_id: &str,
        window: TimeWindow,
    ) -> Result<ActualCostSummary, HostError> {
        let deadline = Instant::now() + self.config.deadline;
        let plugins = self.registry.ready();

        let calls = plugins.iter().map(|process| {
            let method = Method::GetActualCost;
            self.bounded(deadline, process, method, move |client, budget| async move {
                client.get_actual_cost(resource_id, window, budget).await
            })
        });
        let outcomes = join_all(calls).await;

        let mut answers = Vec::new();
        let mut failures = Vec::new();
        let mut unreachable = None;
        for (process, outcome) in plugins.iter().zip(outcomes) {
            match outcome {
                Ok(results) => answers.push((process.name().to_string(), results)),
                Err(e) => {
                    debug!(plugin = process.name(), error = %e, "no actual cost from plugin");
                    failures.push(PluginFailure::new(process.name(), &e));
                    let could_not_answer =
                        e.is_infrastructure() || e.kind() == ErrorKind::Timeout;
                    if unreachable.is_none() && could_not_answer {
                        unreachable = Some(e);
                    }
                }
            }
        }

        // Nobody had data: a plugin that could not be asked outranks the
        // ones that said they had none.
        match aggregate_actual(resource_id, answers, failures) {
            Err(e) if e.kind() == ErrorKind::NoData => Err(unreachable.unwrap_or(e)),
            other => other,
        }
    }

    /// Run one call under a concurrency permit and the remaining budget.
    async fn bounded<'a, T, F, Fut>(
        &'a self,
        deadline: Instant,
        process: &'a Arc<PluginProcess>,
        method: Method,
        call: F,
    ) -> Result<T, HostError>
    where
        F: FnOnce(PluginClient, Duration) -> Fut,
        Fut: Future<Output = Result<T, HostError>>,
    {
        let timed_out = || HostError::Timeout {
            plugin: process.name().to_string(),
            method,
            timeout: self.config.deadline,
        };

        let _permit = match tokio::time::timeout_at(deadline, self.permits.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_closed)) => {
                return Err(HostError::unavailable(process.name(), "dispatcher closed"));
            }
            Err(_) => return Err(timed_out()),
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(timed_out());
        }
        let budget = self.config.per_call_timeout.min(remaining);
        call(PluginClient::new(Arc::clone(process)), budget).await
    }
}

fn matching(
    plugins: &[Arc<PluginProcess>],
    resource: &ResourceDescriptor,
) -> Vec<Arc<PluginProcess>> {
    plugins
        .iter()
        .filter(|p| p.manifest().matches(resource))
        .cloned()
        .collect()
}
