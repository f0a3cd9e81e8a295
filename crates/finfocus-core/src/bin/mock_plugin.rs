//! Configurable cost plugin used by the host's integration tests and as a
//! reference for plugin authors.
//!
//! Behaviour is driven by `MOCK_*` environment variables:
//!
//! | variable                        | default                                 |
//! |---------------------------------|-----------------------------------------|
//! | `MOCK_PLUGIN_NAME`              | `mock`                                  |
//! | `MOCK_PLUGIN_VERSION`           | `0.1.0`                                 |
//! | `MOCK_SPEC_VERSION`             | host spec version                       |
//! | `MOCK_PROVIDERS`                | `aws`                                   |
//! | `MOCK_CURRENCY`                 | `USD`                                   |
//! | `MOCK_UNIT_PRICE`               | `0.0104`                                |
//! | `MOCK_CAPABILITIES`             | `actual_cost,recommendations,dry_run`   |
//! | `MOCK_ACTUAL_RESOURCES`         | `urn:finfocus:conformance:sample`       |
//! | `MOCK_PROJECTED_DELAY_MS`       | `0`                                     |
//! | `MOCK_RECOMMENDATIONS_DELAY_MS` | `0`                                     |
//! | `MOCK_CRASH_ON`                 | unset; a method name such as `dry_run`  |
//! | `MOCK_CRASH_DELAY_MS`           | `0`                                     |
//! | `MOCK_NO_PLUGIN_INFO`           | unset; when set, behaves as a legacy plugin |

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;

use finfocus_proto::{
    ActualCostQuery, ActualCostResult, CostSource, DryRunRequest, DryRunResponse, FieldMapping,
    FieldSupportStatus, Method, PluginInfo, ProjectedCost, Recommendation, ResourceDescriptor,
    RpcError, SPEC_VERSION,
};

const HOURS_PER_MONTH: f64 = 730.0;
const MAX_ACTUAL_DAYS: i64 = 31;

struct MockPlugin {
    name: String,
    version: String,
    spec_version: String,
    providers: Vec<String>,
    currency: String,
    unit_price: f64,
    capabilities: Vec<String>,
    actual_resources: Vec<String>,
    projected_delay: Duration,
    recommendations_delay: Duration,
    crash_on: Option<Method>,
    crash_delay: Duration,
    legacy: bool,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn list_var(name: &str, default: &str) -> Vec<String> {
    var_or(name, default)
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn millis_var(name: &str) -> anyhow::Result<Duration> {
    let raw = var_or(name, "0");
    let ms: u64 = raw
        .parse()
        .with_context(|| format!("{name}={raw:?} is not a number of milliseconds"))?;
    Ok(Duration::from_millis(ms))
}

impl MockPlugin {
    fn from_env() -> anyhow::Result<Self> {
        let unit_price = var_or("MOCK_UNIT_PRICE", "0.0104");
        let crash_on = match std::env::var("MOCK_CRASH_ON") {
            Ok(method) => Some(method.parse::<Method>().context("invalid MOCK_CRASH_ON")?),
            Err(_) => None,
        };
        Ok(Self {
            name: var_or("MOCK_PLUGIN_NAME", "mock"),
            version: var_or("MOCK_PLUGIN_VERSION", "0.1.0"),
            spec_version: var_or("MOCK_SPEC_VERSION", SPEC_VERSION),
            providers: list_var("MOCK_PROVIDERS", "aws"),
            currency: var_or("MOCK_CURRENCY", "USD"),
            unit_price: unit_price
                .parse()
                .with_context(|| format!("MOCK_UNIT_PRICE={unit_price:?} is not a number"))?,
            capabilities: list_var("MOCK_CAPABILITIES", "actual_cost,recommendations,dry_run"),
            actual_resources: list_var("MOCK_ACTUAL_RESOURCES", "urn:finfocus:conformance:sample"),
            projected_delay: millis_var("MOCK_PROJECTED_DELAY_MS")?,
            recommendations_delay: millis_var("MOCK_RECOMMENDATIONS_DELAY_MS")?,
            crash_on,
            crash_delay: millis_var("MOCK_CRASH_DELAY_MS")?,
            legacy: std::env::var_os("MOCK_NO_PLUGIN_INFO").is_some(),
        })
    }

    async fn maybe_crash(&self, method: Method) {
        if self.crash_on == Some(method) {
            tokio::time::sleep(self.crash_delay).await;
            tracing::error!(%method, "crashing on request");
            std::process::exit(101);
        }
    }

    fn check_resource(&self, resource: &ResourceDescriptor) -> Result<(), RpcError> {
        if resource.resource_type.trim().is_empty() {
            return Err(RpcError::invalid_argument("resource_type must not be empty"));
        }
        if !self.providers.iter().any(|p| p == "*" || *p == resource.provider) {
            return Err(RpcError::not_supported(format!(
                "provider {:?} is not supported by {}",
                resource.provider, self.name
            )));
        }
        Ok(())
    }

    fn has(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

#[async_trait]
impl CostSource for MockPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    async fn plugin_info(&self) -> Result<PluginInfo, RpcError> {
        self.maybe_crash(Method::GetPluginInfo).await;
        if self.legacy {
            return Err(RpcError::unimplemented(Method::GetPluginInfo));
        }
        Ok(PluginInfo {
            name: self.name.clone(),
            version: self.version.clone(),
            spec_version: self.spec_version.clone(),
            supported_providers: self.providers.clone(),
            metadata: BTreeMap::from([("kind".to_string(), "mock".to_string())]),
            capabilities: self.capabilities.clone(),
        })
    }

    async fn projected_cost(
        &self,
        resource: &ResourceDescriptor,
    ) -> Result<ProjectedCost, RpcError> {
        self.maybe_crash(Method::GetProjectedCost).await;
        tokio::time::sleep(self.projected_delay).await;
        self.check_resource(resource)?;
        Ok(ProjectedCost {
            currency: self.currency.clone(),
            unit_price: self.unit_price,
            monthly_cost: self.unit_price * HOURS_PER_MONTH,
            billing_detail: format!("{} on-demand", self.name),
        })
    }

    async fn actual_cost(
        &self,
        query: &ActualCostQuery,
    ) -> Result<Vec<ActualCostResult>, RpcError> {
        self.maybe_crash(Method::GetActualCost).await;
        if !self.has("actual_cost") {
            return Err(RpcError::unimplemented(Method::GetActualCost));
        }
        if !query.window.is_valid() {
            return Err(RpcError::invalid_argument("window start must precede its end"));
        }
        if !self.actual_resources.iter().any(|id| *id == query.resource_id) {
            return Err(RpcError::no_data(format!("no spend recorded for {}", query.resource_id)));
        }

        let days = (query.window.end - query.window.start).num_days().clamp(1, MAX_ACTUAL_DAYS);
        let daily = self.unit_price * 24.0;
        Ok((0..days)
            .map(|day| ActualCostResult {
                timestamp: query.window.start + ChronoDuration::days(day),
                currency: self.currency.clone(),
                cost: daily,
                source: self.name.clone(),
            })
            .collect())
    }

    async fn recommendations(
        &self,
        resource: &ResourceDescriptor,
    ) -> Result<Vec<Recommendation>, RpcError> {
        self.maybe_crash(Method::GetRecommendations).await;
        tokio::time::sleep(self.recommendations_delay).await;
        if !self.has("recommendations") {
            return Ok(Vec::new());
        }
        self.check_resource(resource)?;
        Ok(vec![Recommendation {
            id: format!("{}:rightsize:{}", self.name, resource.id),
            category: "rightsizing".to_string(),
            description: format!("Downsize {} to the next smaller instance size", resource.id),
            estimated_savings: Some(self.unit_price * HOURS_PER_MONTH / 2.0),
            currency: Some(self.currency.clone()),
        }])
    }

    async fn dry_run(&self, request: &DryRunRequest) -> Result<DryRunResponse, RpcError> {
        self.maybe_crash(Method::DryRun).await;
        if !self.has("dry_run") {
            return Err(RpcError::unimplemented(Method::DryRun));
        }
        self.check_resource(&request.resource)?;

        let mut field_mappings = vec![
            FieldMapping {
                field_name: "instanceType".to_string(),
                status: FieldSupportStatus::Supported,
                condition: None,
                expected_type: "string".to_string(),
            },
            FieldMapping {
                field_name: "region".to_string(),
                status: FieldSupportStatus::Supported,
                condition: None,
                expected_type: "string".to_string(),
            },
            FieldMapping {
                field_name: "ebsOptimized".to_string(),
                status: FieldSupportStatus::Conditional,
                condition: Some(
                    "only priced for instance types without EBS optimization by default"
                        .to_string(),
                ),

                expected_type: "boolean".to_string(),
            },
        ];
        if request.simulation.contains_key("usage_hours") {
            field_mappings.push(FieldMapping {
                field_name: "usage_hours".to_string(),
                status: FieldSupportStatus::Dynamic,
                condition: None,
                expected_type: "number".to_string(),
            });
        }

        let configuration_errors: Vec<String> = ["instanceType", "region"]
            .into_iter()
            .filter(|key| request.resource.string_property(key).is_none())
            .map(|key| format!("missing required property {key}"))
            .collect();
        Ok(DryRunResponse {
            field_mappings,
            configuration_valid: configuration_errors.is_empty(),
            configuration_errors,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout belongs to the protocol.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let plugin = MockPlugin::from_env()?;
    tracing::info!(name = %plugin.name, version = %plugin.version, "mock plugin starting");
    finfocus_proto::serve(Arc::new(plugin))
        .await
        .context("serving the host")?;
    Ok(())
}
