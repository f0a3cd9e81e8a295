//! The declared conformance battery.
//!
//! Each case is a plain function from a [`CaseContext`] to a boxed future;
//! the runner owns ordering, budgets, and preconditions.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use futures::FutureExt;
use futures::future::BoxFuture;

use finfocus_proto::{PluginInfo, PropertyValue, ResourceDescriptor, TimeWindow, spec_major};

use crate::adapter::PluginClient;
use crate::error::{ErrorKind, HostError};

use super::Category;

/// Presence of this variable enables cases that need real cloud credentials.
pub const CREDENTIALS_ENV: &str = "FINFOCUS_CONFORMANCE_CREDENTIALS";

/// Provider no plugin is expected to support.
const UNKNOWN_PROVIDER: &str = "finfocus-conformance-unknown";

/// Resource id no plugin is expected to have spend for.
const UNKNOWN_RESOURCE_ID: &str = "finfocus-conformance/does-not-exist";

const BACK_TO_BACK_CALLS: usize = 5;

/// What must hold for a case to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    None,
    /// Environment variable must be set.
    Env(&'static str),
    /// `PluginInfo.capabilities` must list this capability.
    Capability(&'static str),
}

impl Precondition {
    /// `None` when satisfied, otherwise the skip reason.
    pub(crate) fn unmet(self, info: Option<&PluginInfo>) -> Option<String> {
        match self {
            Self::None => None,
            Self::Env(var) => match std::env::var_os(var) {
                Some(_) => None,
                None => Some(format!("requires environment variable {var}")),
            },
            Self::Capability(capability) => match info {
                Some(info) if info.has_capability(capability) => None,
                _ => Some(format!("plugin does not advertise capability {capability:?}")),
            },
        }
    }
}

/// Everything a case may touch.
#[derive(Debug, Clone)]
pub(crate) struct CaseContext {
    pub(crate) client: PluginClient,
    pub(crate) info: Option<PluginInfo>,
    pub(crate) resource: ResourceDescriptor,
    /// Budget for each individual call the case makes.
    pub(crate) budget: Duration,
}

#[derive(Debug)]
pub(crate) enum CaseFailure {
    Assertion(String),
    Unexpected(HostError),
}

impl From<HostError> for CaseFailure {
    fn from(error: HostError) -> Self {
        Self::Unexpected(error)
    }
}

pub(crate) type CaseResult = Result<(), CaseFailure>;

pub struct TestCase {
    pub name: &'static str,
    pub category: Category,
    pub precondition: Precondition,
    pub(crate) run: fn(CaseContext) -> BoxFuture<'static, CaseResult>,
}

impl std::fmt::Debug for TestCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestCase")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("precondition", &self.precondition)
            .finish()
    }
}

/// The EC2 instance used by cost cases unless the caller supplies one.
pub fn default_sample_resource() -> ResourceDescriptor {
    ResourceDescriptor::new("urn:finfocus:conformance:sample", "aws", "aws:ec2:Instance")
        .with_property("instanceType", "t3.micro")
        .with_property("region", "us-east-1")
}

/// Every case in declared order.
pub fn battery() -> Vec<TestCase> {
    use Category::*;
    use Precondition::{Capability, Env};

    vec![
        case("identity_responds", Protocol, Precondition::None, |c| identity_responds(c).boxed()),
        case("identity_is_stable", Protocol, Precondition::None, |c| identity_is_stable(c).boxed()),
        case("plugin_info_metadata", Protocol, Precondition::None, |c| {
            plugin_info_metadata(c).boxed()
        }),
        case("spec_version_compatible", Protocol, Precondition::None, |c| {
            spec_version_compatible(c).boxed()
        }),
        case("back_to_back_calls", Protocol, Precondition::None, |c| back_to_back_calls(c).boxed()),
        case("projected_cost_shape", Cost, Precondition::None, |c| projected_cost_shape(c).boxed()),
        case("projected_cost_deterministic", Cost, Precondition::None, |c| {
            projected_cost_deterministic(c).boxed()
        }),
        case("actual_cost_with_credentials", Cost, Env(CREDENTIALS_ENV), |c| {
            actual_cost_with_credentials(c).boxed()
        }),
        case("actual_cost_rejects_inverted_window", Cost, Capability("actual_cost"), |c| {
            actual_cost_rejects_inverted_window(c).boxed()
        }),
        case("unsupported_provider_rejected", Error, Precondition::None, |c| {
            unsupported_provider_rejected(c).boxed()
        }),
        case("empty_resource_type_rejected", Error, Precondition::None, |c| {
            empty_resource_type_rejected(c).boxed()
        }),
        case("unknown_resource_has_no_data", Error, Capability("actual_cost"), |c| {
            unknown_resource_has_no_data(c).boxed()
        }),
        case("recommendations_shape", Recommendation, Capability("recommendations"), |c| {
            recommendations_shape(c).boxed()
        }),
        case(
            "recommendation_savings_non_negative",
            Recommendation,
            Capability("recommendations"),
            |c| recommendation_savings_non_negative(c).boxed(),
        ),
        case("dry_run_field_mappings", DryRun, Capability("dry_run"), |c| {
            dry_run_field_mappings(c).boxed()
        }),
        case("dry_run_conditional_mappings_have_conditions", DryRun, Capability("dry_run"), |c| {
            dry_run_conditional_mappings_have_conditions(c).boxed()
        }),
        case("dry_run_rejects_invalid_resource", DryRun, Capability("dry_run"), |c| {
            dry_run_rejects_invalid_resource(c).boxed()
        }),
    ]
}

fn case(
    name: &'static str,
    category: Category,
    precondition: Precondition,
    run: fn(CaseContext) -> BoxFuture<'static, CaseResult>,
) -> TestCase {
    TestCase {
        name,
        category,
        precondition,
        run,
    }
}

// ---------------------------------------------------------------------------
// Assertions
// ---------------------------------------------------------------------------

fn ensure(condition: bool, message: impl FnOnce() -> String) -> CaseResult {
    if condition {
        Ok(())
    } else {
        Err(CaseFailure::Assertion(message()))
    }
}

/// The call must fail with exactly `expected`.
fn expect_error<T: std::fmt::Debug>(
    outcome: Result<T, HostError>,
    expected: ErrorKind,
) -> CaseResult {
    match outcome {
        Ok(value) => Err(CaseFailure::Assertion(format!(
            "expected {expected}, plugin answered {value:?}"
        ))),
        Err(e) if e.kind() == expected => Ok(()),
        Err(e) if e.is_infrastructure() => Err(CaseFailure::Unexpected(e)),
        Err(e) => Err(CaseFailure::Assertion(format!(
            "expected {expected}, got {}: {e}",
            e.kind()
        ))),
    }
}

fn is_currency_code(code: &str) -> bool {
    code.len() == 3 && code.bytes().all(|b| b.is_ascii_uppercase())
}

fn last_day() -> TimeWindow {
    let end = Utc::now();
    TimeWindow::new(end - ChronoDuration::days(1), end)
}

// ---------------------------------------------------------------------------
// protocol
// ---------------------------------------------------------------------------

async fn identity_responds(ctx: CaseContext) -> CaseResult {
    let name = ctx.client.identity(ctx.budget).await?;
    ensure(!name.trim().is_empty(), || "Identity returned an empty name".to_string())
}

async fn identity_is_stable(ctx: CaseContext) -> CaseResult {
    let first = ctx.client.identity(ctx.budget).await?;
    let second = ctx.client.identity(ctx.budget).await?;
    ensure(first == second, || format!("Identity changed between calls: {first:?} then {second:?}"))
}

async fn plugin_info_metadata(ctx: CaseContext) -> CaseResult {
    let info = match ctx.client.get_plugin_info(ctx.budget).await {
        Ok(info) => info,
        Err(HostError::NotSupported { .. }) => {
            return Err(CaseFailure::Assertion("GetPluginInfo is not implemented".to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    ensure(!info.name.trim().is_empty(), || "PluginInfo.name is empty".to_string())?;
    ensure(!info.version.trim().is_empty(), || "PluginInfo.version is empty".to_string())?;
    ensure(!info.supported_providers.is_empty(), || {
        "PluginInfo.supported_providers is empty".to_string()
    })
}

async fn spec_version_compatible(ctx: CaseContext) -> CaseResult {
    let Some(info) = ctx.info else {
        return Err(CaseFailure::Assertion("plugin does not report a spec version".to_string()));
    };
    let host = finfocus_proto::SPEC_VERSION;
    ensure(spec_major(&info.spec_version) == spec_major(host), || {
        format!("plugin spec version {} is incompatible with host {host}", info.spec_version)
    })
}

async fn back_to_back_calls(ctx: CaseContext) -> CaseResult {
    let expected = ctx.client.identity(ctx.budget).await?;
    for call in 1..BACK_TO_BACK_CALLS {
        let name = ctx.client.identity(ctx.budget).await?;
        ensure(name == expected, || {
            format!("call {call} returned {name:?}, expected {expected:?}")
        })?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// cost
// ---------------------------------------------------------------------------

async fn projected_cost_shape(ctx: CaseContext) -> CaseResult {
    let cost = ctx.client.get_projected_cost(&ctx.resource, ctx.budget).await?;
    ensure(is_currency_code(&cost.currency), || {
        format!("currency {:?} is not an ISO 4217 code", cost.currency)
    })?;
    ensure(cost.unit_price.is_finite() && cost.unit_price >= 0.0, || {
        format!("unit_price {} is negative or not finite", cost.unit_price)
    })?;
    ensure(cost.monthly_cost.is_finite() && cost.monthly_cost >= 0.0, || {
        format!("monthly_cost {} is negative or not finite", cost.monthly_cost)
    })
}

async fn projected_cost_deterministic(ctx: CaseContext) -> CaseResult {
    let first = ctx.client.get_projected_cost(&ctx.resource, ctx.budget).await?;
    let second = ctx.client.get_projected_cost(&ctx.resource, ctx.budget).await?;
    ensure(first == second, || format!("answers differ: {first:?} then {second:?}"))
}

async fn actual_cost_with_credentials(ctx: CaseContext) -> CaseResult {
    let window = last_day();
    let results = match ctx.client.get_actual_cost(&ctx.resource.id, window, ctx.budget).await {
        Ok(results) => results,
        // An account without spend for the sample is still conformant.
        Err(HostError::NoData { .. }) => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    for result in &results {
        ensure(is_currency_code(&result.currency), || {
            format!("currency {:?} is not an ISO 4217 code", result.currency)
        })?;
        ensure(result.cost.is_finite() && result.cost >= 0.0, || {
            format!("cost {} is negative or not finite", result.cost)
        })?;
    }
    Ok(())
}

async fn actual_cost_rejects_inverted_window(ctx: CaseContext) -> CaseResult {
    let valid = last_day();
    let inverted = TimeWindow::new(valid.end, valid.start);
    expect_error(
        ctx.client.get_actual_cost(&ctx.resource.id, inverted, ctx.budget).await,
        ErrorKind::InvalidArgument,
    )
}

// ---------------------------------------------------------------------------
// error
// ---------------------------------------------------------------------------

async fn unsupported_provider_rejected(ctx: CaseContext) -> CaseResult {
    let mut resource = ctx.resource.clone();
    resource.provider = UNKNOWN_PROVIDER.to_string();
    expect_error(
        ctx.client.get_projected_cost(&resource, ctx.budget).await,
        ErrorKind::NotSupported,
    )
}

async fn empty_resource_type_rejected(ctx: CaseContext) -> CaseResult {
    let mut resource = ctx.resource.clone();
    resource.resource_type = String::new();
    expect_error(
        ctx.client.get_projected_cost(&resource, ctx.budget).await,
        ErrorKind::InvalidArgument,
    )
}

async fn unknown_resource_has_no_data(ctx: CaseContext) -> CaseResult {
    expect_error(
        ctx.client.get_actual_cost(UNKNOWN_RESOURCE_ID, last_day(), ctx.budget).await,
        ErrorKind::NoData,
    )
}

// ---------------------------------------------------------------------------
// recommendation
// ---------------------------------------------------------------------------

async fn recommendations_shape(ctx: CaseContext) -> CaseResult {
    let recommendations = ctx.client.get_recommendations(&ctx.resource, ctx.budget).await?;
    for rec in &recommendations {
        ensure(!rec.id.trim().is_empty(), || "recommendation without an id".to_string())?;
        ensure(!rec.description.trim().is_empty(), || {
            format!("recommendation {} has no description", rec.id)
        })?;
    }
    Ok(())
}

async fn recommendation_savings_non_negative(ctx: CaseContext) -> CaseResult {
    let recommendations = ctx.client.get_recommendations(&ctx.resource, ctx.budget).await?;
    for rec in &recommendations {
        if let Some(savings) = rec.estimated_savings {
            ensure(savings.is_finite() && savings >= 0.0, || {
                format!("recommendation {} claims savings of {savings}", rec.id)
            })?;
            ensure(rec.currency.as_deref().is_some_and(is_currency_code), || {
                format!("recommendation {} states savings without a currency", rec.id)
            })?;
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// dryrun
// ---------------------------------------------------------------------------

async fn dry_run_field_mappings(ctx: CaseContext) -> CaseResult {
    let response = ctx.client.dry_run(&ctx.resource, BTreeMap::new(), ctx.budget).await?;
    ensure(!response.field_mappings.is_empty(), || {
        "DryRun returned no field mappings".to_string()
    })?;
    for mapping in &response.field_mappings {
        ensure(!mapping.field_name.trim().is_empty(), || {
            "field mapping without a name".to_string()
        })?;

    }
    ensure(response.configuration_valid || !response.configuration_errors.is_empty(), || {
        "configuration marked invalid without any configuration errors".to_string()
    })
}

async fn dry_run_conditional_mappings_have_conditions(ctx: CaseContext) -> CaseResult {
    let simulation = BTreeMap::from([("usage_hours".to_string(), PropertyValue::Number(730.0))]);
    let response = ctx.client.dry_run(&ctx.resource, simulation, ctx.budget).await?;
    for mapping in &response.field_mappings {
        if mapping.status == finfocus_proto::FieldSupportStatus::Conditional {
            ensure(mapping.condition.as_deref().is_some_and(|c| !c.trim().is_empty()), || {
                format!("CONDITIONAL mapping {} carries no condition", mapping.field_name)
            })?;
        }
    }
    Ok(())
}

async fn dry_run_rejects_invalid_resource(ctx: CaseContext) -> CaseResult {
    let mut resource = ctx.resource.clone();
    resource.resource_type = String::new();
    expect_error(
        ctx.client.dry_run(&resource, BTreeMap::new(), ctx.budget).await,
        ErrorKind::InvalidArgument,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn battery_names_are_unique_and_ordered_by_category() {
        let cases = battery();
        let mut names: Vec<_> = cases.iter().map(|c| c.name).collect();
        let len = names.len();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), len);

        let categories: Vec<_> = cases.iter().map(|c| c.category).collect();
        let mut sorted = categories.clone();
        sorted.sort();
        assert_eq!(categories, sorted, "cases must be declared grouped in category order");
    }

    #[test]
    fn capability_precondition_needs_plugin_info() {
        let pre = Precondition::Capability("dry_run");
        assert!(pre.unmet(None).is_some());

        let info = PluginInfo {
            name: "p".into(),
            version: "1.0.0".into(),
            spec_version: "1.0.0".into(),
            supported_providers: vec!["aws".into()],
            metadata: Default::default(),
            capabilities: vec!["dry_run".into()],
        };
        assert!(pre.unmet(Some(&info)).is_none());
        assert!(Precondition::Capability("actual_cost").unmet(Some(&info)).is_some());
        assert!(Precondition::None.unmet(None).is_none());
    }

    #[test]
    fn env_precondition_reports_variable_name() {
        let reason = Precondition::Env("FINFOCUS_TEST_SURELY_UNSET_VARIABLE").unmet(None).unwrap();
        assert!(reason.contains("FINFOCUS_TEST_SURELY_UNSET_VARIABLE"));
    }

    #[test]
    fn currency_codes_are_three_upper_letters() {
        assert!(is_currency_code("USD"));
        assert!(!is_currency_code("usd"));
        assert!(!is_currency_code("US"));
    }

    #[test]
    fn expect_error_distinguishes_wrong_kind() {
        let wrong: Result<(), HostError> = Err(HostError::NoData {
            plugin: "p".into(),
            message: "none".into(),
        });
        assert!(matches!(
            expect_error(wrong, ErrorKind::InvalidArgument),
            Err(CaseFailure::Assertion(_))
        ));
        let ok: Result<u32, HostError> = Ok(1);
        assert!(matches!(expect_error(ok, ErrorKind::NoData), Err(CaseFailure::Assertion(_))));
    }
}
