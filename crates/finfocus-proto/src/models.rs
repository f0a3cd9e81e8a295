use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Property bag
// ---------------------------------------------------------------------------

/// A schema-free value inside a resource's property bag.
///
/// Plan data is arbitrary JSON, so properties are kept as a tagged tree
/// instead of a typed struct. Accessors perform explicit coercions:
///
/// - every JSON number decodes as `f64`, integers included;
/// - [`PropertyValue::as_f64`] also accepts strings holding a number;
/// - [`PropertyValue::as_bool`] also accepts the strings `"true"` and `"false"`;
/// - [`PropertyValue::as_str`] only accepts strings (numbers are not stringified).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<PropertyValue>),
    Map(BTreeMap<String, PropertyValue>),
}

impl PropertyValue {
    /// Borrow the string content, if this is a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Numeric view: numbers as-is, numeric strings parsed.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Boolean view: booleans as-is, `"true"`/`"false"` strings parsed.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::String(s) => match s.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[PropertyValue]> {
        match self {
            Self::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, PropertyValue>> {
        match self {
            Self::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

impl From<&str> for PropertyValue {
    fn from(s: &str) -> Self {
        Self::String(s.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<f64> for PropertyValue {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for PropertyValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

// ---------------------------------------------------------------------------
// Resource descriptor
// ---------------------------------------------------------------------------

/// One infrastructure resource as handed to plugins.
///
/// The host treats descriptors as opaque: it reads `provider` and
/// `resource_type` for routing and never mutates the property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Stable identity of the resource (URN or plan address).
    pub id: String,
    /// Cloud provider, e.g. `aws`.
    pub provider: String,
    /// Provider-specific type token, e.g. `aws:ec2:Instance`.
    pub resource_type: String,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertyValue>,
}

impl ResourceDescriptor {
    pub fn new(
        id: impl Into<String>,
        provider: impl Into<String>,
        resource_type: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            provider: provider.into(),
            resource_type: resource_type.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with_property(
        mut self,
        key: impl Into<String>,
        value: impl Into<PropertyValue>,
    ) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Look up a property by dotted path (`tags.env` walks into the `tags` map).
    pub fn property(&self, path: &str) -> Option<&PropertyValue> {
        let mut segments = path.split('.');
        let first = segments.next()?;
        let mut current = self.properties.get(first)?;
        for segment in segments {
            current = current.as_map()?.get(segment)?;
        }
        Some(current)
    }

    pub fn string_property(&self, path: &str) -> Option<&str> {
        self.property(path).and_then(PropertyValue::as_str)
    }

    pub fn number_property(&self, path: &str) -> Option<f64> {
        self.property(path).and_then(PropertyValue::as_f64)
    }

    pub fn bool_property(&self, path: &str) -> Option<bool> {
        self.property(path).and_then(PropertyValue::as_bool)
    }
}

// ---------------------------------------------------------------------------
// Cost payloads
// ---------------------------------------------------------------------------

/// Answer to `GetProjectedCost`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedCost {
    /// ISO 4217 currency code.
    pub currency: String,
    pub unit_price: f64,
    pub monthly_cost: f64,
    #[serde(default)]
    pub billing_detail: String,
}

/// Half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// A window is valid when it is non-empty.
    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }
}

/// Parameters of `GetActualCost`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActualCostQuery {
    pub resource_id: String,
    pub window: TimeWindow,
}

/// One dated spend record returned by `GetActualCost`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActualCostResult {
    pub timestamp: DateTime<Utc>,
    pub currency: String,
    pub cost: f64,
    #[serde(default)]
    pub source: String,
}

/// Advisory item returned by `GetRecommendations`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub id: String,
    #[serde(default)]
    pub category: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_savings: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
}

/// Self-description returned by `GetPluginInfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PluginInfo {
    pub name: String,
    pub version: String,
    pub spec_version: String,
    #[serde(default)]
    pub supported_providers: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Optional capabilities: `actual_cost`, `recommendations`, `dry_run`.
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl PluginInfo {
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

// ---------------------------------------------------------------------------
// Dry run
// ---------------------------------------------------------------------------

/// How a plugin would treat one field of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FieldSupportStatus {
    Supported,
    Unsupported,
    Conditional,
    Dynamic,
}

impl fmt::Display for FieldSupportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Supported => "SUPPORTED",
            Self::Unsupported => "UNSUPPORTED",
            Self::Conditional => "CONDITIONAL",
            Self::Dynamic => "DYNAMIC",
        };
        f.write_str(s)
    }
}

impl FromStr for FieldSupportStatus {
    type Err = FieldSupportStatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "SUPPORTED" => Ok(Self::Supported),
            "UNSUPPORTED" => Ok(Self::Unsupported),
            "CONDITIONAL" => Ok(Self::Conditional),
            "DYNAMIC" => Ok(Self::Dynamic),
            other => Err(FieldSupportStatusParseError(other.to_owned())),
        }
    }
}

/// Error returned when parsing an invalid [`FieldSupportStatus`] string.
#[derive(Debug, Clone)]
pub struct FieldSupportStatusParseError(pub String);

impl fmt::Display for FieldSupportStatusParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid field support status: {:?}", self.0)
    }
}

impl std::error::Error for FieldSupportStatusParseError {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub field_name: String,
    pub status: FieldSupportStatus,
    /// Required for `CONDITIONAL` mappings: when the field is honoured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default)]
    pub expected_type: String,
}

/// Parameters of `DryRun`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunRequest {
    pub resource: ResourceDescriptor,
    /// Free-form simulation knobs (region override, usage hours, ...).
    #[serde(default)]
    pub simulation: BTreeMap<String, PropertyValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunResponse {
    pub field_mappings: Vec<FieldMapping>,
    pub configuration_valid: bool,
    #[serde(default)]
    pub configuration_errors: Vec<String>,
}
