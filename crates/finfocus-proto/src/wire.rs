//! Request/response envelope carried inside every frame.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// RPC methods of the cost-source contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Identity,
    GetProjectedCost,
    GetActualCost,
    GetRecommendations,
    GetPluginInfo,
    DryRun,
}

impl Method {
    pub const ALL: [Method; 6] = [
        Method::Identity,
        Method::GetProjectedCost,
        Method::GetActualCost,
        Method::GetRecommendations,
        Method::GetPluginInfo,
        Method::DryRun,
    ];
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Identity => "identity",
            Self::GetProjectedCost => "get_projected_cost",
            Self::GetActualCost => "get_actual_cost",
            Self::GetRecommendations => "get_recommendations",
            Self::GetPluginInfo => "get_plugin_info",
            Self::DryRun => "dry_run",
        };
        f.write_str(s)
    }
}

impl FromStr for Method {
    type Err = MethodParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|m| m.to_string() == s)
            .ok_or_else(|| MethodParseError(s.to_owned()))
    }
}

/// Error returned when parsing an invalid [`Method`] string.
#[derive(Debug, Clone, Error)]
#[error("invalid method: {0:?}")]
pub struct MethodParseError(pub String);

// ---------------------------------------------------------------------------
// Errors on the wire
// ---------------------------------------------------------------------------

/// Error classes a plugin may answer with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The plugin declines this resource or provider.
    NotSupported,
    /// Nothing recorded for the query.
    NoData,
    /// The request is malformed for this method.
    InvalidArgument,
    /// The plugin cannot reach its own backend.
    Unavailable,
    /// The method is not implemented by this plugin.
    Unimplemented,
    Internal,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotSupported => "not_supported",
            Self::NoData => "no_data",
            Self::InvalidArgument => "invalid_argument",
            Self::Unavailable => "unavailable",
            Self::Unimplemented => "unimplemented",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// A domain error returned by a plugin in place of a result.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn not_supported(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NotSupported, message)
    }

    pub fn no_data(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::NoData, message)
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn unimplemented(method: Method) -> Self {
        Self::new(ErrorCode::Unimplemented, format!("{method} is not implemented"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: u64,
    pub method: Method,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// A reply to one [`Request`]. Exactly one of `result` / `error` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: u64, result: serde_json::Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: u64, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    /// Collapse into a `Result`; a response with neither field is `null`.
    pub fn into_result(self) -> Result<serde_json::Value, RpcError> {
        match (self.error, self.result) {
            (Some(error), _) => Err(error),
            (None, result) => Ok(result.unwrap_or(serde_json::Value::Null)),
        }
    }
}
