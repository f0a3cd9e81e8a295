//! Wire contract between the finfocus host and cost-source plugins.
//!
//! Both sides of the protocol live here so that the host and every plugin
//! agree on one definition of the data model, the request envelope, and the
//! framing:
//!
//! ```text
//! host                                   plugin
//!  |  spawn (FINFOCUS_PLUGIN_TRANSPORT)    |
//!  |-------------------------------------->|
//!  |         "PORT=<port>" (tcp only)      |
//!  |<--------------------------------------|
//!  |  [len:u32 BE][Request JSON]           |
//!  |-------------------------------------->|
//!  |  [len:u32 BE][Response JSON]          |
//!  |<--------------------------------------|
//! ```

pub mod codec;
pub mod handshake;
pub mod models;
pub mod server;
pub mod wire;

pub use handshake::CommMode;
pub use models::{
    ActualCostQuery, ActualCostResult, DryRunRequest, DryRunResponse, FieldMapping,
    FieldSupportStatus, PluginInfo, ProjectedCost, PropertyValue, Recommendation,
    ResourceDescriptor, TimeWindow,
};
pub use server::{CostSource, serve, serve_connection, serve_stdio, serve_tcp};
pub use wire::{ErrorCode, Method, Request, Response, RpcError};

/// Protocol version spoken by this build of the host and SDK.
///
/// Only the major component has to match for two peers to interoperate.
pub const SPEC_VERSION: &str = "1.0.0";

/// Environment variable telling a plugin which transport to serve.
pub const TRANSPORT_ENV: &str = "FINFOCUS_PLUGIN_TRANSPORT";

/// Return the major component of a dotted version string (`"1.4.2"` -> 1).
///
/// A leading `v` is tolerated. Returns `None` when the major component is
/// missing or not a number.
pub fn spec_major(version: &str) -> Option<u64> {
    version
        .trim()
        .trim_start_matches('v')
        .split('.')
        .next()
        .and_then(|major| major.parse().ok())
}
