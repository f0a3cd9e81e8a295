//! Host side of finfocus: discovers cost plugins on disk, supervises their
//! processes, talks to them through a typed adapter, fans cost queries out
//! across many plugins, and validates a single plugin with a black-box
//! conformance suite.
//!
//! # Architecture
//!
//! ```text
//! discovery::discover(root) --> PluginManifest[]
//!     |
//!     v
//! Supervisor::start(manifest, mode) --> Arc<PluginProcess>
//!     |                                      |
//!     |  StateChange (broadcast)             |  PluginClient (typed RPC)
//!     v                                      v
//! PluginRegistry <------------------- Dispatcher (fan-out, precedence)
//!
//! conformance::run_suite(binary) -- one Supervisor + one PluginClient
//! ```

pub mod adapter;
pub mod conformance;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod manifest;
pub mod registry;
pub mod supervisor;
mod transport;

pub use adapter::PluginClient;
pub use discovery::{DiscoveryReport, discover};
pub use dispatcher::{DispatchConfig, Dispatcher};
pub use error::{Diagnostics, ErrorKind, HostError};
pub use manifest::PluginManifest;
pub use registry::PluginRegistry;
pub use supervisor::{PluginProcess, ProcessState, StateChange, Supervisor, SupervisorConfig};

pub use finfocus_proto as proto;
