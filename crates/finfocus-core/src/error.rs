//! Domain error taxonomy of the plugin host.
//!
//! Everything above the adapter sees only [`HostError`]; connection, framing
//! and process faults are reclassified before they leave
//! [`crate::adapter`].

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use finfocus_proto::Method;

use crate::supervisor::ProcessState;

/// Flat classification of a [`HostError`], stable for reports and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    HandshakeTimeout,
    ProtocolMismatch,
    NotSupported,
    NoData,
    InvalidArgument,
    Timeout,
    Unavailable,
    NotReady,
    MixedCurrencies,
    MalformedManifest,
    VersionConflict,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::HandshakeTimeout => "handshake_timeout",
            Self::ProtocolMismatch => "protocol_mismatch",
            Self::NotSupported => "not_supported",
            Self::NoData => "no_data",
            Self::InvalidArgument => "invalid_argument",
            Self::Timeout => "timeout",
            Self::Unavailable => "unavailable",
            Self::NotReady => "not_ready",
            Self::MixedCurrencies => "mixed_currencies",
            Self::MalformedManifest => "malformed_manifest",
            Self::VersionConflict => "version_conflict",
        };
        f.write_str(s)
    }
}

/// Captured child output attached to start-up and crash errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

impl Diagnostics {
    pub fn is_empty(&self) -> bool {
        self.stdout.is_empty() && self.stderr.is_empty()
    }
}

impl fmt::Display for Diagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return Ok(());
        }
        if !self.stdout.is_empty() {
            write!(f, "\n  stdout:")?;
            for line in &self.stdout {
                write!(f, "\n    {line}")?;
            }
        }
        if !self.stderr.is_empty() {
            write!(f, "\n  stderr:")?;
            for line in &self.stderr {
                write!(f, "\n    {line}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum HostError {
    #[error("plugin {plugin:?} did not complete its handshake within {timeout:?}{diagnostics}")]
    HandshakeTimeout {
        plugin: String,
        timeout: Duration,
        diagnostics: Diagnostics,
    },

    #[error("plugin {plugin:?} speaks spec version {plugin_version}, host speaks {host_version}")]
    ProtocolMismatch {
        plugin: String,
        host_version: String,
        plugin_version: String,
    },

    #[error("plugin {plugin:?} does not support this request: {message}")]
    NotSupported { plugin: String, message: String },

    #[error("plugin {plugin:?} has no data: {message}")]
    NoData { plugin: String, message: String },

    #[error("plugin {plugin:?} rejected the request: {message}")]
    InvalidArgument { plugin: String, message: String },

    #[error("{method} on plugin {plugin:?} timed out after {timeout:?}")]
    Timeout {
        plugin: String,
        method: Method,
        timeout: Duration,
    },

    #[error("plugin {plugin:?} is unavailable: {reason}{diagnostics}")]
    Unavailable {
        plugin: String,
        reason: String,
        diagnostics: Diagnostics,
    },

    #[error("plugin {plugin:?} is not ready (state: {state})")]
    NotReady { plugin: String, state: ProcessState },

    #[error("failed to launch plugin binary {}: {source}", path.display())]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "refusing to aggregate {resource_id:?}: results mix currencies {}",
        currencies.join(", ")
    )]
    MixedCurrencies {
        resource_id: String,
        currencies: Vec<String>,
    },

    #[error("malformed manifest at {}: {reason}", path.display())]
    MalformedManifest { path: PathBuf, reason: String },

    #[error(
        "plugin {name} {version} is declared twice: {} and {}",
        first.display(),
        second.display()
    )]
    VersionConflict {
        name: String,
        version: String,
        first: PathBuf,
        second: PathBuf,
    },
}

impl HostError {
    pub fn unavailable(plugin: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            plugin: plugin.into(),
            reason: reason.into(),
            diagnostics: Diagnostics::default(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::HandshakeTimeout { .. } => ErrorKind::HandshakeTimeout,
            Self::ProtocolMismatch { .. } => ErrorKind::ProtocolMismatch,
            Self::NotSupported { .. } => ErrorKind::NotSupported,
            Self::NoData { .. } => ErrorKind::NoData,
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Unavailable { .. } | Self::Spawn { .. } => ErrorKind::Unavailable,
            Self::NotReady { .. } => ErrorKind::NotReady,
            Self::MixedCurrencies { .. } => ErrorKind::MixedCurrencies,
            Self::MalformedManifest { .. } => ErrorKind::MalformedManifest,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
        }
    }

    /// The plugin process itself is the problem (dead, unreachable, wrong
    /// protocol), as opposed to an answer the plugin chose to give.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::HandshakeTimeout
                | ErrorKind::ProtocolMismatch
                | ErrorKind::Unavailable
                | ErrorKind::NotReady
        )
    }

    /// Captured child output, when the error carries any.
    pub fn diagnostics(&self) -> Option<&Diagnostics> {
        match self {
            Self::HandshakeTimeout { diagnostics, .. } | Self::Unavailable { diagnostics, .. } => {
                Some(diagnostics)
            }
            _ => None,
        }
    }
}
