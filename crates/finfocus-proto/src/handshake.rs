//! Transport selection and the TCP handshake line.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::TRANSPORT_ENV;

/// How the host talks to a plugin process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommMode {
    /// The plugin listens on loopback and announces its port on stdout.
    #[default]
    Tcp,
    /// Frames flow over the plugin's stdin/stdout.
    Stdio,
}

impl CommMode {
    /// Read the mode a host asked for; unset means TCP.
    pub fn from_env() -> Result<Self, CommModeParseError> {
        match std::env::var(TRANSPORT_ENV) {
            Ok(value) => value.parse(),
            Err(_) => Ok(Self::Tcp),
        }
    }
}

impl fmt::Display for CommMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Stdio => "stdio",
        })
    }
}

impl FromStr for CommMode {
    type Err = CommModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "tcp" => Ok(Self::Tcp),
            "stdio" => Ok(Self::Stdio),
            other => Err(CommModeParseError(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("invalid communication mode {0:?} (expected tcp or stdio)")]
pub struct CommModeParseError(pub String);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeParseError {
    #[error("not a handshake line: {0:?}")]
    NotHandshake(String),

    #[error("handshake announced an invalid port: {0:?}")]
    InvalidPort(String),
}

/// The line a TCP-mode plugin prints once it is listening.
pub fn format_handshake(port: u16) -> String {
    format!("PORT={port}")
}

/// Parse a handshake line into the announced port.
///
/// Accepts `PORT=<port>` and, for hand-written plugins, a bare `<port>`.
/// Port 0 is rejected because it cannot be connected to.
pub fn parse_handshake(line: &str) -> Result<u16, HandshakeParseError> {
    let trimmed = line.trim();
    let value = trimmed.strip_prefix("PORT=").unwrap_or(trimmed);
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(HandshakeParseError::NotHandshake(trimmed.to_owned()));
    }
    match value.parse::<u16>() {
        Ok(0) | Err(_) => Err(HandshakeParseError::InvalidPort(value.to_owned())),
        Ok(port) => Ok(port),
    }
}
