//! Plugin process supervisor.
//!
//! [`Supervisor::start`] spawns a plugin binary, completes the transport
//! handshake, verifies liveness and protocol compatibility, and hands back
//! a [`PluginProcess`] in state `Ready`. A monitor task per process turns
//! an unexpected exit into `Crashed` and publishes it on the supervisor's
//! [`StateChange`] channel.

mod output;
mod process;
mod state;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use finfocus_proto::handshake::parse_handshake;
use finfocus_proto::{CommMode, SPEC_VERSION, TRANSPORT_ENV, spec_major};

use crate::adapter::PluginClient;
use crate::error::{Diagnostics, HostError};
use crate::manifest::PluginManifest;
use crate::transport::Connection;

pub use output::TAIL_LINES;
pub use process::{Endpoint, PluginProcess};
pub use state::{ProcessState, ProcessStateParseError, StateChange};

use output::{capture_reader, spawn_capture};
use process::{ProcessParts, Tails};
use state::StateCell;

/// Capacity of the state-change broadcast channel.
const EVENT_CAPACITY: usize = 256;

/// Time allowed for stderr capture to drain after a failed start.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Deadline for the TCP handshake line.
    pub handshake_timeout: Duration,
    /// SIGTERM-to-SIGKILL grace period on stop.
    pub stop_grace: Duration,
    /// Budget of the post-handshake `Identity` and `GetPluginInfo` calls.
    pub liveness_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            stop_grace: Duration::from_secs(3),
            liveness_timeout: Duration::from_secs(5),
        }
    }
}

/// Spawns plugin processes and owns their state-change channel.
#[derive(Debug, Clone)]
pub struct Supervisor {
    config: SupervisorConfig,
    events: broadcast::Sender<StateChange>,
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new(SupervisorConfig::default())
    }
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self { config, events }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Receive every state transition of every process this supervisor starts.
    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.events.subscribe()
    }

    /// Start a bare binary without an install tree.
    pub async fn start_binary(
        &self,
        path: &Path,
        mode: CommMode,
        cancel: &CancellationToken,
    ) -> Result<Arc<PluginProcess>, HostError> {
        self.start(&PluginManifest::for_binary(path), mode, cancel).await
    }

    /// Spawn `manifest`'s binary and bring it to `Ready`.
    ///
    /// Cancelling `cancel` aborts the start and kills the child.
    pub async fn start(
        &self,
        manifest: &PluginManifest,
        mode: CommMode,
        cancel: &CancellationToken,
    ) -> Result<Arc<PluginProcess>, HostError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HostError::unavailable(
                manifest.key(),
                "start cancelled",
            )),
            result = self.start_inner(manifest, mode) => result,
        }
    }

    async fn start_inner(
        &self,
        manifest: &PluginManifest,
        mode: CommMode,
    ) -> Result<Arc<PluginProcess>, HostError> {
        let key = manifest.key();
        let mut child = Command::new(&manifest.binary_path)
            .current_dir(&manifest.dir)
            .env(TRANSPORT_ENV, mode.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| HostError::Spawn {
                path: manifest.binary_path.clone(),
                source,
            })?;
        let pid = child.id();
        info!(plugin = %key, pid = ?pid, %mode, "spawned plugin");

        let tails = Arc::new(Tails::default());
        let state = Arc::new(StateCell::new(key.clone(), pid, self.events.clone()));
        state.transition(ProcessState::Handshaking);

        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| capture_reader(stderr, Arc::clone(&tails.stderr), key.clone(), "stderr"));

        let (endpoint, connection) = match mode {
            CommMode::Tcp => {
                let Some(stdout) = child.stdout.take() else {
                    let reason = "stdout not captured";
                    return Err(self
                        .fail_early(child, &state, &key, reason, stderr_task, &tails)
                        .await);
                };
                match self.tcp_handshake(&key, stdout, &tails).await {
                    Ok(addr) => match Connection::from_tcp(addr).await {
                        Ok(connection) => (Endpoint::Tcp(addr), connection),
                        Err(e) => {
                            let reason = format!("connecting to {addr} failed: {e}");
                            return Err(self
                                .fail_early(child, &state, &key, &reason, stderr_task, &tails)
                                .await);
                        }
                    },
                    Err(HandshakeFailure::Exited) => {
                        let reason = "exited before completing its handshake";
                        return Err(self
                            .fail_early(child, &state, &key, reason, stderr_task, &tails)
                            .await);
                    }
                    Err(HandshakeFailure::TimedOut) => {
                        warn!(
                            plugin = %key,
                            timeout = ?self.config.handshake_timeout,
                            "handshake timed out"
                        );
                        let diagnostics =
                            self.reap_and_collect(child, &state, stderr_task, &tails).await;
                        return Err(HostError::HandshakeTimeout {
                            plugin: key,
                            timeout: self.config.handshake_timeout,
                            diagnostics,
                        });
                    }
                }
            }
            CommMode::Stdio => match (child.stdout.take(), child.stdin.take()) {
                (Some(stdout), Some(stdin)) => {
                    (Endpoint::Stdio, Connection::from_pipes(stdout, stdin))
                }
                _ => {
                    let reason = "stdio not captured";
                    return Err(self
                        .fail_early(child, &state, &key, reason, stderr_task, &tails)
                        .await);
                }
            },
        };

        let process = PluginProcess::launch(ProcessParts {
            manifest: manifest.clone(),
            mode,
            endpoint,
            child,
            state,
            connection,
            tails,
            stop_grace: self.config.stop_grace,
        });

        // If this future is dropped here, dropping `process` stops the monitor,
        // which terminates the child.
        match self.verify(&process).await {
            Ok(()) => {
                process.transition(ProcessState::Ready);
                info!(
                    plugin = %key,
                    pid = ?process.pid(),
                    endpoint = %process.endpoint(),
                    "plugin ready"
                );
                Ok(process)
            }
            Err(e @ HostError::ProtocolMismatch { .. }) => {
                warn!(plugin = %key, error = %e, "refusing plugin with incompatible protocol");
                process.stop().await;
                Err(e)
            }
            Err(e) => {
                warn!(plugin = %key, error = %e, "plugin failed its liveness check");
                process.transition(ProcessState::Crashed);
                process.stop().await;
                Err(attach_diagnostics(e, process.diagnostics()))
            }
        }
    }

    /// Identity liveness call, then the spec-version check.
    async fn verify(&self, process: &Arc<PluginProcess>) -> Result<(), HostError> {
        let client = PluginClient::during_handshake(Arc::clone(process));
        let budget = self.config.liveness_timeout;

        let name = client.identity(budget).await?;
        debug!(plugin = %process.key(), identity = %name, "liveness check passed");

        match client.get_plugin_info(budget).await {
            Ok(info) => {
                let host_major = spec_major(SPEC_VERSION);
                if spec_major(&info.spec_version) != host_major {
                    return Err(HostError::ProtocolMismatch {
                        plugin: process.key(),
                        host_version: SPEC_VERSION.to_string(),
                        plugin_version: info.spec_version,
                    });
                }
                process.set_info(info);
                Ok(())
            }
            Err(HostError::NotSupported { .. }) => {
                warn!(
                    plugin = %process.key(),
                    "plugin does not report its spec version, accepting as legacy"
                );

                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Read stdout until a handshake line, capturing everything else.
    async fn tcp_handshake(
        &self,
        key: &str,
        stdout: ChildStdout,
        tails: &Arc<Tails>,
    ) -> Result<SocketAddr, HandshakeFailure> {
        let mut lines = BufReader::new(stdout).lines();
        let read = async {
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => match parse_handshake(&line) {
                        Ok(port) => return Ok(port),
                        Err(_) => {
                            debug!(plugin = %key, line = %line, "pre-handshake output");
                            tails.stdout.push(line);
                        }
                    },
                    Ok(None) | Err(_) => return Err(HandshakeFailure::Exited),
                }
            }
        };

        let port = tokio::time::timeout(self.config.handshake_timeout, read)
            .await
            .map_err(|_| HandshakeFailure::TimedOut)??;
        debug!(plugin = %key, port, "handshake received");

        // Keep draining stdout so the child never blocks on a full pipe.
        spawn_capture(lines, Arc::clone(&tails.stdout), key.to_string(), "stdout");
        Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    }

    async fn fail_early(
        &self,
        child: Child,
        state: &StateCell,
        key: &str,
        reason: &str,
        stderr_task: Option<JoinHandle<()>>,
        tails: &Tails,
    ) -> HostError {
        let diagnostics = self.reap_and_collect(child, state, stderr_task, tails).await;
        warn!(plugin = %key, reason, "plugin failed to start");
        HostError::Unavailable {
            plugin: key.to_string(),
            reason: reason.to_string(),
            diagnostics,
        }
    }

    async fn reap_and_collect(
        &self,
        mut child: Child,
        state: &StateCell,
        stderr_task: Option<JoinHandle<()>>,
        tails: &Tails,
    ) -> Diagnostics {
        state.transition(ProcessState::Crashed);
        if let Err(e) = child.kill().await {
            debug!(error = %e, "kill after failed start");
        }
        if let Some(task) = stderr_task {
            let _ = tokio::time::timeout(DRAIN_TIMEOUT, task).await;
        }
        tails.diagnostics()
    }
}

enum HandshakeFailure {
    Exited,
    TimedOut,
}

fn attach_diagnostics(error: HostError, captured: Diagnostics) -> HostError {
    match error {
        HostError::Unavailable {
            plugin,
            reason,
            diagnostics,
        } if diagnostics.is_empty() => HostError::Unavailable {
            plugin,
            reason,
            diagnostics: captured,
        },
        other => other,
    }
}
