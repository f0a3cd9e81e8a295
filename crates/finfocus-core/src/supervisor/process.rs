//! A running plugin process and its monitor task.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use finfocus_proto::{CommMode, PluginInfo};

use crate::error::Diagnostics;
use crate::manifest::PluginManifest;
use crate::transport::Connection;

use super::output::OutputTail;
use super::state::{ProcessState, StateCell};

/// Where the host reaches the plugin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Tcp(SocketAddr),
    Stdio,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Stdio => f.write_str("stdio"),
        }
    }
}

/// Captured output of a child, shared with the capture tasks.
#[derive(Debug, Default)]
pub(crate) struct Tails {
    pub(crate) stdout: Arc<OutputTail>,
    pub(crate) stderr: Arc<OutputTail>,
}

impl Tails {
    pub(crate) fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            stdout: self.stdout.snapshot(),
            stderr: self.stderr.snapshot(),
        }
    }
}

/// A live plugin process. Owned by the supervisor, shared as `Arc`.
pub struct PluginProcess {
    manifest: PluginManifest,
    mode: CommMode,
    endpoint: Endpoint,
    pid: Option<u32>,
    state: Arc<StateCell>,
    connection: Connection,
    tails: Arc<Tails>,
    info: OnceLock<PluginInfo>,
    stop_token: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PluginProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginProcess")
            .field("plugin", &self.manifest.key())
            .field("pid", &self.pid)
            .field("mode", &self.mode)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) struct ProcessParts {
    pub(crate) manifest: PluginManifest,
    pub(crate) mode: CommMode,
    pub(crate) endpoint: Endpoint,
    pub(crate) child: Child,
    pub(crate) state: Arc<StateCell>,
    pub(crate) connection: Connection,
    pub(crate) tails: Arc<Tails>,
    pub(crate) stop_grace: Duration,
}

impl PluginProcess {
    /// Take ownership of a spawned child and start its monitor.
    pub(crate) fn launch(parts: ProcessParts) -> Arc<Self> {
        let ProcessParts {
            manifest,
            mode,
            endpoint,
            child,
            state,
            connection,
            tails,
            stop_grace,
        } = parts;

        let pid = child.id();
        let stop_token = CancellationToken::new();
        let monitor = tokio::spawn(monitor(
            child,
            manifest.key(),
            Arc::clone(&state),
            Arc::clone(&tails),
            stop_token.clone(),
            stop_grace,
        ));

        Arc::new(Self {
            manifest,
            mode,
            endpoint,
            pid,
            state,
            connection,
            tails,
            info: OnceLock::new(),
            stop_token,
            monitor: Mutex::new(Some(monitor)),
        })
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    /// `name@version`.
    pub fn key(&self) -> String {
        self.manifest.key()
    }

    pub fn mode(&self) -> CommMode {
        self.mode
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> ProcessState {
        self.state.get()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ProcessState::Ready
    }

    /// Receiver that observes every state change of this process.
    pub fn watch_state(&self) -> watch::Receiver<ProcessState> {
        self.state.subscribe()
    }

    /// Self-description reported at start-up; `None` for legacy plugins.
    pub fn info(&self) -> Option<&PluginInfo> {
        self.info.get()
    }

    /// Recent stdout/stderr lines of the child.
    pub fn diagnostics(&self) -> Diagnostics {
        self.tails.diagnostics()
    }

    pub(crate) fn connection(&self) -> &Connection {
        &self.connection
    }

    pub(crate) fn set_info(&self, info: PluginInfo) {
        let _ = self.info.set(info);
    }

    pub(crate) fn transition(&self, to: ProcessState) -> bool {
        self.state.transition(to)
    }

    /// Give up on a live child whose connection can no longer carry frames:
    /// publish `Crashed` and let the monitor terminate and reap it.
    pub(crate) fn abandon(&self, reason: &str) {
        if self.state.transition(ProcessState::Crashed) {
            warn!(plugin = %self.key(), pid = ?self.pid, reason, "abandoning plugin");
        }
        self.stop_token.cancel();
    }

    /// Terminate the child and wait for it to be reaped.
    ///
    /// Idempotent. A process that already crashed stays `Crashed`.
    pub async fn stop(&self) {
        self.state.transition(ProcessState::Stopped);
        self.stop_token.cancel();
        let handle = self.monitor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(plugin = %self.key(), error = %e, "monitor task failed");
            }
        }
    }
}

impl Drop for PluginProcess {
    fn drop(&mut self) {
        // The monitor terminates the child; kill_on_drop covers runtime shutdown.
        self.stop_token.cancel();
    }
}

/// Own the child until it exits or a stop is requested.
async fn monitor(
    mut child: Child,
    plugin: String,
    state: Arc<StateCell>,
    tails: Arc<Tails>,
    stop: CancellationToken,
    grace: Duration,
) {
    let pid = child.id();
    tokio::select! {
        biased;
        _ = stop.cancelled() => {
            terminate(&mut child, &plugin, grace).await;
            info!(plugin = %plugin, pid = ?pid, "plugin stopped");
        }
        status = child.wait() => {
            if state.transition(ProcessState::Crashed) {
                let stderr = tails.stderr.snapshot();
                warn!(
                    plugin = %plugin,
                    pid = ?pid,
                    status = ?status.as_ref().ok(),
                    stderr_tail = ?stderr.iter().rev().take(5).rev().collect::<Vec<_>>(),
                    "plugin exited unexpectedly"
                );
            } else {
                debug!(plugin = %plugin, pid = ?pid, "plugin exited after stop");
            }
        }
    }
}

/// SIGTERM, wait up to `grace`, then SIGKILL. Always reaps.
async fn terminate(child: &mut Child, plugin: &str, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // SAFETY: pid belongs to a child we spawned and have not yet reaped.
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            warn!(plugin, pid, "SIGTERM failed, proceeding to SIGKILL");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(plugin, ?status, "plugin exited after SIGTERM"),
        _ => {
            debug!(plugin, "plugin did not exit within grace period, sending SIGKILL");
            if let Err(e) = child.kill().await {
                warn!(plugin, error = %e, "failed to kill plugin");
            }
        }
    }
}
