//! Live plugin handles in manifest declaration order.
//!
//! One `std::sync::RwLock` guards only membership and is never held across
//! an await: callers take an `Arc` snapshot and release it. Each process
//! carries its own state cell and connection mutex, so a slow or dying
//! plugin never blocks calls to another.

use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use finfocus_proto::CommMode;

use crate::adapter::PluginClient;
use crate::error::HostError;
use crate::manifest::PluginManifest;
use crate::supervisor::{PluginProcess, ProcessState, StateChange, Supervisor};

#[derive(Debug, Default)]
pub struct PluginRegistry {
    handles: RwLock<Vec<Arc<PluginProcess>>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Arc<PluginProcess>>> {
        self.handles.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Arc<PluginProcess>>> {
        self.handles.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a handle; insertion order is declaration order.
    pub fn insert(&self, process: Arc<PluginProcess>) {
        self.write().push(process);
    }

    /// Remove the handle with this `name@version` key.
    pub fn remove(&self, key: &str) -> Option<Arc<PluginProcess>> {
        let mut handles = self.write();
        let index = handles.iter().position(|p| p.key() == key)?;
        Some(handles.remove(index))
    }

    /// First handle with this plugin name.
    pub fn get(&self, name: &str) -> Option<Arc<PluginProcess>> {
        self.read().iter().find(|p| p.name() == name).cloned()
    }

    /// Every tracked handle, in declaration order.
    pub fn snapshot(&self) -> Vec<Arc<PluginProcess>> {
        self.read().clone()
    }

    /// Handles currently eligible for dispatch.
    pub fn ready(&self) -> Vec<Arc<PluginProcess>> {
        self.read().iter().filter(|p| p.is_ready()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Start every manifest and track the ones that come up.
    ///
    /// Starts run concurrently; successful handles are inserted in manifest
    /// order regardless of which finished first. Failures are returned.
    pub async fn start_all(
        &self,
        supervisor: &Supervisor,
        manifests: &[PluginManifest],
        mode: CommMode,
        cancel: &CancellationToken,
    ) -> Vec<HostError> {
        let starts = manifests
            .iter()
            .map(|manifest| supervisor.start(manifest, mode, cancel));
        let mut errors = Vec::new();
        for result in join_all(starts).await {
            match result {
                Ok(process) => self.insert(process),
                Err(e) => {
                    warn!(error = %e, "plugin failed to start");
                    errors.push(e);
                }
            }
        }
        errors
    }

    /// Stop and forget every tracked process.
    pub async fn stop_all(&self) {
        let handles = std::mem::take(&mut *self.write());
        join_all(handles.iter().map(|p| p.stop())).await;
        info!(count = handles.len(), "stopped all plugins");
    }

    /// Send `identity` to every `Degraded` handle. An answer restores
    /// `Ready`; a failure stops the handle and drops it. Returns how many
    /// recovered.
    pub async fn health_check_degraded(&self, budget: Duration) -> usize {
        let degraded: Vec<_> = self
            .read()
            .iter()
            .filter(|p| p.state() == ProcessState::Degraded)
            .cloned()
            .collect();
        let checks = degraded.into_iter().map(|process| async move {
            let client = PluginClient::new(Arc::clone(&process));
            match client.identity(budget).await {
                Ok(_) => true,
                Err(e) => {
                    warn!(
                        plugin = %process.key(),
                        error = %e,
                        "degraded plugin failed its health check, stopping"
                    );
                    self.remove(&process.key());
                    process.stop().await;
                    false
                }
            }
        });
        join_all(checks).await.into_iter().filter(|ok| *ok).count()

    }

    /// Consume state changes and drop crashed handles. Runs until the
    /// channel closes.
    pub fn watch(self: Arc<Self>, rx: broadcast::Receiver<StateChange>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut changes = BroadcastStream::new(rx);
            while let Some(change) = changes.next().await {
                match change {
                    Ok(change) if change.to == ProcessState::Crashed => {
                        self.remove_crashed(&change);
                    }
                    Ok(_) => {}
                    Err(BroadcastStreamRecvError::Lagged(missed)) => {
                        warn!(missed, "state-change stream lagged, sweeping registry");
                        self.sweep();
                    }
                }
            }
            debug!("state-change channel closed");
        })
    }

    fn remove_crashed(&self, change: &StateChange) {
        let mut handles = self.write();
        let before = handles.len();
        handles.retain(|p| !(p.key() == change.plugin && p.pid() == change.pid));
        if handles.len() < before {
            warn!(plugin = %change.plugin, pid = ?change.pid, "removed crashed plugin");
        }
    }

    fn sweep(&self) {
        self.write().retain(|p| !p.state().is_terminal());
    }
}
