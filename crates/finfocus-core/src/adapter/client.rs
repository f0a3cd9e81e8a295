use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tracing::{debug, trace};

use finfocus_proto::server::{
    ActualCostResults, IdentityResult, RecommendationResults, ResourceParams,
};
use finfocus_proto::{
    ActualCostQuery, ActualCostResult, DryRunRequest, DryRunResponse, Method, PluginInfo,
    ProjectedCost, PropertyValue, Recommendation, ResourceDescriptor, TimeWindow,
};

use crate::error::HostError;
use crate::transport::TransportError;
use crate::supervisor::{PluginProcess, ProcessState};

use super::classify_rpc_error;

/// Typed client for one plugin process.
///
/// Cheap to clone; all clones share the process and its connection.
#[derive(Debug, Clone)]
pub struct PluginClient {
    process: Arc<PluginProcess>,
    /// Also admit calls while the supervisor is still verifying the process.
    handshaking: bool,
}

impl PluginClient {
    pub fn new(process: Arc<PluginProcess>) -> Self {
        Self {
            process,
            handshaking: false,
        }
    }

    pub(crate) fn during_handshake(process: Arc<PluginProcess>) -> Self {
        Self {
            process,
            handshaking: true,
        }
    }

    pub fn process(&self) -> &Arc<PluginProcess> {
        &self.process
    }

    pub fn name(&self) -> &str {
        self.process.name()
    }

    fn admits(&self, state: ProcessState) -> bool {
        match state {
            ProcessState::Ready | ProcessState::Degraded => true,
            ProcessState::Handshaking => self.handshaking,
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // RPC methods
    // -----------------------------------------------------------------------

    /// Liveness check; returns the name the plugin reports.
    pub async fn identity(&self, budget: Duration) -> Result<String, HostError> {
        let result: IdentityResult =
            self.call(Method::Identity, serde_json::Value::Null, budget).await?;
        Ok(result.name)
    }

    pub async fn get_projected_cost(
        &self,
        resource: &ResourceDescriptor,
        budget: Duration,
    ) -> Result<ProjectedCost, HostError> {
        let params = to_params(&ResourceParams {
            resource: resource.clone(),
        })?;
        self.call(Method::GetProjectedCost, params, budget).await
    }

    /// Dated spend for a resource. An empty answer is [`HostError::NoData`].
    pub async fn get_actual_cost(
        &self,
        resource_id: &str,
        window: TimeWindow,
        budget: Duration,
    ) -> Result<Vec<ActualCostResult>, HostError> {
        let params = to_params(&ActualCostQuery {
            resource_id: resource_id.to_string(),
            window,
        })?;
        let answer: ActualCostResults = self.call(Method::GetActualCost, params, budget).await?;
        if answer.results.is_empty() {
            return Err(HostError::NoData {
                plugin: self.name().to_string(),
                message: format!("no actual cost recorded for {resource_id}"),
            });
        }
        Ok(answer.results)
    }

    pub async fn get_recommendations(
        &self,
        resource: &ResourceDescriptor,
        budget: Duration,
    ) -> Result<Vec<Recommendation>, HostError> {
        let params = to_params(&ResourceParams {
            resource: resource.clone(),
        })?;
        let answer: RecommendationResults =
            self.call(Method::GetRecommendations, params, budget).await?;
        Ok(answer.recommendations)
    }

    pub async fn get_plugin_info(&self, budget: Duration) -> Result<PluginInfo, HostError> {
        self.call(Method::GetPluginInfo, serde_json::Value::Null, budget).await
    }

    pub async fn dry_run(
        &self,
        resource: &ResourceDescriptor,
        simulation: BTreeMap<String, PropertyValue>,
        budget: Duration,
    ) -> Result<DryRunResponse, HostError> {
        let params = to_params(&DryRunRequest {
            resource: resource.clone(),
            simulation,
        })?;
        self.call(Method::DryRun, params, budget).await
    }

    // -----------------------------------------------------------------------
    // Call plumbing
    // -----------------------------------------------------------------------

    async fn call<T: DeserializeOwned>(
        &self,
        method: Method,
        params: serde_json::Value,
        budget: Duration,
    ) -> Result<T, HostError> {
        let plugin = self.name();
        let state = self.process.state();
        if !self.admits(state) {
            return Err(HostError::NotReady {
                plugin: plugin.to_string(),
                state,
            });
        }

        let mut state_rx = self.process.watch_state();
        trace!(plugin, %method, ?budget, "calling plugin");

        let outcome = tokio::select! {
            biased;
            terminal = wait_terminal(&mut state_rx) => {
                debug!(plugin, %method, state = %terminal, "plugin went away mid-call");
                return Err(HostError::Unavailable {
                    plugin: plugin.to_string(),
                    reason: format!("process {terminal} during {method}"),
                    diagnostics: self.process.diagnostics(),
                });
            }
            outcome = tokio::time::timeout(
                budget,
                self.process.connection().round_trip(method, params),
            ) => outcome,
        };

        let response = match outcome {
            Err(_elapsed) => {
                self.mark_degraded();
                return Err(HostError::Timeout {
                    plugin: plugin.to_string(),
                    method,
                    timeout: budget,
                });
            }
            Ok(Err(transport)) => {
                let reason = format!("{method}: {transport}");
                if matches!(transport, TransportError::Poisoned) {
                    // No later call can succeed on this connection.
                    self.process.abandon(&reason);
                } else {
                    self.mark_degraded();
                }
                return Err(HostError::Unavailable {
                    plugin: plugin.to_string(),
                    reason,
                    diagnostics: self.process.diagnostics(),
                });
            }
            Ok(Ok(response)) => response,
        };

        // A well-framed answer, error or not, proves the channel works.
        self.mark_healthy();

        let value = response
            .into_result()
            .map_err(|e| classify_rpc_error(plugin, method, e))?;
        serde_json::from_value(value).map_err(|e| {
            let reason = format!("{method} returned an unexpected result shape: {e}");
            HostError::unavailable(plugin, reason)

        })
    }

    fn mark_degraded(&self) {
        if self.process.state() == ProcessState::Ready {
            self.process.transition(ProcessState::Degraded);
        }
    }

    fn mark_healthy(&self) {
        if self.process.state() == ProcessState::Degraded {
            self.process.transition(ProcessState::Ready);
        }
    }
}

fn to_params<T: serde::Serialize>(params: &T) -> Result<serde_json::Value, HostError> {
    serde_json::to_value(params)
        .map_err(|e| HostError::unavailable("host", format!("failed to encode request: {e}")))
}

/// Resolve once the process reaches a terminal state.
async fn wait_terminal(rx: &mut watch::Receiver<ProcessState>) -> ProcessState {
    match rx.wait_for(|state| state.is_terminal()).await {
        Ok(state) => *state,
        Err(_) => ProcessState::Stopped,
    }
}
