//! Plugin-side runtime: implement [`CostSource`] and call [`serve`].
//!
//! A plugin binary is usually just:
//!
//! ```ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     finfocus_proto::serve(Arc::new(MyPlugin)).await?;
//!     Ok(())
//! }
//! ```
//!
//! Requests on one connection are answered in order; a TCP-mode plugin
//! serves each accepted connection on its own task.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, warn};

use crate::codec::{CodecError, decode_message, encode_message, frame_codec};
use crate::handshake::{CommMode, format_handshake};
use crate::models::{
    ActualCostQuery, ActualCostResult, DryRunRequest, DryRunResponse, PluginInfo, ProjectedCost,
    Recommendation, ResourceDescriptor,
};
use crate::wire::{Method, Request, Response, RpcError};

/// The contract a cost plugin implements.
///
/// Only [`CostSource::name`] and [`CostSource::projected_cost`] are
/// mandatory; the optional methods answer `unimplemented`, `no_data`, or an
/// empty list by default.
#[async_trait]
pub trait CostSource: Send + Sync + 'static {
    /// Plugin name reported by `Identity`.
    fn name(&self) -> &str;

    async fn plugin_info(&self) -> Result<PluginInfo, RpcError> {
        Err(RpcError::unimplemented(Method::GetPluginInfo))
    }

    async fn projected_cost(
        &self,
        resource: &ResourceDescriptor,
    ) -> Result<ProjectedCost, RpcError>;

    async fn actual_cost(
        &self,
        query: &ActualCostQuery,
    ) -> Result<Vec<ActualCostResult>, RpcError> {
        Err(RpcError::no_data(format!("no actual cost recorded for {}", query.resource_id)))
    }

    async fn recommendations(
        &self,
        _resource: &ResourceDescriptor,
    ) -> Result<Vec<Recommendation>, RpcError> {
        Ok(Vec::new())
    }

    async fn dry_run(&self, _request: &DryRunRequest) -> Result<DryRunResponse, RpcError> {
        Err(RpcError::unimplemented(Method::DryRun))
    }
}

// ---------------------------------------------------------------------------
// Parameter and result shapes
// ---------------------------------------------------------------------------

/// `Identity` result.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct IdentityResult {
    pub name: String,
}

/// Params of `GetProjectedCost`, `GetRecommendations`.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct ResourceParams {
    pub resource: ResourceDescriptor,
}

/// `GetActualCost` result.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct ActualCostResults {
    pub results: Vec<ActualCostResult>,
}

/// `GetRecommendations` result.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
pub struct RecommendationResults {
    pub recommendations: Vec<Recommendation>,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

fn params<T: DeserializeOwned>(request: &Request) -> Result<T, RpcError> {
    serde_json::from_value(request.params.clone()).map_err(|e| {
        RpcError::invalid_argument(format!("invalid params for {}: {e}", request.method))
    })
}

fn to_value<T: Serialize>(value: &T) -> Result<serde_json::Value, RpcError> {
    serde_json::to_value(value)
        .map_err(|e| RpcError::internal(format!("failed to encode result: {e}")))
}

/// Answer one request against a [`CostSource`].
pub async fn handle_request<S: CostSource + ?Sized>(source: &S, request: &Request) -> Response {
    let outcome = match request.method {
        Method::Identity => to_value(&IdentityResult {
            name: source.name().to_owned(),
        }),
        Method::GetPluginInfo => match source.plugin_info().await {
            Ok(info) => to_value(&info),
            Err(e) => Err(e),
        },
        Method::GetProjectedCost => match params::<ResourceParams>(request) {
            Ok(p) => match source.projected_cost(&p.resource).await {
                Ok(cost) => to_value(&cost),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        },
        Method::GetActualCost => match params::<ActualCostQuery>(request) {
            Ok(query) => match source.actual_cost(&query).await {
                Ok(results) => to_value(&ActualCostResults { results }),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        },
        Method::GetRecommendations => match params::<ResourceParams>(request) {
            Ok(p) => match source.recommendations(&p.resource).await {
                Ok(recommendations) => to_value(&RecommendationResults { recommendations }),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        },
        Method::DryRun => match params::<DryRunRequest>(request) {
            Ok(dry_run) => match source.dry_run(&dry_run).await {
                Ok(response) => to_value(&response),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        },
    };

    match outcome {
        Ok(value) => Response::ok(request.id, value),
        Err(error) => Response::err(request.id, error),
    }
}

/// Serve requests from one reader/writer pair until the peer hangs up.
pub async fn serve_connection<S, R, W>(
    source: Arc<S>,
    reader: R,
    writer: W,
) -> Result<(), CodecError>
where
    S: CostSource + ?Sized,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut frames = FramedRead::new(reader, frame_codec());
    let mut sink = FramedWrite::new(writer, frame_codec());

    while let Some(frame) = frames.next().await {
        let frame = frame?;
        let request: Request = match decode_message(&frame) {
            Ok(request) => request,
            Err(e) => {
                // Without an id there is nobody to answer; keep the stream alive.
                warn!(error = %e, "dropping undecodable request frame");
                continue;
            }
        };
        debug!(id = request.id, method = %request.method, "handling request");
        let response = handle_request(source.as_ref(), &request).await;
        sink.send(encode_message(&response)?).await?;
    }

    Ok(())
}

/// Serve over the process's own stdin/stdout.
pub async fn serve_stdio<S: CostSource + ?Sized>(source: Arc<S>) -> Result<(), CodecError> {
    serve_connection(source, tokio::io::stdin(), tokio::io::stdout()).await
}

/// Listen on an ephemeral loopback port, announce it, and serve every
/// connection concurrently. Runs until the process is terminated.
pub async fn serve_tcp<S: CostSource + ?Sized>(source: Arc<S>) -> Result<(), CodecError> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let port = listener.local_addr()?.port();

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("{}\n", format_handshake(port)).as_bytes())
        .await?;
    stdout.flush().await?;

    loop {
        let (stream, peer) = listener.accept().await?;
        debug!(%peer, "accepted host connection");
        let source = Arc::clone(&source);
        tokio::spawn(async move {
            let (reader, writer) = stream.into_split();
            if let Err(e) = serve_connection(source, reader, writer).await {
                warn!(%peer, error = %e, "connection ended with error");
            }
        });
    }
}

/// Serve using the transport the host requested via
/// [`crate::TRANSPORT_ENV`].
pub async fn serve<S: CostSource + ?Sized>(source: Arc<S>) -> Result<(), CodecError> {
    let mode = CommMode::from_env()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    match mode {
        CommMode::Tcp => serve_tcp(source).await,
        CommMode::Stdio => serve_stdio(source).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::ErrorCode;

    struct FixedPrice;

    #[async_trait]
    impl CostSource for FixedPrice {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn projected_cost(
            &self,
            resource: &ResourceDescriptor,
        ) -> Result<ProjectedCost, RpcError> {
            if resource.provider != "aws" {
                return Err(RpcError::not_supported("aws only"));
            }
            Ok(ProjectedCost {
                currency: "USD".to_owned(),
                unit_price: 0.01,
                monthly_cost: 7.3,
                billing_detail: "on-demand".to_owned(),
            })
        }
    }

    fn request(method: Method, params: serde_json::Value) -> Request {
        Request { id: 5, method, params }
    }

    #[tokio::test]
    async fn identity_reports_source_name() {
        let response =
            handle_request(&FixedPrice, &request(Method::Identity, serde_json::Value::Null)).await;
        assert_eq!(response.id, 5);
        assert_eq!(response.into_result().unwrap()["name"], "fixed");
    }

    #[tokio::test]
    async fn optional_methods_have_defaults() {
        let info_request = request(Method::GetPluginInfo, serde_json::Value::Null);
        let info = handle_request(&FixedPrice, &info_request).await;
        assert_eq!(info.into_result().unwrap_err().code, ErrorCode::Unimplemented);

        let resource = ResourceDescriptor::new("r", "aws", "aws:ec2:Instance");
        let params = serde_json::json!({ "resource": resource });
        let recs = handle_request(&FixedPrice, &request(Method::GetRecommendations, params)).await;
        assert_eq!(recs.into_result().unwrap()["recommendations"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn bad_params_are_invalid_argument() {
        let response = handle_request(
            &FixedPrice,
            &request(Method::GetProjectedCost, serde_json::json!({"nope": 1})),
        )
        .await;
        assert_eq!(response.into_result().unwrap_err().code, ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn serve_connection_answers_in_order_until_eof() {
        let (host, plugin) = tokio::io::duplex(4096);
        let (plugin_read, plugin_write) = tokio::io::split(plugin);
        let server =
            tokio::spawn(serve_connection(Arc::new(FixedPrice), plugin_read, plugin_write));

        let (host_read, host_write) = tokio::io::split(host);
        let mut sink = FramedWrite::new(host_write, frame_codec());
        let mut frames = FramedRead::new(host_read, frame_codec());

        for id in [1, 2] {
            let resource = ResourceDescriptor::new("r", "gcp", "gcp:compute:Instance");
            let params = serde_json::json!({ "resource": resource });
            let req = Request {
                id,
                method: Method::GetProjectedCost,
                params,
            };
            sink.send(encode_message(&req).unwrap()).await.unwrap();
        }
        for id in [1, 2] {
            let frame = frames.next().await.unwrap().unwrap();
            let response: Response = decode_message(&frame).unwrap();

            assert_eq!(response.id, id);
            assert_eq!(response.into_result().unwrap_err().code, ErrorCode::NotSupported);
        }

        drop(sink);
        drop(frames);
        server.await.unwrap().unwrap();
    }
}
