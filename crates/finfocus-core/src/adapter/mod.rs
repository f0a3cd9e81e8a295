//! Typed RPC surface over one plugin process.
//!
//! Every call is bounded by a caller-supplied budget and always resolves.
//! Connection, framing and process faults never escape as such; they are
//! reclassified into [`HostError`](crate::HostError) here.

mod client;

pub use client::PluginClient;

use finfocus_proto::{ErrorCode, Method, RpcError};

use crate::error::HostError;

/// Map a plugin's wire error onto the host taxonomy.
pub(crate) fn classify_rpc_error(plugin: &str, method: Method, error: RpcError) -> HostError {
    let plugin = plugin.to_string();
    match error.code {
        ErrorCode::NotSupported | ErrorCode::Unimplemented => HostError::NotSupported {
            plugin,
            message: error.message,
        },
        ErrorCode::NoData => HostError::NoData {
            plugin,
            message: error.message,
        },
        ErrorCode::InvalidArgument => HostError::InvalidArgument {
            plugin,
            message: error.message,
        },
        ErrorCode::Unavailable | ErrorCode::Internal => {
            HostError::unavailable(plugin, format!("{method} failed: {}", error))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn wire_codes_map_to_domain_kinds() {
        let cases = [
            (RpcError::not_supported("x"), ErrorKind::NotSupported),
            (RpcError::unimplemented(Method::DryRun), ErrorKind::NotSupported),
            (RpcError::no_data("x"), ErrorKind::NoData),
            (RpcError::invalid_argument("x"), ErrorKind::InvalidArgument),
            (RpcError::internal("x"), ErrorKind::Unavailable),
            (RpcError::new(ErrorCode::Unavailable, "backend down"), ErrorKind::Unavailable),
        ];
        for (error, kind) in cases {
            assert_eq!(classify_rpc_error("p", Method::GetProjectedCost, error).kind(), kind);
        }
    }

    #[test]
    fn plugin_message_is_preserved() {
        let err =
            classify_rpc_error("aws", Method::GetActualCost, RpcError::no_data("nothing for r-1"));

        assert!(err.to_string().contains("nothing for r-1"));
    }
}
