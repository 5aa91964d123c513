// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Error conditions that callers need to tell apart.
//!
//! # Description
//!
//! Most of the crate returns [anyhow::Result]. The conditions below travel inside [anyhow::Error] and are
//! recovered with [IndexerError::find] when a caller has to react differently, e.g. the REST layer mapping an
//! error to its status code or the node pool flagging an unreachable endpoint.

use crate::constants::BLOCK_SYNC_DOWN_MESSAGE;
use axum::http::StatusCode;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexerError {
    #[error("Invalid Parameter: {0}")]
    InvalidParameter(String),
    #[error("Not Supported: {0}")]
    NotSupported(String),
    #[error("Data Not Exists: {0}")]
    DataNotExists(String),
    #[error("Suspended Token: {0}")]
    SuspendedToken(String),
    #[error("Data Conflict: {0}")]
    DataConflict(String),
    #[error("Service Unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("RPC call {method} timed out after {timeout:?}")]
    RpcTimeout {
        method: &'static str,
        timeout: Duration,
    },
    #[error("RPC node unreachable: {0}")]
    NodeUnreachable(String),
    #[error("RPC error: {0}")]
    Rpc(String),
    #[error("Failed to decode log: {0}")]
    Decode(String),
}

impl IndexerError {
    /// Condition raised when no RPC node is synchronized.
    pub fn sync_down() -> Self {
        IndexerError::ServiceUnavailable(BLOCK_SYNC_DOWN_MESSAGE.to_string())
    }

    /// Looks for an [IndexerError] in the chain of an [anyhow::Error].
    pub fn find(error: &anyhow::Error) -> Option<&IndexerError> {
        error.chain().find_map(|cause| cause.downcast_ref::<IndexerError>())
    }

    /// Whether the error means that the node serving the request should not be used anymore.
    pub fn is_node_failure(&self) -> bool {
        matches!(
            self,
            IndexerError::RpcTimeout { .. } | IndexerError::NodeUnreachable(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            IndexerError::InvalidParameter(_) | IndexerError::SuspendedToken(_) => {
                StatusCode::BAD_REQUEST
            }
            IndexerError::NotSupported(_) | IndexerError::DataNotExists(_) => StatusCode::NOT_FOUND,
            IndexerError::DataConflict(_) => StatusCode::CONFLICT,
            IndexerError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Numeric code included in the `meta` section of error responses.
    pub fn error_code(&self) -> u16 {
        match self {
            IndexerError::InvalidParameter(_) => 88,
            IndexerError::NotSupported(_) => 10,
            IndexerError::DataNotExists(_) => 30,
            IndexerError::SuspendedToken(_) => 20,
            IndexerError::DataConflict(_) => 40,
            IndexerError::ServiceUnavailable(_) => 503,
            _ => 1,
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            IndexerError::InvalidParameter(_) => "Invalid Parameter",
            IndexerError::NotSupported(_) => "Not Supported",
            IndexerError::DataNotExists(_) => "Data Not Exists",
            IndexerError::SuspendedToken(_) => "Suspended Token",
            IndexerError::DataConflict(_) => "Data Conflict",
            IndexerError::ServiceUnavailable(_) => "Service Unavailable",
            _ => "Internal Server Error",
        }
    }

    /// Detail of the error without the title prefix.
    pub fn description(&self) -> String {
        match self {
            IndexerError::InvalidParameter(d)
            | IndexerError::NotSupported(d)
            | IndexerError::DataNotExists(d)
            | IndexerError::SuspendedToken(d)
            | IndexerError::DataConflict(d)
            | IndexerError::ServiceUnavailable(d) => d.clone(),
            other => other.to_string(),
        }
    }
}
