// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! JSON-RPC client of a single node.

use crate::{
    IndexerError,
    chain::{ChainClient, LogQuery, SyncProgress},
    constants::*,
};
use alloy::{
    eips::BlockNumberOrTag,
    primitives::{Address, Bytes},
    providers::{Provider, ProviderBuilder},
    rpc::{
        client::RpcClient,
        types::{Filter, Log, SyncStatus, TransactionInput, TransactionRequest},
    },
    transports::{
        RpcError, TransportError,
        http::reqwest::Url,
        layers::{RetryBackoffLayer, RetryPolicy},
    },
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{future::Future, sync::Arc, time::Duration};
use tracing::debug;

/// Retry policy of the transport layer.
///
/// # Description
///
/// Only errors that the node flags as transient (rate limits, temporary overloads) are retried by the transport.
/// Anything else is reported right away so the caller can switch to another node.
#[derive(Debug, Copy, Clone, Default)]
#[non_exhaustive]
pub struct TransientRetryPolicy;

impl RetryPolicy for TransientRetryPolicy {
    fn should_retry(&self, error: &TransportError) -> bool {
        match error {
            RpcError::Transport(kind) => kind.is_retry_err(),
            RpcError::ErrorResp(payload) => payload.is_retry_err(),
            _ => false,
        }
    }

    fn backoff_hint(&self, _error: &TransportError) -> Option<Duration> {
        None
    }
}

/// Removes the credentials of an endpoint so it can be logged.
pub fn redact_endpoint(endpoint: &str) -> String {
    match Url::parse(endpoint) {
        Ok(mut url) => {
            if !url.username().is_empty() || url.password().is_some() {
                let _ = url.set_username("");
                let _ = url.set_password(None);
            }
            url.to_string()
        }
        Err(_) => "<invalid endpoint>".to_string(),
    }
}

/// [ChainClient] backed by one JSON-RPC node.
#[derive(Clone)]
pub struct RpcChainClient {
    endpoint: String,
    provider: Arc<dyn Provider + Send + Sync>,
    timeout: Duration,
}

impl RpcChainClient {
    pub fn connect(endpoint: &str, timeout: Duration) -> Result<Self> {
        let url: Url = endpoint
            .parse()
            .with_context(|| format!("Invalid RPC endpoint {}", redact_endpoint(endpoint)))?;

        let retry_policy = RetryBackoffLayer::new_with_policy(
            DEFAULT_BACKOFF_LAYER_MAX_RETRIES,
            DEFAULT_BACKOFF_LAYER_BACKOFF_TIME,
            DEFAULT_BACKOFF_LAYER_CUP_SIZE,
            TransientRetryPolicy,
        );

        let provider =
            ProviderBuilder::new().connect_client(RpcClient::builder().layer(retry_policy).http(url));

        Ok(Self {
            endpoint: redact_endpoint(endpoint),
            provider: Arc::new(provider),
            timeout,
        })
    }

    /// Endpoint of the node, without credentials.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn request<T, F>(&self, method: &'static str, request: F) -> Result<T>
    where
        F: Future<Output = Result<T, TransportError>> + Send,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(self.map_error(method, error)),
            Err(_) => Err(IndexerError::RpcTimeout {
                method,
                timeout: self.timeout,
            }
            .into()),
        }
    }

    fn map_error(&self, method: &'static str, error: TransportError) -> anyhow::Error {
        match error {
            RpcError::ErrorResp(payload) => IndexerError::Rpc(format!(
                "{method}: error code {}: {}",
                payload.code, payload.message
            ))
            .into(),
            RpcError::Transport(kind) => {
                IndexerError::NodeUnreachable(format!("{}: {kind}", self.endpoint)).into()
            }
            other => IndexerError::Rpc(format!("{method}: {other}")).into(),
        }
    }
}

#[async_trait]
impl ChainClient for RpcChainClient {
    async fn current_block_number(&self) -> Result<u64> {
        self.request("eth_blockNumber", async {
            self.provider.get_block_number().await
        })
        .await
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>> {
        if query.addresses.is_empty() {
            return Ok(Vec::new());
        }

        let filter = Filter::new()
            .from_block(query.from_block)
            .to_block(query.to_block)
            .address(query.addresses.clone())
            .event_signature(query.topic0.clone());

        debug!(
            "eth_getLogs [{}-{}] on {} contracts",
            query.from_block,
            query.to_block,
            query.addresses.len()
        );

        self.request("eth_getLogs", async { self.provider.get_logs(&filter).await })
            .await
    }

    async fn get_block_timestamp(&self, block_number: u64) -> Result<DateTime<Utc>> {
        let block = self
            .request("eth_getBlockByNumber", async {
                self.provider
                    .get_block_by_number(BlockNumberOrTag::Number(block_number))
                    .await
            })
            .await?
            .ok_or_else(|| IndexerError::Rpc(format!("block {block_number} not found")))?;

        let timestamp = i64::try_from(block.header.timestamp)
            .ok()
            .and_then(|seconds| DateTime::<Utc>::from_timestamp(seconds, 0))
            .ok_or_else(|| {
                IndexerError::Decode(format!(
                    "timestamp {} of block {block_number}",
                    block.header.timestamp
                ))
            })?;

        Ok(timestamp)
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes> {
        let request = TransactionRequest::default()
            .to(to)
            .input(TransactionInput::new(input));

        self.request("eth_call", async { self.provider.call(request).await })
            .await
    }

    async fn sync_progress(&self) -> Result<Option<SyncProgress>> {
        let status = self
            .request("eth_syncing", async { self.provider.syncing().await })
            .await?;

        Ok(match status {
            SyncStatus::Info(info) => Some(SyncProgress {
                current_block: info.current_block.saturating_to(),
                highest_block: info.highest_block.saturating_to(),
            }),
            SyncStatus::None => None,
        })
    }
}
