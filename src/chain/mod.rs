// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Access to the ibet chain.
//!
//! # Description
//!
//! The sync jobs only see the [ChainClient] trait. [RpcChainClient] talks to a single JSON-RPC node, and
//! [FailoverChainClient] spreads the calls over a pool of nodes that [NodeHealthMonitor] keeps up to date.

mod client;
mod failover;
mod node_monitor;

pub use client::{RpcChainClient, TransientRetryPolicy, redact_endpoint};
pub use failover::{FailoverChainClient, NodePool, RetrySettings};
pub use node_monitor::{BlockSyncTracker, NodeHealthMonitor, SyncThresholds};

use crate::IndexerError;
use alloy::{
    primitives::{Address, B256, Bytes},
    rpc::types::Log,
    sol_types::SolCall,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Parameters of an `eth_getLogs` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogQuery {
    /// Contracts whose logs are wanted. An empty list matches nothing.
    pub addresses: Vec<Address>,
    /// Accepted values of the first topic, i.e. the event signatures.
    pub topic0: Vec<B256>,
    pub from_block: u64,
    pub to_block: u64,
}

impl LogQuery {
    /// Whether a log falls inside the query.
    pub fn matches(&self, log: &Log) -> bool {
        let in_range = log
            .block_number
            .is_some_and(|block| (self.from_block..=self.to_block).contains(&block));
        let topic_matches = log
            .topic0()
            .is_some_and(|topic| self.topic0.is_empty() || self.topic0.contains(topic));

        in_range && topic_matches && self.addresses.contains(&log.address())
    }
}

/// Progress reported by a node that is still catching up with the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncProgress {
    pub current_block: u64,
    pub highest_block: u64,
}

impl SyncProgress {
    pub fn remaining_blocks(&self) -> u64 {
        self.highest_block.saturating_sub(self.current_block)
    }
}

/// Trait that defines the chain operations needed by the sync jobs.
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Latest block number known to the node.
    async fn current_block_number(&self) -> Result<u64>;
    /// Logs matching the query, in chain order.
    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>>;
    async fn get_block_timestamp(&self, block_number: u64) -> Result<DateTime<Utc>>;
    /// Executes a read-only call against the latest block.
    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes>;
    /// `None` when the node is not syncing.
    async fn sync_progress(&self) -> Result<Option<SyncProgress>>;
}

/// Calls a view function of a contract and decodes its return value.
pub async fn call_view<C: SolCall>(
    chain: &dyn ChainClient,
    to: Address,
    call: C,
) -> Result<C::Return> {
    let output = chain.call(to, call.abi_encode().into()).await?;
    C::abi_decode_returns(&output).map_err(|e| {
        IndexerError::Decode(format!("return of {} at {to}: {e}", C::SIGNATURE)).into()
    })
}
