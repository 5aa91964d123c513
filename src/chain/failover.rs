// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Selection of a synced node among the configured ones.

use crate::{
    IndexerError,
    chain::{ChainClient, LogQuery, SyncProgress},
    storage::Node,
};
use alloy::{
    primitives::{Address, Bytes},
    rpc::types::Log,
};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    future::Future,
    sync::{Arc, RwLock},
    time::Duration,
};
use tracing::{info, warn};

struct PoolEntry {
    node: Node,
    client: Arc<dyn ChainClient>,
}

/// In-memory registry of the RPC nodes and their health.
///
/// # Description
///
/// Nodes start flagged as synced. The pool is shared by the [FailoverChainClient], which flags a node as not
/// synced when it stops answering, and by the [crate::chain::NodeHealthMonitor], which flips the flag both ways.
pub struct NodePool {
    entries: RwLock<Vec<PoolEntry>>,
}

impl NodePool {
    pub fn new(nodes: Vec<(Node, Arc<dyn ChainClient>)>) -> Self {
        let entries = nodes
            .into_iter()
            .map(|(node, client)| PoolEntry { node, client })
            .collect();

        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Synced node with the lowest priority value, ties broken by the lowest id.
    pub fn select(&self) -> Result<Option<(i64, Arc<dyn ChainClient>)>> {
        let entries = self.read()?;
        Ok(entries
            .iter()
            .filter(|entry| entry.node.is_synced)
            .min_by_key(|entry| (entry.node.priority, entry.node.id))
            .map(|entry| (entry.node.id, entry.client.clone())))
    }

    /// Updates the health flag of a node. Returns whether the flag changed.
    pub fn set_synced(&self, id: i64, is_synced: bool) -> Result<bool> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| anyhow!("Failed to acquire lock: {}", e))?;

        let Some(entry) = entries.iter_mut().find(|entry| entry.node.id == id) else {
            return Ok(false);
        };
        let changed = entry.node.is_synced != is_synced;
        entry.node.is_synced = is_synced;

        if changed {
            info!(
                "Node {} ({}) is now {}",
                id,
                entry.node.endpoint_uri,
                if is_synced { "synced" } else { "not synced" }
            );
        }

        Ok(changed)
    }

    pub fn nodes(&self) -> Result<Vec<Node>> {
        Ok(self.read()?.iter().map(|entry| entry.node.clone()).collect())
    }

    /// Every node with its client, for the health checks.
    pub fn clients(&self) -> Result<Vec<(Node, Arc<dyn ChainClient>)>> {
        Ok(self
            .read()?
            .iter()
            .map(|entry| (entry.node.clone(), entry.client.clone()))
            .collect())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<PoolEntry>>> {
        self.entries
            .read()
            .map_err(|e| anyhow!("Failed to acquire lock: {}", e))
    }
}

/// How a call waits for a synced node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    /// Attempts before the call fails with the sync down error.
    pub count: u32,
    pub wait: Duration,
}

/// [ChainClient] that routes every call to the best synced node of a [NodePool].
///
/// # Description
///
/// A call that fails because the node timed out or could not be reached flags that node as not synced and is
/// retried on the next candidate. Any other error is returned to the caller as is. When no synced node answers
/// after [RetrySettings::count] attempts, the call fails with [IndexerError::ServiceUnavailable].
#[derive(Clone)]
pub struct FailoverChainClient {
    pool: Arc<NodePool>,
    retry: RetrySettings,
}

impl FailoverChainClient {
    pub fn new(pool: Arc<NodePool>, retry: RetrySettings) -> Self {
        Self { pool, retry }
    }

    pub fn pool(&self) -> &Arc<NodePool> {
        &self.pool
    }

    async fn with_node<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: Fn(Arc<dyn ChainClient>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        for attempt in 1..=self.retry.count.max(1) {
            match self.pool.select()? {
                Some((id, client)) => match operation(client).await {
                    Ok(value) => return Ok(value),
                    Err(error) => {
                        let node_failure =
                            IndexerError::find(&error).is_some_and(IndexerError::is_node_failure);
                        if !node_failure {
                            return Err(error);
                        }
                        warn!("Node {id} failed (attempt {attempt}): {error:#}");
                        self.pool.set_synced(id, false)?;
                    }
                },
                None => warn!("No synced node available (attempt {attempt})"),
            }

            tokio::time::sleep(self.retry.wait).await;
        }

        Err(IndexerError::sync_down().into())
    }
}

#[async_trait]
impl ChainClient for FailoverChainClient {
    async fn current_block_number(&self) -> Result<u64> {
        self.with_node(|client| async move { client.current_block_number().await })
            .await
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>> {
        self.with_node(|client| {
            let query = query.clone();
            async move { client.get_logs(&query).await }
        })
        .await
    }

    async fn get_block_timestamp(&self, block_number: u64) -> Result<DateTime<Utc>> {
        self.with_node(|client| async move { client.get_block_timestamp(block_number).await })
            .await
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes> {
        self.with_node(|client| {
            let input = input.clone();
            async move { client.call(to, input).await }
        })
        .await
    }

    async fn sync_progress(&self) -> Result<Option<SyncProgress>> {
        self.with_node(|client| async move { client.sync_progress().await })
            .await
    }
}
