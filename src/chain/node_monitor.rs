// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Periodic health check of the RPC nodes.

use crate::{
    CancellationToken,
    chain::{ChainClient, NodePool, redact_endpoint},
    metrics::MetricsHandle,
    storage::{Node, Storage},
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info, warn};

/// Ring buffer of `(time, block number)` samples of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockSyncTracker {
    samples: VecDeque<(DateTime<Utc>, u64)>,
    capacity: usize,
}

impl BlockSyncTracker {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn record(&mut self, at: DateTime<Utc>, block_number: u64) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back((at, block_number));
    }

    /// Blocks generated per second between the oldest and the newest sample.
    ///
    /// Returns `None` until the buffer is full.
    pub fn blocks_per_second(&self) -> Option<f64> {
        if self.samples.len() < self.capacity {
            return None;
        }
        let (first_at, first_block) = self.samples.front()?;
        let (last_at, last_block) = self.samples.back()?;

        let elapsed = (*last_at - *first_at).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return None;
        }
        Some(last_block.saturating_sub(*first_block) as f64 / elapsed)
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Limits that a node has to respect to be considered synced.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncThresholds {
    /// Blocks that a syncing node may lag behind the network.
    pub remaining_blocks: u64,
    pub expected_blocks_per_sec: f64,
    /// Minimum percentage of the expected block generation speed.
    pub speed_threshold_percent: f64,
    pub sample_size: usize,
}

impl SyncThresholds {
    fn speed_is_healthy(&self, blocks_per_second: f64) -> bool {
        let percent = blocks_per_second / self.expected_blocks_per_sec * 100.0;
        percent >= self.speed_threshold_percent
    }
}

/// Background task that keeps the health flags of the [NodePool] up to date.
///
/// # Description
///
/// Every check queries each node for its sync status and its latest block. A node is flagged as not synced when:
/// - It does not answer.
/// - It reports that it is syncing and lags more than [SyncThresholds::remaining_blocks] behind.
/// - Its block number grows slower than [SyncThresholds::speed_threshold_percent] of the expected speed.
///
/// The result is written to the pool, to the `node` table and to the `node_synced` metric.
pub struct NodeHealthMonitor {
    pool: Arc<NodePool>,
    storage: Arc<dyn Storage>,
    thresholds: SyncThresholds,
    trackers: HashMap<i64, BlockSyncTracker>,
    metrics: MetricsHandle,
}

impl NodeHealthMonitor {
    pub fn new(pool: Arc<NodePool>, storage: Arc<dyn Storage>, thresholds: SyncThresholds) -> Self {
        Self {
            pool,
            storage,
            thresholds,
            trackers: HashMap::new(),
            metrics: MetricsHandle::default(),
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    /// Checks every node once.
    pub async fn check_all(&mut self, now: DateTime<Utc>) -> Result<()> {
        for (node, client) in self.pool.clients()? {
            let is_synced = self.evaluate(&node, client.as_ref(), now).await;

            self.pool.set_synced(node.id, is_synced)?;
            self.storage.upsert_node(&Node {
                is_synced,
                ..node.clone()
            })?;
            self.metrics
                .record_node_synced(&redact_endpoint(&node.endpoint_uri), is_synced);
        }

        Ok(())
    }

    async fn evaluate(&mut self, node: &Node, client: &dyn ChainClient, now: DateTime<Utc>) -> bool {
        let thresholds = self.thresholds;
        let tracker = self
            .trackers
            .entry(node.id)
            .or_insert_with(|| BlockSyncTracker::new(thresholds.sample_size));

        let progress = match client.sync_progress().await {
            Ok(progress) => progress,
            Err(e) => {
                warn!("Node {} did not report its sync status: {e:#}", node.id);
                tracker.reset();
                return false;
            }
        };
        let block_number = match client.current_block_number().await {
            Ok(block_number) => block_number,
            Err(e) => {
                warn!("Node {} did not report its block number: {e:#}", node.id);
                tracker.reset();
                return false;
            }
        };
        tracker.record(now, block_number);

        if let Some(progress) = progress
            && progress.remaining_blocks() > thresholds.remaining_blocks
        {
            info!(
                "Node {} is syncing: block {} of {}",
                node.id, progress.current_block, progress.highest_block
            );
            return false;
        }

        match tracker.blocks_per_second() {
            Some(speed) if !thresholds.speed_is_healthy(speed) => {
                info!(
                    "Node {} generates {speed:.3} blocks/s, below the expected speed",
                    node.id
                );
                false
            }
            _ => true,
        }
    }

    /// Runs the checks every `interval` until the app shuts down.
    pub async fn run(mut self, interval: Duration, cancellation_token: CancellationToken) {
        let mut shutdown = cancellation_token.subscribe();
        let mut ticker = tokio::time::interval(interval);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!("Node health monitor stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check_all(Utc::now()).await {
                        warn!("Node health check failed: {e:#}");
                    }
                }
            }
        }
    }
}
