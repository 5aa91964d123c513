// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Block range scanning shared by every sync job.
//!
//! # Description
//!
//! A sync job is a [SyncEngine] parameterized by a [LogHandler]. The engine owns the scanning loop: it plans the
//! block ranges from the job checkpoint, fetches the logs of the contracts the handler targets, hands them to the
//! handler in chain order and commits the resulting rows together with the new checkpoint. The handler only knows
//! how to turn logs into row mutations.

use crate::{
    CancellationToken,
    chain::{ChainClient, LogQuery},
    checkpoint::Checkpoint,
    constants::*,
    metrics::MetricsHandle,
    storage::{IndexBatch, RowMutation, Storage},
};
use alloy::{
    primitives::{Address, B256},
    rpc::types::Log,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::{
    collections::{HashMap, HashSet},
    ops::RangeInclusive,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, error, info, warn};

/// Per-cycle view of the collaborators of a job.
///
/// Block timestamps and the listing are read at most once per cycle.
pub struct ScanContext<'a> {
    pub chain: &'a dyn ChainClient,
    pub storage: &'a dyn Storage,
    timestamps: HashMap<u64, DateTime<Utc>>,
    listed: Option<HashSet<Address>>,
    catching_up: Option<HashSet<Address>>,
}

impl<'a> ScanContext<'a> {
    pub fn new(chain: &'a dyn ChainClient, storage: &'a dyn Storage) -> Self {
        Self {
            chain,
            storage,
            timestamps: HashMap::new(),
            listed: None,
            catching_up: None,
        }
    }

    /// Whether events concerning the contract belong to the current scan.
    ///
    /// Always true, except while targets catch up with the job: then only the targets being caught up are in
    /// scope.
    pub fn in_scope(&self, address: &Address) -> bool {
        self.catching_up
            .as_ref()
            .is_none_or(|targets| targets.contains(address))
    }

    pub async fn block_timestamp(&mut self, block_number: u64) -> Result<DateTime<Utc>> {
        if let Some(timestamp) = self.timestamps.get(&block_number) {
            return Ok(*timestamp);
        }
        let timestamp = self.chain.get_block_timestamp(block_number).await?;
        self.timestamps.insert(block_number, timestamp);
        Ok(timestamp)
    }

    /// Whether the token is in the listing allow-list.
    pub fn is_listed(&mut self, token_address: &Address) -> Result<bool> {
        if self.listed.is_none() {
            self.listed = Some(self.storage.listed_tokens(false)?.into_iter().collect());
        }
        Ok(self
            .listed
            .as_ref()
            .is_some_and(|listed| listed.contains(token_address)))
    }
}

/// Trait that turns the logs of a block range into row mutations.
#[async_trait]
pub trait LogHandler: Send + Sync {
    /// Name of the job, also the key of its checkpoint.
    fn job_name(&self) -> &str;
    /// Signatures of the events the handler consumes.
    fn event_topics(&self) -> Vec<B256>;
    /// Contracts whose logs are scanned in the current cycle.
    async fn target_addresses(&mut self, ctx: &mut ScanContext<'_>) -> Result<Vec<Address>>;
    /// Other contracts emitting events about `targets`, scanned along with them while they catch up.
    fn catch_up_companions(&self, _targets: &[Address]) -> Vec<Address> {
        Vec::new()
    }
    /// Transforms the logs of a range, given in chain order, into the mutations to commit.
    async fn transform(
        &mut self,
        logs: &[Log],
        ctx: &mut ScanContext<'_>,
    ) -> Result<Vec<RowMutation>>;
}

/// Scanning options of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineOptions {
    /// Maximum number of blocks requested in one eth_getLogs call.
    pub batch_size: u64,
    /// Start a job without checkpoint at the chain head instead of at block 0.
    pub skip_past_data: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_SCAN_BATCH_SIZE,
            skip_past_data: false,
        }
    }
}

pub struct SyncEngine<H: LogHandler> {
    handler: H,
    chain: Arc<dyn ChainClient>,
    storage: Arc<dyn Storage>,
    options: EngineOptions,
    checkpoint: Option<Checkpoint>,
    /// First block scanned for a contract that joins the job.
    genesis_block: u64,
    /// Next block to scan of every contract scanned so far, loaded on the first scan.
    target_checkpoints: Option<HashMap<Address, u64>>,
    /// Current batch size, lower than the configured one after the node rejected a range.
    batch_size: u64,
    successful_cycles: u8,
    block_range_hint_regex: Regex,
    metrics: MetricsHandle,
}

impl<H: LogHandler> SyncEngine<H> {
    pub fn new(
        handler: H,
        chain: Arc<dyn ChainClient>,
        storage: Arc<dyn Storage>,
        options: EngineOptions,
    ) -> Result<Self> {
        // Captures the range hinted by messages like:
        // "error code -32602: query exceeds max results 20000, retry with the range 22382105-22382515"
        let block_range_hint_regex = Regex::new(r"(\d+)-(\d+)\s*$")?;

        Ok(Self {
            handler,
            chain,
            storage,
            batch_size: options.batch_size.max(1),
            options,
            checkpoint: None,
            genesis_block: 0,
            target_checkpoints: None,
            successful_cycles: 0,
            block_range_hint_regex,
            metrics: MetricsHandle::default(),
        })
    }

    /// Seeds the checkpoint, the job starts scanning at `from_block` whatever is stored.
    ///
    /// Contracts that join the job later are not scanned before `from_block` either.
    pub fn with_from_block(mut self, from_block: u64) -> Self {
        self.checkpoint = Some(Checkpoint::new(from_block));
        self.genesis_block = from_block;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsHandle) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn job_name(&self) -> &str {
        self.handler.job_name()
    }

    /// First block of the next scan, if known.
    pub fn from_block(&self) -> Option<u64> {
        self.checkpoint.map(|c| c.from_block())
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Catches up with the chain head at start up.
    ///
    /// # Description
    ///
    /// The job resumes from its stored checkpoint. A job that never committed starts at block 0, or at the current
    /// head when past data has to be skipped; in that case the skipped position is committed right away so a
    /// restart does not rescan the history.
    pub async fn initial_sync(&mut self) -> Result<usize> {
        if self.checkpoint.is_none() {
            let checkpoint = match self.storage.load_checkpoint(self.handler.job_name())? {
                Some(next_block) => Checkpoint::new(next_block),
                None if self.options.skip_past_data => {
                    let head = self.chain.current_block_number().await?;
                    let next_block = head + 1;
                    self.storage.commit_batch(&IndexBatch {
                        job_name: self.handler.job_name().to_string(),
                        next_block,
                        ..Default::default()
                    })?;
                    info!(
                        "{}: skipping past data, starting at block {next_block}",
                        self.handler.job_name()
                    );
                    Checkpoint::new(next_block)
                }
                None => Checkpoint::default(),
            };
            self.checkpoint = Some(checkpoint);
        }

        let written = self.sync_new_logs().await?;
        info!(
            "{}: initial sync completed, {written} rows written",
            self.handler.job_name()
        );
        Ok(written)
    }

    /// Scans every block from the checkpoint up to the current head.
    ///
    /// # Description
    ///
    /// The range is scanned in batches, each one committed with its checkpoint. An error stops the scan: the
    /// batches committed before it are kept, the failed one is scanned again by the next call.
    ///
    /// Returns the number of rows written.
    pub async fn sync_new_logs(&mut self) -> Result<usize> {
        let mut checkpoint = match self.checkpoint {
            Some(checkpoint) => checkpoint,
            None => Checkpoint::new(
                self.storage
                    .load_checkpoint(self.handler.job_name())?
                    .unwrap_or_default(),
            ),
        };
        self.checkpoint = Some(checkpoint);

        let head = self.chain.current_block_number().await?;
        self.metrics
            .record_chain_head_block(self.handler.job_name(), head);

        let mut written = 0;
        while let Some(range) = checkpoint.next_range(head, self.batch_size) {
            match self.scan_range(&range).await {
                Ok(rows) => {
                    checkpoint.advance(&range);
                    self.checkpoint = Some(checkpoint);
                    written += rows;
                    self.on_success();
                    self.metrics
                        .record_synced_block(self.handler.job_name(), *range.end());
                    self.metrics
                        .record_rows_written(self.handler.job_name(), rows);
                }
                Err(e) => {
                    self.on_failure(&e);
                    self.metrics.record_scan_failure(self.handler.job_name());
                    return Err(e).with_context(|| {
                        format!(
                            "{}: failed to scan blocks [{}-{}]",
                            self.handler.job_name(),
                            range.start(),
                            range.end()
                        )
                    });
                }
            }
        }

        Ok(written)
    }

    async fn scan_range(&mut self, range: &RangeInclusive<u64>) -> Result<usize> {
        let chain = self.chain.clone();
        let storage = self.storage.clone();
        let mut ctx = ScanContext::new(chain.as_ref(), storage.as_ref());

        let addresses = self.handler.target_addresses(&mut ctx).await?;
        let mut written = self
            .catch_up_targets(&addresses, *range.start(), &mut ctx)
            .await?;
        written += self
            .scan_targets(&addresses, &[], range.clone(), &mut ctx)
            .await?;

        Ok(written)
    }

    /// Scans the history of the targets that are behind the job, up to the block before `until`.
    ///
    /// # Description
    ///
    /// A target seen for the first time starts at the genesis block of the job, or joins the job right away when
    /// past data is skipped. Targets sharing a starting block are scanned together, and each batch moves their own
    /// checkpoints, so an interrupted catch up resumes where it stopped.
    async fn catch_up_targets(
        &mut self,
        addresses: &[Address],
        until: u64,
        ctx: &mut ScanContext<'_>,
    ) -> Result<usize> {
        if self.target_checkpoints.is_none() {
            self.target_checkpoints = Some(
                self.storage
                    .load_target_checkpoints(self.handler.job_name())?,
            );
        }
        let known = self.target_checkpoints.as_ref();
        let mut lagging: Vec<(Address, u64)> = addresses
            .iter()
            .filter_map(|target| {
                let next_block = match known.and_then(|known| known.get(target)) {
                    Some(next_block) => *next_block,
                    None if self.options.skip_past_data => until,
                    None => self.genesis_block,
                };
                (next_block < until).then_some((*target, next_block))
            })
            .collect();

        if lagging.is_empty() {
            return Ok(0);
        }
        info!(
            "{}: catching up {} contracts up to block {}",
            self.handler.job_name(),
            lagging.len(),
            until - 1
        );

        let mut written = 0;
        while let Some(from_block) = lagging.iter().map(|(_, next_block)| *next_block).min() {
            let range = Checkpoint::new(from_block)
                .next_range(until - 1, self.batch_size)
                .with_context(|| format!("Empty catch up range starting at {from_block}"))?;
            let targets: Vec<Address> = lagging
                .iter()
                .filter(|(_, next_block)| *next_block == from_block)
                .map(|(target, _)| *target)
                .collect();

            let companions: Vec<Address> = self
                .handler
                .catch_up_companions(&targets)
                .into_iter()
                .filter(|companion| !targets.contains(companion))
                .collect();
            ctx.catching_up = Some(targets.iter().copied().collect());
            let scanned = self
                .scan_targets(&targets, &companions, range.clone(), ctx)
                .await;
            ctx.catching_up = None;
            written += scanned?;

            let next_block = range.end() + 1;
            for (_, target_next_block) in lagging.iter_mut().filter(|(t, _)| targets.contains(t)) {
                *target_next_block = next_block;
            }
            lagging.retain(|(_, target_next_block)| *target_next_block < until);
        }

        Ok(written)
    }

    /// Fetches the logs of the targets in the range, transforms them and commits the rows.
    ///
    /// Only the checkpoints of the targets move, the companions are scanned on behalf of the targets.
    async fn scan_targets(
        &mut self,
        targets: &[Address],
        companions: &[Address],
        range: RangeInclusive<u64>,
        ctx: &mut ScanContext<'_>,
    ) -> Result<usize> {
        let catch_up = ctx.catching_up.is_some();
        let mut logs = if targets.is_empty() {
            Vec::new()
        } else {
            ctx.chain
                .get_logs(&LogQuery {
                    addresses: targets.iter().chain(companions).copied().collect(),
                    topic0: self.handler.event_topics(),
                    from_block: *range.start(),
                    to_block: *range.end(),
                })
                .await?
        };

        logs.retain(|log| !log.removed);
        logs.sort_by_key(|log| (log.block_number, log.transaction_index, log.log_index));

        let mutations = self.handler.transform(&logs, ctx).await?;
        let next_block = range.end() + 1;
        let rows = self.storage.commit_batch(&IndexBatch {
            job_name: self.handler.job_name().to_string(),
            next_block,
            mutations,
            targets: targets.to_vec(),
            catch_up,
        })?;

        if let Some(known) = self.target_checkpoints.as_mut() {
            known.extend(targets.iter().map(|target| (*target, next_block)));
        }

        debug!(
            "{}: blocks [{}-{}], {} contracts, {} logs, {rows} rows",
            self.handler.job_name(),
            range.start(),
            range.end(),
            targets.len(),
            logs.len()
        );

        Ok(rows)
    }

    fn on_success(&mut self) {
        if self.batch_size == self.options.batch_size {
            return;
        }
        self.successful_cycles = self.successful_cycles.saturating_add(1);
        if self.successful_cycles >= SUCCESSFUL_CYCLES_THRESHOLD {
            info!(
                "{}: restoring the batch size to {}",
                self.handler.job_name(),
                self.options.batch_size
            );
            self.batch_size = self.options.batch_size;
            self.successful_cycles = 0;
        }
    }

    /// Shrinks the batch size when the node rejected the requested range.
    fn on_failure(&mut self, error: &anyhow::Error) {
        let message = format!("{error:#}");
        if !message.contains("-32602") {
            return;
        }

        let previous = self.batch_size;
        let hinted = self
            .block_range_hint_regex
            .captures(&message)
            .and_then(|captures| {
                let first: u64 = captures.get(1)?.as_str().parse().ok()?;
                let second: u64 = captures.get(2)?.as_str().parse().ok()?;
                let range = second.saturating_sub(first);
                // Safety margin of a 10% of the range.
                Some(range - range / 10)
            });

        self.batch_size = hinted.unwrap_or(previous >> 1).max(1);
        self.successful_cycles = 0;

        warn!(
            "{}: the node rejected the block range, reducing the batch size from {previous} to {}",
            self.handler.job_name(),
            self.batch_size
        );
    }
}

/// Object safe view of a sync job, used to run heterogeneous jobs side by side.
#[async_trait]
pub trait SyncJob: Send {
    fn name(&self) -> &str;
    async fn initial_sync(&mut self) -> Result<usize>;
    async fn sync_new_logs(&mut self) -> Result<usize>;
}

#[async_trait]
impl<H: LogHandler + 'static> SyncJob for SyncEngine<H> {
    fn name(&self) -> &str {
        self.handler.job_name()
    }

    async fn initial_sync(&mut self) -> Result<usize> {
        SyncEngine::initial_sync(self).await
    }

    async fn sync_new_logs(&mut self) -> Result<usize> {
        SyncEngine::sync_new_logs(self).await
    }
}

/// Runs a job until the app shuts down.
///
/// # Description
///
/// The job first catches up with [SyncJob::initial_sync] and then polls with [SyncJob::sync_new_logs] every
/// `interval`. Failed cycles are logged and retried on the next tick, they never stop the job.
pub async fn run_job(
    mut job: Box<dyn SyncJob>,
    interval: Duration,
    cancellation_token: CancellationToken,
) {
    let mut shutdown = cancellation_token.subscribe();
    let mut initialized = false;

    loop {
        let result = if initialized {
            job.sync_new_logs().await
        } else {
            job.initial_sync().await
        };

        match result {
            Ok(rows) => {
                initialized = true;
                if rows > 0 {
                    info!("{}: {rows} rows written", job.name());
                }
            }
            Err(e) => error!("{}: sync cycle failed: {e:#}", job.name()),
        }

        tokio::select! {
            _ = shutdown.recv() => {
                info!("{}: stopped", job.name());
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }
    }
}
