// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

use crate::storage::{ExecutableContract, Listing, Node, RowMutation};
use alloy::primitives::Address;
use anyhow::Result;
use std::collections::HashMap;

/// Rows produced by the scan of one block range of a job.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct IndexBatch {
    /// Name of the job that owns the checkpoint.
    pub job_name: String,
    /// First block of the next scan, i.e. the last scanned block + 1.
    pub next_block: u64,
    pub mutations: Vec<RowMutation>,
    /// Contracts whose logs were scanned, their own checkpoints move to `next_block` as well.
    pub targets: Vec<Address>,
    /// The batch backfills targets that joined the job late. The job checkpoint is left untouched.
    pub catch_up: bool,
}

/// Trait that defines the API between the sync jobs and the storage.
pub trait Storage: Send + Sync + 'static {
    /// Applies the mutations of a batch and stores the checkpoint of its job.
    ///
    /// # Description
    ///
    /// Both the rows and the checkpoint are written in a single transaction: either the whole scanned range is
    /// persisted and the job moves forward, or nothing changes and the next attempt scans the same range again.
    /// Every mutation is idempotent by the natural key of its table, so replaying a range never duplicates rows.
    ///
    /// Returns the number of rows inserted or updated.
    fn commit_batch(&self, batch: &IndexBatch) -> Result<usize>;
    /// Gets the first block that a job has to scan, if the job ever committed a batch.
    fn load_checkpoint(&self, job_name: &str) -> Result<Option<u64>>;
    /// Gets the first block to scan of every contract the job ever scanned.
    fn load_target_checkpoints(&self, job_name: &str) -> Result<HashMap<Address, u64>>;
    /// Whether the token is present in the listing allow-list.
    fn is_listed(&self, token_address: &Address) -> Result<bool>;
    /// Lists the listed tokens, optionally only the public ones.
    fn listed_tokens(&self, public_only: bool) -> Result<Vec<Address>>;
    /// Registers a token in the listing.
    ///
    /// # Description
    ///
    /// Fails with [crate::IndexerError::DataConflict] if the token is already listed.
    fn insert_listing(&self, listing: &Listing) -> Result<()>;
    /// Registers a contract as a valid target of relayed transactions.
    ///
    /// # Description
    ///
    /// Fails with [crate::IndexerError::DataConflict] if the contract is already registered.
    fn insert_executable_contract(&self, contract_address: &Address) -> Result<ExecutableContract>;
    /// Registers a token in the listing and as a valid target of relayed transactions.
    ///
    /// # Description
    ///
    /// Both rows are written in a single transaction. Fails with [crate::IndexerError::DataConflict], and writes
    /// nothing, if the token is already listed or already executable.
    fn register_token(&self, listing: &Listing) -> Result<ExecutableContract>;
    /// Whether raw transactions may be relayed to the contract.
    fn is_executable(&self, contract_address: &Address) -> Result<bool>;
    /// Stores the health status of an RPC node.
    fn upsert_node(&self, node: &Node) -> Result<()>;
}
