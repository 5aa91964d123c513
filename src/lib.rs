// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Library of the ibet indexer.
//!
//! The indexer replays logs emitted by the ibet exchange and token contracts into relational index tables
//! (orders, agreements and transfer approvals) and converts selected events into user facing notifications.

pub mod api_rest;
pub mod chain;
pub mod checkpoint;
pub mod cli;
pub mod configuration;
pub mod contracts;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod indexing_app;
pub mod metrics;
pub mod notification_id;
pub mod registry;
pub mod telemetry;
pub mod watcher;

#[cfg(test)]
pub mod test_utils;

pub use error::IndexerError;
pub use indexing_app::IndexingApp;

use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

/// Module with constants used throughout the application.
pub mod constants {
    /// Number of blocks requested per eth_getLogs call when no batch size is configured.
    pub const DEFAULT_SCAN_BATCH_SIZE: u64 = 1_000_000;
    /// Default poll interval in seconds between two `sync_new_logs` passes of a job.
    pub const DEFAULT_POLL_INTERVAL: u64 = 10;
    /// Successful scan cycles needed to restore a batch size that was reduced by the RPC server.
    pub const SUCCESSFUL_CYCLES_THRESHOLD: u8 = 10;

    /// Timeout in seconds applied to every RPC request.
    pub const DEFAULT_RPC_TIMEOUT: u64 = 30;
    /// How many times a synced node is looked for before giving up.
    pub const DEFAULT_RPC_RETRY_COUNT: u32 = 3;
    /// Wait in milliseconds between two node selection attempts.
    pub const DEFAULT_RPC_RETRY_WAIT: u64 = 3000;
    /// Maximum number of retries of the transport layer for transient errors.
    pub const DEFAULT_BACKOFF_LAYER_MAX_RETRIES: u32 = 5;
    /// Backoff time in milliseconds of the transport layer.
    pub const DEFAULT_BACKOFF_LAYER_BACKOFF_TIME: u64 = 1000;
    /// Compute units per second of the transport layer.
    pub const DEFAULT_BACKOFF_LAYER_CUP_SIZE: u64 = 100;

    /// Interval in seconds between two health checks of the RPC nodes.
    pub const DEFAULT_NODE_MONITOR_INTERVAL: u64 = 10;
    /// Blocks per second that a healthy chain is expected to produce.
    pub const DEFAULT_EXPECTED_BLOCKS_PER_SEC: f64 = 1.0;
    /// Minimum percentage of the expected block generation speed for a node to be considered synced.
    pub const DEFAULT_BLOCK_GENERATION_SPEED_THRESHOLD: f64 = 20.0;
    /// Maximum number of blocks a syncing node may lag behind before being flagged.
    pub const DEFAULT_BLOCK_SYNC_REMAINING_THRESHOLD: u64 = 2;
    /// Number of samples used to compute the block generation speed.
    pub const DEFAULT_BLOCK_SYNC_SAMPLE_SIZE: usize = 5;

    /// Base address for the API server that runs locally.
    pub const DEFAULT_API_SERVER_ADDRESS: &str = "127.0.0.1";
    /// Default port of the API server.
    pub const DEFAULT_API_SERVER_PORT: u16 = 9720;
    /// Path to the DuckDB database file.
    pub const DUCKDB_FILE_PATH: &str = "ibet_indexer.duckdb";
    /// Schema version for the DuckDB database.
    pub const DUCKDB_SCHEMA_VERSION: &str = "0.1.0";
    /// Base table name for the DuckDB database.
    pub const DUCKDB_BASE_TABLE_NAME: &str = "ibet_indexer_info";
    /// Message returned when no RPC node is synchronized.
    pub const BLOCK_SYNC_DOWN_MESSAGE: &str = "Block synchronization is down";
}

/// Process exit codes.
pub mod error_codes {
    pub const ERROR_CODE_WRONG_INPUT_ARGUMENTS: i32 = 2;
    pub const ERROR_CODE_FAILED_TO_LOAD_CONFIGURATION_FROM_FILE: i32 = 3;
    pub const ERROR_CODE_DATABASE_LOCKED: i32 = 4;
    pub const ERROR_CODE_INDEXER_FAILURE: i32 = 5;
}

/// Module with definitions related to the storage of the indexed data.
pub mod storage {
    pub mod models;
    pub mod storage_api;
    pub mod storage_duckdb;
    pub mod storage_query;

    pub use models::*;
    pub use storage_api::{IndexBatch, Storage};
    pub use storage_duckdb::{DuckDBStorage, DuckDBStorageFactory};
    pub use storage_query::{
        AgreementFilter, ListingFilter, NotificationFilter, OrderBookEntry, OrderBookQuery, OrderFilter, Page,
        PageRequest, ResultSet, SortOrder, StorageQuery, TransferApprovalFilter,
    };
}

pub type RxCancellationToken = tokio::sync::broadcast::Receiver<()>;

/// Cancellation token for a graceful shutdown of the components of the indexer app.
#[derive(Clone)]
pub struct CancellationToken(tokio::sync::broadcast::Sender<()>);

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    pub fn new() -> Self {
        Self(tokio::sync::broadcast::Sender::new(1))
    }

    pub fn subscribe(&self) -> RxCancellationToken {
        self.0.subscribe()
    }

    pub fn graceful_shutdown(&self) {
        // Nobody listening means everything already stopped.
        let _ = self.0.send(());
    }
}

/// Token templates deployed on the ibet network.
///
/// # Description
///
/// The template name is the value registered in the token list contract, and it is also the value stored as
/// `token_type` in the notification metadata.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, EnumString, Serialize, Deserialize,
)]
pub enum TokenTemplate {
    IbetStraightBond,
    IbetShare,
    IbetMembership,
    IbetCoupon,
}

impl TokenTemplate {
    pub const ALL: [TokenTemplate; 4] = [
        TokenTemplate::IbetStraightBond,
        TokenTemplate::IbetShare,
        TokenTemplate::IbetMembership,
        TokenTemplate::IbetCoupon,
    ];

    /// Templates whose transfers may require an approval by the issuer.
    pub fn supports_transfer_approval(&self) -> bool {
        matches!(self, TokenTemplate::IbetStraightBond | TokenTemplate::IbetShare)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::str::FromStr;

    #[rstest]
    #[case::bond("IbetStraightBond", TokenTemplate::IbetStraightBond)]
    #[case::share("IbetShare", TokenTemplate::IbetShare)]
    #[case::membership("IbetMembership", TokenTemplate::IbetMembership)]
    #[case::coupon("IbetCoupon", TokenTemplate::IbetCoupon)]
    fn token_template_names_match_the_token_list(#[case] name: &str, #[case] template: TokenTemplate) {
        assert_eq!(TokenTemplate::from_str(name).unwrap(), template);
        assert_eq!(template.to_string(), name);
    }

    #[test]
    fn unknown_template_is_rejected() {
        assert!(TokenTemplate::from_str("IbetDeposit").is_err());
    }

    #[tokio::test]
    async fn cancellation_reaches_every_subscriber() {
        let token = CancellationToken::new();
        let mut first = token.subscribe();
        let mut second = token.subscribe();

        token.graceful_shutdown();

        assert!(first.recv().await.is_ok());
        assert!(second.recv().await.is_ok());
    }
}
