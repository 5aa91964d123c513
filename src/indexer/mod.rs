// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Handlers that replay contract events into the index tables.

mod order_agreement;
mod transfer_approval;

pub use order_agreement::OrderAgreementIndexer;
pub use transfer_approval::{TransferApprovalIndexer, parse_epoch};

use crate::contracts::u256_to_i64;
use alloy::{primitives::U256, rpc::types::Log};
use tracing::warn;

/// Hash of the transaction that emitted the log, empty when the node did not return it.
pub(crate) fn transaction_hash(log: &Log) -> String {
    log.transaction_hash
        .map(|hash| hash.to_string())
        .unwrap_or_default()
}

/// Converts the quantities of an event into the signed 64-bit integers stored in the index tables.
///
/// Returns `None` and warns when one of them overflows, the event is then skipped.
pub(crate) fn quantities<const N: usize>(values: [U256; N], log: &Log) -> Option<[i64; N]> {
    let mut converted = [0i64; N];
    for (slot, value) in converted.iter_mut().zip(values) {
        match u256_to_i64(value) {
            Some(value) => *slot = value,
            None => {
                warn!(
                    "Skipping event at block {:?} log index {:?}: quantity {value} overflows",
                    log.block_number, log.log_index
                );
                return None;
            }
        }
    }
    Some(converted)
}
