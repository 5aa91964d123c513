// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Deterministic identifier of a notification.
//!
//! # Description
//!
//! The identifier packs the position of the source log and a priority slot into a fixed width hexadecimal
//! string: `0x` + block number (12 digits) + transaction index (6 digits) + log index (6 digits) + option (2
//! digits). Every field is zero padded, so the lexicographic order of two identifiers is the order of the logs
//! in the chain, and two notifications produced by the same log are ordered by their option slot.

use crate::{IndexerError, contracts::log_position};
use alloy::rpc::types::Log;
use anyhow::Result;
use std::{fmt, str::FromStr};

const BLOCK_DIGITS: usize = 12;
const TRANSACTION_DIGITS: usize = 6;
const LOG_INDEX_DIGITS: usize = 6;
const OPTION_DIGITS: usize = 2;
const ID_DIGITS: usize = BLOCK_DIGITS + TRANSACTION_DIGITS + LOG_INDEX_DIGITS + OPTION_DIGITS;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NotificationId {
    pub block_number: u64,
    pub transaction_index: u64,
    pub log_index: u64,
    pub option: u8,
}

impl NotificationId {
    pub fn new(block_number: u64, transaction_index: u64, log_index: u64, option: u8) -> Result<Self> {
        Self::check_width("block number", block_number, BLOCK_DIGITS)?;
        Self::check_width("transaction index", transaction_index, TRANSACTION_DIGITS)?;
        Self::check_width("log index", log_index, LOG_INDEX_DIGITS)?;

        Ok(Self {
            block_number,
            transaction_index,
            log_index,
            option,
        })
    }

    /// Builds the identifier of the notification produced by `log` in the given option slot.
    pub fn from_log(log: &Log, option: u8) -> Result<Self> {
        let (block_number, transaction_index, log_index) = log_position(log)?;
        Self::new(block_number, transaction_index, log_index, option)
    }

    fn check_width(field: &str, value: u64, digits: usize) -> Result<()> {
        if value >> (4 * digits) != 0 {
            return Err(IndexerError::InvalidParameter(format!(
                "{field} {value} does not fit in {digits} hex digits"
            ))
            .into());
        }
        Ok(())
    }
}

impl fmt::Display for NotificationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "0x{:012x}{:06x}{:06x}{:02x}",
            self.block_number, self.transaction_index, self.log_index, self.option
        )
    }
}

impl FromStr for NotificationId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix("0x")
            .filter(|d| d.len() == ID_DIGITS && d.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| {
                IndexerError::InvalidParameter(format!("malformed notification id: {s}"))
            })?;

        let (block, rest) = digits.split_at(BLOCK_DIGITS);
        let (transaction, rest) = rest.split_at(TRANSACTION_DIGITS);
        let (index, option) = rest.split_at(LOG_INDEX_DIGITS);

        Ok(Self {
            block_number: u64::from_str_radix(block, 16)?,
            transaction_index: u64::from_str_radix(transaction, 16)?,
            log_index: u64::from_str_radix(index, 16)?,
            option: u8::from_str_radix(option, 16)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{LogBuilder, fake_address};
    use crate::contracts::IbetToken;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn identifier_is_zero_padded_hex() {
        let id = NotificationId::new(0x1a2b, 3, 0x10, 2).unwrap();

        assert_eq!(id.to_string(), "0x000000001a2b00000300001002");
        assert_eq!(id.to_string().len(), 2 + ID_DIGITS);
    }

    #[test]
    fn identifier_comes_from_the_log_position() {
        let log = LogBuilder::new(fake_address())
            .block(4_096)
            .transaction_index(7)
            .log_index(12)
            .build(&IbetToken::Redeem {});

        let id = NotificationId::from_log(&log, 1).unwrap();

        assert_eq!(id.to_string(), "0x00000000100000000700000c01");
    }

    #[rstest]
    #[case::next_block((99, 5, 5, 2), (100, 0, 0, 0))]
    #[case::block_boundary_in_hex((0xf, 0, 0, 0), (0x10, 0, 0, 0))]
    #[case::next_transaction((100, 1, 9, 0), (100, 2, 0, 0))]
    #[case::next_log((100, 1, 0xff, 0), (100, 1, 0x100, 0))]
    #[case::priority_slot((100, 1, 1, 0), (100, 1, 1, 2))]
    fn string_order_follows_chain_order(
        #[case] earlier: (u64, u64, u64, u8),
        #[case] later: (u64, u64, u64, u8),
    ) {
        let earlier = NotificationId::new(earlier.0, earlier.1, earlier.2, earlier.3).unwrap();
        let later = NotificationId::new(later.0, later.1, later.2, later.3).unwrap();

        assert!(earlier.to_string() < later.to_string());
        assert!(earlier < later);
    }

    #[rstest]
    #[case::block(1 << 48, 0, 0)]
    #[case::transaction(0, 1 << 24, 0)]
    #[case::log_index(0, 0, 1 << 24)]
    fn oversized_fields_are_rejected(
        #[case] block: u64,
        #[case] transaction: u64,
        #[case] index: u64,
    ) {
        let error = NotificationId::new(block, transaction, index, 0).unwrap_err();

        assert!(matches!(
            IndexerError::find(&error),
            Some(IndexerError::InvalidParameter(_))
        ));
    }

    #[test]
    fn identifier_parses_back() {
        let id = NotificationId::new(123_456, 2, 3, 1).unwrap();

        assert_eq!(id.to_string().parse::<NotificationId>().unwrap(), id);
    }

    #[rstest]
    #[case::missing_prefix("000000001a2b00000300001002")]
    #[case::too_short("0x1a2b")]
    #[case::not_hex("0x00000000zzzz00000300001002")]
    fn malformed_identifiers_are_rejected(#[case] raw: &str) {
        assert!(raw.parse::<NotificationId>().is_err());
    }
}
