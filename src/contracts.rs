// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! ABI definitions of the ibet contracts consumed by the indexer.

use crate::IndexerError;
use alloy::{
    primitives::{Address, U256},
    rpc::types::Log,
    sol,
    sol_types::SolEvent,
};
use anyhow::Result;

sol! {
    /// Order book exchange shared by bond, share, membership and coupon tokens.
    #[derive(Debug, PartialEq, Eq)]
    interface IbetExchange {
        event NewOrder(
            address indexed tokenAddress,
            uint256 orderId,
            address indexed accountAddress,
            bool indexed isBuy,
            uint256 price,
            uint256 amount,
            address agentAddress
        );
        event CancelOrder(
            address indexed tokenAddress,
            uint256 orderId,
            address indexed accountAddress,
            bool indexed isBuy,
            uint256 price,
            uint256 amount,
            address agentAddress
        );
        event Agree(
            address indexed tokenAddress,
            uint256 orderId,
            uint256 agreementId,
            address indexed buyAddress,
            address indexed sellAddress,
            uint256 price,
            uint256 amount,
            address agentAddress
        );
        event SettlementOK(
            address indexed tokenAddress,
            uint256 orderId,
            uint256 agreementId,
            address indexed buyAddress,
            address indexed sellAddress,
            uint256 price,
            uint256 amount,
            address agentAddress
        );
        event SettlementNG(
            address indexed tokenAddress,
            uint256 orderId,
            uint256 agreementId,
            address indexed buyAddress,
            address indexed sellAddress,
            uint256 price,
            uint256 amount,
            address agentAddress
        );
    }

    /// Events and views common to the ibet token templates.
    #[derive(Debug, PartialEq, Eq)]
    interface IbetToken {
        event Transfer(address indexed from, address indexed to, uint256 value);
        event ChangeStatus(bool status);
        event ChangeInitialOfferingStatus(bool status);
        event ChangeOfferingStatus(bool status);
        event Redeem();
        event ApplyFor(address indexed accountAddress, uint256 amount);
        event Allot(address indexed accountAddress, uint256 amount);
        event ApplyForTransfer(uint256 indexed index, address from, address to, uint256 value, string data);
        event CancelTransfer(uint256 indexed index, address from, address to);
        event ApproveTransfer(uint256 indexed index, address from, address to, string data);

        function name() external view returns (string);
        function owner() external view returns (address);
        function tradableExchange() external view returns (address);
    }

    /// Escrow exchange used to transfer security tokens that require an approval.
    #[derive(Debug, PartialEq, Eq)]
    interface IbetSecurityTokenEscrow {
        event ApplyForTransfer(
            uint256 indexed escrowId,
            address indexed token,
            address from,
            address to,
            uint256 value,
            string data
        );
        event CancelTransfer(uint256 indexed escrowId, address indexed token, address from, address to);
        event ApproveTransfer(uint256 indexed escrowId, address indexed token, string data);
        event EscrowFinished(
            uint256 indexed escrowId,
            address indexed token,
            address from,
            address to,
            uint256 amount,
            address agent,
            bool transferApprovalRequired,
            string data
        );
    }

    /// Registry of the tokens issued on the platform.
    #[derive(Debug, PartialEq, Eq)]
    interface TokenList {
        function getListLength() external view returns (uint256);
        function getTokenByIndex(uint256 _index) external view returns (address token_address, string token_template, address owner_address);
        function getTokenByAddress(address _token) external view returns (address token_address, string token_template, address owner_address);
    }
}

/// Decodes a log into the event `E`.
pub fn decode_event<E: SolEvent>(log: &Log) -> Result<E> {
    let decoded = log.log_decode::<E>().map_err(|e| {
        IndexerError::Decode(format!(
            "{} at block {:?} log index {:?}: {e}",
            E::SIGNATURE,
            log.block_number,
            log.log_index
        ))
    })?;
    Ok(decoded.inner.data)
}

/// Position of a log in the chain: block number, transaction index and log index.
pub fn log_position(log: &Log) -> Result<(u64, u64, u64)> {
    match (log.block_number, log.transaction_index, log.log_index) {
        (Some(block), Some(transaction), Some(index)) => Ok((block, transaction, index)),
        _ => Err(IndexerError::Decode(format!(
            "log of {} has no position, it might belong to a pending block",
            log.address()
        ))
        .into()),
    }
}

/// Converts an on-chain quantity into the signed 64-bit integer stored in the index tables.
///
/// Values that do not fit are rejected, the caller decides whether to skip the event.
pub fn u256_to_i64(value: U256) -> Option<i64> {
    if value.bit_len() <= 63 {
        Some(value.as_limbs()[0] as i64)
    } else {
        None
    }
}

/// Some views return the zero address when the value is not set.
pub fn non_zero(address: Address) -> Option<Address> {
    (!address.is_zero()).then_some(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{LogBuilder, fake_address};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[rstest]
    #[case::zero(U256::ZERO, Some(0))]
    #[case::small(U256::from(1_000_000u64), Some(1_000_000))]
    #[case::max(U256::from(i64::MAX as u64), Some(i64::MAX))]
    #[case::overflow(U256::from(i64::MAX as u64) + U256::from(1u64), None)]
    #[case::huge(U256::MAX, None)]
    fn quantities_fit_in_i64_or_are_rejected(#[case] value: U256, #[case] expected: Option<i64>) {
        assert_eq!(u256_to_i64(value), expected);
    }

    #[test]
    fn logs_decode_into_their_event() {
        let account = fake_address();
        let event = IbetToken::Allot {
            accountAddress: account,
            amount: U256::from(5u64),
        };
        let log = LogBuilder::new(fake_address()).block(10).build(&event);

        let decoded: IbetToken::Allot = decode_event(&log).unwrap();

        assert_eq!(decoded, event);
        assert_eq!(log_position(&log).unwrap(), (10, 0, 0));
    }

    #[test]
    fn decoding_the_wrong_event_fails() {
        let log = LogBuilder::new(fake_address()).build(&IbetToken::Redeem {});

        let error = decode_event::<IbetToken::Allot>(&log).unwrap_err();

        assert!(matches!(
            IndexerError::find(&error),
            Some(IndexerError::Decode(_))
        ));
    }
}
