// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

use crate::{
    contracts::{IbetExchange, decode_event, log_position},
    engine::{LogHandler, ScanContext},
    indexer::{quantities, transaction_hash},
    storage::{AgreementStatus, IdxOrder, RowMutation},
};
use alloy::{
    primitives::{Address, B256},
    rpc::types::Log,
    sol_types::SolEvent,
};
use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

/// Job that keeps the `idx_order` and `idx_agreement` tables in sync with the exchange contracts.
///
/// # Description
///
/// Every order and agreement event of the configured exchanges is replayed, but only the events whose token is in
/// the listing are persisted. Quantities that do not fit in a signed 64-bit column skip the event.
pub struct OrderAgreementIndexer {
    exchanges: Vec<Address>,
}

impl OrderAgreementIndexer {
    pub fn new(exchanges: Vec<Address>) -> Self {
        let mut exchanges = exchanges;
        exchanges.sort();
        exchanges.dedup();
        Self { exchanges }
    }

    async fn transform_log(
        &self,
        log: &Log,
        ctx: &mut ScanContext<'_>,
    ) -> Result<Option<RowMutation>> {
        let exchange_address = log.address();
        let topic = log.topic0().copied().unwrap_or_default();

        match topic {
            IbetExchange::NewOrder::SIGNATURE_HASH => {
                let event: IbetExchange::NewOrder = decode_event(log)?;
                if !Self::is_tracked(ctx, &event.tokenAddress, log)? {
                    return Ok(None);
                }
                let Some([order_id, price, amount]) =
                    quantities([event.orderId, event.price, event.amount], log)
                else {
                    return Ok(None);
                };
                let order_timestamp = match log.block_number {
                    Some(block) => Some(ctx.block_timestamp(block).await?),
                    None => None,
                };

                Ok(Some(RowMutation::NewOrder(IdxOrder {
                    exchange_address,
                    order_id,
                    unique_order_id: IdxOrder::unique_order_id(&exchange_address, order_id),
                    token_address: event.tokenAddress,
                    account_address: event.accountAddress,
                    counterpart_address: None,
                    is_buy: event.isBuy,
                    price,
                    amount,
                    agent_address: event.agentAddress,
                    is_cancelled: false,
                    order_timestamp,
                    transaction_hash: transaction_hash(log),
                })))
            }
            IbetExchange::CancelOrder::SIGNATURE_HASH => {
                let event: IbetExchange::CancelOrder = decode_event(log)?;
                if !Self::is_tracked(ctx, &event.tokenAddress, log)? {
                    return Ok(None);
                }
                let Some([order_id]) = quantities([event.orderId], log) else {
                    return Ok(None);
                };
                Ok(Some(RowMutation::CancelOrder {
                    exchange_address,
                    order_id,
                }))
            }
            IbetExchange::Agree::SIGNATURE_HASH => {
                let event: IbetExchange::Agree = decode_event(log)?;
                if !Self::is_tracked(ctx, &event.tokenAddress, log)? {
                    return Ok(None);
                }
                let Some([order_id, agreement_id, price, amount]) = quantities(
                    [event.orderId, event.agreementId, event.price, event.amount],
                    log,
                ) else {
                    return Ok(None);
                };
                let block = log_position(log)?.0;

                Ok(Some(RowMutation::NewAgreement {
                    exchange_address,
                    order_id,
                    agreement_id,
                    buyer_address: event.buyAddress,
                    seller_address: event.sellAddress,
                    price,
                    amount,
                    agreement_timestamp: ctx.block_timestamp(block).await?,
                }))
            }
            IbetExchange::SettlementOK::SIGNATURE_HASH => {
                let event: IbetExchange::SettlementOK = decode_event(log)?;
                if !Self::is_tracked(ctx, &event.tokenAddress, log)? {
                    return Ok(None);
                }
                let Some([order_id, agreement_id]) =
                    quantities([event.orderId, event.agreementId], log)
                else {
                    return Ok(None);
                };
                let block = log_position(log)?.0;

                Ok(Some(RowMutation::SettleAgreement {
                    exchange_address,
                    order_id,
                    agreement_id,
                    status: AgreementStatus::Done,
                    settlement_timestamp: Some(ctx.block_timestamp(block).await?),
                }))
            }
            IbetExchange::SettlementNG::SIGNATURE_HASH => {
                let event: IbetExchange::SettlementNG = decode_event(log)?;
                if !Self::is_tracked(ctx, &event.tokenAddress, log)? {
                    return Ok(None);
                }
                let Some([order_id, agreement_id]) =
                    quantities([event.orderId, event.agreementId], log)
                else {
                    return Ok(None);
                };

                Ok(Some(RowMutation::SettleAgreement {
                    exchange_address,
                    order_id,
                    agreement_id,
                    status: AgreementStatus::Canceled,
                    settlement_timestamp: None,
                }))
            }
            _ => Ok(None),
        }
    }

    fn is_tracked(ctx: &mut ScanContext<'_>, token_address: &Address, log: &Log) -> Result<bool> {
        let listed = ctx.is_listed(token_address)?;
        if !listed {
            debug!(
                "Skipping event of the unlisted token {token_address} at block {:?}",
                log.block_number
            );
        }
        Ok(listed)
    }
}

#[async_trait]
impl LogHandler for OrderAgreementIndexer {
    fn job_name(&self) -> &str {
        "index/order_agreement"
    }

    fn event_topics(&self) -> Vec<B256> {
        vec![
            IbetExchange::NewOrder::SIGNATURE_HASH,
            IbetExchange::CancelOrder::SIGNATURE_HASH,
            IbetExchange::Agree::SIGNATURE_HASH,
            IbetExchange::SettlementOK::SIGNATURE_HASH,
            IbetExchange::SettlementNG::SIGNATURE_HASH,
        ]
    }

    async fn target_addresses(&mut self, _ctx: &mut ScanContext<'_>) -> Result<Vec<Address>> {
        Ok(self.exchanges.clone())
    }

    async fn transform(
        &mut self,
        logs: &[Log],
        ctx: &mut ScanContext<'_>,
    ) -> Result<Vec<RowMutation>> {
        let mut mutations = Vec::with_capacity(logs.len());
        for log in logs {
            if let Some(mutation) = self.transform_log(log, ctx).await? {
                mutations.push(mutation);
            }
        }
        Ok(mutations)
    }
}
