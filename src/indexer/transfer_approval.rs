// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

use crate::{
    TokenTemplate,
    contracts::{IbetSecurityTokenEscrow, IbetToken, decode_event, log_position, non_zero},
    engine::{LogHandler, ScanContext},
    indexer::quantities,
    registry::ContractRegistry,
    storage::{IdxTransferApproval, RowMutation, TransferApplicationKey},
};
use alloy::{
    primitives::{Address, B256},
    rpc::types::Log,
    sol_types::SolEvent,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};
use tracing::debug;

/// Parses the `data` attached to a transfer application or approval.
///
/// The applicant and the approver store a Unix epoch in seconds, possibly with a fractional part. Anything else
/// yields `None`.
pub fn parse_epoch(data: &str) -> Option<DateTime<Utc>> {
    let seconds: f64 = data.trim().parse().ok()?;
    if !seconds.is_finite() {
        return None;
    }
    let micros = (seconds * 1_000_000.0).round();
    if micros < i64::MIN as f64 || micros > i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_micros(micros as i64)
}

/// Job that keeps the `idx_transfer_approval` table in sync.
///
/// # Description
///
/// The job tracks the listed security tokens (bonds and shares) and the escrow exchanges they trade on. Transfers
/// applied for directly on a token are keyed with an empty exchange, the ones applied for through an escrow are
/// keyed with the escrow contract. Escrow events of tokens outside the listing are ignored.
///
/// A token listed late catches up together with its escrow, whose events about other tokens are skipped.
pub struct TransferApprovalIndexer {
    registry: Arc<dyn ContractRegistry>,
    templates: Vec<TokenTemplate>,
    tokens: HashSet<Address>,
    /// Escrow exchange of each tracked token that has one.
    escrows: HashMap<Address, Address>,
}

impl TransferApprovalIndexer {
    pub fn new(registry: Arc<dyn ContractRegistry>) -> Self {
        Self {
            registry,
            templates: TokenTemplate::ALL
                .into_iter()
                .filter(TokenTemplate::supports_transfer_approval)
                .collect(),
            tokens: HashSet::new(),
            escrows: HashMap::new(),
        }
    }

    fn key(token_address: Address, exchange_address: Option<Address>, application_id: i64) -> TransferApplicationKey {
        TransferApplicationKey {
            token_address,
            exchange_address,
            application_id,
        }
    }

    /// Whether an escrow event refers to one of the tracked tokens and belongs to the current scan.
    fn is_tracked(&self, token_address: &Address, log: &Log, ctx: &ScanContext<'_>) -> bool {
        let tracked = self.tokens.contains(token_address);
        if !tracked {
            debug!(
                "Skipping escrow event of the untracked token {token_address} at block {:?}",
                log.block_number
            );
        }
        tracked && (ctx.in_scope(&log.address()) || ctx.in_scope(token_address))
    }

    async fn transform_log(
        &self,
        log: &Log,
        ctx: &mut ScanContext<'_>,
    ) -> Result<Option<RowMutation>> {
        let emitter = log.address();
        let topic = log.topic0().copied().unwrap_or_default();
        let block = log_position(log)?.0;

        let mutation = match topic {
            IbetToken::ApplyForTransfer::SIGNATURE_HASH => {
                let event: IbetToken::ApplyForTransfer = decode_event(log)?;
                let Some([application_id, value]) = quantities([event.index, event.value], log)
                else {
                    return Ok(None);
                };
                RowMutation::ApplyForTransfer(IdxTransferApproval {
                    token_address: emitter,
                    exchange_address: None,
                    application_id,
                    from_address: event.from,
                    to_address: event.to,
                    value,
                    application_datetime: parse_epoch(&event.data),
                    application_blocktimestamp: ctx.block_timestamp(block).await?,
                    approval_datetime: None,
                    approval_blocktimestamp: None,
                    cancelled: None,
                    escrow_finished: None,
                    transfer_approved: None,
                })
            }
            IbetToken::CancelTransfer::SIGNATURE_HASH => {
                let event: IbetToken::CancelTransfer = decode_event(log)?;
                let Some([application_id]) = quantities([event.index], log) else {
                    return Ok(None);
                };
                RowMutation::CancelTransfer(Self::key(emitter, None, application_id))
            }
            IbetToken::ApproveTransfer::SIGNATURE_HASH => {
                let event: IbetToken::ApproveTransfer = decode_event(log)?;
                let Some([application_id]) = quantities([event.index], log) else {
                    return Ok(None);
                };
                RowMutation::ApproveTransfer {
                    key: Self::key(emitter, None, application_id),
                    approval_datetime: parse_epoch(&event.data),
                    approval_blocktimestamp: ctx.block_timestamp(block).await?,
                }
            }
            IbetSecurityTokenEscrow::ApplyForTransfer::SIGNATURE_HASH => {
                let event: IbetSecurityTokenEscrow::ApplyForTransfer = decode_event(log)?;
                if !self.is_tracked(&event.token, log, ctx) {
                    return Ok(None);
                }
                let Some([application_id, value]) =
                    quantities([event.escrowId, event.value], log)
                else {
                    return Ok(None);
                };
                RowMutation::ApplyForTransfer(IdxTransferApproval {
                    token_address: event.token,
                    exchange_address: Some(emitter),
                    application_id,
                    from_address: event.from,
                    to_address: event.to,
                    value,
                    application_datetime: parse_epoch(&event.data),
                    application_blocktimestamp: ctx.block_timestamp(block).await?,
                    approval_datetime: None,
                    approval_blocktimestamp: None,
                    cancelled: None,
                    escrow_finished: None,
                    transfer_approved: None,
                })
            }
            IbetSecurityTokenEscrow::CancelTransfer::SIGNATURE_HASH => {
                let event: IbetSecurityTokenEscrow::CancelTransfer = decode_event(log)?;
                if !self.is_tracked(&event.token, log, ctx) {
                    return Ok(None);
                }
                let Some([application_id]) = quantities([event.escrowId], log) else {
                    return Ok(None);
                };
                RowMutation::CancelTransfer(Self::key(event.token, Some(emitter), application_id))
            }
            IbetSecurityTokenEscrow::EscrowFinished::SIGNATURE_HASH => {
                let event: IbetSecurityTokenEscrow::EscrowFinished = decode_event(log)?;
                if !event.transferApprovalRequired || !self.is_tracked(&event.token, log, ctx) {
                    return Ok(None);
                }
                let Some([application_id]) = quantities([event.escrowId], log) else {
                    return Ok(None);
                };
                RowMutation::FinishEscrow(Self::key(event.token, Some(emitter), application_id))
            }
            IbetSecurityTokenEscrow::ApproveTransfer::SIGNATURE_HASH => {
                let event: IbetSecurityTokenEscrow::ApproveTransfer = decode_event(log)?;
                if !self.is_tracked(&event.token, log, ctx) {
                    return Ok(None);
                }
                let Some([application_id]) = quantities([event.escrowId], log) else {
                    return Ok(None);
                };
                RowMutation::ApproveTransfer {
                    key: Self::key(event.token, Some(emitter), application_id),
                    approval_datetime: parse_epoch(&event.data),
                    approval_blocktimestamp: ctx.block_timestamp(block).await?,
                }
            }
            _ => return Ok(None),
        };

        Ok(Some(mutation))
    }
}

#[async_trait]
impl LogHandler for TransferApprovalIndexer {
    fn job_name(&self) -> &str {
        "index/transfer_approval"
    }

    fn event_topics(&self) -> Vec<B256> {
        vec![
            IbetToken::ApplyForTransfer::SIGNATURE_HASH,
            IbetToken::CancelTransfer::SIGNATURE_HASH,
            IbetToken::ApproveTransfer::SIGNATURE_HASH,
            IbetSecurityTokenEscrow::ApplyForTransfer::SIGNATURE_HASH,
            IbetSecurityTokenEscrow::CancelTransfer::SIGNATURE_HASH,
            IbetSecurityTokenEscrow::EscrowFinished::SIGNATURE_HASH,
            IbetSecurityTokenEscrow::ApproveTransfer::SIGNATURE_HASH,
        ]
    }

    /// Listed bonds and shares, plus the exchanges they are tradable on.
    async fn target_addresses(&mut self, ctx: &mut ScanContext<'_>) -> Result<Vec<Address>> {
        let mut tracked = HashSet::new();
        for template in &self.templates {
            tracked.extend(self.registry.list_tracked_token_addresses(Some(*template)).await?);
        }

        let mut tokens = HashSet::new();
        let mut escrows = HashMap::new();
        let mut exchanges = Vec::new();
        for token_address in ctx.storage.listed_tokens(false)? {
            if !tracked.contains(&token_address) {
                continue;
            }
            tokens.insert(token_address);
            if let Some(exchange) = self
                .registry
                .resolve_tradable_exchange(token_address)
                .await?
                .and_then(non_zero)
            {
                escrows.insert(token_address, exchange);
                if !exchanges.contains(&exchange) {
                    exchanges.push(exchange);
                }
            }
        }

        let mut targets: Vec<Address> = tokens.iter().copied().collect();
        targets.sort();
        targets.extend(exchanges);
        self.tokens = tokens;
        self.escrows = escrows;
        Ok(targets)
    }

    fn catch_up_companions(&self, targets: &[Address]) -> Vec<Address> {
        let mut companions: Vec<Address> = targets
            .iter()
            .filter_map(|token| self.escrows.get(token).copied())
            .collect();
        companions.sort();
        companions.dedup();
        companions
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
