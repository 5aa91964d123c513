// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Jobs that turn contract events into user notifications.
//!
//! # Description
//!
//! Every notification kind is a zero sized type implementing [NotificationKind]: it names the source event and
//! knows how to read the token, the recipient and the payload out of it. A [NotificationWatcher] instantiated for
//! one kind and one token template is a [LogHandler], so each kind runs as its own job with its own checkpoint.

mod exchange;
mod token;

pub use exchange::*;
pub use token::*;

use crate::{
    TokenTemplate,
    chain::ChainClient,
    contracts::decode_event,
    engine::{EngineOptions, LogHandler, ScanContext, SyncEngine, SyncJob},
    metrics::MetricsHandle,
    notification_id::NotificationId,
    registry::{CompanyDirectory, ContractRegistry},
    storage::{Notification, NotificationArgs, NotificationMetainfo, NotificationType, RowMutation, Storage},
};
use alloy::{
    primitives::{Address, B256},
    rpc::types::Log,
    sol_types::SolEvent,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::{collections::HashSet, marker::PhantomData, sync::Arc};
use tracing::debug;

/// A notification derived from one contract event.
pub trait NotificationKind: Send + Sync + 'static {
    type Event: SolEvent + Send + Sync;

    const NOTIFICATION_TYPE: NotificationType;

    /// Token the event refers to. `emitter` is the contract that emitted the log.
    fn token_address(event: &Self::Event, emitter: Address) -> Address;

    /// Account that receives the notification.
    fn recipient(event: &Self::Event) -> Option<Address>;

    fn args(event: &Self::Event) -> NotificationArgs;

    /// Whether the event produces a notification at all.
    fn accepts(_event: &Self::Event) -> bool {
        true
    }

    /// Sender of the tokens moved by the event. Movements sent by an exchange are not notified.
    fn sender(_event: &Self::Event) -> Option<Address> {
        None
    }
}

/// Contracts whose logs a watcher scans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchSource {
    /// One exchange contract, the events carry the token address.
    Exchange(Address),
    /// The listed tokens of the watcher template.
    ListedTokens { public_only: bool },
}

/// Collaborators shared by every watcher.
#[derive(Clone)]
pub struct WatcherContext {
    pub registry: Arc<dyn ContractRegistry>,
    pub companies: Arc<dyn CompanyDirectory>,
    /// Every exchange the indexer is configured with.
    pub exchanges: Arc<HashSet<Address>>,
}

pub struct NotificationWatcher<K: NotificationKind> {
    job_name: String,
    source: WatchSource,
    template: TokenTemplate,
    context: WatcherContext,
    _kind: PhantomData<fn() -> K>,
}

impl<K: NotificationKind> NotificationWatcher<K> {
    pub fn new(source: WatchSource, template: TokenTemplate, context: WatcherContext) -> Self {
        Self {
            job_name: format!("notification/{template}/{}", K::NOTIFICATION_TYPE),
            source,
            template,
            context,
            _kind: PhantomData,
        }
    }

    /// Whether the token is one of the template of the watcher.
    async fn is_of_template(&self, token_address: Address) -> Result<bool> {
        Ok(self.context.registry.resolve_token_type(token_address).await? == Some(self.template))
    }

    async fn metainfo(&self, token_address: Address, emitter: Address) -> Result<NotificationMetainfo> {
        let registry = &self.context.registry;
        let owner = registry.token_owner(token_address).await?;
        let exchange_address = match self.source {
            WatchSource::Exchange(_) => Some(emitter),
            WatchSource::ListedTokens { .. } => registry.resolve_tradable_exchange(token_address).await?,
        };

        Ok(NotificationMetainfo {
            company_name: self.context.companies.lookup(&owner).corporate_name,
            token_address: token_address.to_string(),
            token_name: registry.token_name(token_address).await?,
            exchange_address: exchange_address.map(|a| a.to_string()).unwrap_or_default(),
            token_type: self.template.to_string(),
        })
    }

    /// Whether the tokens were sent by an exchange.
    async fn is_sent_by_exchange(&self, sender: Address, token_address: Address) -> Result<bool> {
        if self.context.exchanges.contains(&sender) {
            return Ok(true);
        }
        Ok(self
            .context
            .registry
            .resolve_tradable_exchange(token_address)
            .await?
            == Some(sender))
    }

    async fn notify(&self, log: &Log, ctx: &mut ScanContext<'_>) -> Result<Option<Notification>> {
        let event: K::Event = decode_event(log)?;
        if !K::accepts(&event) {
            return Ok(None);
        }

        let emitter = log.address();
        let token_address = K::token_address(&event, emitter);
        if let WatchSource::Exchange(_) = self.source
            && !(ctx.is_listed(&token_address)? && self.is_of_template(token_address).await?)
        {
            debug!("{}: skipping event of the unlisted token {token_address}", self.job_name);
            return Ok(None);
        }
        if let Some(sender) = K::sender(&event)
            && self.is_sent_by_exchange(sender, token_address).await?
        {
            debug!(
                "{}: skipping movement of {token_address} sent by the exchange {sender}",
                self.job_name
            );
            return Ok(None);
        }

        let id = NotificationId::from_log(log, K::NOTIFICATION_TYPE.id_option())?;
        let block_timestamp = ctx.block_timestamp(id.block_number).await?;

        Ok(Some(Notification {
            notification_id: id.to_string(),
            notification_type: K::NOTIFICATION_TYPE,
            priority: K::NOTIFICATION_TYPE.priority(),
            address: K::recipient(&event),
            block_timestamp,
            args: serde_json::to_value(K::args(&event))?,
            metainfo: self.metainfo(token_address, emitter).await?,
            is_read: false,
            is_flagged: false,
            is_deleted: false,
            deleted_at: None,
            created: Utc::now(),
        }))
    }
}

#[async_trait]
impl<K: NotificationKind> LogHandler for NotificationWatcher<K> {
    fn job_name(&self) -> &str {
        &self.job_name
    }

    fn event_topics(&self) -> Vec<B256> {
        vec![K::Event::SIGNATURE_HASH]
    }

    async fn target_addresses(&mut self, ctx: &mut ScanContext<'_>) -> Result<Vec<Address>> {
        match self.source {
            WatchSource::Exchange(exchange) => Ok(vec![exchange]),
            WatchSource::ListedTokens { public_only } => {
                let tracked: HashSet<Address> = self
                    .context
                    .registry
                    .list_tracked_token_addresses(Some(self.template))
                    .await?
                    .into_iter()
                    .collect();
                Ok(ctx
                    .storage
                    .listed_tokens(public_only)?
                    .into_iter()
                    .filter(|token_address| tracked.contains(token_address))
                    .collect())
            }
        }
    }

    async fn transform(&mut self, logs: &[Log], ctx: &mut ScanContext<'_>) -> Result<Vec<RowMutation>> {
        let mut mutations = Vec::new();
        for log in logs {
            if log.topic0() != Some(&K::Event::SIGNATURE_HASH) {
                continue;
            }
            if let Some(notification) = self.notify(log, ctx).await? {
                mutations.push(RowMutation::Notify(notification));
            }
        }
        Ok(mutations)
    }
}

/// Builds the notification jobs of the token templates.
pub struct WatcherFactory {
    pub chain: Arc<dyn ChainClient>,
    pub storage: Arc<dyn Storage>,
    pub options: EngineOptions,
    pub metrics: MetricsHandle,
    pub context: WatcherContext,
}

impl WatcherFactory {
    fn job<K: NotificationKind>(&self, source: WatchSource, template: TokenTemplate) -> Result<Box<dyn SyncJob>> {
        let watcher = NotificationWatcher::<K>::new(source, template, self.context.clone());
        let engine = SyncEngine::new(watcher, self.chain.clone(), self.storage.clone(), self.options)?
            .with_metrics(self.metrics.clone());
        Ok(Box::new(engine))
    }

    /// Jobs of the order and agreement notifications of one exchange.
    pub fn exchange_watchers(&self, template: TokenTemplate, exchange: Address) -> Result<Vec<Box<dyn SyncJob>>> {
        let source = WatchSource::Exchange(exchange);
        Ok(vec![
            self.job::<NewOrderNotice>(source, template)?,
            self.job::<CancelOrderNotice>(source, template)?,
            self.job::<BuyAgreementNotice>(source, template)?,
            self.job::<SellAgreementNotice>(source, template)?,
            self.job::<BuySettlementOkNotice>(source, template)?,
            self.job::<SellSettlementOkNotice>(source, template)?,
            self.job::<BuySettlementNgNotice>(source, template)?,
            self.job::<SellSettlementNgNotice>(source, template)?,
        ])
    }

    /// Jobs of the notifications emitted by the tokens of one template.
    pub fn token_watchers(&self, template: TokenTemplate) -> Result<Vec<Box<dyn SyncJob>>> {
        let public = WatchSource::ListedTokens { public_only: true };
        let mut jobs = vec![
            self.job::<SuspendNotice>(public, template)?,
            self.job::<TransferNotice>(WatchSource::ListedTokens { public_only: false }, template)?,
        ];

        match template {
            TokenTemplate::IbetStraightBond | TokenTemplate::IbetShare => {
                jobs.push(self.job::<StartInitialOfferingNotice>(public, template)?);
                jobs.push(self.job::<StopInitialOfferingNotice>(public, template)?);
                jobs.push(self.job::<ApplyForOfferingNotice>(public, template)?);
                jobs.push(self.job::<AllotNotice>(public, template)?);
            }
            TokenTemplate::IbetMembership | TokenTemplate::IbetCoupon => {
                jobs.push(self.job::<StartOfferingNotice>(public, template)?);
                jobs.push(self.job::<StopOfferingNotice>(public, template)?);
            }
        }
        if template == TokenTemplate::IbetStraightBond {
            jobs.push(self.job::<RedeemNotice>(public, template)?);
        }

        Ok(jobs)
    }
}
