// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Module with utilities for testing.

use crate::{
    IndexerError, TokenTemplate,
    chain::{ChainClient, LogQuery, SyncProgress},
    contracts::{IbetToken, TokenList},
    registry::{Company, CompanyDirectory, ContractRegistry},
    storage::{Listing, Node},
};
use alloy::{
    primitives::{Address, B256, Bytes, U256},
    rpc::types::Log,
    sol_types::{SolCall, SolEvent, SolValue},
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fake::{Fake, Faker};
use std::{
    collections::HashMap,
    sync::Mutex,
};

/// Generates a random address.
pub fn fake_address() -> Address {
    let bytes: [u8; 20] = Faker.fake();
    Address::from(bytes)
}

/// Generates a random transaction hash.
pub fn fake_tx_hash() -> B256 {
    let bytes: [u8; 32] = Faker.fake();
    B256::from(bytes)
}

pub fn node(id: i64, priority: i32, is_synced: bool) -> Node {
    Node {
        id,
        endpoint_uri: format!("http://node-{id}.local:8545/"),
        priority,
        is_synced,
    }
}

pub fn listing_for(token_address: Address, is_public: bool) -> Listing {
    Listing {
        id: None,
        token_address,
        is_public,
        max_holding_quantity: Some(1),
        max_sell_amount: Some(1000),
        owner_address: fake_address(),
    }
}

/// Timestamp that [MockChainClient] reports for a block without an explicit one.
pub fn default_block_timestamp(block_number: u64) -> DateTime<Utc> {
    DateTime::from_timestamp(1_700_000_000 + block_number as i64, 0).unwrap_or_default()
}

/// Builds RPC logs out of `sol!` event values.
#[derive(Debug, Clone)]
pub struct LogBuilder {
    address: Address,
    block: u64,
    transaction_index: u64,
    log_index: u64,
    transaction_hash: B256,
    removed: bool,
}

impl LogBuilder {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            block: 1,
            transaction_index: 0,
            log_index: 0,
            transaction_hash: fake_tx_hash(),
            removed: false,
        }
    }

    pub fn block(mut self, block: u64) -> Self {
        self.block = block;
        self
    }

    pub fn transaction_index(mut self, transaction_index: u64) -> Self {
        self.transaction_index = transaction_index;
        self
    }

    pub fn log_index(mut self, log_index: u64) -> Self {
        self.log_index = log_index;
        self
    }

    pub fn transaction_hash(mut self, transaction_hash: B256) -> Self {
        self.transaction_hash = transaction_hash;
        self
    }

    pub fn removed(mut self) -> Self {
        self.removed = true;
        self
    }

    pub fn build<E: SolEvent>(&self, event: &E) -> Log {
        Log {
            inner: alloy::primitives::Log {
                address: self.address,
                data: event.encode_log_data(),
            },
            block_hash: Some(B256::left_padding_from(&self.block.to_be_bytes())),
            block_number: Some(self.block),
            block_timestamp: None,
            transaction_hash: Some(self.transaction_hash),
            transaction_index: Some(self.transaction_index),
            log_index: Some(self.log_index),
            removed: self.removed,
        }
    }
}

#[derive(Default)]
struct MockChainState {
    head: u64,
    logs: Vec<Log>,
    timestamps: HashMap<u64, DateTime<Utc>>,
    views: HashMap<(Address, Bytes), Bytes>,
    sync_progress: Option<SyncProgress>,
    unreachable: bool,
    get_logs_error: Option<String>,
    /// Largest block range accepted by eth_getLogs.
    max_log_range: Option<u64>,
    log_queries: Vec<LogQuery>,
}

/// In-memory chain.
///
/// # Description
///
/// Logs are served from a list filled by the test, view calls from a table of encoded inputs and outputs. Failures
/// of the node can be injected to exercise the error paths of the callers.
#[derive(Default)]
pub struct MockChainClient {
    state: Mutex<MockChainState>,
}

impl MockChainClient {
    pub fn new(head: u64) -> Self {
        let client = Self::default();
        client.state.lock().unwrap().head = head;
        client
    }

    pub fn set_head(&self, head: u64) {
        self.state.lock().unwrap().head = head;
    }

    pub fn push_log(&self, log: Log) {
        self.state.lock().unwrap().logs.push(log);
    }

    /// Adds the log of `event` emitted by `address` and moves the head up to its block if needed.
    pub fn emit<E: SolEvent>(&self, address: Address, block: u64, log_index: u64, event: &E) -> Log {
        let log = LogBuilder::new(address)
            .block(block)
            .log_index(log_index)
            .build(event);
        let mut state = self.state.lock().unwrap();
        state.head = state.head.max(block);
        state.logs.push(log.clone());
        log
    }

    pub fn set_block_timestamp(&self, block: u64, timestamp: DateTime<Utc>) {
        self.state.lock().unwrap().timestamps.insert(block, timestamp);
    }

    pub fn set_sync_progress(&self, progress: Option<SyncProgress>) {
        self.state.lock().unwrap().sync_progress = progress;
    }

    pub fn fail_with_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    pub fn fail_get_logs_with(&self, message: &str) {
        self.state.lock().unwrap().get_logs_error = Some(message.to_string());
    }

    pub fn clear_get_logs_failure(&self) {
        self.state.lock().unwrap().get_logs_error = None;
    }

    pub fn set_max_log_range(&self, max_log_range: Option<u64>) {
        self.state.lock().unwrap().max_log_range = max_log_range;
    }

    pub fn log_queries(&self) -> Vec<LogQuery> {
        self.state.lock().unwrap().log_queries.clone()
    }

    pub fn set_view<C: SolCall>(&self, to: Address, call: &C, output: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .views
            .insert((to, call.abi_encode().into()), output.into());
    }

    pub fn set_token_name(&self, token: Address, name: &str) {
        self.set_view(token, &IbetToken::nameCall {}, (name.to_string(),).abi_encode_params());
    }

    pub fn set_token_owner(&self, token: Address, owner: Address) {
        self.set_view(token, &IbetToken::ownerCall {}, (owner,).abi_encode_params());
    }

    pub fn set_tradable_exchange(&self, token: Address, exchange: Address) {
        self.set_view(
            token,
            &IbetToken::tradableExchangeCall {},
            (exchange,).abi_encode_params(),
        );
    }

    /// Registers the entries of a token list contract as `(token, template, owner)`.
    pub fn set_token_list(&self, token_list: Address, tokens: &[(Address, &str, Address)]) {
        self.set_view(
            token_list,
            &TokenList::getListLengthCall {},
            (U256::from(tokens.len()),).abi_encode_params(),
        );
        for (index, (token, template, owner)) in tokens.iter().enumerate() {
            let entry = (*token, template.to_string(), *owner).abi_encode_params();
            self.set_view(
                token_list,
                &TokenList::getTokenByIndexCall {
                    _index: U256::from(index),
                },
                entry.clone(),
            );
            self.set_view(
                token_list,
                &TokenList::getTokenByAddressCall { _token: *token },
                entry,
            );
        }
    }

    fn check_reachable(&self) -> Result<()> {
        if self.state.lock().unwrap().unreachable {
            return Err(IndexerError::NodeUnreachable("mock node is down".to_string()).into());
        }
        Ok(())
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    async fn current_block_number(&self) -> Result<u64> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().head)
    }

    async fn get_logs(&self, query: &LogQuery) -> Result<Vec<Log>> {
        self.check_reachable()?;
        let mut state = self.state.lock().unwrap();
        state.log_queries.push(query.clone());

        if let Some(message) = &state.get_logs_error {
            return Err(IndexerError::Rpc(format!("eth_getLogs: {message}")).into());
        }
        if let Some(max) = state.max_log_range
            && query.to_block - query.from_block + 1 > max
        {
            return Err(IndexerError::Rpc(format!(
                "eth_getLogs: error code -32602: query exceeds max block range {max}, retry with the range {}-{}",
                query.from_block,
                query.from_block + max - 1
            ))
            .into());
        }

        let mut logs: Vec<Log> = state
            .logs
            .iter()
            .filter(|log| query.matches(log))
            .cloned()
            .collect();
        logs.sort_by_key(|log| (log.block_number, log.transaction_index, log.log_index));
        Ok(logs)
    }

    async fn get_block_timestamp(&self, block_number: u64) -> Result<DateTime<Utc>> {
        self.check_reachable()?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .timestamps
            .get(&block_number)
            .copied()
            .unwrap_or_else(|| default_block_timestamp(block_number)))
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes> {
        self.check_reachable()?;
        self.state
            .lock()
            .unwrap()
            .views
            .get(&(to, input))
            .cloned()
            .ok_or_else(|| IndexerError::Rpc(format!("eth_call to {to}: execution reverted")).into())
    }

    async fn sync_progress(&self) -> Result<Option<SyncProgress>> {
        self.check_reachable()?;
        Ok(self.state.lock().unwrap().sync_progress)
    }
}

/// Token metadata served by [StaticRegistry].
#[derive(Debug, Clone)]
pub struct StaticToken {
    pub template: TokenTemplate,
    pub name: String,
    pub owner: Address,
    pub tradable_exchange: Option<Address>,
}

/// [ContractRegistry] with a fixed set of tokens.
#[derive(Default)]
pub struct StaticRegistry {
    tokens: Mutex<Vec<(Address, StaticToken)>>,
}

impl StaticRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_token(
        &self,
        token: Address,
        template: TokenTemplate,
        owner: Address,
        tradable_exchange: Option<Address>,
    ) {
        self.tokens.lock().unwrap().push((
            token,
            StaticToken {
                template,
                name: format!("{template} token"),
                owner,
                tradable_exchange,
            },
        ));
    }

    fn get(&self, token: Address) -> Option<StaticToken> {
        self.tokens
            .lock()
            .unwrap()
            .iter()
            .find(|(address, _)| *address == token)
            .map(|(_, entry)| entry.clone())
    }
}

#[async_trait]
impl ContractRegistry for StaticRegistry {
    async fn list_tracked_token_addresses(
        &self,
        template: Option<TokenTemplate>,
    ) -> Result<Vec<Address>> {
        Ok(self
            .tokens
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, entry)| template.is_none_or(|t| t == entry.template))
            .map(|(address, _)| *address)
            .collect())
    }

    async fn resolve_tradable_exchange(&self, token_address: Address) -> Result<Option<Address>> {
        Ok(self.get(token_address).and_then(|t| t.tradable_exchange))
    }

    async fn resolve_token_type(&self, token_address: Address) -> Result<Option<TokenTemplate>> {
        Ok(self.get(token_address).map(|t| t.template))
    }

    async fn token_name(&self, token_address: Address) -> Result<String> {
        self.get(token_address)
            .map(|t| t.name)
            .ok_or_else(|| IndexerError::Rpc(format!("{token_address}: execution reverted")).into())
    }

    async fn token_owner(&self, token_address: Address) -> Result<Address> {
        self.get(token_address)
            .map(|t| t.owner)
            .ok_or_else(|| IndexerError::Rpc(format!("{token_address}: execution reverted")).into())
    }
}

/// [CompanyDirectory] with a fixed set of companies.
#[derive(Default)]
pub struct StaticCompanyDirectory {
    companies: HashMap<Address, Company>,
}

impl StaticCompanyDirectory {
    pub fn with_company(mut self, owner: Address, corporate_name: &str) -> Self {
        self.companies.insert(
            owner,
            Company {
                address: owner.to_string(),
                corporate_name: corporate_name.to_string(),
                ..Default::default()
            },
        );
        self
    }
}

impl CompanyDirectory for StaticCompanyDirectory {
    fn lookup(&self, owner_address: &Address) -> Company {
        self.companies.get(owner_address).cloned().unwrap_or_default()
    }
}
