// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Resolution of the contracts tracked by the sync jobs and of the companies that issue them.

use crate::{
    IndexerError, TokenTemplate,
    chain::{ChainClient, call_view},
    contracts::{IbetToken, TokenList, non_zero, u256_to_i64},
};
use alloy::{primitives::Address, transports::http::reqwest};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    path::Path,
    str::FromStr,
    sync::{Arc, Mutex},
};
use tracing::{debug, info};

/// Trait that resolves the contracts that the sync jobs watch.
#[async_trait]
pub trait ContractRegistry: Send + Sync {
    /// Tokens registered in the token list, optionally only those of one template.
    async fn list_tracked_token_addresses(
        &self,
        template: Option<TokenTemplate>,
    ) -> Result<Vec<Address>>;
    /// Exchange where the token is traded, `None` if the token has no exchange configured.
    async fn resolve_tradable_exchange(&self, token_address: Address) -> Result<Option<Address>>;
    /// Template of a token, `None` if the token is not registered in the token list.
    async fn resolve_token_type(&self, token_address: Address) -> Result<Option<TokenTemplate>>;
    async fn token_name(&self, token_address: Address) -> Result<String>;
    async fn token_owner(&self, token_address: Address) -> Result<Address>;
}

#[derive(Default)]
struct RegistryCache {
    /// Entries of the token list read so far, in list order.
    tokens: Vec<(Address, TokenTemplate)>,
    /// Number of list entries already read, including those with an unknown template.
    read_entries: u64,
    templates: HashMap<Address, Option<TokenTemplate>>,
    names: HashMap<Address, String>,
    owners: HashMap<Address, Address>,
}

/// [ContractRegistry] backed by the token list contract.
///
/// # Description
///
/// The token list is append-only, so each refresh only reads the entries added since the previous one. Templates,
/// names and owners of the tokens never change and are cached after the first read. The tradable exchange of a
/// token can be changed by its issuer and is always read from the chain.
pub struct OnChainRegistry {
    chain: Arc<dyn ChainClient>,
    token_list: Address,
    cache: Mutex<RegistryCache>,
}

impl OnChainRegistry {
    pub fn new(chain: Arc<dyn ChainClient>, token_list: Address) -> Self {
        Self {
            chain,
            token_list,
            cache: Mutex::new(RegistryCache::default()),
        }
    }

    fn cache(&self) -> Result<std::sync::MutexGuard<'_, RegistryCache>> {
        self.cache
            .lock()
            .map_err(|e| anyhow::anyhow!("Failed to acquire lock: {}", e))
    }

    async fn refresh_token_list(&self) -> Result<()> {
        let length = call_view(
            self.chain.as_ref(),
            self.token_list,
            TokenList::getListLengthCall {},
        )
        .await?;
        let length = u256_to_i64(length)
            .and_then(|l| u64::try_from(l).ok())
            .ok_or_else(|| IndexerError::Decode(format!("token list length {length}")))?;

        let start = self.cache()?.read_entries;
        for index in start..length {
            let entry = call_view(
                self.chain.as_ref(),
                self.token_list,
                TokenList::getTokenByIndexCall {
                    _index: alloy::primitives::U256::from(index),
                },
            )
            .await?;

            let template = TokenTemplate::from_str(&entry.token_template).ok();
            let mut cache = self.cache()?;
            cache.read_entries = index + 1;
            cache.templates.insert(entry.token_address, template);
            cache.owners.insert(entry.token_address, entry.owner_address);
            match template {
                Some(template) => cache.tokens.push((entry.token_address, template)),
                None => debug!(
                    "Token {} has an unsupported template {}",
                    entry.token_address, entry.token_template
                ),
            }
        }

        if length > start {
            info!("Token list: {} new entries", length - start);
        }

        Ok(())
    }
}

#[async_trait]
impl ContractRegistry for OnChainRegistry {
    async fn list_tracked_token_addresses(
        &self,
        template: Option<TokenTemplate>,
    ) -> Result<Vec<Address>> {
        self.refresh_token_list().await?;

        Ok(self
            .cache()?
            .tokens
            .iter()
            .filter(|(_, t)| template.is_none_or(|wanted| wanted == *t))
            .map(|(token, _)| *token)
            .collect())
    }

    async fn resolve_tradable_exchange(&self, token_address: Address) -> Result<Option<Address>> {
        match call_view(
            self.chain.as_ref(),
            token_address,
            IbetToken::tradableExchangeCall {},
        )
        .await
        {
            Ok(exchange) => Ok(non_zero(exchange)),
            // A contract without the view reverts, the token is simply not tradable.
            Err(e) if matches!(IndexerError::find(&e), Some(IndexerError::Rpc(_))) => {
                debug!("Token {token_address} has no tradable exchange: {e:#}");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve_token_type(&self, token_address: Address) -> Result<Option<TokenTemplate>> {
        if let Some(template) = self.cache()?.templates.get(&token_address) {
            return Ok(*template);
        }

        let entry = call_view(
            self.chain.as_ref(),
            self.token_list,
            TokenList::getTokenByAddressCall {
                _token: token_address,
            },
        )
        .await?;

        if entry.token_address.is_zero() {
            // Not registered yet, it might be registered later.
            return Ok(None);
        }

        let template = TokenTemplate::from_str(&entry.token_template).ok();
        let mut cache = self.cache()?;
        cache.templates.insert(token_address, template);
        cache.owners.insert(token_address, entry.owner_address);
        Ok(template)
    }

    async fn token_name(&self, token_address: Address) -> Result<String> {
        if let Some(name) = self.cache()?.names.get(&token_address) {
            return Ok(name.clone());
        }

        let name = call_view(self.chain.as_ref(), token_address, IbetToken::nameCall {})
            .await
            .with_context(|| format!("Failed to read the name of {token_address}"))?;
        self.cache()?.names.insert(token_address, name.clone());
        Ok(name)
    }

    async fn token_owner(&self, token_address: Address) -> Result<Address> {
        if let Some(owner) = self.cache()?.owners.get(&token_address) {
            return Ok(*owner);
        }

        let owner = call_view(self.chain.as_ref(), token_address, IbetToken::ownerCall {})
            .await
            .with_context(|| format!("Failed to read the owner of {token_address}"))?;
        self.cache()?.owners.insert(token_address, owner);
        Ok(owner)
    }
}

/// Public profile of an issuer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub corporate_name: String,
    #[serde(default)]
    pub rsa_publickey: String,
    #[serde(default)]
    pub homepage: String,
}

/// Trait that resolves the issuer of a token from the owner address.
pub trait CompanyDirectory: Send + Sync {
    /// Gets the company of an owner. Unknown owners resolve to a company with empty fields.
    fn lookup(&self, owner_address: &Address) -> Company;
}

/// [CompanyDirectory] loaded from the company list JSON.
#[derive(Debug, Clone, Default)]
pub struct CompanyList {
    companies: HashMap<String, Company>,
}

impl CompanyList {
    pub fn from_json(json: &str) -> Result<Self> {
        let companies: Vec<Company> =
            serde_json::from_str(json).context("Malformed company list")?;

        Ok(Self {
            companies: companies
                .into_iter()
                .map(|company| (company.address.to_lowercase(), company))
                .collect(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read the company list {}", path.display()))?;
        Self::from_json(&json)
    }

    pub async fn fetch(url: &str) -> Result<Self> {
        let json = reqwest::get(url)
            .await?
            .error_for_status()?
            .text()
            .await
            .with_context(|| format!("Failed to fetch the company list from {url}"))?;
        Self::from_json(&json)
    }

    pub fn len(&self) -> usize {
        self.companies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.companies.is_empty()
    }
}

impl CompanyDirectory for CompanyList {
    fn lookup(&self, owner_address: &Address) -> Company {
        self.companies
            .get(&owner_address.to_string().to_lowercase())
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{MockChainClient, fake_address};
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn registry(chain: Arc<MockChainClient>, token_list: Address) -> OnChainRegistry {
        OnChainRegistry::new(chain, token_list)
    }

    #[tokio::test]
    async fn token_list_is_filtered_by_template() {
        let chain = Arc::new(MockChainClient::new(10));
        let token_list = fake_address();
        let (bond, share, unknown) = (fake_address(), fake_address(), fake_address());
        chain.set_token_list(
            token_list,
            &[
                (bond, "IbetStraightBond", fake_address()),
                (unknown, "IbetDeposit", fake_address()),
                (share, "IbetShare", fake_address()),
            ],
        );
        let registry = registry(chain, token_list);

        assert_eq!(
            registry.list_tracked_token_addresses(None).await.unwrap(),
            vec![bond, share]
        );
        assert_eq!(
            registry
                .list_tracked_token_addresses(Some(TokenTemplate::IbetShare))
                .await
                .unwrap(),
            vec![share]
        );
        assert_eq!(
            registry.resolve_token_type(unknown).await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn new_token_list_entries_are_picked_up() {
        let chain = Arc::new(MockChainClient::new(10));
        let token_list = fake_address();
        let (first, second) = (fake_address(), fake_address());
        chain.set_token_list(token_list, &[(first, "IbetCoupon", fake_address())]);
        let registry = registry(chain.clone(), token_list);
        assert_eq!(
            registry.list_tracked_token_addresses(None).await.unwrap(),
            vec![first]
        );

        chain.set_token_list(
            token_list,
            &[
                (first, "IbetCoupon", fake_address()),
                (second, "IbetMembership", fake_address()),
            ],
        );

        assert_eq!(
            registry.list_tracked_token_addresses(None).await.unwrap(),
            vec![first, second]
        );
    }

    #[tokio::test]
    async fn token_views_are_resolved() {
        let chain = Arc::new(MockChainClient::new(10));
        let token_list = fake_address();
        let (token, owner, exchange) = (fake_address(), fake_address(), fake_address());
        chain.set_token_list(token_list, &[(token, "IbetMembership", owner)]);
        chain.set_token_name(token, "Membership");
        chain.set_tradable_exchange(token, exchange);
        let registry = registry(chain, token_list);

        assert_eq!(
            registry.resolve_token_type(token).await.unwrap(),
            Some(TokenTemplate::IbetMembership)
        );
        assert_eq!(registry.token_name(token).await.unwrap(), "Membership");
        assert_eq!(registry.token_owner(token).await.unwrap(), owner);
        assert_eq!(
            registry.resolve_tradable_exchange(token).await.unwrap(),
            Some(exchange)
        );
    }

    #[rstest]
    #[case::zero_address(Some(Address::ZERO))]
    #[case::reverted(None)]
    #[tokio::test]
    async fn tokens_without_exchange_are_not_tradable(#[case] exchange: Option<Address>) {
        let chain = Arc::new(MockChainClient::new(10));
        let token = fake_address();
        if let Some(exchange) = exchange {
            chain.set_tradable_exchange(token, exchange);
        }
        let registry = registry(chain, fake_address());

        assert_eq!(registry.resolve_tradable_exchange(token).await.unwrap(), None);
    }

    #[test]
    fn company_lookup_ignores_the_address_case() {
        let owner = fake_address();
        let json = format!(
            r#"[{{"address": "{}", "corporate_name": "Issuer Inc.", "rsa_publickey": "", "homepage": "https://issuer.example"}}]"#,
            owner.to_string().to_uppercase().replace("0X", "0x")
        );
        let companies = CompanyList::from_json(&json).unwrap();

        assert_eq!(companies.lookup(&owner).corporate_name, "Issuer Inc.");
        assert_eq!(companies.len(), 1);
    }

    #[test]
    fn unknown_owner_resolves_to_empty_company() {
        let companies = CompanyList::from_json("[]").unwrap();

        assert_eq!(companies.lookup(&fake_address()), Company::default());
    }

    #[test]
    fn malformed_company_list_is_rejected() {
        assert!(CompanyList::from_json("{\"address\": 1}").is_err());
    }
}
