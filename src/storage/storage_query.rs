// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Read API of the index tables.

use crate::{
    IndexerError,
    storage::{
        AgreementStatus, ExecutableContract, IdxAgreement, IdxOrder, IdxTransferApproval, Listing,
        Node, Notification, NotificationType,
    },
};
use alloy::primitives::Address;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, EnumString, Deserialize)]
#[strum(serialize_all = "UPPERCASE", ascii_case_insensitive)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Pagination and ordering of a list query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    /// Column to sort by. Each table accepts a fixed set of columns.
    pub sort_item: Option<String>,
    pub sort_order: SortOrder,
}

impl PageRequest {
    pub fn new(offset: Option<u64>, limit: Option<u64>) -> Self {
        Self {
            offset,
            limit,
            ..Default::default()
        }
    }

    pub fn sorted_by(mut self, sort_item: &str, sort_order: SortOrder) -> Self {
        self.sort_item = Some(sort_item.to_string());
        self.sort_order = sort_order;
        self
    }

    /// Resolves the sort column against the columns accepted by a table.
    pub fn sort_column<'a>(&self, sortable: &[&'a str], default: &'a str) -> Result<&'a str> {
        match &self.sort_item {
            None => Ok(default),
            Some(item) => sortable
                .iter()
                .find(|column| *column == item)
                .copied()
                .ok_or_else(|| {
                    IndexerError::InvalidParameter(format!("sort_item: unknown column {item}"))
                        .into()
                }),
        }
    }
}

/// Pagination summary returned along every page.
///
/// `total` counts every row of the table, `count` only the rows that match the filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResultSet {
    pub count: u64,
    pub offset: Option<u64>,
    pub limit: Option<u64>,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub result_set: ResultSet,
    pub rows: Vec<T>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListingFilter {
    pub token_address: Option<Address>,
    pub owner_address: Option<Address>,
    pub is_public: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderFilter {
    pub exchange_address: Option<Address>,
    pub token_address: Option<Address>,
    pub account_address: Option<Address>,
    pub is_buy: Option<bool>,
    pub is_cancelled: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgreementFilter {
    pub exchange_address: Option<Address>,
    pub order_id: Option<i64>,
    pub buyer_address: Option<Address>,
    pub seller_address: Option<Address>,
    pub status: Option<AgreementStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferApprovalFilter {
    pub token_address: Option<Address>,
    pub from_address: Option<Address>,
    pub to_address: Option<Address>,
    pub cancelled: Option<bool>,
    pub transfer_approved: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationFilter {
    pub address: Option<Address>,
    pub notification_type: Option<NotificationType>,
    pub priority: Option<u8>,
}

/// Side of the order that the caller wants to place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Buy,
    Sell,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBookQuery {
    pub exchange_address: Option<Address>,
    pub token_address: Address,
    pub order_type: OrderType,
    /// Orders of this account are left out.
    pub account_address: Option<Address>,
    pub agent_address: Option<Address>,
}

/// Open order as seen from the side that wants to take it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderBookEntry {
    pub exchange_address: Address,
    pub order_id: i64,
    pub price: i64,
    /// Amount not yet matched by a live agreement.
    pub amount: i64,
    pub account_address: Address,
}

/// Trait that defines the read API used by the REST layer.
pub trait StorageQuery: Send + Sync {
    fn list_listings(&self, filter: &ListingFilter, page: &PageRequest) -> Result<Page<Listing>>;
    fn list_executable_contracts(&self, page: &PageRequest) -> Result<Page<ExecutableContract>>;
    fn list_orders(&self, filter: &OrderFilter, page: &PageRequest) -> Result<Page<IdxOrder>>;
    fn list_agreements(
        &self,
        filter: &AgreementFilter,
        page: &PageRequest,
    ) -> Result<Page<IdxAgreement>>;
    fn list_transfer_approvals(
        &self,
        filter: &TransferApprovalFilter,
        page: &PageRequest,
    ) -> Result<Page<IdxTransferApproval>>;
    /// Lists notifications. Unless another column is requested they come sorted by identifier, which is the
    /// order of the source logs in the chain.
    fn list_notifications(
        &self,
        filter: &NotificationFilter,
        page: &PageRequest,
    ) -> Result<Page<Notification>>;
    /// Gets the open orders that a `query.order_type` order could take.
    ///
    /// # Description
    ///
    /// A buyer sees the sell orders sorted by price ascending, a seller sees the buy orders sorted by price
    /// descending. Cancelled orders, orders of `query.account_address` and orders fully matched by agreements
    /// that were not cancelled are left out.
    fn order_book(&self, query: &OrderBookQuery) -> Result<Vec<OrderBookEntry>>;
    fn list_nodes(&self) -> Result<Vec<Node>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::str::FromStr;

    const SORTABLE: &[&str] = &["id", "token_address"];

    #[rstest]
    #[case::default(None, "id")]
    #[case::known(Some("token_address"), "token_address")]
    fn sort_column_is_resolved(#[case] item: Option<&str>, #[case] expected: &str) {
        let page = PageRequest {
            sort_item: item.map(str::to_string),
            ..Default::default()
        };

        assert_eq!(page.sort_column(SORTABLE, "id").unwrap(), expected);
    }

    #[test]
    fn unknown_sort_column_is_an_invalid_parameter() {
        let page = PageRequest::default().sorted_by("id; DROP TABLE listing", SortOrder::Asc);

        let error = page.sort_column(SORTABLE, "id").unwrap_err();

        assert!(matches!(
            IndexerError::find(&error),
            Some(IndexerError::InvalidParameter(_))
        ));
    }

    #[rstest]
    #[case::lower("asc", SortOrder::Asc)]
    #[case::upper("DESC", SortOrder::Desc)]
    fn sort_order_parses_case_insensitively(#[case] raw: &str, #[case] expected: SortOrder) {
        assert_eq!(SortOrder::from_str(raw).unwrap(), expected);
    }
}
