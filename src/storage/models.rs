// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Rows of the index tables and the mutations applied to them.

use alloy::primitives::{Address, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use strum_macros::{Display, EnumString};

/// Token registered for public listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Listing {
    pub id: Option<i64>,
    pub token_address: Address,
    pub is_public: bool,
    pub max_holding_quantity: Option<i64>,
    pub max_sell_amount: Option<i64>,
    pub owner_address: Address,
}

/// Contract that raw transactions may be relayed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutableContract {
    pub id: Option<i64>,
    pub contract_address: Address,
}

/// Order placed in an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdxOrder {
    pub exchange_address: Address,
    pub order_id: i64,
    pub unique_order_id: String,
    pub token_address: Address,
    pub account_address: Address,
    /// Only set for negotiated orders.
    pub counterpart_address: Option<Address>,
    pub is_buy: bool,
    pub price: i64,
    pub amount: i64,
    pub agent_address: Address,
    pub is_cancelled: bool,
    pub order_timestamp: Option<DateTime<Utc>>,
    pub transaction_hash: String,
}

impl IdxOrder {
    pub fn unique_order_id(exchange_address: &Address, order_id: i64) -> String {
        format!("{exchange_address}_{order_id}")
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgreementStatus {
    Pending,
    Done,
    Canceled,
}

impl AgreementStatus {
    pub fn as_i64(&self) -> i64 {
        match self {
            AgreementStatus::Pending => 0,
            AgreementStatus::Done => 1,
            AgreementStatus::Canceled => 2,
        }
    }

    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(AgreementStatus::Pending),
            1 => Some(AgreementStatus::Done),
            2 => Some(AgreementStatus::Canceled),
            _ => None,
        }
    }
}

/// Match between an order and the order that took it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdxAgreement {
    pub exchange_address: Address,
    pub order_id: i64,
    pub agreement_id: i64,
    pub unique_order_id: String,
    pub counterpart_address: Address,
    pub buyer_address: Address,
    pub seller_address: Address,
    pub price: i64,
    pub amount: i64,
    pub status: AgreementStatus,
    pub agreement_timestamp: Option<DateTime<Utc>>,
    pub settlement_timestamp: Option<DateTime<Utc>>,
}

/// Application for a transfer that needs the approval of the issuer.
///
/// `exchange_address` is `None` for applications made directly on the token contract and holds the escrow
/// contract otherwise.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdxTransferApproval {
    pub token_address: Address,
    pub exchange_address: Option<Address>,
    pub application_id: i64,
    pub from_address: Address,
    pub to_address: Address,
    pub value: i64,
    pub application_datetime: Option<DateTime<Utc>>,
    pub application_blocktimestamp: DateTime<Utc>,
    pub approval_datetime: Option<DateTime<Utc>>,
    pub approval_blocktimestamp: Option<DateTime<Utc>>,
    pub cancelled: Option<bool>,
    pub escrow_finished: Option<bool>,
    pub transfer_approved: Option<bool>,
}

/// Natural key of a transfer application.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransferApplicationKey {
    pub token_address: Address,
    pub exchange_address: Option<Address>,
    pub application_id: i64,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, Serialize, Deserialize,
)]
pub enum NotificationType {
    NewOrder,
    CancelOrder,
    BuyAgreement,
    SellAgreement,
    BuySettlementOK,
    SellSettlementOK,
    BuySettlementNG,
    SellSettlementNG,
    StartInitialOffering,
    StopInitialOffering,
    StartOffering,
    StopOffering,
    Suspend,
    Redeem,
    ApplyForOffering,
    Allot,
    Transfer,
}

impl NotificationType {
    /// Priority stored along the notification: 0 low, 1 medium, 2 high.
    pub fn priority(&self) -> u8 {
        match self {
            NotificationType::Allot
            | NotificationType::BuyAgreement
            | NotificationType::BuySettlementOK => 1,
            NotificationType::SellAgreement
            | NotificationType::SellSettlementOK
            | NotificationType::BuySettlementNG
            | NotificationType::SellSettlementNG => 2,
            _ => 0,
        }
    }

    /// Option slot of the notification identifier.
    ///
    /// One settlement or agreement log notifies both sides, the buy side takes slot 1 and the sell side slot 2.
    pub fn id_option(&self) -> u8 {
        match self {
            NotificationType::Allot
            | NotificationType::BuyAgreement
            | NotificationType::BuySettlementOK
            | NotificationType::BuySettlementNG => 1,
            NotificationType::SellAgreement
            | NotificationType::SellSettlementOK
            | NotificationType::SellSettlementNG => 2,
            _ => 0,
        }
    }
}

/// Serializes a 256-bit quantity as a JSON number when it fits in 64 bits, as a decimal string otherwise.
fn serialize_quantity<S>(value: &U256, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    if value.bit_len() <= 64 {
        serializer.serialize_u64(value.as_limbs()[0])
    } else {
        serializer.serialize_str(&value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderArgs {
    pub token_address: Address,
    #[serde(serialize_with = "serialize_quantity")]
    pub order_id: U256,
    pub account_address: Address,
    pub is_buy: bool,
    #[serde(serialize_with = "serialize_quantity")]
    pub price: U256,
    #[serde(serialize_with = "serialize_quantity")]
    pub amount: U256,
    pub agent_address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AgreementArgs {
    pub token_address: Address,
    #[serde(serialize_with = "serialize_quantity")]
    pub order_id: U256,
    #[serde(serialize_with = "serialize_quantity")]
    pub agreement_id: U256,
    pub buy_address: Address,
    pub sell_address: Address,
    #[serde(serialize_with = "serialize_quantity")]
    pub price: U256,
    #[serde(serialize_with = "serialize_quantity")]
    pub amount: U256,
    pub agent_address: Address,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationArgs {
    pub account_address: Address,
    #[serde(serialize_with = "serialize_quantity")]
    pub amount: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferArgs {
    pub from: Address,
    pub to: Address,
    #[serde(serialize_with = "serialize_quantity")]
    pub value: U256,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusArgs {
    pub status: bool,
}

/// Payload of a notification, one shape per family of source events.
///
/// Serialized as a plain JSON object with the field names of the event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum NotificationArgs {
    Order(OrderArgs),
    Agreement(AgreementArgs),
    Allocation(AllocationArgs),
    Transfer(TransferArgs),
    Status(StatusArgs),
    Empty {},
}

/// Token context attached to every notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMetainfo {
    pub company_name: String,
    pub token_address: String,
    pub token_name: String,
    pub exchange_address: String,
    pub token_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub notification_id: String,
    pub notification_type: NotificationType,
    pub priority: u8,
    pub address: Option<Address>,
    pub block_timestamp: DateTime<Utc>,
    pub args: Value,
    pub metainfo: NotificationMetainfo,
    pub is_read: bool,
    pub is_flagged: bool,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created: DateTime<Utc>,
}

/// RPC endpoint candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Node {
    pub id: i64,
    pub endpoint_uri: String,
    /// 0 for the primary node, 1 for standby nodes.
    pub priority: i32,
    pub is_synced: bool,
}

/// A row change produced by the transformation of one log.
///
/// Mutations are applied in order within a single transaction, so a later mutation sees the rows written by an
/// earlier one of the same batch.
#[derive(Debug, Clone, PartialEq)]
pub enum RowMutation {
    /// Inserts the order unless it is already indexed.
    NewOrder(IdxOrder),
    CancelOrder {
        exchange_address: Address,
        order_id: i64,
    },
    /// Inserts a pending agreement unless it is already indexed. The counterpart is resolved against the
    /// side of the referenced order.
    NewAgreement {
        exchange_address: Address,
        order_id: i64,
        agreement_id: i64,
        buyer_address: Address,
        seller_address: Address,
        price: i64,
        amount: i64,
        agreement_timestamp: DateTime<Utc>,
    },
    /// Moves a pending agreement to a final status.
    SettleAgreement {
        exchange_address: Address,
        order_id: i64,
        agreement_id: i64,
        status: AgreementStatus,
        settlement_timestamp: Option<DateTime<Utc>>,
    },
    /// Creates the application or refreshes the application fields of an existing one.
    ApplyForTransfer(IdxTransferApproval),
    CancelTransfer(TransferApplicationKey),
    ApproveTransfer {
        key: TransferApplicationKey,
        approval_datetime: Option<DateTime<Utc>>,
        approval_blocktimestamp: DateTime<Utc>,
    },
    FinishEscrow(TransferApplicationKey),
    /// Appends a notification unless its identifier is already stored.
    Notify(Notification),
}
