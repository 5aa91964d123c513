// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Notifications of the order book exchanges.

use crate::{
    contracts::IbetExchange,
    storage::{AgreementArgs, NotificationArgs, NotificationType, OrderArgs},
    watcher::NotificationKind,
};
use alloy::primitives::Address;

macro_rules! order_notice {
    ($(#[$doc:meta])* $name:ident, $event:ident) => {
        $(#[$doc])*
        pub struct $name;

        impl NotificationKind for $name {
            type Event = IbetExchange::$event;

            const NOTIFICATION_TYPE: NotificationType = NotificationType::$event;

            fn token_address(event: &Self::Event, _emitter: Address) -> Address {
                event.tokenAddress
            }

            fn recipient(event: &Self::Event) -> Option<Address> {
                Some(event.accountAddress)
            }

            fn args(event: &Self::Event) -> NotificationArgs {
                NotificationArgs::Order(OrderArgs {
                    token_address: event.tokenAddress,
                    order_id: event.orderId,
                    account_address: event.accountAddress,
                    is_buy: event.isBuy,
                    price: event.price,
                    amount: event.amount,
                    agent_address: event.agentAddress,
                })
            }
        }
    };
}

/// One agreement log notifies both the buyer and the seller.
macro_rules! agreement_notice {
    ($(#[$doc:meta])* $name:ident, $event:ident, $kind:ident, $recipient:ident) => {
        $(#[$doc])*
        pub struct $name;

        impl NotificationKind for $name {
            type Event = IbetExchange::$event;

            const NOTIFICATION_TYPE: NotificationType = NotificationType::$kind;

            fn token_address(event: &Self::Event, _emitter: Address) -> Address {
                event.tokenAddress
            }

            fn recipient(event: &Self::Event) -> Option<Address> {
                Some(event.$recipient)
            }

            fn args(event: &Self::Event) -> NotificationArgs {
                NotificationArgs::Agreement(AgreementArgs {
                    token_address: event.tokenAddress,
                    order_id: event.orderId,
                    agreement_id: event.agreementId,
                    buy_address: event.buyAddress,
                    sell_address: event.sellAddress,
                    price: event.price,
                    amount: event.amount,
                    agent_address: event.agentAddress,
                })
            }
        }
    };
}

order_notice!(
    /// An order was placed.
    NewOrderNotice,
    NewOrder
);
order_notice!(
    /// An order was cancelled by its owner.
    CancelOrderNotice,
    CancelOrder
);
agreement_notice!(
    /// Someone took an order: notifies the buyer.
    BuyAgreementNotice,
    Agree,
    BuyAgreement,
    buyAddress
);
agreement_notice!(
    /// Someone took an order: notifies the seller.
    SellAgreementNotice,
    Agree,
    SellAgreement,
    sellAddress
);
agreement_notice!(BuySettlementOkNotice, SettlementOK, BuySettlementOK, buyAddress);
agreement_notice!(SellSettlementOkNotice, SettlementOK, SellSettlementOK, sellAddress);
agreement_notice!(BuySettlementNgNotice, SettlementNG, BuySettlementNG, buyAddress);
agreement_notice!(SellSettlementNgNotice, SettlementNG, SellSettlementNG, sellAddress);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        TokenTemplate,
        test_utils::fake_address,
        watcher::{WatchSource, tests::Fixture},
    };
    use alloy::primitives::U256;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn settlement_ng(fixture: &Fixture, buyer: Address, seller: Address) -> IbetExchange::SettlementNG {
        IbetExchange::SettlementNG {
            tokenAddress: fixture.token,
            orderId: U256::from(4u64),
            agreementId: U256::from(1u64),
            buyAddress: buyer,
            sellAddress: seller,
            price: U256::from(100u64),
            amount: U256::from(3u64),
            agentAddress: fake_address(),
        }
    }

    #[tokio::test]
    async fn failed_settlement_notifies_both_sides_with_high_priority() {
        let fixture = Fixture::new(TokenTemplate::IbetCoupon);
        let (buyer, seller) = (fake_address(), fake_address());
        fixture
            .chain
            .emit(fixture.exchange, 3, 0, &settlement_ng(&fixture, buyer, seller));
        let source = WatchSource::Exchange(fixture.exchange);

        fixture
            .engine::<BuySettlementNgNotice>(source, TokenTemplate::IbetCoupon)
            .sync_new_logs()
            .await
            .unwrap();
        fixture
            .engine::<SellSettlementNgNotice>(source, TokenTemplate::IbetCoupon)
            .sync_new_logs()
            .await
            .unwrap();

        let summary: Vec<_> = fixture
            .notifications()
            .into_iter()
            .map(|n| (n.notification_type, n.priority, n.address))
            .collect();
        assert_eq!(
            summary,
            vec![
                (NotificationType::BuySettlementNG, 2, Some(buyer)),
                (NotificationType::SellSettlementNG, 2, Some(seller)),
            ]
        );
    }

    #[tokio::test]
    async fn order_args_keep_the_event_field_names() {
        let fixture = Fixture::new(TokenTemplate::IbetMembership);
        let account = fake_address();
        fixture.chain.emit(
            fixture.exchange,
            2,
            0,
            &IbetExchange::CancelOrder {
                tokenAddress: fixture.token,
                orderId: U256::from(9u64),
                accountAddress: account,
                isBuy: false,
                price: U256::from(1_000u64),
                amount: U256::from(5u64),
                agentAddress: Address::ZERO,
            },
        );

        fixture
            .engine::<CancelOrderNotice>(WatchSource::Exchange(fixture.exchange), TokenTemplate::IbetMembership)
            .sync_new_logs()
            .await
            .unwrap();

        let notifications = fixture.notifications();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].priority, 0);
        assert_eq!(notifications[0].address, Some(account));
        assert_eq!(
            notifications[0].args,
            json!({
                "tokenAddress": serde_json::to_value(fixture.token).unwrap(),
                "orderId": 9,
                "accountAddress": serde_json::to_value(account).unwrap(),
                "isBuy": false,
                "price": 1000,
                "amount": 5,
                "agentAddress": serde_json::to_value(Address::ZERO).unwrap(),
            })
        );
    }
}
