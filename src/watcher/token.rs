// Copyright (c) 2026 Bilinear Labs
// SPDX-License-Identifier: MIT

//! Notifications emitted by the token contracts themselves.

use crate::{
    contracts::IbetToken,
    storage::{AllocationArgs, NotificationArgs, NotificationType, StatusArgs, TransferArgs},
    watcher::NotificationKind,
};
use alloy::primitives::Address;

/// Status switch of a token, notified for one direction of the switch only.
macro_rules! status_notice {
    ($(#[$doc:meta])* $name:ident, $event:ident, $kind:ident, $status:literal) => {
        $(#[$doc])*
        pub struct $name;

        impl NotificationKind for $name {
            type Event = IbetToken::$event;

            const NOTIFICATION_TYPE: NotificationType = NotificationType::$kind;

            fn token_address(_event: &Self::Event, emitter: Address) -> Address {
                emitter
            }

            fn recipient(_event: &Self::Event) -> Option<Address> {
                None
            }

            fn args(event: &Self::Event) -> NotificationArgs {
                NotificationArgs::Status(StatusArgs {
                    status: event.status,
                })
            }

            fn accepts(event: &Self::Event) -> bool {
                event.status == $status
            }
        }
    };
}

status_notice!(StartInitialOfferingNotice, ChangeInitialOfferingStatus, StartInitialOffering, true);
status_notice!(StopInitialOfferingNotice, ChangeInitialOfferingStatus, StopInitialOffering, false);
status_notice!(StartOfferingNotice, ChangeOfferingStatus, StartOffering, true);
status_notice!(StopOfferingNotice, ChangeOfferingStatus, StopOffering, false);
status_notice!(
    /// The issuer stopped the trading of the token.
    SuspendNotice,
    ChangeStatus,
    Suspend,
    false
);

pub struct RedeemNotice;

impl NotificationKind for RedeemNotice {
    type Event = IbetToken::Redeem;

    const NOTIFICATION_TYPE: NotificationType = NotificationType::Redeem;

    fn token_address(_event: &Self::Event, emitter: Address) -> Address {
        emitter
    }

    fn recipient(_event: &Self::Event) -> Option<Address> {
        None
    }

    fn args(_event: &Self::Event) -> NotificationArgs {
        NotificationArgs::Empty {}
    }
}

/// An investor applied for the offering of a token.
pub struct ApplyForOfferingNotice;

impl NotificationKind for ApplyForOfferingNotice {
    type Event = IbetToken::ApplyFor;

    const NOTIFICATION_TYPE: NotificationType = NotificationType::ApplyForOffering;

    fn token_address(_event: &Self::Event, emitter: Address) -> Address {
        emitter
    }

    fn recipient(event: &Self::Event) -> Option<Address> {
        Some(event.accountAddress)
    }

    fn args(event: &Self::Event) -> NotificationArgs {
        NotificationArgs::Allocation(AllocationArgs {
            account_address: event.accountAddress,
            amount: event.amount,
        })
    }
}

/// The issuer allotted tokens to an applicant.
pub struct AllotNotice;

impl NotificationKind for AllotNotice {
    type Event = IbetToken::Allot;

    const NOTIFICATION_TYPE: NotificationType = NotificationType::Allot;

    fn token_address(_event: &Self::Event, emitter: Address) -> Address {
        emitter
    }

    fn recipient(event: &Self::Event) -> Option<Address> {
        Some(event.accountAddress)
    }

    fn args(event: &Self::Event) -> NotificationArgs {
        NotificationArgs::Allocation(AllocationArgs {
            account_address: event.accountAddress,
            amount: event.amount,
        })
    }
}

/// Tokens received by an account.
///
/// Transfers sent by an exchange are the settlement of a trade, already notified by the exchange watchers.
pub struct TransferNotice;

impl NotificationKind for TransferNotice {
    type Event = IbetToken::Transfer;

    const NOTIFICATION_TYPE: NotificationType = NotificationType::Transfer;

    fn token_address(_event: &Self::Event, emitter: Address) -> Address {
        emitter
    }

    fn recipient(event: &Self::Event) -> Option<Address> {
        Some(event.to)
    }

    fn args(event: &Self::Event) -> NotificationArgs {
        NotificationArgs::Transfer(TransferArgs {
            from: event.from,
            to: event.to,
            value: event.value,
        })
    }

    fn sender(event: &Self::Event) -> Option<Address> {
        Some(event.from)
    }
}
