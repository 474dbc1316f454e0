use serde::{Deserialize, Serialize};

use crate::model::{BookingStatus, Money};

/// Something that happens to an existing booking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleEvent {
    /// Deposit share of the total received while pending.
    DepositPaid { amount: Money },
    /// Whole total received while pending.
    PaidInFull { amount: Money },
    /// Remaining balance received on a confirmed booking.
    BalancePaid { amount: Money },
    DepositWindowElapsed,
    SessionFinished,
    Cancelled,
    PaymentFailed,
}

impl LifecycleEvent {
    pub fn payment_amount(self) -> Option<Money> {
        match self {
            LifecycleEvent::DepositPaid { amount }
            | LifecycleEvent::PaidInFull { amount }
            | LifecycleEvent::BalancePaid { amount } => Some(amount),
            _ => None,
        }
    }
}

impl std::fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LifecycleEvent::DepositPaid { amount } => write!(f, "deposit_paid({amount})"),
            LifecycleEvent::PaidInFull { amount } => write!(f, "paid_in_full({amount})"),
            LifecycleEvent::BalancePaid { amount } => write!(f, "balance_paid({amount})"),
            LifecycleEvent::DepositWindowElapsed => f.write_str("deposit_window_elapsed"),
            LifecycleEvent::SessionFinished => f.write_str("session_finished"),
            LifecycleEvent::Cancelled => f.write_str("cancelled"),
            LifecycleEvent::PaymentFailed => f.write_str("payment_failed"),
        }
    }
}

/// The transition table. `None` means the event is not valid from `from`.
pub fn next(from: BookingStatus, event: LifecycleEvent) -> Option<BookingStatus> {
    use BookingStatus::*;
    use LifecycleEvent as E;
    match (from, event) {
        (PendingDeposit, E::DepositPaid { .. }) => Some(Confirmed),
        (PendingDeposit, E::PaidInFull { .. }) => Some(Confirmed),
        (PendingDeposit, E::DepositWindowElapsed) => Some(Expired),
        (PendingDeposit, E::PaymentFailed) => Some(Failed),
        (PendingDeposit, E::Cancelled) => Some(Cancelled),
        (Confirmed, E::BalancePaid { .. }) => Some(Confirmed),
        (Confirmed, E::SessionFinished) => Some(Completed),
        (Confirmed, E::Cancelled) => Some(Cancelled),
        _ => None,
    }
}

/// Whether the amount a payment event carries is what the booking owes for
/// it right now. Non-payment events always fit.
pub fn amount_fits(event: LifecycleEvent, total: Money, amount_due: Money, deposit: Money) -> bool {
    match event {
        LifecycleEvent::DepositPaid { amount } => amount == deposit,
        LifecycleEvent::PaidInFull { amount } => amount == total,
        LifecycleEvent::BalancePaid { amount } => amount > 0 && amount == amount_due,
        _ => true,
    }
}

/// Amount still owed after `event` is applied to a booking owing `amount_due`.
pub fn amount_due_after(amount_due: Money, event: LifecycleEvent) -> Money {
    match event {
        LifecycleEvent::DepositPaid { amount } => (amount_due - amount).max(0),
        LifecycleEvent::PaidInFull { .. } | LifecycleEvent::BalancePaid { .. } => 0,
        _ => amount_due,
    }
}

/// Status a freshly created booking starts in.
pub fn initial_status(total: Money, deposit_threshold: Money) -> BookingStatus {
    if total > deposit_threshold {
        BookingStatus::PendingDeposit
    } else {
        BookingStatus::Confirmed
    }
}

/// `value * percent / 100`, rounded half up, in integer money.
pub fn percent_of(value: Money, percent: u32) -> Money {
    (value * percent as Money + 50) / 100
}
