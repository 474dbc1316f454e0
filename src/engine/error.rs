use chrono::NaiveDate;
use ulid::Ulid;

use crate::engine::lifecycle::LifecycleEvent;
use crate::model::{BookingStatus, Money};

/// Where an error sits in the failure taxonomy. Drives log severity and
/// the SQLSTATE returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller's fault, nothing was written.
    Validation,
    /// Lost a race for a slot; pick another.
    Conflict,
    DomainRule,
    /// Race or caller bug against the lifecycle.
    State,
    External,
    Internal,
}

#[derive(Debug)]
pub enum EngineError {
    MissingField(&'static str),
    InvalidSlotSelection(String),
    RoomNotFound(Ulid),
    RoomInactive(Ulid),
    NotFound(String),
    LimitExceeded(&'static str),
    SlotConflict {
        slot: Ulid,
        booking: Ulid,
    },
    ComboMismatch(String),
    InvalidPromotion(String),
    DailyCapacityExceeded(NaiveDate),
    AmountMismatch {
        order_code: i64,
        expected: Vec<Money>,
        got: Money,
    },
    NothingToPay(String),
    InvalidTransition {
        code: String,
        from: BookingStatus,
        event: LifecycleEvent,
    },
    PaymentAfterClose {
        code: String,
        status: BookingStatus,
        order_code: i64,
        amount: Money,
    },
    InvalidSignature,
    Gateway(String),
    Catalog(String),
    WalError(String),
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::MissingField(_)
            | EngineError::InvalidSlotSelection(_)
            | EngineError::RoomNotFound(_)
            | EngineError::NotFound(_)
            | EngineError::LimitExceeded(_) => ErrorKind::Validation,
            EngineError::SlotConflict { .. } => ErrorKind::Conflict,
            EngineError::ComboMismatch(_)
            | EngineError::InvalidPromotion(_)
            | EngineError::DailyCapacityExceeded(_)
            | EngineError::RoomInactive(_)
            | EngineError::AmountMismatch { .. }
            | EngineError::NothingToPay(_) => ErrorKind::DomainRule,
            EngineError::InvalidTransition { .. } | EngineError::PaymentAfterClose { .. } => {
                ErrorKind::State
            }
            EngineError::InvalidSignature | EngineError::Gateway(_) | EngineError::Catalog(_) => {
                ErrorKind::External
            }
            EngineError::WalError(_) => ErrorKind::Internal,
        }
    }

    /// Short stable label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::MissingField(_) => "missing_field",
            EngineError::InvalidSlotSelection(_) => "invalid_slot_selection",
            EngineError::RoomNotFound(_) => "room_not_found",
            EngineError::RoomInactive(_) => "room_inactive",
            EngineError::NotFound(_) => "not_found",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::SlotConflict { .. } => "slot_conflict",
            EngineError::ComboMismatch(_) => "combo_mismatch",
            EngineError::InvalidPromotion(_) => "invalid_promotion",
            EngineError::DailyCapacityExceeded(_) => "daily_capacity_exceeded",
            EngineError::AmountMismatch { .. } => "amount_mismatch",
            EngineError::NothingToPay(_) => "nothing_to_pay",
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::PaymentAfterClose { .. } => "payment_after_close",
            EngineError::InvalidSignature => "invalid_signature",
            EngineError::Gateway(_) => "gateway",
            EngineError::Catalog(_) => "catalog",
            EngineError::WalError(_) => "wal",
        }
    }
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::MissingField(field) => write!(f, "missing field: {field}"),
            EngineError::InvalidSlotSelection(why) => write!(f, "invalid slot selection: {why}"),
            EngineError::RoomNotFound(id) => write!(f, "room not found: {id}"),
            EngineError::RoomInactive(id) => write!(f, "room is inactive: {id}"),
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::SlotConflict { slot, booking } => {
                write!(f, "slot {slot} already held by booking {booking}")
            }
            EngineError::ComboMismatch(why) => write!(f, "combo mismatch: {why}"),
            EngineError::InvalidPromotion(why) => write!(f, "invalid promotion: {why}"),
            EngineError::DailyCapacityExceeded(date) => {
                write!(f, "daily booking capacity exceeded for {date}")
            }
            EngineError::AmountMismatch {
                order_code,
                expected,
                got,
            } => write!(
                f,
                "amount {got} for order {order_code} matches none of {expected:?}"
            ),
            EngineError::NothingToPay(code) => write!(f, "booking {code} has nothing to pay"),
            EngineError::InvalidTransition { code, from, event } => {
                write!(f, "booking {code}: no transition from {from} on {event}")
            }
            EngineError::PaymentAfterClose {
                code,
                status,
                order_code,
                amount,
            } => write!(
                f,
                "payment of {amount} (order {order_code}) arrived for booking {code} already {status}"
            ),
            EngineError::InvalidSignature => write!(f, "payment notification signature invalid"),
            EngineError::Gateway(e) => write!(f, "payment gateway error: {e}"),
            EngineError::Catalog(e) => write!(f, "catalog error: {e}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
