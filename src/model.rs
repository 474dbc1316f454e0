use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds.
pub type Ms = i64;

/// Money in the currency's smallest unit.
pub type Money = i64;

// ── Catalog (read-only reference data) ───────────────────────────

/// A fixed time-of-day interval shared by every room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Ulid,
    pub start: NaiveTime,
    pub end: NaiveTime,
    pub duration_minutes: u32,
}

impl TimeSlot {
    /// Slot `next` starts exactly where `self` ends.
    pub fn is_followed_by(&self, next: &TimeSlot) -> bool {
        self.end == next.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoomStatus {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: Ulid,
    pub branch_id: Ulid,
    pub room_type_id: Ulid,
    pub price_per_minute: Money,
    pub status: RoomStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Promotion {
    pub id: Ulid,
    pub code: String,
    pub discount_percent: u32,
    pub remaining_quantity: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComboPrice {
    pub room_type_id: Ulid,
    pub price: Money,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComboOffer {
    pub id: Ulid,
    pub duration_minutes: u32,
    pub prices: Vec<ComboPrice>,
}

impl ComboOffer {
    pub fn price_for(&self, room_type_id: Ulid) -> Option<Money> {
        self.prices
            .iter()
            .find(|p| p.room_type_id == room_type_id)
            .map(|p| p.price)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    PendingDeposit,
    Confirmed,
    Completed,
    Expired,
    Cancelled,
    Failed,
}

impl BookingStatus {
    /// Holding states still occupy their slots.
    pub fn is_holding(self) -> bool {
        matches!(self, BookingStatus::PendingDeposit | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_holding()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::PendingDeposit => "PENDING_DEPOSIT",
            BookingStatus::Confirmed => "CONFIRMED",
            BookingStatus::Completed => "COMPLETED",
            BookingStatus::Expired => "EXPIRED",
            BookingStatus::Cancelled => "CANCELLED",
            BookingStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING_DEPOSIT" => Some(BookingStatus::PendingDeposit),
            "CONFIRMED" => Some(BookingStatus::Confirmed),
            "COMPLETED" => Some(BookingStatus::Completed),
            "EXPIRED" => Some(BookingStatus::Expired),
            "CANCELLED" => Some(BookingStatus::Cancelled),
            "FAILED" => Some(BookingStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    pub name: String,
    pub email: String,
    pub phone: String,
}

/// A payment that has been reconciled against a booking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub order_code: i64,
    pub amount: Money,
    pub at: Ms,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub code: String,
    /// One per payment attempt, oldest first.
    pub order_codes: Vec<i64>,
    pub room_id: Ulid,
    pub date: NaiveDate,
    /// Sorted by slot start time.
    pub slot_ids: Vec<Ulid>,
    pub customer: Customer,
    pub film_id: Option<Ulid>,
    pub combo_id: Option<Ulid>,
    pub promotion_id: Option<Ulid>,
    pub total_money: Money,
    pub amount_due: Money,
    pub status: BookingStatus,
    pub payments: Vec<PaymentRecord>,
    pub created_at: Ms,
    pub updated_at: Ms,
}

impl Booking {
    /// Current payment-gateway correlation key, if a payment attempt started.
    pub fn order_code(&self) -> Option<i64> {
        self.order_codes.last().copied()
    }

    pub fn has_payment(&self, order_code: i64, amount: Money) -> bool {
        self.payments
            .iter()
            .any(|p| p.order_code == order_code && p.amount == amount)
    }
}

/// How a booking's price was put together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceBreakdown {
    pub price_per_minute: Money,
    pub total_minutes: u32,
    pub base_price: Money,
    pub combo_price: Option<Money>,
    pub discount_percent: u32,
    pub discount: Money,
    pub total: Money,
}

/// Input to `Engine::reserve`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservationRequest {
    pub room_id: Ulid,
    pub date: NaiveDate,
    pub slot_ids: Vec<Ulid>,
    pub customer: Customer,
    pub film_id: Option<Ulid>,
    pub combo_id: Option<Ulid>,
    pub promotion_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub booking: Booking,
    pub price: PriceBreakdown,
}

/// The WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    BookingCreated {
        booking: Booking,
    },
    StatusChanged {
        id: Ulid,
        room_id: Ulid,
        from: BookingStatus,
        to: BookingStatus,
        amount_due: Money,
        payment: Option<PaymentRecord>,
        at: Ms,
    },
    OrderCodeAssigned {
        id: Ulid,
        room_id: Ulid,
        order_code: i64,
        at: Ms,
    },
}

/// What the event bus publishes to downstream collaborators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingEvent {
    Created {
        booking: Booking,
        price: PriceBreakdown,
    },
    Updated {
        booking: Booking,
    },
}

impl BookingEvent {
    pub fn booking(&self) -> &Booking {
        match self {
            BookingEvent::Created { booking, .. } | BookingEvent::Updated { booking } => booking,
        }
    }
}

// ── Query result types ───────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomerStats {
    pub email: String,
    pub total_bookings: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub completed: usize,
    pub cancelled: usize,
    pub expired: usize,
    pub failed: usize,
    /// Sum of `total_money` over completed bookings.
    pub completed_spend: Money,
    /// Sum of payments reconciled across all bookings.
    pub paid: Money,
}
