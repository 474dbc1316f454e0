use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        let room_id = self
            .booking_room
            .get(&id)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::NotFound(format!("booking {id}")))?;
        let rs = self
            .get_room(&room_id)
            .ok_or_else(|| EngineError::NotFound(format!("room {room_id}")))?;
        let guard = rs.read().await;
        guard
            .bookings
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("booking {id}")))
    }

    pub async fn get_by_code(&self, code: &str) -> Result<Booking, EngineError> {
        let id = self
            .booking_id_for_code(code)
            .ok_or_else(|| EngineError::NotFound(format!("booking {code}")))?;
        self.get_booking(id).await
    }

    /// Resolves current and earlier order codes alike.
    pub async fn get_by_order_code(&self, order_code: i64) -> Result<Booking, EngineError> {
        let id = self
            .booking_id_for_order(order_code)
            .ok_or_else(|| EngineError::NotFound(format!("order {order_code}")))?;
        self.get_booking(id).await
    }

    /// Slots held by a pending or confirmed booking on `date`.
    pub async fn occupied_slots(&self, room_id: Ulid, date: NaiveDate) -> Vec<Ulid> {
        let Some(rs) = self.get_room(&room_id) else {
            return Vec::new();
        };
        let mut slots = rs.read().await.occupied_slots(date);
        slots.sort();
        slots
    }

    async fn collect(&self, keep: impl Fn(&Booking) -> bool) -> Vec<Booking> {
        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut out = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            out.extend(guard.bookings.values().filter(|b| keep(*b)).cloned());
        }
        out
    }

    /// A customer's bookings, newest first. Email match ignores case.
    pub async fn bookings_for_customer(&self, email: &str) -> Vec<Booking> {
        let email = email.trim();
        let mut bookings = self
            .collect(|b| b.customer.email.eq_ignore_ascii_case(email))
            .await;
        bookings.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        bookings
    }

    /// Every booking for a session date, in code order.
    pub async fn bookings_on_date(&self, date: NaiveDate) -> Vec<Booking> {
        let mut bookings = self.collect(|b| b.date == date).await;
        bookings.sort_by(|a, b| a.code.cmp(&b.code));
        bookings
    }

    pub async fn customer_stats(&self, email: &str) -> CustomerStats {
        let mut stats = CustomerStats {
            email: email.trim().to_string(),
            ..Default::default()
        };
        for b in self.bookings_for_customer(email).await {
            stats.total_bookings += 1;
            match b.status {
                BookingStatus::PendingDeposit => stats.pending += 1,
                BookingStatus::Confirmed => stats.confirmed += 1,
                BookingStatus::Completed => {
                    stats.completed += 1;
                    stats.completed_spend += b.total_money;
                }
                BookingStatus::Cancelled => stats.cancelled += 1,
                BookingStatus::Expired => stats.expired += 1,
                BookingStatus::Failed => stats.failed += 1,
            }
            stats.paid += b.payments.iter().map(|p| p.amount).sum::<Money>();
        }
        stats
    }

    pub fn booking_count(&self) -> usize {
        self.booking_room.len()
    }
}
