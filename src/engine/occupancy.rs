use std::collections::HashMap;

use chrono::NaiveDate;
use ulid::Ulid;

use crate::model::*;

use super::EngineError;

pub(crate) fn now_ms() -> Ms {
    chrono::Utc::now().timestamp_millis()
}

/// Everything the ledger knows about one room: its bookings, and which
/// booking holds each slot on each date.
#[derive(Debug)]
pub struct RoomState {
    pub id: Ulid,
    pub bookings: HashMap<Ulid, Booking>,
    held: HashMap<NaiveDate, HashMap<Ulid, Ulid>>,
}

impl RoomState {
    pub fn new(id: Ulid) -> Self {
        Self {
            id,
            bookings: HashMap::new(),
            held: HashMap::new(),
        }
    }

    /// Mark `booking`'s slots as held by it.
    pub(super) fn hold(&mut self, booking: &Booking) {
        let day = self.held.entry(booking.date).or_default();
        for slot in &booking.slot_ids {
            day.insert(*slot, booking.id);
        }
    }

    /// Free the slots `booking` holds. Slots since taken by another booking
    /// are left alone.
    pub(super) fn release(&mut self, booking: &Booking) {
        if let Some(day) = self.held.get_mut(&booking.date) {
            for slot in &booking.slot_ids {
                if day.get(slot) == Some(&booking.id) {
                    day.remove(slot);
                }
            }
            if day.is_empty() {
                self.held.remove(&booking.date);
            }
        }
    }

    pub fn holder_of(&self, date: NaiveDate, slot: Ulid) -> Option<Ulid> {
        self.held.get(&date).and_then(|day| day.get(&slot)).copied()
    }

    /// Slot ids held on `date`, unordered.
    pub fn occupied_slots(&self, date: NaiveDate) -> Vec<Ulid> {
        self.held
            .get(&date)
            .map(|day| day.keys().copied().collect())
            .unwrap_or_default()
    }
}

/// Fails on the first requested slot already held on `date`.
pub(crate) fn check_no_conflict(
    rs: &RoomState,
    date: NaiveDate,
    slot_ids: &[Ulid],
) -> Result<(), EngineError> {
    for slot in slot_ids {
        if let Some(booking) = rs.holder_of(date, *slot) {
            return Err(EngineError::SlotConflict {
                slot: *slot,
                booking,
            });
        }
    }
    Ok(())
}
