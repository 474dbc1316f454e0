use std::sync::atomic::Ordering;

use tokio::sync::oneshot;
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{RESERVATIONS_TOTAL, TRANSITIONS_TOTAL};
use crate::pricing;

use super::lifecycle::{self, LifecycleEvent};
use super::occupancy::{check_no_conflict, now_ms};
use super::sequence;
use super::{Engine, EngineError, WalCommand};

fn require(value: &str, field: &'static str) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(EngineError::MissingField(field));
    }
    if value.len() > MAX_CONTACT_FIELD_LEN {
        return Err(EngineError::LimitExceeded("contact field too long"));
    }
    Ok(())
}

fn validate_request(request: &ReservationRequest) -> Result<(), EngineError> {
    require(&request.customer.name, "name")?;
    require(&request.customer.email, "email")?;
    require(&request.customer.phone, "phone")?;
    if request.slot_ids.is_empty() {
        return Err(EngineError::MissingField("slot_ids"));
    }
    if request.slot_ids.len() > MAX_SLOTS_PER_BOOKING {
        return Err(EngineError::LimitExceeded("too many slots in one booking"));
    }
    if let Some(code) = &request.promotion_code
        && code.len() > MAX_PROMOTION_CODE_LEN
    {
        return Err(EngineError::LimitExceeded("promotion code too long"));
    }
    Ok(())
}

/// A priced request: the breakdown plus the sorted slot ids it covers.
pub struct Quote {
    pub price: PriceBreakdown,
    pub slot_ids: Vec<Ulid>,
    pub promotion_id: Option<Ulid>,
}

impl Engine {
    /// Price a request against the catalog without reserving anything.
    pub async fn quote(&self, request: &ReservationRequest) -> Result<Quote, EngineError> {
        let room = self
            .catalog
            .get_room(request.room_id)
            .await
            .map_err(EngineError::Catalog)?
            .ok_or(EngineError::RoomNotFound(request.room_id))?;
        if room.status == RoomStatus::Inactive {
            return Err(EngineError::RoomInactive(room.id));
        }

        let master = self
            .catalog
            .list_master_slots()
            .await
            .map_err(EngineError::Catalog)?;
        let slots = pricing::select_slots(&master, &request.slot_ids)?;

        let promotion_code = request
            .promotion_code
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty());
        let promotion = match promotion_code {
            Some(code) => Some(
                self.catalog
                    .get_promotion(code)
                    .await
                    .map_err(EngineError::Catalog)?
                    .ok_or_else(|| EngineError::InvalidPromotion(format!("{code}: unknown code")))?,
            ),
            None => None,
        };
        let combo = match request.combo_id {
            Some(id) => Some(
                self.catalog
                    .get_combo(id)
                    .await
                    .map_err(EngineError::Catalog)?
                    .ok_or_else(|| EngineError::ComboMismatch(format!("combo {id} not found")))?,
            ),
            None => None,
        };

        let price = pricing::resolve(&room, &slots, promotion.as_ref(), combo.as_ref())?;
        Ok(Quote {
            price,
            slot_ids: slots.iter().map(|s| s.id).collect(),
            promotion_id: promotion.map(|p| p.id),
        })
    }

    /// Create a booking if every requested slot is free on that date.
    pub async fn reserve(&self, request: ReservationRequest) -> Result<Reservation, EngineError> {
        let result = self.reserve_inner(request).await;
        let outcome = match &result {
            Ok(_) => "created",
            Err(e) => e.label(),
        };
        metrics::counter!(RESERVATIONS_TOTAL, "outcome" => outcome).increment(1);
        result
    }

    async fn reserve_inner(&self, request: ReservationRequest) -> Result<Reservation, EngineError> {
        validate_request(&request)?;
        let Quote {
            price,
            slot_ids,
            promotion_id,
        } = self.quote(&request).await?;

        let rs = self.room(request.room_id);
        let mut guard = rs.write().await;
        check_no_conflict(&guard, request.date, &slot_ids)?;

        // Held until the booking is applied, so `codes` already holds every
        // code issued for this DDMM in any year.
        let mut next_seq = self.sequences.lock(request.date).await;
        let (seq, code) =
            sequence::allocate(request.date, next_seq.next(), |c| self.codes.contains_key(c))?;

        let now = now_ms();
        let booking = Booking {
            id: Ulid::new(),
            code,
            order_codes: Vec::new(),
            room_id: request.room_id,
            date: request.date,
            slot_ids,
            customer: request.customer,
            film_id: request.film_id,
            combo_id: request.combo_id,
            promotion_id,
            total_money: price.total,
            amount_due: price.total,
            status: lifecycle::initial_status(price.total, self.policy.deposit_threshold),
            payments: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        next_seq.advance_past(seq);
        drop(next_seq);
        drop(guard);

        info!(
            "reserved {} in room {} on {} ({} slots, total {}, {})",
            booking.code,
            booking.room_id,
            booking.date,
            booking.slot_ids.len(),
            booking.total_money,
            booking.status
        );
        self.notify.send(
            booking.room_id,
            &BookingEvent::Created {
                booking: booking.clone(),
                price: price.clone(),
            },
        );
        Ok(Reservation { booking, price })
    }

    /// Apply `event` to a booking whose status must still be `expected`.
    /// `order_code` tags the payment carried by a payment event.
    pub async fn transition(
        &self,
        id: Ulid,
        expected: BookingStatus,
        event: LifecycleEvent,
        order_code: Option<i64>,
    ) -> Result<Booking, EngineError> {
        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard
            .bookings
            .get(&id)
            .ok_or_else(|| EngineError::NotFound(format!("booking {id}")))?;

        let fits = lifecycle::amount_fits(
            event,
            booking.total_money,
            booking.amount_due,
            self.policy.deposit_amount(booking.total_money),
        );
        let to = match lifecycle::next(booking.status, event) {
            Some(to) if booking.status == expected && fits => to,
            _ => {
                debug!(
                    "booking {}: rejected {event} from {} (expected {expected}, due {})",
                    booking.code, booking.status, booking.amount_due
                );
                return Err(EngineError::InvalidTransition {
                    code: booking.code.clone(),
                    from: booking.status,
                    event,
                });
            }
        };

        let now = now_ms();
        let payment = match (event.payment_amount(), order_code) {
            (Some(amount), Some(order_code)) => Some(PaymentRecord {
                order_code,
                amount,
                at: now,
            }),
            _ => None,
        };
        let change = Event::StatusChanged {
            id,
            room_id,
            from: booking.status,
            to,
            amount_due: lifecycle::amount_due_after(booking.amount_due, event),
            payment,
            at: now,
        };
        let from = booking.status;
        self.persist_and_apply(&mut guard, &change).await?;

        let updated = guard.bookings[&id].clone();
        drop(guard);

        metrics::counter!(TRANSITIONS_TOTAL, "to" => to.as_str()).increment(1);
        debug!("booking {}: {from} -> {to} on {event}", updated.code);
        self.notify.send(
            room_id,
            &BookingEvent::Updated {
                booking: updated.clone(),
            },
        );
        Ok(updated)
    }

    /// Operator cancellation of a holding booking.
    pub async fn cancel(&self, code: &str) -> Result<Booking, EngineError> {
        let booking = self.get_by_code(code).await?;
        self.transition(booking.id, booking.status, LifecycleEvent::Cancelled, None)
            .await
    }

    /// Mark a confirmed booking's session as finished.
    pub async fn complete(&self, code: &str) -> Result<Booking, EngineError> {
        let booking = self.get_by_code(code).await?;
        self.transition(booking.id, booking.status, LifecycleEvent::SessionFinished, None)
            .await
    }

    /// Give a holding booking a fresh gateway order code for a new payment
    /// attempt. Earlier order codes stay resolvable.
    pub async fn assign_order_code(&self, code: &str) -> Result<(Booking, i64), EngineError> {
        let id = self
            .booking_id_for_code(code)
            .ok_or_else(|| EngineError::NotFound(format!("booking {code}")))?;
        let (room_id, mut guard) = self.resolve_booking_write(&id).await?;
        let booking = guard
            .bookings
            .get(&id)
            .ok_or_else(|| EngineError::NotFound(format!("booking {code}")))?;
        if booking.status.is_terminal() || booking.amount_due <= 0 {
            return Err(EngineError::NothingToPay(booking.code.clone()));
        }

        let order_code = self.next_order_code.fetch_add(1, Ordering::SeqCst);
        if order_code > MAX_ORDER_CODE {
            return Err(EngineError::LimitExceeded("order code space exhausted"));
        }
        let event = Event::OrderCodeAssigned {
            id,
            room_id,
            order_code,
            at: now_ms(),
        };
        self.persist_and_apply(&mut guard, &event).await?;
        Ok((guard.bookings[&id].clone(), order_code))
    }

    /// Pending bookings created at or before `now - grace`.
    pub async fn collect_stale_pending(&self, now: Ms, grace: Ms) -> Vec<(Ulid, String)> {
        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut stale = Vec::new();
        for rs in rooms {
            let guard = rs.read().await;
            stale.extend(
                guard
                    .bookings
                    .values()
                    .filter(|b| b.status == BookingStatus::PendingDeposit)
                    .filter(|b| b.created_at + grace <= now)
                    .map(|b| (b.id, b.code.clone())),
            );
        }
        stale
    }

    /// Rewrite the WAL as one `BookingCreated` per booking, in creation order.
    /// Room read locks are held until the swap so no write slips between
    /// the snapshot and the rewrite.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let rooms: Vec<_> = self.rooms.iter().map(|e| e.value().clone()).collect();
        let mut guards = Vec::with_capacity(rooms.len());
        let mut bookings = Vec::new();
        for rs in rooms {
            let guard = rs.read_owned().await;
            bookings.extend(guard.bookings.values().cloned());
            guards.push(guard);
        }
        bookings.sort_by_key(|b| (b.created_at, b.id));
        let events: Vec<Event> = bookings
            .into_iter()
            .map(|booking| Event::BookingCreated { booking })
            .collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        let result = rx
            .await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()));
        drop(guards);
        result
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
