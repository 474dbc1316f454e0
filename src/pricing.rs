//! Price resolution for a room, a run of slots, and optional combo and
//! promotion. Everything here is pure; catalog lookups happen in the engine.

use std::collections::HashSet;

use ulid::Ulid;

use crate::engine::lifecycle::percent_of;
use crate::engine::EngineError;
use crate::model::*;

/// Resolve `ids` against the master slot list, sorted by start time.
/// Rejects empty, unknown, duplicate, and non-contiguous selections.
pub fn select_slots(master: &[TimeSlot], ids: &[Ulid]) -> Result<Vec<TimeSlot>, EngineError> {
    if ids.is_empty() {
        return Err(EngineError::InvalidSlotSelection("no slots selected".into()));
    }
    let mut seen = HashSet::with_capacity(ids.len());
    let mut slots = Vec::with_capacity(ids.len());
    for id in ids {
        if !seen.insert(*id) {
            return Err(EngineError::InvalidSlotSelection(format!("slot {id} selected twice")));
        }
        let slot = master
            .iter()
            .find(|s| s.id == *id)
            .ok_or_else(|| EngineError::InvalidSlotSelection(format!("unknown slot {id}")))?;
        slots.push(slot.clone());
    }
    slots.sort_by_key(|s| s.start);
    check_contiguous(&slots)?;
    Ok(slots)
}

/// Sorted slots must chain end-to-start with no gaps.
pub fn check_contiguous(slots: &[TimeSlot]) -> Result<(), EngineError> {
    for pair in slots.windows(2) {
        if !pair[0].is_followed_by(&pair[1]) {
            return Err(EngineError::InvalidSlotSelection(format!(
                "gap between {} and {}",
                pair[0].end, pair[1].start
            )));
        }
    }
    Ok(())
}

/// Compute the price of `slots` in `room`.
pub fn resolve(
    room: &Room,
    slots: &[TimeSlot],
    promotion: Option<&Promotion>,
    combo: Option<&ComboOffer>,
) -> Result<PriceBreakdown, EngineError> {
    check_contiguous(slots)?;
    let total_minutes: u32 = slots.iter().map(|s| s.duration_minutes).sum();

    let combo_price = match combo {
        Some(combo) => {
            let price = combo.price_for(room.room_type_id).ok_or_else(|| {
                EngineError::ComboMismatch(format!("combo {} not offered for this room type", combo.id))
            })?;
            if combo.duration_minutes != total_minutes {
                return Err(EngineError::ComboMismatch(format!(
                    "combo requires {} minutes, selection covers {total_minutes}",
                    combo.duration_minutes
                )));
            }
            Some(price)
        }
        None => None,
    };
    let base_price = combo_price.unwrap_or(room.price_per_minute * total_minutes as Money);

    let discount_percent = match promotion {
        Some(p) => {
            if p.discount_percent > 100 {
                return Err(EngineError::InvalidPromotion(format!(
                    "{}: discount {}% out of range",
                    p.code, p.discount_percent
                )));
            }
            if p.remaining_quantity == 0 {
                return Err(EngineError::InvalidPromotion(format!("{}: exhausted", p.code)));
            }
            p.discount_percent
        }
        None => 0,
    };
    let discount = percent_of(base_price, discount_percent);

    Ok(PriceBreakdown {
        price_per_minute: room.price_per_minute,
        total_minutes,
        base_price,
        combo_price,
        discount_percent,
        discount,
        total: (base_price - discount).max(0),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn slot(h: u32, m: u32, minutes: u32) -> TimeSlot {
        let start = NaiveTime::from_hms_opt(h, m, 0).unwrap();
        TimeSlot {
            id: Ulid::new(),
            start,
            end: start + chrono::Duration::minutes(minutes as i64),
            duration_minutes: minutes,
        }
    }

    fn room(price_per_minute: Money) -> Room {
        Room {
            id: Ulid::new(),
            branch_id: Ulid::new(),
            room_type_id: Ulid::new(),
            price_per_minute,
            status: RoomStatus::Active,
        }
    }

    fn promo(percent: u32, remaining: u32) -> Promotion {
        Promotion {
            id: Ulid::new(),
            code: "SALE10".into(),
            discount_percent: percent,
            remaining_quantity: remaining,
        }
    }

    /// Two half-hour slots, 60 minutes total.
    fn morning() -> Vec<TimeSlot> {
        vec![slot(9, 0, 30), slot(9, 30, 30)]
    }

    #[test]
    fn per_minute_price() {
        let price = resolve(&room(2000), &morning(), None, None).unwrap();
        assert_eq!(price.total_minutes, 60);
        assert_eq!(price.base_price, 120_000);
        assert_eq!(price.discount, 0);
        assert_eq!(price.total, 120_000);
    }

    #[test]
    fn promotion_discount() {
        let price = resolve(&room(2000), &morning(), Some(&promo(10, 5)), None).unwrap();
        assert_eq!(price.discount_percent, 10);
        assert_eq!(price.discount, 12_000);
        assert_eq!(price.total, 108_000);
    }

    #[test]
    fn full_discount_never_negative() {
        let price = resolve(&room(2000), &morning(), Some(&promo(100, 1)), None).unwrap();
        assert_eq!(price.total, 0);
    }

    #[test]
    fn exhausted_promotion_rejected() {
        let err = resolve(&room(2000), &morning(), Some(&promo(10, 0)), None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidPromotion(_)));
    }

    #[test]
    fn out_of_range_promotion_rejected() {
        let err = resolve(&room(2000), &morning(), Some(&promo(150, 3)), None).unwrap_err();
        assert!(matches!(err, EngineError::InvalidPromotion(_)));
    }

    #[test]
    fn combo_replaces_base_price() {
        let r = room(2000);
        let combo = ComboOffer {
            id: Ulid::new(),
            duration_minutes: 60,
            prices: vec![ComboPrice { room_type_id: r.room_type_id, price: 99_000 }],
        };
        let price = resolve(&r, &morning(), Some(&promo(10, 1)), Some(&combo)).unwrap();
        assert_eq!(price.combo_price, Some(99_000));
        assert_eq!(price.base_price, 99_000);
        assert_eq!(price.total, 89_100);
    }

    #[test]
    fn combo_duration_mismatch() {
        let r = room(2000);
        let combo = ComboOffer {
            id: Ulid::new(),
            duration_minutes: 90,
            prices: vec![ComboPrice { room_type_id: r.room_type_id, price: 99_000 }],
        };
        let err = resolve(&r, &morning(), None, Some(&combo)).unwrap_err();
        assert!(matches!(err, EngineError::ComboMismatch(_)));
    }

    #[test]
    fn combo_for_other_room_type() {
        let combo = ComboOffer {
            id: Ulid::new(),
            duration_minutes: 60,
            prices: vec![ComboPrice { room_type_id: Ulid::new(), price: 99_000 }],
        };
        let err = resolve(&room(2000), &morning(), None, Some(&combo)).unwrap_err();
        assert!(matches!(err, EngineError::ComboMismatch(_)));
    }

    #[test]
    fn select_sorts_and_accepts_contiguous() {
        let master = vec![slot(9, 0, 60), slot(10, 0, 60), slot(11, 0, 60)];
        let ids = vec![master[1].id, master[0].id];
        let selected = select_slots(&master, &ids).unwrap();
        assert_eq!(selected[0].id, master[0].id);
        assert_eq!(selected[1].id, master[1].id);
    }

    #[test]
    fn select_rejects_gap() {
        let master = vec![slot(9, 0, 60), slot(10, 0, 60), slot(11, 0, 60)];
        let ids = vec![master[0].id, master[2].id];
        let err = select_slots(&master, &ids).unwrap_err();
        assert!(matches!(err, EngineError::InvalidSlotSelection(_)));
    }

    #[test]
    fn select_rejects_unknown_duplicate_and_empty() {
        let master = vec![slot(9, 0, 60)];
        assert!(matches!(
            select_slots(&master, &[Ulid::new()]),
            Err(EngineError::InvalidSlotSelection(_))
        ));
        assert!(matches!(
            select_slots(&master, &[master[0].id, master[0].id]),
            Err(EngineError::InvalidSlotSelection(_))
        ));
        assert!(matches!(select_slots(&master, &[]), Err(EngineError::InvalidSlotSelection(_))));
    }

    #[test]
    fn pricing_is_deterministic() {
        let r = room(1750);
        let slots = morning();
        let p = promo(15, 2);
        let a = resolve(&r, &slots, Some(&p), None).unwrap();
        let b = resolve(&r, &slots, Some(&p), None).unwrap();
        assert_eq!(a, b);
    }
}
