use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::limits::{BOOKING_SEQUENCE_DIGITS, MAX_BOOKINGS_PER_DATE};

use super::EngineError;

/// `DDMM` of the session date followed by a zero-padded per-date sequence.
pub fn format_code(date: NaiveDate, seq: u32) -> String {
    format!(
        "{}{:0width$}",
        date.format("%d%m"),
        seq,
        width = BOOKING_SEQUENCE_DIGITS
    )
}

/// Next free code on `date` starting from sequence `from`. Codes for which
/// `taken` is true (same `DDMM` in another year) are skipped and still use
/// up a sequence number, so a busy `DDMM` reaches `DailyCapacityExceeded`
/// sooner with every year of history it accumulates.
pub fn allocate(
    date: NaiveDate,
    from: u32,
    taken: impl Fn(&str) -> bool,
) -> Result<(u32, String), EngineError> {
    (from..MAX_BOOKINGS_PER_DATE)
        .map(|seq| (seq, format_code(date, seq)))
        .find(|(_, code)| !taken(code))
        .ok_or(EngineError::DailyCapacityExceeded(date))
}

/// `(month, day)`: every year of a calendar day shares one code space.
type DayOfYear = (u32, u32);

fn day_of_year(date: NaiveDate) -> DayOfYear {
    (date.month(), date.day())
}

/// Per-date counters, locked per `DDMM`. Holding the guard serialises code
/// allocation for that calendar day across all years; a counter only
/// advances once the booking is durable.
#[derive(Default)]
pub(crate) struct DaySequences {
    days: DashMap<DayOfYear, Arc<Mutex<HashMap<i32, u32>>>>,
}

/// Exclusive access to one date's counter.
pub(crate) struct SequenceGuard {
    years: OwnedMutexGuard<HashMap<i32, u32>>,
    year: i32,
}

impl SequenceGuard {
    pub fn next(&self) -> u32 {
        self.years.get(&self.year).copied().unwrap_or(0)
    }

    pub fn advance_past(&mut self, seq: u32) {
        self.years.insert(self.year, seq + 1);
    }
}

impl DaySequences {
    fn counters(&self, date: NaiveDate) -> Arc<Mutex<HashMap<i32, u32>>> {
        self.days.entry(day_of_year(date)).or_default().clone()
    }

    pub async fn lock(&self, date: NaiveDate) -> SequenceGuard {
        SequenceGuard {
            years: self.counters(date).lock_owned().await,
            year: date.year(),
        }
    }

    /// Count one replayed booking. Replay is single-threaded so the lock
    /// is always free.
    pub fn observe(&self, date: NaiveDate) {
        if let Ok(mut years) = self.counters(date).try_lock() {
            *years.entry(date.year()).or_insert(0) += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn may_23() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 5, 23).unwrap()
    }

    #[test]
    fn code_format() {
        assert_eq!(format_code(may_23(), 0), "2305000");
        assert_eq!(format_code(may_23(), 7), "2305007");
        assert_eq!(format_code(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(), 123), "0201123");
    }

    #[test]
    fn allocate_skips_taken_codes() {
        let taken: HashSet<String> = ["2305000", "2305001"].iter().map(|s| s.to_string()).collect();
        let (seq, code) = allocate(may_23(), 0, |c| taken.contains(c)).unwrap();
        assert_eq!(seq, 2);
        assert_eq!(code, "2305002");
    }

    #[test]
    fn allocate_exhausts() {
        let err = allocate(may_23(), MAX_BOOKINGS_PER_DATE, |_| false).unwrap_err();
        assert!(matches!(err, EngineError::DailyCapacityExceeded(d) if d == may_23()));

        let err = allocate(may_23(), MAX_BOOKINGS_PER_DATE - 1, |_| true).unwrap_err();
        assert!(matches!(err, EngineError::DailyCapacityExceeded(_)));
    }

    #[tokio::test]
    async fn observe_advances_counter() {
        let seqs = DaySequences::default();
        seqs.observe(may_23());
        seqs.observe(may_23());
        assert_eq!(seqs.lock(may_23()).await.next(), 2);
        assert_eq!(seqs.lock(may_23().succ_opt().unwrap()).await.next(), 0);
        assert_eq!(seqs.lock(may_23().with_year(2026).unwrap()).await.next(), 0);
    }

    #[tokio::test]
    async fn same_day_of_year_shares_one_lock() {
        let seqs = DaySequences::default();
        let mut held = seqs.lock(may_23()).await;
        let next_year = may_23().with_year(2026).unwrap();
        assert!(seqs.counters(next_year).try_lock().is_err());
        assert!(seqs.counters(may_23().succ_opt().unwrap()).try_lock().is_ok());

        held.advance_past(4);
        drop(held);
        assert_eq!(seqs.lock(may_23()).await.next(), 5);
        assert_eq!(seqs.lock(next_year).await.next(), 0);
    }

    #[test]
    fn history_eats_into_capacity() {
        // Every code of the first 990 sequences is already used in earlier years.
        let (seq, code) = allocate(may_23(), 0, |c| &c[4..] < "990").unwrap();
        assert_eq!(seq, 990);
        assert_eq!(code, "2305990");
        let left = MAX_BOOKINGS_PER_DATE - seq;
        assert_eq!(left, 10);

        let err = allocate(may_23(), 0, |_| true).unwrap_err();
        assert!(matches!(err, EngineError::DailyCapacityExceeded(_)));
    }
}
