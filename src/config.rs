use std::path::PathBuf;
use std::time::Duration;

use crate::engine::lifecycle::percent_of;
use crate::model::{Money, Ms};

/// Business rules the ledger and reconciler apply. Threshold and deposit
/// share are deployment decisions, not constants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    /// Totals strictly above this start in `PENDING_DEPOSIT`.
    pub deposit_threshold: Money,
    /// Share of the total (1–100) that confirms a pending booking.
    pub deposit_percent: u32,
    /// How long a pending booking may wait for payment.
    pub deposit_grace_ms: Ms,
    /// Lifetime of a payment link handed to the customer.
    pub payment_link_ttl_ms: Ms,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            deposit_threshold: 300_000,
            deposit_percent: 50,
            deposit_grace_ms: 15 * 60_000,
            payment_link_ttl_ms: 5 * 60_000,
        }
    }
}

impl BookingPolicy {
    pub fn deposit_amount(&self, total: Money) -> Money {
        percent_of(total, self.deposit_percent)
    }
}

/// Process configuration, read once from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub catalog_path: PathBuf,
    pub checksum_key: String,
    pub checkout_base_url: String,
    pub sweep_interval: Duration,
    pub policy: BookingPolicy,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unparseable values fall back to defaults.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: std::str::FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            get(key).and_then(|s| s.trim().parse().ok())
        }

        let defaults = BookingPolicy::default();
        let deposit_percent = parsed::<u32>(&get, "SLOTBOOK_DEPOSIT_PERCENT")
            .filter(|p| (1..=100).contains(p))
            .unwrap_or(defaults.deposit_percent);
        let policy = BookingPolicy {
            deposit_threshold: parsed(&get, "SLOTBOOK_DEPOSIT_THRESHOLD")
                .unwrap_or(defaults.deposit_threshold),
            deposit_percent,
            deposit_grace_ms: parsed::<u64>(&get, "SLOTBOOK_DEPOSIT_GRACE_SECS")
                .map(|s| s as Ms * 1000)
                .unwrap_or(defaults.deposit_grace_ms),
            payment_link_ttl_ms: parsed::<u64>(&get, "SLOTBOOK_PAYMENT_LINK_TTL_SECS")
                .map(|s| s as Ms * 1000)
                .unwrap_or(defaults.payment_link_ttl_ms),
        };

        Self {
            bind: get("SLOTBOOK_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&get, "SLOTBOOK_PORT").unwrap_or(5433),
            data_dir: PathBuf::from(get("SLOTBOOK_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: get("SLOTBOOK_PASSWORD").unwrap_or_else(|| "slotbook".into()),
            max_connections: parsed(&get, "SLOTBOOK_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&get, "SLOTBOOK_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parsed(&get, "SLOTBOOK_METRICS_PORT"),
            tls_cert: get("SLOTBOOK_TLS_CERT"),
            tls_key: get("SLOTBOOK_TLS_KEY"),
            catalog_path: PathBuf::from(
                get("SLOTBOOK_CATALOG").unwrap_or_else(|| "./catalog.json".into()),
            ),
            checksum_key: get("SLOTBOOK_CHECKSUM_KEY").unwrap_or_default(),
            checkout_base_url: get("SLOTBOOK_CHECKOUT_BASE_URL")
                .unwrap_or_else(|| "http://localhost:8080/checkout".into()),
            sweep_interval: Duration::from_secs(
                parsed(&get, "SLOTBOOK_SWEEP_INTERVAL_SECS").unwrap_or(60).max(1),
            ),
            policy,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("bookings.wal")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults() {
        let cfg = Config::from_lookup(lookup(&[]));
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.sweep_interval, Duration::from_secs(60));
        assert_eq!(cfg.policy, BookingPolicy::default());
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/bookings.wal"));
    }

    #[test]
    fn overrides() {
        let cfg = Config::from_lookup(lookup(&[
            ("SLOTBOOK_PORT", "6000"),
            ("SLOTBOOK_DEPOSIT_THRESHOLD", "500000"),
            ("SLOTBOOK_DEPOSIT_PERCENT", "30"),
            ("SLOTBOOK_DEPOSIT_GRACE_SECS", "60"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
        ]));
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.policy.deposit_threshold, 500_000);
        assert_eq!(cfg.policy.deposit_percent, 30);
        assert_eq!(cfg.policy.deposit_grace_ms, 60_000);
    }

    #[test]
    fn bad_values_fall_back() {
        let cfg = Config::from_lookup(lookup(&[
            ("SLOTBOOK_PORT", "not-a-port"),
            ("SLOTBOOK_DEPOSIT_PERCENT", "0"),
        ]));
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.policy.deposit_percent, 50);
    }

    #[test]
    fn deposit_amount_uses_percent() {
        let policy = BookingPolicy::default();
        assert_eq!(policy.deposit_amount(400_000), 200_000);
        let thirty = BookingPolicy { deposit_percent: 30, ..policy };
        assert_eq!(thirty.deposit_amount(400_000), 120_000);
    }
}
