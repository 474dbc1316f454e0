use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use ulid::Ulid;

use crate::model::{Booking, BookingEvent, PriceBreakdown};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for booking changes, per room plus one firehose.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<BookingEvent>>,
    all: broadcast::Sender<BookingEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to changes on one room. Creates the channel if needed.
    pub fn subscribe(&self, room_id: Ulid) -> broadcast::Receiver<BookingEvent> {
        let sender = self
            .channels
            .entry(room_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Subscribe to every change on every room.
    pub fn subscribe_all(&self) -> broadcast::Receiver<BookingEvent> {
        self.all.subscribe()
    }

    /// Publish a change. No-op if nobody is listening.
    pub fn send(&self, room_id: Ulid, event: &BookingEvent) {
        let _ = self.all.send(event.clone());
        if let Some(sender) = self.channels.get(&room_id) {
            let _ = sender.send(event.clone());
        }
    }
}

/// Downstream collaborator told about every booking change (email, UI push).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn booking_created(&self, booking: &Booking, price: &PriceBreakdown) -> Result<(), String>;
    async fn booking_updated(&self, booking: &Booking) -> Result<(), String>;
}

/// Sink that only logs.
pub struct TracingSink;

#[async_trait]
impl NotificationSink for TracingSink {
    async fn booking_created(&self, booking: &Booking, price: &PriceBreakdown) -> Result<(), String> {
        info!(
            "booking {} created for {} ({}), total {}, status {}",
            booking.code, booking.customer.email, booking.date, price.total, booking.status
        );
        Ok(())
    }

    async fn booking_updated(&self, booking: &Booking) -> Result<(), String> {
        info!(
            "booking {} now {}, amount due {}",
            booking.code, booking.status, booking.amount_due
        );
        Ok(())
    }
}

/// Forward every published event to `sink`. Sink failures are logged and
/// never reach the ledger.
pub fn spawn_dispatcher(hub: &NotifyHub, sink: Arc<dyn NotificationSink>) -> JoinHandle<()> {
    let mut rx = hub.subscribe_all();
    tokio::spawn(async move {
        loop {
            let event = match rx.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!("notification dispatcher lagged, {n} events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let result = match &event {
                BookingEvent::Created { booking, price } => sink.booking_created(booking, price).await,
                BookingEvent::Updated { booking } => sink.booking_updated(booking).await,
            };
            if let Err(e) = result {
                warn!("notification for booking {} failed: {e}", event.booking().code);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use chrono::NaiveDate;
    use std::sync::Mutex;

    fn booking(room_id: Ulid) -> Booking {
        Booking {
            id: Ulid::new(),
            code: "2305000".into(),
            order_codes: vec![],
            room_id,
            date: NaiveDate::from_ymd_opt(2025, 5, 23).unwrap(),
            slot_ids: vec![Ulid::new()],
            customer: Customer {
                name: "An".into(),
                email: "an@example.com".into(),
                phone: "0900000000".into(),
            },
            film_id: None,
            combo_id: None,
            promotion_id: None,
            total_money: 120_000,
            amount_due: 120_000,
            status: BookingStatus::Confirmed,
            payments: vec![],
            created_at: 0,
            updated_at: 0,
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        let mut rx = hub.subscribe(rid);

        let event = BookingEvent::Updated { booking: booking(rid) };
        hub.send(rid, &event);

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
    }

    #[tokio::test]
    async fn room_channels_are_isolated() {
        let hub = NotifyHub::new();
        let (a, b) = (Ulid::new(), Ulid::new());
        let mut rx_a = hub.subscribe(a);
        let mut all = hub.subscribe_all();

        hub.send(b, &BookingEvent::Updated { booking: booking(b) });

        assert!(rx_a.try_recv().is_err());
        assert_eq!(all.recv().await.unwrap().booking().room_id, b);
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let rid = Ulid::new();
        hub.send(rid, &BookingEvent::Updated { booking: booking(rid) });
    }

    struct FlakySink {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl NotificationSink for FlakySink {
        async fn booking_created(&self, booking: &Booking, _price: &PriceBreakdown) -> Result<(), String> {
            self.seen.lock().unwrap().push(format!("created:{}", booking.code));
            Err("smtp down".into())
        }

        async fn booking_updated(&self, booking: &Booking) -> Result<(), String> {
            self.seen.lock().unwrap().push(format!("updated:{}", booking.code));
            Ok(())
        }
    }

    #[tokio::test]
    async fn dispatcher_survives_sink_failures() {
        let hub = NotifyHub::new();
        let sink = Arc::new(FlakySink { seen: Mutex::new(Vec::new()) });
        let handle = spawn_dispatcher(&hub, sink.clone());

        let rid = Ulid::new();
        let b = booking(rid);
        let price = PriceBreakdown {
            price_per_minute: 2000,
            total_minutes: 60,
            base_price: 120_000,
            combo_price: None,
            discount_percent: 0,
            discount: 0,
            total: 120_000,
        };
        hub.send(rid, &BookingEvent::Created { booking: b.clone(), price });
        hub.send(rid, &BookingEvent::Updated { booking: b });

        for _ in 0..50 {
            if sink.seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(
            *sink.seen.lock().unwrap(),
            vec!["created:2305000".to_string(), "updated:2305000".to_string()]
        );
        handle.abort();
    }
}
