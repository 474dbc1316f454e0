mod error;
pub mod lifecycle;
mod mutations;
mod occupancy;
mod queries;
pub mod sequence;

pub use error::{EngineError, ErrorKind};
pub use occupancy::RoomState;

use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, OwnedRwLockWriteGuard, RwLock};
use tracing::{error, info};
use ulid::Ulid;

use crate::catalog::CatalogReader;
use crate::config::BookingPolicy;
use crate::limits::ORDER_CODE_BASE;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::observability::{WAL_FLUSH_BATCH_SIZE, WAL_FLUSH_DURATION_SECONDS};
use crate::wal::Wal;

use sequence::DaySequences;

pub type SharedRoomState = Arc<RwLock<RoomState>>;

// ── Group-commit WAL channel ─────────────────────────────

type Pending = (Event, oneshot::Sender<io::Result<()>>);

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Owns the WAL. Appends that queue up while a flush is in progress are
/// written together and share one fsync; every caller hears the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        let (event, response) = match cmd {
            WalCommand::Append { event, response } => (event, response),
            other => {
                handle_control(&mut wal, other);
                continue;
            }
        };
        let mut batch = vec![(event, response)];
        let mut deferred = None;
        loop {
            match rx.try_recv() {
                Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
                Ok(other) => {
                    deferred = Some(other);
                    break;
                }
                Err(_) => break,
            }
        }
        commit_batch(&mut wal, batch);
        if let Some(cmd) = deferred {
            handle_control(&mut wal, cmd);
        }
    }
    info!("WAL writer stopped");
}

fn commit_batch(wal: &mut Wal, batch: Vec<Pending>) {
    metrics::histogram!(WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let started = std::time::Instant::now();

    let appended = batch
        .iter()
        .try_for_each(|(event, _)| wal.append_buffered(event));
    // Flush even after a failed append so stray bytes never join the next batch.
    let flushed = wal.flush_sync();
    let result = appended.and(flushed);

    metrics::histogram!(WAL_FLUSH_DURATION_SECONDS).record(started.elapsed().as_secs_f64());
    if let Err(e) = &result {
        error!("WAL flush of {} records failed: {e}", batch.len());
    }
    for (_, tx) in batch {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_control(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => commit_batch(wal, vec![(event, response)]),
    }
}

/// The reservation ledger. Rooms are locked independently; every change is
/// appended to the WAL before it is applied in memory.
pub struct Engine {
    pub(super) rooms: DashMap<Ulid, SharedRoomState>,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub notify: Arc<NotifyHub>,
    pub(super) catalog: Arc<dyn CatalogReader>,
    pub(super) policy: BookingPolicy,
    /// booking id → room id
    pub(super) booking_room: DashMap<Ulid, Ulid>,
    /// booking code → booking id, across all years
    pub(super) codes: DashMap<String, Ulid>,
    /// every order code ever assigned → booking id
    pub(super) order_codes: DashMap<i64, Ulid>,
    pub(super) sequences: DaySequences,
    pub(super) next_order_code: AtomicI64,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        notify: Arc<NotifyHub>,
        catalog: Arc<dyn CatalogReader>,
        policy: BookingPolicy,
    ) -> io::Result<Self> {
        let events = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            rooms: DashMap::new(),
            wal_tx,
            notify,
            catalog,
            policy,
            booking_room: DashMap::new(),
            codes: DashMap::new(),
            order_codes: DashMap::new(),
            sequences: DaySequences::default(),
            next_order_code: AtomicI64::new(ORDER_CODE_BASE),
        };

        // Nobody else holds these locks yet, so try_write always succeeds.
        for event in &events {
            if let Event::BookingCreated { booking } = event {
                engine.sequences.observe(booking.date);
            }
            let room = engine.room(event_room_id(event));
            if let Ok(mut guard) = room.try_write() {
                engine.apply(&mut guard, event);
            }
        }
        if !events.is_empty() {
            info!(
                "replayed {} WAL records: {} bookings in {} rooms",
                events.len(),
                engine.booking_room.len(),
                engine.rooms.len()
            );
        }

        Ok(engine)
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    /// The room's state, created empty on first use.
    pub(super) fn room(&self, room_id: Ulid) -> SharedRoomState {
        self.rooms
            .entry(room_id)
            .or_insert_with(|| Arc::new(RwLock::new(RoomState::new(room_id))))
            .clone()
    }

    pub fn get_room(&self, room_id: &Ulid) -> Option<SharedRoomState> {
        self.rooms.get(room_id).map(|e| e.value().clone())
    }

    pub(super) fn booking_id_for_code(&self, code: &str) -> Option<Ulid> {
        self.codes.get(code).map(|e| *e.value())
    }

    pub(super) fn booking_id_for_order(&self, order_code: i64) -> Option<Ulid> {
        self.order_codes.get(&order_code).map(|e| *e.value())
    }

    /// Apply an event to a room. The caller holds the room's write lock.
    fn apply(&self, rs: &mut RoomState, event: &Event) {
        match event {
            Event::BookingCreated { booking } => {
                if booking.status.is_holding() {
                    rs.hold(booking);
                }
                self.booking_room.insert(booking.id, booking.room_id);
                self.codes.insert(booking.code.clone(), booking.id);
                for order_code in &booking.order_codes {
                    self.index_order_code(*order_code, booking.id);
                }
                rs.bookings.insert(booking.id, booking.clone());
            }
            Event::StatusChanged {
                id,
                to,
                amount_due,
                payment,
                at,
                ..
            } => {
                let Some(booking) = rs.bookings.get_mut(id) else {
                    return;
                };
                let released = booking.status.is_holding() && !to.is_holding();
                booking.status = *to;
                booking.amount_due = *amount_due;
                booking.updated_at = *at;
                if let Some(p) = payment {
                    booking.payments.push(p.clone());
                }
                if released {
                    let snapshot = booking.clone();
                    rs.release(&snapshot);
                }
            }
            Event::OrderCodeAssigned {
                id, order_code, at, ..
            } => {
                if let Some(booking) = rs.bookings.get_mut(id) {
                    booking.order_codes.push(*order_code);
                    booking.updated_at = *at;
                    self.index_order_code(*order_code, *id);
                }
            }
        }
    }

    fn index_order_code(&self, order_code: i64, booking_id: Ulid) {
        self.order_codes.insert(order_code, booking_id);
        self.next_order_code
            .fetch_max(order_code + 1, Ordering::SeqCst);
    }

    /// Write event to WAL via the background group-commit writer.
    async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL append, then apply. Nothing changes in memory if the append fails.
    pub(super) async fn persist_and_apply(
        &self,
        rs: &mut RoomState,
        event: &Event,
    ) -> Result<(), EngineError> {
        self.wal_append(event).await?;
        self.apply(rs, event);
        Ok(())
    }

    /// Lookup booking → room and take the room's write lock.
    pub(super) async fn resolve_booking_write(
        &self,
        booking_id: &Ulid,
    ) -> Result<(Ulid, OwnedRwLockWriteGuard<RoomState>), EngineError> {
        let room_id = self
            .booking_room
            .get(booking_id)
            .map(|e| *e.value())
            .ok_or_else(|| EngineError::NotFound(format!("booking {booking_id}")))?;
        let rs = self
            .get_room(&room_id)
            .ok_or_else(|| EngineError::NotFound(format!("room {room_id}")))?;
        Ok((room_id, rs.write_owned().await))
    }
}

fn event_room_id(event: &Event) -> Ulid {
    match event {
        Event::BookingCreated { booking } => booking.room_id,
        Event::StatusChanged { room_id, .. } | Event::OrderCodeAssigned { room_id, .. } => *room_id,
    }
}
