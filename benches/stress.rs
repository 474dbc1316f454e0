use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Days, NaiveDate, NaiveTime};
use ulid::Ulid;

use slotbook::catalog::InMemoryCatalog;
use slotbook::config::BookingPolicy;
use slotbook::engine::{Engine, EngineError};
use slotbook::model::*;
use slotbook::notify::NotifyHub;
use slotbook::sweeper;

const ROOMS: usize = 20;
const SLOTS_PER_DAY: u32 = 12;

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.3}ms, p50={:.3}ms, p95={:.3}ms, p99={:.3}ms, max={:.3}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

struct Bench {
    engine: Arc<Engine>,
    rooms: Vec<Ulid>,
    /// Hour slots from 08:00, in order.
    slots: Vec<Ulid>,
}

fn setup() -> Bench {
    let slots: Vec<TimeSlot> = (0..SLOTS_PER_DAY)
        .map(|i| TimeSlot {
            id: Ulid::new(),
            start: NaiveTime::from_hms_opt(8 + i, 0, 0).unwrap(),
            end: NaiveTime::from_hms_opt(9 + i, 0, 0).unwrap(),
            duration_minutes: 60,
        })
        .collect();
    let rooms: Vec<Room> = (0..ROOMS)
        .map(|_| Room {
            id: Ulid::new(),
            branch_id: Ulid::new(),
            room_type_id: Ulid::new(),
            price_per_minute: 2000,
            status: RoomStatus::Active,
        })
        .collect();

    let dir = std::env::temp_dir().join(format!("slotbook_bench_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let bench = Bench {
        rooms: rooms.iter().map(|r| r.id).collect(),
        slots: slots.iter().map(|s| s.id).collect(),
        engine: Arc::new(
            Engine::new(
                dir.join("bookings.wal"),
                Arc::new(NotifyHub::new()),
                Arc::new(InMemoryCatalog {
                    slots,
                    rooms,
                    ..Default::default()
                }),
                BookingPolicy::default(),
            )
            .unwrap(),
        ),
    };
    println!("  {ROOMS} rooms x {SLOTS_PER_DAY} slots, WAL in {}", dir.display());
    bench
}

fn day(offset: u64) -> NaiveDate {
    NaiveDate::from_ymd_opt(2030, 1, 1).unwrap() + Days::new(offset)
}

fn request(room_id: Ulid, date: NaiveDate, slot_ids: Vec<Ulid>) -> ReservationRequest {
    ReservationRequest {
        room_id,
        date,
        slot_ids,
        customer: Customer {
            name: "Bench".into(),
            email: "bench@example.com".into(),
            phone: "0900000000".into(),
        },
        film_id: None,
        combo_id: None,
        promotion_code: None,
    }
}

/// One three-hour reservation per (room, date, block), back to back.
async fn phase1_sequential(b: &Bench) {
    let n = 2000;
    let blocks = (SLOTS_PER_DAY / 3) as usize;
    let mut latencies = Vec::with_capacity(n);
    let start = Instant::now();

    for i in 0..n {
        let room = b.rooms[i % ROOMS];
        let block = (i / ROOMS) % blocks;
        let date = day((i / (ROOMS * blocks)) as u64);
        let slots = b.slots[block * 3..block * 3 + 3].to_vec();
        let t = Instant::now();
        b.engine.reserve(request(room, date, slots)).await.unwrap();
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} reservations in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("reserve latency", &mut latencies);
}

/// Many tasks fight over the same slot; exactly one may win per date.
async fn phase2_contended(b: &Bench) {
    let n_tasks = 64;
    let dates = 100u64;
    let room = b.rooms[0];
    let slot = b.slots[SLOTS_PER_DAY as usize - 1];
    let wins = Arc::new(AtomicUsize::new(0));
    let conflicts = Arc::new(AtomicUsize::new(0));

    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..n_tasks {
        let engine = b.engine.clone();
        let wins = wins.clone();
        let conflicts = conflicts.clone();
        handles.push(tokio::spawn(async move {
            for d in 0..dates {
                match engine.reserve(request(room, day(1000 + d), vec![slot])).await {
                    Ok(_) => wins.fetch_add(1, Ordering::Relaxed),
                    Err(EngineError::SlotConflict { .. }) => conflicts.fetch_add(1, Ordering::Relaxed),
                    Err(e) => panic!("unexpected error: {e}"),
                };
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let wins = wins.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {dates} dates in {:.2}s: {wins} won, {} conflicted",
        elapsed.as_secs_f64(),
        conflicts.load(Ordering::Relaxed)
    );
    assert_eq!(wins as u64, dates, "double booking detected");
}

async fn phase3_read_under_load(b: &Bench) {
    let stop = Arc::new(AtomicBool::new(false));
    let mut writers = Vec::new();
    for w in 0..5u64 {
        let engine = b.engine.clone();
        let stop = stop.clone();
        let rooms = b.rooms.clone();
        let slots = b.slots.clone();
        writers.push(tokio::spawn(async move {
            let mut i = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let date = day(2000 + w * 10_000 + (i / (ROOMS * slots.len())) as u64);
                let room = rooms[i % ROOMS];
                let slot = slots[(i / ROOMS) % slots.len()];
                let _ = engine.reserve(request(room, date, vec![slot])).await;
                i += 1;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 500;
    let mut readers = Vec::new();
    for r in 0..n_readers {
        let engine = b.engine.clone();
        let room = b.rooms[r % ROOMS];
        readers.push(tokio::spawn(async move {
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let t = Instant::now();
                engine.occupied_slots(room, day((i % 20) as u64)).await;
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all = Vec::new();
    for h in readers {
        all.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writers {
        let _ = h.await;
    }
    print_latency("occupied_slots query", &mut all);
}

async fn phase4_sweep(b: &Bench) {
    let grace = b.engine.policy().deposit_grace_ms;
    let start = Instant::now();
    let report = sweeper::sweep_once(&b.engine, i64::MAX - grace, grace).await;
    println!(
        "  swept {} pending bookings in {:.2}s ({} failed)",
        report.expired.len(),
        start.elapsed().as_secs_f64(),
        report.failed.len()
    );
}

#[tokio::main]
async fn main() {
    println!("=== slotbook stress benchmark ===\n");

    println!("[setup]");
    let bench = setup();

    println!("\n[phase 1] sequential reservation throughput");
    phase1_sequential(&bench).await;

    println!("\n[phase 2] contended slot");
    phase2_contended(&bench).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&bench).await;

    println!("\n[phase 4] deposit sweep");
    phase4_sweep(&bench).await;

    println!("\n  {} bookings in ledger", bench.engine.booking_count());
    println!("\n=== benchmark complete ===");
}
