use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::NaiveDate;
use ulid::Ulid;

use slotbook::catalog::{ServiceInfo, StaticCatalog};
use slotbook::engine::{BufferReleasePolicy, Engine, EngineError};
use slotbook::model::{CarInfo, NewAppointment, Stamp, TimeSlot, WorkingHours};
use slotbook::notify::NotifyHub;

const YEAR: i32 = 2031;

fn service() -> ServiceInfo {
    ServiceInfo {
        id: Ulid::from_parts(1, 1),
        name: "Full wash".into(),
        duration_minutes: 60,
        default_price: 1500,
    }
}

fn open(dir: &Path) -> Arc<Engine> {
    let engine = Engine::new(
        dir.join("slotbook.wal"),
        Arc::new(StaticCatalog::new([service()])),
        Arc::new(NotifyHub::new()),
        BufferReleasePolicy::ConfirmedOnly,
    )
    .expect("open engine");
    Arc::new(engine)
}

fn request(slot: &TimeSlot) -> NewAppointment {
    NewAppointment {
        customer_id: Ulid::new(),
        service_id: service().id,
        time_slot_id: slot.id,
        car: CarInfo::default(),
        client_comment: None,
    }
}

/// Generate every month of the bench year and return the slots in time order.
async fn setup(engine: &Engine, months: u32) -> Vec<TimeSlot> {
    let before = NaiveDate::from_ymd_opt(YEAR - 1, 12, 31)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap();
    let mut slots = Vec::new();
    for month in 1..=months {
        slots.extend(
            engine
                .bulk_generate(YEAR, month, &WorkingHours::default(), before)
                .await
                .expect("generate month"),
        );
    }
    slots.sort_by_key(|s| s.start_time);
    slots
}

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
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies.last().unwrap().as_secs_f64() * 1000.0,
    );
}

/// Every active booking must be at least two hours from the next one.
async fn check_spacing(engine: &Engine, slots: &[TimeSlot]) -> usize {
    let mut starts: Vec<Stamp> = Vec::new();
    for status in [
        slotbook::model::AppointmentStatus::Pending,
        slotbook::model::AppointmentStatus::Confirmed,
    ] {
        for a in engine.appointments_with_status(status).await {
            if let Some(slot) = slots.iter().find(|s| s.id == a.time_slot_id) {
                starts.push(slot.start_time);
            }
        }
    }
    starts.sort();
    starts
        .windows(2)
        .filter(|w| w[1] - w[0] < chrono::Duration::hours(2))
        .count()
}

async fn phase1_sequential(dir: &Path) {
    let engine = open(dir);
    let slots = setup(&engine, 3).await;

    let mut latencies = Vec::with_capacity(slots.len());
    let mut booked = 0usize;
    let mut refused = 0usize;
    let start = Instant::now();
    for slot in &slots {
        let t = Instant::now();
        match engine.create_appointment(request(slot)).await {
            Ok(_) => booked += 1,
            Err(EngineError::SlotUnavailable(_)) => refused += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
        latencies.push(t.elapsed());
    }

    let elapsed = start.elapsed();
    let ops = slots.len() as f64 / elapsed.as_secs_f64();
    println!(
        "  {} attempts ({booked} booked, {refused} refused) in {:.2}s = {ops:.0} ops/sec",
        slots.len(),
        elapsed.as_secs_f64()
    );
    print_latency("write latency", &mut latencies);
}

async fn phase2_contended(dir: &Path) {
    let engine = open(dir);
    let slots = Arc::new(setup(&engine, 1).await);
    let n_tasks = 16;

    let start = Instant::now();
    let mut handles = Vec::new();
    for i in 0..n_tasks {
        let engine = engine.clone();
        let slots = slots.clone();
        // every task walks the whole month from a different offset
        handles.push(tokio::spawn(async move {
            let mut booked = 0usize;
            for k in 0..slots.len() {
                let slot = &slots[(k + i * 7) % slots.len()];
                if engine.create_appointment(request(slot)).await.is_ok() {
                    booked += 1;
                }
            }
            booked
        }));
    }

    let mut booked = 0;
    for h in handles {
        booked += h.await.unwrap();
    }
    let elapsed = start.elapsed();
    let attempts = n_tasks * slots.len();
    let ops = attempts as f64 / elapsed.as_secs_f64();
    println!(
        "  {n_tasks} tasks x {} slots = {attempts} attempts, {booked} booked in {:.2}s = {ops:.0} ops/sec",
        slots.len(),
        elapsed.as_secs_f64()
    );
    let violations = check_spacing(&engine, &slots).await;
    println!("  bookings closer than two hours: {violations}");
    assert_eq!(violations, 0);
}

async fn phase3_read_under_load(dir: &Path) {
    let engine = open(dir);
    let slots = Arc::new(setup(&engine, 2).await);
    let day = slots[slots.len() / 2].start_time.date();

    let writer = {
        let engine = engine.clone();
        let slots = slots.clone();
        tokio::spawn(async move {
            for slot in slots.iter() {
                if let Ok(a) = engine.create_appointment(request(slot)).await {
                    let _ = engine.confirm_appointment(a.id, 1500).await;
                    let _ = engine.cancel_appointment(a.id, "bench", false).await;
                }
            }
        })
    };

    let mut latencies = Vec::new();
    while !writer.is_finished() {
        let t = Instant::now();
        let views = engine.slots_for_date(day).await;
        latencies.push(t.elapsed());
        assert!(!views.is_empty());
        tokio::task::yield_now().await;
    }
    writer.await.unwrap();
    print_latency("day view latency", &mut latencies);
}

async fn phase4_compaction(dir: &Path) {
    let engine = open(dir);
    let slots = setup(&engine, 12).await;
    for slot in slots.iter().step_by(2) {
        let _ = engine.create_appointment(request(slot)).await;
    }
    let appends = engine.wal_appends_since_compact().await;

    let t = Instant::now();
    engine.compact_wal().await.expect("compact");
    println!(
        "  compacted {appends} transactions ({} slots) in {:.2}ms",
        engine.slot_count(),
        t.elapsed().as_secs_f64() * 1000.0
    );
    drop(engine);

    let t = Instant::now();
    let reopened = open(dir);
    println!(
        "  replayed {} slots, {} appointments in {:.2}ms",
        reopened.slot_count(),
        reopened.appointment_count(),
        t.elapsed().as_secs_f64() * 1000.0
    );
}

#[tokio::main]
async fn main() {
    println!("=== slotbook stress benchmark ===\n");

    // Each phase gets its own data directory to avoid interference
    println!("[phase 1] sequential booking throughput");
    phase1_sequential(tempfile::tempdir().unwrap().path()).await;

    println!("\n[phase 2] contended booking throughput");
    phase2_contended(tempfile::tempdir().unwrap().path()).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(tempfile::tempdir().unwrap().path()).await;

    println!("\n[phase 4] compaction and replay");
    phase4_compaction(tempfile::tempdir().unwrap().path()).await;

    println!("\n=== benchmark complete ===");
}
