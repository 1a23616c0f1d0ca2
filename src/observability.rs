use std::net::SocketAddr;

use metrics_exporter_prometheus::BuildError;

// ── Booking flow ────────────────────────────────────────────────

/// Counter: appointments created.
pub const APPOINTMENTS_CREATED_TOTAL: &str = "slotbook_appointments_created_total";

/// Counter: lifecycle transitions applied. Labels: to.
pub const APPOINTMENT_TRANSITIONS_TOTAL: &str = "slotbook_appointment_transitions_total";

/// Counter: rejected operations. Labels: op, kind.
pub const ENGINE_ERRORS_TOTAL: &str = "slotbook_engine_errors_total";

/// Counter: slots created by bulk generation or by hand.
pub const SLOTS_CREATED_TOTAL: &str = "slotbook_slots_created_total";

// ── Notifications ───────────────────────────────────────────────

/// Counter: notices handed to the gateway. Labels: kind, status.
pub const NOTICES_TOTAL: &str = "slotbook_notices_total";

/// Counter: dispatcher fell behind the event hub and dropped events.
pub const DISPATCH_LAGGED_TOTAL: &str = "slotbook_dispatch_lagged_total";

// ── Sweeps ──────────────────────────────────────────────────────

/// Histogram: sweep tick duration in seconds. Labels: sweep.
pub const SWEEP_DURATION_SECONDS: &str = "slotbook_sweep_duration_seconds";

/// Counter: sweep ticks that errored or panicked. Labels: sweep.
pub const SWEEP_FAILURES_TOTAL: &str = "slotbook_sweep_failures_total";

// ── Storage ─────────────────────────────────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "slotbook_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (transactions per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "slotbook_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "slotbook_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}
