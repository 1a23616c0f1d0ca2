use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::dispatch::deliver_all;
use crate::engine::{now_local, Engine, EngineError};
use crate::gateway::{NotificationGateway, Notice, Recipient};
use crate::limits::MAX_BATCH_SIZE;
use crate::model::{Stamp, WorkingHours};
use crate::observability::{SWEEP_DURATION_SECONDS, SWEEP_FAILURES_TOTAL};

const MAX_INTERVAL_SECS: u64 = 7 * 24 * 3600;

/// When a periodic task fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    /// Fixed delay between the end of one tick and the start of the next.
    Interval { every_secs: u64 },
    /// Once a day at HH:MM shop time.
    Daily { hour: u32, minute: u32 },
}

impl Trigger {
    pub fn every_secs(every_secs: u64) -> Self {
        Self::Interval { every_secs }
    }

    /// Next firing strictly after `from`.
    pub fn next_after(&self, from: Stamp) -> Stamp {
        match *self {
            Self::Interval { every_secs } => {
                from + Duration::seconds(every_secs.clamp(1, MAX_INTERVAL_SECS) as i64)
            }
            Self::Daily { hour, minute } => {
                let candidate = from.date().and_hms_opt(hour.min(23), minute.min(59), 0);
                match candidate {
                    Some(c) if c > from => c,
                    Some(c) => c + Duration::days(1),
                    None => from + Duration::days(1),
                }
            }
        }
    }

    pub fn delay_from(&self, now: Stamp) -> std::time::Duration {
        (self.next_after(now) - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}

/// Outcome of one sweep tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    /// Rows the sweep looked at.
    pub candidates: usize,
    /// Rows it changed.
    pub applied: usize,
}

/// The reminder and completion sweeps over one engine.
pub struct Scheduler {
    engine: Arc<Engine>,
    gateway: Arc<dyn NotificationGateway>,
    staff: Vec<String>,
    reminder_lead: Duration,
    /// Most appointments written in one transaction.
    batch_size: usize,
}

impl Scheduler {
    pub fn new(
        engine: Arc<Engine>,
        gateway: Arc<dyn NotificationGateway>,
        staff: Vec<String>,
        reminder_lead: Duration,
    ) -> Self {
        Self {
            engine,
            gateway,
            staff,
            reminder_lead,
            batch_size: MAX_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_BATCH_SIZE);
        self
    }

    /// Remind the customer and staff of every confirmed appointment starting
    /// within the lead window. Only fully delivered reminders are marked, so
    /// partial failures are retried on the next tick.
    pub async fn reminder_sweep(&self, now: Stamp) -> Result<SweepReport, EngineError> {
        let due = self.engine.list_due(now, self.reminder_lead).await;
        if due.is_empty() {
            debug!("reminder sweep: nothing due");
            return Ok(SweepReport::default());
        }

        let mut delivered: Vec<Ulid> = Vec::with_capacity(due.len());
        for item in &due {
            let appointment = &item.appointment;
            let notice = Notice::Reminder {
                appointment_id: appointment.id,
                start_time: item.start_time,
                final_price: appointment.final_price,
            };
            let deliveries: Vec<(Recipient, Notice)> =
                std::iter::once(Recipient::Customer(appointment.customer_id))
                    .chain(self.staff.iter().cloned().map(Recipient::Staff))
                    .map(|to| (to, notice.clone()))
                    .collect();

            let failed = deliver_all(self.gateway.as_ref(), &deliveries).await;
            if failed == 0 {
                delivered.push(appointment.id);
            } else {
                warn!(
                    appointment_id = %appointment.id,
                    failed,
                    "reminder not delivered to everyone; will retry"
                );
            }
        }

        let mut marked = Vec::with_capacity(delivered.len());
        for chunk in delivered.chunks(self.batch_size) {
            marked.extend(self.engine.mark_notified_all(chunk).await?);
        }
        info!(due = due.len(), marked = marked.len(), "reminder sweep");
        Ok(SweepReport {
            candidates: due.len(),
            applied: marked.len(),
        })
    }

    /// Promote every confirmed appointment whose service time has elapsed.
    /// The follow-up notice goes out through the event hub.
    pub async fn completion_sweep(&self, now: Stamp) -> Result<SweepReport, EngineError> {
        let expired = self.engine.list_expired(now).await;
        if expired.is_empty() {
            debug!("completion sweep: nothing expired");
            return Ok(SweepReport::default());
        }

        let ids: Vec<Ulid> = expired.iter().map(|d| d.appointment.id).collect();
        let mut completed = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.batch_size) {
            completed.extend(self.engine.mark_completed_all(chunk, now).await?);
        }
        info!(
            expired = expired.len(),
            completed = completed.len(),
            "completion sweep"
        );
        Ok(SweepReport {
            candidates: expired.len(),
            applied: completed.len(),
        })
    }
}

/// Run `tick` on every firing of `trigger` until `shutdown` is cancelled.
/// Each tick runs in its own task: an error or a panic is logged and only
/// that tick is lost. A tick in flight finishes before shutdown returns.
pub async fn run_periodic<F, Fut>(
    name: &'static str,
    trigger: Trigger,
    shutdown: CancellationToken,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<SweepReport, EngineError>> + Send + 'static,
{
    info!(task = name, ?trigger, "periodic task started");
    loop {
        let delay = trigger.delay_from(now_local());
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let started = Instant::now();
        let outcome = tokio::spawn(tick()).await;
        metrics::histogram!(SWEEP_DURATION_SECONDS, "sweep" => name)
            .record(started.elapsed().as_secs_f64());
        match outcome {
            Ok(Ok(report)) => debug!(task = name, ?report, "tick done"),
            Ok(Err(e)) => {
                metrics::counter!(SWEEP_FAILURES_TOTAL, "sweep" => name).increment(1);
                error!(task = name, "tick failed: {e}");
            }
            Err(e) => {
                metrics::counter!(SWEEP_FAILURES_TOTAL, "sweep" => name).increment(1);
                error!(task = name, "tick panicked: {e}");
            }
        }
    }
    info!(task = name, "periodic task stopped");
}

/// Spawn the reminder and completion sweeps.
pub fn spawn_sweeps(
    scheduler: Arc<Scheduler>,
    reminder: Trigger,
    completion: Trigger,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    let reminders = scheduler.clone();
    vec![
        tokio::spawn(run_periodic("reminder", reminder, shutdown.clone(), move || {
            let scheduler = reminders.clone();
            async move { scheduler.reminder_sweep(now_local()).await }
        })),
        tokio::spawn(run_periodic("completion", completion, shutdown, move || {
            let scheduler = scheduler.clone();
            async move { scheduler.completion_sweep(now_local()).await }
        })),
    ]
}

/// Compact the WAL whenever more than `threshold` transactions have been
/// appended since the last compaction.
pub async fn run_compactor(
    engine: Arc<Engine>,
    threshold: u64,
    trigger: Trigger,
    shutdown: CancellationToken,
) {
    run_periodic("compaction", trigger, shutdown, move || {
        let engine = engine.clone();
        async move {
            let appends = engine.wal_appends_since_compact().await;
            if appends <= threshold {
                return Ok(SweepReport {
                    candidates: appends as usize,
                    applied: 0,
                });
            }
            engine.compact_wal().await?;
            Ok(SweepReport {
                candidates: appends as usize,
                applied: 1,
            })
        }
    })
    .await
}

/// Keep next month's calendar filled. Months already generated are
/// skipped, so firing more than once a day is harmless.
pub async fn run_planner(
    engine: Arc<Engine>,
    hours: WorkingHours,
    trigger: Trigger,
    shutdown: CancellationToken,
) {
    run_periodic("planner", trigger, shutdown, move || {
        let engine = engine.clone();
        async move {
            let created = engine.schedule_next_month(&hours, now_local()).await?;
            Ok(SweepReport {
                candidates: created.len(),
                applied: created.len(),
            })
        }
    })
    .await
}
