mod allocator;
mod conflict;
mod error;
mod ledger;
mod queries;
mod store;

pub use allocator::next_month;
pub use conflict::now_local;
pub use error::EngineError;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::info;

use crate::catalog::ServiceCatalog;
use crate::model::*;
use crate::notify::NotifyHub;
use crate::wal::{Txn, Wal};

use store::Tables;

/// What happens to the buffer slots of an appointment cancelled before it
/// was confirmed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BufferReleasePolicy {
    /// Only appointments that reached CONFIRMED free their neighbours; a
    /// cancelled pending booking leaves its buffers blocked.
    #[default]
    ConfirmedOnly,
    /// Free unclaimed neighbours on every cancellation.
    Always,
}

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        txn: Txn,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        snapshot: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type PendingAppend = (Txn, oneshot::Sender<io::Result<()>>);

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the batch result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { txn, response } => {
                let mut batch = vec![(txn, response)];
                let mut deferred = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { txn, response }) => batch.push((txn, response)),
                        Ok(other) => {
                            // flush what we have before compaction or stats
                            deferred = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE)
                    .record(batch.len() as f64);
                let flush_start = std::time::Instant::now();
                let result = flush_batch(&mut wal, &batch);
                metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
                    .record(flush_start.elapsed().as_secs_f64());
                respond_batch(batch, &result);

                if let Some(other) = deferred {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_batch(wal: &mut Wal, batch: &[PendingAppend]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (txn, _) in batch {
        if let Err(e) = wal.append_buffered(txn) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn respond_batch(batch: Vec<PendingAppend>, result: &io::Result<()>) {
    for (_, tx) in batch {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { snapshot, response } => {
            let result = Wal::write_compact_file(wal.path(), &snapshot)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { txn, response } => {
            let result = wal.append_buffered(&txn).and_then(|()| wal.flush_sync());
            let _ = response.send(result);
        }
    }
}

/// The booking engine: slot allocator plus appointment ledger over one
/// WAL-backed store.
///
/// Locking order, always: commit gate (shared) → appointment row →
/// calendar lock → slot rows in start-time order.
pub struct Engine {
    pub(super) tables: Tables,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Mutations hold it shared from first lock to last apply; compaction
    /// takes it exclusively so the snapshot never splits a transaction.
    pub(super) commit_gate: RwLock<()>,
    /// Serializes creation and deletion of slot rows.
    pub(super) calendar_lock: Mutex<()>,
    pub(super) catalog: Arc<dyn ServiceCatalog>,
    pub notify: Arc<NotifyHub>,
    pub(super) buffer_policy: BufferReleasePolicy,
}

impl Engine {
    pub fn new(
        wal_path: PathBuf,
        catalog: Arc<dyn ServiceCatalog>,
        notify: Arc<NotifyHub>,
        buffer_policy: BufferReleasePolicy,
    ) -> io::Result<Self> {
        let (txns, wal) = Wal::recover(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        // We are the sole owner of every row here, so try_lock always succeeds.
        let tables = Tables::new();
        for event in txns.iter().flatten() {
            tables.replay(event);
        }
        info!(
            path = %wal_path.display(),
            transactions = txns.len(),
            slots = tables.slot_count(),
            appointments = tables.appointment_count(),
            "store recovered"
        );

        Ok(Self {
            tables,
            wal_tx,
            commit_gate: RwLock::new(()),
            calendar_lock: Mutex::new(()),
            catalog,
            notify,
            buffer_policy,
        })
    }

    /// Make one transaction durable via the group-commit writer. Nothing is
    /// applied in memory until this returns Ok.
    pub(super) async fn commit(&self, txn: &[Event]) -> Result<(), EngineError> {
        if txn.is_empty() {
            return Ok(());
        }
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                txn: txn.to_vec(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }

    pub fn buffer_policy(&self) -> BufferReleasePolicy {
        self.buffer_policy
    }

    pub fn slot_count(&self) -> usize {
        self.tables.slot_count()
    }

    pub fn appointment_count(&self) -> usize {
        self.tables.appointment_count()
    }

    /// Rewrite the WAL as a single snapshot transaction of the current rows.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.commit_gate.write().await;

        let mut slots = Vec::new();
        for row in self.tables.slot_rows() {
            slots.push(row.lock().await.clone());
        }
        slots.sort_by_key(|s| s.start_time);
        let mut appointments = Vec::new();
        for row in self.tables.appointment_rows() {
            appointments.push(row.lock().await.clone());
        }
        appointments.sort_by_key(|a| a.id);

        let rows = slots.len() + appointments.len();
        let snapshot: Vec<Event> = slots
            .into_iter()
            .map(Event::SlotCreated)
            .chain(
                appointments
                    .into_iter()
                    .map(|a| Event::AppointmentCreated(Box::new(a))),
            )
            .collect();

        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact {
                snapshot,
                response: tx,
            })
            .await
            .map_err(|_| EngineError::Persistence("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::Persistence("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::Persistence(e.to_string()))?;

        metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
        info!(rows, "WAL compacted");
        Ok(())
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

    pub(super) fn record_error(&self, op: &'static str, err: &EngineError) {
        metrics::counter!(
            crate::observability::ENGINE_ERRORS_TOTAL,
            "op" => op,
            "kind" => err.kind()
        )
        .increment(1);
    }
}
