use chrono::{Datelike, NaiveDate};
use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::conflict::now_local;
use super::store::SlotGuard;
use super::{Engine, EngineError};

/// Year and month following the one containing `now`.
pub fn next_month(now: Stamp) -> (i32, u32) {
    if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    }
}

impl Engine {
    /// Lock one live slot row by id.
    async fn lock_slot(&self, slot_id: Ulid) -> Result<SlotGuard, EngineError> {
        let row = self
            .tables
            .slot(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let guard = row.clone().lock_owned().await;
        if !self.tables.is_live_slot(&slot_id, &row) {
            return Err(EngineError::NotFound(slot_id));
        }
        Ok(guard)
    }

    /// Take a free slot. Check and write happen under the row lock.
    pub async fn reserve(&self, slot_id: Ulid) -> Result<TimeSlot, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut slot = self
            .lock_slot(slot_id)
            .await
            .inspect_err(|e| self.record_error("reserve", e))?;
        if !slot.is_available {
            let err = EngineError::SlotUnavailable(slot_id);
            self.record_error("reserve", &err);
            return Err(err);
        }

        let txn = [Event::SlotAvailabilityChanged {
            id: slot_id,
            is_available: false,
            at: now_local(),
        }];
        self.commit(&txn).await?;
        self.tables
            .apply_locked(&txn[0], std::slice::from_mut(&mut slot), &mut []);
        debug!(slot_id = %slot_id, start = %slot.start_time, "slot reserved");
        Ok(slot.clone())
    }

    /// Make a slot bookable again. No-op if it already is.
    pub async fn release(&self, slot_id: Ulid) -> Result<TimeSlot, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut slot = self.lock_slot(slot_id).await?;
        if slot.is_available {
            return Ok(slot.clone());
        }

        let txn = [Event::SlotAvailabilityChanged {
            id: slot_id,
            is_available: true,
            at: now_local(),
        }];
        self.commit(&txn).await?;
        self.tables
            .apply_locked(&txn[0], std::slice::from_mut(&mut slot), &mut []);
        debug!(slot_id = %slot_id, start = %slot.start_time, "slot released");
        Ok(slot.clone())
    }

    /// Block the hour before and the hour after `slot_id`, creating rows that
    /// don't exist yet. Returns both buffer slots.
    pub async fn apply_confirmation_buffer(&self, slot_id: Ulid) -> Result<Vec<TimeSlot>, EngineError> {
        let _gate = self.commit_gate.read().await;
        let start = self
            .tables
            .slot_time(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let hours = [hour_before(start), hour_after(start)];
        let mut locks = self.lock_hours_for_write(&hours).await;

        let txn = self.block_buffers(&locks, start, now_local());
        self.commit(&txn).await?;
        for event in &txn {
            self.tables.apply_locked(event, &mut locks.guards, &mut []);
        }
        Ok(self.snapshot_hours(&locks.guards, &hours).await)
    }

    /// Free the hour before and the hour after `slot_id`, skipping any that
    /// another active appointment still claims. Returns the slots freed.
    pub async fn release_confirmation_buffer(
        &self,
        slot_id: Ulid,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let _gate = self.commit_gate.read().await;
        let start = self
            .tables
            .slot_time(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let owner = self.tables.holder(&slot_id);
        let (mut guards, _) = self
            .lock_existing(&[hour_before(start), hour_after(start)])
            .await;

        let txn = self.release_unclaimed(&guards, owner, now_local());
        self.commit(&txn).await?;
        for event in &txn {
            self.tables.apply_locked(event, &mut guards, &mut []);
        }
        let freed: Vec<Ulid> = txn
            .iter()
            .filter_map(|e| match e {
                Event::SlotAvailabilityChanged { id, .. } => Some(*id),
                _ => None,
            })
            .collect();
        Ok(guards
            .iter()
            .filter(|g| freed.contains(&g.id))
            .map(|g| (**g).clone())
            .collect())
    }

    /// Current state of the rows at `hours`: locked ones from `guards`, rows
    /// created by the last commit from the tables.
    async fn snapshot_hours(&self, guards: &[SlotGuard], hours: &[Stamp]) -> Vec<TimeSlot> {
        let mut out = Vec::with_capacity(hours.len());
        for &hour in hours {
            if let Some(g) = guards.iter().find(|g| g.start_time == hour) {
                out.push((**g).clone());
            } else if let Some(row) = self.tables.slot_at(hour).and_then(|id| self.tables.slot(&id)) {
                out.push(row.lock().await.clone());
            }
        }
        out
    }

    /// Create the hourly slots of one month. Skips the day off, hours at or
    /// before `now` and hours that already have a row. Re-running is a no-op.
    pub async fn bulk_generate(
        &self,
        year: i32,
        month: u32,
        hours: &WorkingHours,
        now: Stamp,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        if !hours.weekday.is_valid() || !hours.saturday.is_valid() {
            return Err(EngineError::InvalidInput("opening hours out of range"));
        }
        let first = NaiveDate::from_ymd_opt(year, month, 1)
            .ok_or(EngineError::InvalidInput("no such month"))?;

        let _gate = self.commit_gate.read().await;
        let _calendar = self.calendar_lock.lock().await;

        let mut created = Vec::new();
        for day in first.iter_days().take_while(|d| d.month() == month) {
            let Some(range) = hours.for_day(day.weekday()) else {
                continue;
            };
            for hour in range.hours() {
                let Some(start) = day.and_hms_opt(hour, 0, 0) else {
                    continue;
                };
                if start <= now || self.tables.slot_at(start).is_some() {
                    continue;
                }
                created.push(TimeSlot::new(Ulid::new(), start, true, now));
            }
        }
        if created.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("too many slots in one month"));
        }

        let txn: Vec<Event> = created.iter().cloned().map(Event::SlotCreated).collect();
        self.commit(&txn).await?;
        for event in &txn {
            self.tables.apply_locked(event, &mut [], &mut []);
        }

        metrics::counter!(crate::observability::SLOTS_CREATED_TOTAL).increment(created.len() as u64);
        info!(year, month, created = created.len(), "month of slots generated");
        Ok(created)
    }

    /// Generate the month after the one containing `now`. The monthly
    /// planner calls this; months already filled yield nothing new.
    pub async fn schedule_next_month(
        &self,
        hours: &WorkingHours,
        now: Stamp,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        let (year, month) = next_month(now);
        self.bulk_generate(year, month, hours, now).await
    }

    /// Create a single bookable slot by hand.
    pub async fn add_slot(&self, start_time: Stamp) -> Result<TimeSlot, EngineError> {
        if !is_whole_hour(&start_time) {
            return Err(EngineError::InvalidInput("slots start on the hour"));
        }
        let _gate = self.commit_gate.read().await;
        let _calendar = self.calendar_lock.lock().await;
        if self.tables.slot_at(start_time).is_some() {
            return Err(EngineError::SlotExists(start_time));
        }

        let slot = TimeSlot::new(Ulid::new(), start_time, true, now_local());
        let txn = [Event::SlotCreated(slot.clone())];
        self.commit(&txn).await?;
        self.tables.apply_locked(&txn[0], &mut [], &mut []);

        metrics::counter!(crate::observability::SLOTS_CREATED_TOTAL).increment(1);
        info!(slot_id = %slot.id, start = %start_time, "slot added");
        Ok(slot)
    }

    /// Remove a slot nobody depends on. Slots that are reserved, act as a
    /// buffer, or appear in any appointment's history stay.
    pub async fn delete_slot(&self, slot_id: Ulid) -> Result<(), EngineError> {
        let _gate = self.commit_gate.read().await;
        let _calendar = self.calendar_lock.lock().await;
        let slot = self.lock_slot(slot_id).await?;
        if self.tables.is_referenced(&slot_id) || self.claimant(slot.start_time, None).is_some() {
            let err = EngineError::SlotInUse(slot_id);
            self.record_error("delete_slot", &err);
            return Err(err);
        }

        let txn = [Event::SlotDeleted { id: slot_id }];
        self.commit(&txn).await?;
        self.tables.apply_locked(&txn[0], &mut [], &mut []);
        info!(slot_id = %slot_id, start = %slot.start_time, "slot deleted");
        Ok(())
    }
}
