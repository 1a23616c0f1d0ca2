use tokio::sync::MutexGuard;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::store::SlotGuard;
use super::{Engine, EngineError};

/// Current shop-local wall-clock time.
pub fn now_local() -> Stamp {
    chrono::Local::now().naive_local()
}

pub(crate) fn validate_new_appointment(req: &NewAppointment) -> Result<(), EngineError> {
    let car = &req.car;
    if car.brand.len() > MAX_CAR_FIELD_LEN || car.model.len() > MAX_CAR_FIELD_LEN {
        return Err(EngineError::LimitExceeded("car description too long"));
    }
    if car.year.len() > MAX_CAR_YEAR_LEN {
        return Err(EngineError::LimitExceeded("car year too long"));
    }
    if let Some(ref comment) = req.client_comment
        && comment.len() > MAX_COMMENT_LEN
    {
        return Err(EngineError::LimitExceeded("comment too long"));
    }
    Ok(())
}

/// Slot rows locked for one transaction, in start-time order.
pub(super) struct HourLocks<'a> {
    /// Held when rows may be created inside the transaction.
    pub(super) _calendar: Option<MutexGuard<'a, ()>>,
    pub(super) guards: Vec<SlotGuard>,
    /// Requested hours that have no slot row.
    pub(super) missing: Vec<Stamp>,
}

impl HourLocks<'_> {
    pub(super) fn get(&self, start: Stamp) -> Option<&TimeSlot> {
        self.guards
            .iter()
            .find(|g| g.start_time == start)
            .map(|g| &**g)
    }

    pub(super) fn is_missing(&self, start: Stamp) -> bool {
        self.missing.contains(&start)
    }
}

impl Engine {
    /// Lock the live rows at `hours` in start-time order. Hours with no row,
    /// or whose row was deleted while we waited, are reported as missing.
    pub(super) async fn lock_existing(&self, hours: &[Stamp]) -> (Vec<SlotGuard>, Vec<Stamp>) {
        let mut hours = hours.to_vec();
        hours.sort();
        hours.dedup();

        let mut guards = Vec::with_capacity(hours.len());
        let mut missing = Vec::new();
        for start in hours {
            let Some(id) = self.tables.slot_at(start) else {
                missing.push(start);
                continue;
            };
            let Some(row) = self.tables.slot(&id) else {
                missing.push(start);
                continue;
            };
            let guard = row.clone().lock_owned().await;
            if self.tables.is_live_slot(&id, &row) {
                guards.push(guard);
            } else {
                missing.push(start);
            }
        }
        (guards, missing)
    }

    /// Lock the rows at `hours` for a transaction that will create any that
    /// are missing. Takes the calendar lock first whenever a row is absent,
    /// so `missing` is stable for the life of the returned locks.
    pub(super) async fn lock_hours_for_write(&self, hours: &[Stamp]) -> HourLocks<'_> {
        let mut calendar = None;
        if hours.iter().any(|h| self.tables.slot_at(*h).is_none()) {
            calendar = Some(self.calendar_lock.lock().await);
        }
        loop {
            let (guards, missing) = self.lock_existing(hours).await;
            if missing.is_empty() || calendar.is_some() {
                return HourLocks {
                    _calendar: calendar,
                    guards,
                    missing,
                };
            }
            // a row vanished after the existence check; retry under the calendar lock
            drop(guards);
            calendar = Some(self.calendar_lock.lock().await);
        }
    }

    /// An active appointment, other than `except`, whose target is `start` or
    /// an hour next to it. Such a slot is reserved or acts as its buffer.
    pub(super) fn claimant(&self, start: Stamp, except: Option<Ulid>) -> Option<Ulid> {
        [hour_before(start), start, hour_after(start)]
            .into_iter()
            .filter_map(|h| self.tables.holder_at(h))
            .find(|a| Some(*a) != except)
    }

    /// Events making both neighbours of `start` unavailable, creating rows
    /// that do not exist yet. Requires `locks` to cover both neighbours.
    pub(super) fn block_buffers(&self, locks: &HourLocks<'_>, start: Stamp, now: Stamp) -> Vec<Event> {
        let mut txn = Vec::new();
        for hour in [hour_before(start), hour_after(start)] {
            if let Some(slot) = locks.get(hour) {
                if slot.is_available {
                    txn.push(Event::SlotAvailabilityChanged {
                        id: slot.id,
                        is_available: false,
                        at: now,
                    });
                }
            } else if locks.is_missing(hour) {
                txn.push(Event::SlotCreated(TimeSlot::new(Ulid::new(), hour, false, now)));
            }
        }
        txn
    }

    /// Events freeing every locked slot nobody else still claims.
    pub(super) fn release_unclaimed(
        &self,
        guards: &[SlotGuard],
        except: Option<Ulid>,
        now: Stamp,
    ) -> Vec<Event> {
        guards
            .iter()
            .filter(|slot| !slot.is_available)
            .filter(|slot| self.claimant(slot.start_time, except).is_none())
            .map(|slot| Event::SlotAvailabilityChanged {
                id: slot.id,
                is_available: true,
                at: now,
            })
            .collect()
    }
}
