use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use tokio::sync::{Mutex, OwnedMutexGuard};
use ulid::Ulid;

use crate::model::*;

pub type SharedSlot = Arc<Mutex<TimeSlot>>;
pub type SharedAppointment = Arc<Mutex<Appointment>>;
pub type SlotGuard = OwnedMutexGuard<TimeSlot>;
pub type AppointmentGuard = OwnedMutexGuard<Appointment>;

/// The `time_slots` and `appointments` tables plus their secondary indexes.
///
/// Rows live behind their own mutex. The indexes are plain maps kept in step
/// with committed events; a slot's start time never changes after creation.
#[derive(Default)]
pub struct Tables {
    slots: DashMap<Ulid, SharedSlot>,
    /// start_time → slot id. Start times are unique.
    calendar: DashMap<Stamp, Ulid>,
    /// slot id → start_time.
    slot_times: DashMap<Ulid, Stamp>,
    appointments: DashMap<Ulid, SharedAppointment>,
    /// slot id → the active appointment targeting it.
    holders: DashMap<Ulid, Ulid>,
    /// Slots referenced by any appointment, active or not.
    referenced: DashSet<Ulid>,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Slots ────────────────────────────────────────────────

    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    pub fn slot(&self, id: &Ulid) -> Option<SharedSlot> {
        self.slots.get(id).map(|e| e.value().clone())
    }

    pub fn slot_time(&self, id: &Ulid) -> Option<Stamp> {
        self.slot_times.get(id).map(|e| *e.value())
    }

    pub fn slot_at(&self, start: Stamp) -> Option<Ulid> {
        self.calendar.get(&start).map(|e| *e.value())
    }

    /// Whether `row` is still the live row for `id` (it may have been deleted
    /// while the caller waited for its lock).
    pub fn is_live_slot(&self, id: &Ulid, row: &SharedSlot) -> bool {
        self.slots.get(id).is_some_and(|e| Arc::ptr_eq(e.value(), row))
    }

    /// Slot ids with `from <= start_time < until`, in time order.
    pub fn slots_between(&self, from: Stamp, until: Stamp) -> Vec<(Stamp, Ulid)> {
        let mut found: Vec<(Stamp, Ulid)> = self
            .calendar
            .iter()
            .filter(|e| *e.key() >= from && *e.key() < until)
            .map(|e| (*e.key(), *e.value()))
            .collect();
        found.sort();
        found
    }

    pub fn insert_slot(&self, slot: TimeSlot) {
        self.calendar.insert(slot.start_time, slot.id);
        self.slot_times.insert(slot.id, slot.start_time);
        self.slots.insert(slot.id, Arc::new(Mutex::new(slot)));
    }

    pub fn remove_slot(&self, id: &Ulid) {
        if let Some((_, start)) = self.slot_times.remove(id) {
            self.calendar.remove_if(&start, |_, v| v == id);
        }
        self.slots.remove(id);
    }

    pub fn is_referenced(&self, slot_id: &Ulid) -> bool {
        self.referenced.contains(slot_id)
    }

    // ── Appointments ─────────────────────────────────────────

    pub fn appointment_count(&self) -> usize {
        self.appointments.len()
    }

    pub fn appointment(&self, id: &Ulid) -> Option<SharedAppointment> {
        self.appointments.get(id).map(|e| e.value().clone())
    }

    /// Snapshot of every appointment row handle. Never hold DashMap refs across
    /// an await; callers lock the returned rows one at a time.
    pub fn appointment_rows(&self) -> Vec<SharedAppointment> {
        self.appointments.iter().map(|e| e.value().clone()).collect()
    }

    pub fn slot_rows(&self) -> Vec<SharedSlot> {
        self.slots.iter().map(|e| e.value().clone()).collect()
    }

    pub fn insert_appointment(&self, appointment: Appointment) {
        self.referenced.insert(appointment.time_slot_id);
        if appointment.status.is_active() {
            self.holders.insert(appointment.time_slot_id, appointment.id);
        }
        self.appointments
            .insert(appointment.id, Arc::new(Mutex::new(appointment)));
    }

    // ── Holder index ─────────────────────────────────────────

    pub fn holder(&self, slot_id: &Ulid) -> Option<Ulid> {
        self.holders.get(slot_id).map(|e| *e.value())
    }

    /// Active appointment whose target slot starts exactly at `start`.
    pub fn holder_at(&self, start: Stamp) -> Option<Ulid> {
        self.slot_at(start).and_then(|id| self.holder(&id))
    }

    /// Drop the hold on `slot_id` if `appointment_id` owns it.
    pub fn release_hold(&self, slot_id: &Ulid, appointment_id: &Ulid) {
        self.holders.remove_if(slot_id, |_, v| v == appointment_id);
    }

    // ── Event application ────────────────────────────────────

    /// Apply a committed event while nobody else can see the rows (startup).
    pub fn replay(&self, event: &Event) {
        match event {
            Event::SlotCreated(slot) => self.insert_slot(slot.clone()),
            Event::SlotDeleted { id } => self.remove_slot(id),
            Event::AppointmentCreated(appointment) => {
                self.insert_appointment(appointment.as_ref().clone());
            }
            Event::SlotAvailabilityChanged { id, .. } => {
                if let Some(row) = self.slot(id)
                    && let Ok(mut slot) = row.try_lock()
                {
                    slot.apply(event);
                }
            }
            other => {
                let Some(id) = other.appointment_id() else { return };
                if let Some(row) = self.appointment(&id)
                    && let Ok(mut appointment) = row.try_lock()
                {
                    appointment.apply(other);
                    if appointment.status.is_terminal() {
                        self.release_hold(&appointment.time_slot_id, &appointment.id);
                    }
                }
            }
        }
    }

    /// Apply a committed event to rows the caller already holds locked.
    /// Row creation and deletion go straight to the tables.
    pub fn apply_locked(
        &self,
        event: &Event,
        slots: &mut [SlotGuard],
        appointments: &mut [AppointmentGuard],
    ) {
        match event {
            Event::SlotCreated(slot) => self.insert_slot(slot.clone()),
            Event::SlotDeleted { id } => self.remove_slot(id),
            Event::AppointmentCreated(appointment) => {
                self.insert_appointment(appointment.as_ref().clone());
            }
            Event::SlotAvailabilityChanged { .. } => {
                for slot in slots.iter_mut() {
                    slot.apply(event);
                }
            }
            other => {
                for appointment in appointments.iter_mut() {
                    appointment.apply(other);
                    if appointment.status.is_terminal() {
                        self.release_hold(&appointment.time_slot_id, &appointment.id);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32) -> Stamp {
        NaiveDate::from_ymd_opt(2031, 6, 3)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    #[test]
    fn slot_indexes_follow_insert_and_remove() {
        let tables = Tables::new();
        let slot = TimeSlot::new(Ulid::new(), at(10), true, at(8));
        tables.insert_slot(slot.clone());
        tables.insert_slot(TimeSlot::new(Ulid::new(), at(9), true, at(8)));

        assert_eq!(tables.slot_at(at(10)), Some(slot.id));
        assert_eq!(tables.slot_time(&slot.id), Some(at(10)));
        let between: Vec<Stamp> = tables
            .slots_between(at(9), at(11))
            .into_iter()
            .map(|(t, _)| t)
            .collect();
        assert_eq!(between, vec![at(9), at(10)]);

        tables.remove_slot(&slot.id);
        assert_eq!(tables.slot_at(at(10)), None);
        assert!(tables.slot(&slot.id).is_none());
        assert_eq!(tables.slot_count(), 1);
    }

    #[test]
    fn replayed_cancellation_releases_hold() {
        let tables = Tables::new();
        let slot = TimeSlot::new(Ulid::new(), at(14), false, at(8));
        tables.insert_slot(slot.clone());
        let appointment = Appointment {
            id: Ulid::new(),
            customer_id: Ulid::new(),
            service_id: Ulid::new(),
            time_slot_id: slot.id,
            status: AppointmentStatus::Pending,
            car: CarInfo::default(),
            client_comment: None,
            quoted_price: 900,
            final_price: None,
            created_at: at(8),
            confirmed_at: None,
            cancellation_reason: None,
            notified: false,
            rating: None,
        };
        tables.replay(&Event::AppointmentCreated(Box::new(appointment.clone())));
        assert_eq!(tables.holder_at(at(14)), Some(appointment.id));
        assert!(tables.is_referenced(&slot.id));

        tables.replay(&Event::AppointmentCancelled {
            id: appointment.id,
            reason: "changed plans".into(),
            at: at(9),
        });
        assert_eq!(tables.holder(&slot.id), None);
        // history keeps the slot referenced
        assert!(tables.is_referenced(&slot.id));
    }
}
