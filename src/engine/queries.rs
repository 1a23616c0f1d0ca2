use std::collections::{HashMap, HashSet};

use chrono::{Duration, NaiveDate};
use tracing::warn;
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::{Engine, EngineError};

impl Engine {
    pub async fn get_slot(&self, id: Ulid) -> Option<TimeSlot> {
        let row = self.tables.slot(&id)?;
        let slot = row.lock().await.clone();
        Some(slot)
    }

    pub async fn get_appointment(&self, id: Ulid) -> Option<Appointment> {
        let row = self.tables.appointment(&id)?;
        let appointment = row.lock().await.clone();
        Some(appointment)
    }

    async fn slots_in(&self, from: Stamp, until: Stamp) -> Vec<TimeSlot> {
        let mut out = Vec::new();
        for (_, id) in self.tables.slots_between(from, until) {
            if let Some(row) = self.tables.slot(&id) {
                out.push(row.lock().await.clone());
            }
        }
        out
    }

    /// Every slot of one day, annotated with what occupies it.
    pub async fn slots_for_date(&self, date: NaiveDate) -> Vec<SlotView> {
        let from = date.and_time(chrono::NaiveTime::MIN);
        let slots = self.slots_in(from, from + Duration::days(1)).await;

        let mut views = Vec::with_capacity(slots.len());
        for slot in slots {
            let occupancy = self.occupancy(&slot).await;
            views.push(SlotView { slot, occupancy });
        }
        views
    }

    async fn occupancy(&self, slot: &TimeSlot) -> Occupancy {
        if let Some(appointment_id) = self.tables.holder(&slot.id) {
            let status = match self.tables.appointment(&appointment_id) {
                Some(row) => row.lock().await.status,
                None => AppointmentStatus::Pending,
            };
            return Occupancy::Booked {
                appointment_id,
                status,
            };
        }
        if !slot.is_available {
            let neighbour = [hour_before(slot.start_time), hour_after(slot.start_time)]
                .into_iter()
                .find_map(|h| self.tables.holder_at(h));
            return match neighbour {
                Some(appointment_id) => Occupancy::Buffer { appointment_id },
                None => Occupancy::Blocked,
            };
        }
        Occupancy::Free
    }

    /// Bookable slots with `from <= start_time < until`, in time order.
    pub async fn available_slots(
        &self,
        from: Stamp,
        until: Stamp,
    ) -> Result<Vec<TimeSlot>, EngineError> {
        if until < from {
            return Err(EngineError::InvalidInput("query window ends before it starts"));
        }
        if until - from > Duration::days(MAX_QUERY_DAYS) {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let mut slots = self.slots_in(from, until).await;
        slots.retain(|s| s.is_available);
        Ok(slots)
    }

    async fn appointments_where(&self, keep: impl Fn(&Appointment) -> bool) -> Vec<Appointment> {
        let mut out = Vec::new();
        for row in self.tables.appointment_rows() {
            let appointment = row.lock().await;
            if keep(&appointment) {
                out.push(appointment.clone());
            }
        }
        out.sort_by_key(|a| a.id);
        out
    }

    /// A customer's PENDING and CONFIRMED appointments, oldest booking first.
    pub async fn appointments_for_customer(&self, customer_id: Ulid) -> Vec<Appointment> {
        self.appointments_where(|a| a.customer_id == customer_id && a.status.is_active())
            .await
    }

    pub async fn appointments_with_status(&self, status: AppointmentStatus) -> Vec<Appointment> {
        self.appointments_where(|a| a.status == status).await
    }

    /// CONFIRMED, not yet reminded, starting within `[now, now + within]`.
    /// Soonest first.
    pub async fn list_due(&self, now: Stamp, within: Duration) -> Vec<DueAppointment> {
        let until = now + within;
        let mut due = Vec::new();
        for appointment in self
            .appointments_where(|a| a.status == AppointmentStatus::Confirmed && !a.notified)
            .await
        {
            let Some(start_time) = self.tables.slot_time(&appointment.time_slot_id) else {
                continue;
            };
            if start_time >= now && start_time <= until {
                due.push(DueAppointment {
                    appointment,
                    start_time,
                });
            }
        }
        due.sort_by_key(|d| d.start_time);
        due
    }

    /// Catalog duration of each distinct service among `appointments`.
    /// Services the catalog no longer lists are absent from the map.
    pub(super) async fn service_durations<'a>(
        &self,
        appointments: impl IntoIterator<Item = &'a Appointment>,
    ) -> HashMap<Ulid, Duration> {
        let mut durations = HashMap::new();
        let mut unknown = HashSet::new();
        for appointment in appointments {
            let service_id = appointment.service_id;
            if durations.contains_key(&service_id) || unknown.contains(&service_id) {
                continue;
            }
            match self.catalog.lookup(service_id).await {
                Some(s) => {
                    durations.insert(service_id, Duration::minutes(i64::from(s.duration_minutes)));
                }
                None => {
                    unknown.insert(service_id);
                }
            }
        }
        durations
    }

    /// CONFIRMED appointments whose service has finished: `start + duration < now`.
    pub async fn list_expired(&self, now: Stamp) -> Vec<DueAppointment> {
        let confirmed = self
            .appointments_with_status(AppointmentStatus::Confirmed)
            .await;
        let durations = self.service_durations(&confirmed).await;
        let mut expired = Vec::new();
        for appointment in confirmed {
            let Some(start_time) = self.tables.slot_time(&appointment.time_slot_id) else {
                continue;
            };
            let Some(&duration) = durations.get(&appointment.service_id) else {
                warn!(
                    appointment_id = %appointment.id,
                    service_id = %appointment.service_id,
                    "service missing from catalog; completion skipped"
                );
                continue;
            };
            if start_time + duration < now {
                expired.push(DueAppointment {
                    appointment,
                    start_time,
                });
            }
        }
        expired.sort_by_key(|d| d.start_time);
        expired
    }
}
