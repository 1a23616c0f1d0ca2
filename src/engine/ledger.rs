use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::notify::BookingEvent;
use crate::observability::{APPOINTMENTS_CREATED_TOTAL, APPOINTMENT_TRANSITIONS_TOTAL};

use super::conflict::{now_local, validate_new_appointment};
use super::store::AppointmentGuard;
use super::{BufferReleasePolicy, Engine, EngineError};

fn count_transition(to: AppointmentStatus) {
    let label = match to {
        AppointmentStatus::Pending => "pending",
        AppointmentStatus::Confirmed => "confirmed",
        AppointmentStatus::Cancelled => "cancelled",
        AppointmentStatus::Completed => "completed",
    };
    metrics::counter!(APPOINTMENT_TRANSITIONS_TOTAL, "to" => label).increment(1);
}

impl Engine {
    async fn lock_appointment(&self, id: Ulid) -> Result<AppointmentGuard, EngineError> {
        let row = self.tables.appointment(&id).ok_or(EngineError::NotFound(id))?;
        Ok(row.lock_owned().await)
    }

    fn start_of(&self, appointment: &Appointment) -> Result<Stamp, EngineError> {
        self.tables
            .slot_time(&appointment.time_slot_id)
            .ok_or(EngineError::NotFound(appointment.time_slot_id))
    }

    /// Book a slot. The target slot and both neighbouring hours are blocked in
    /// the same transaction that creates the PENDING appointment.
    pub async fn create_appointment(&self, req: NewAppointment) -> Result<Appointment, EngineError> {
        self.try_create(req)
            .await
            .inspect_err(|e| self.record_error("create", e))
    }

    async fn try_create(&self, req: NewAppointment) -> Result<Appointment, EngineError> {
        validate_new_appointment(&req)?;
        let service = self
            .catalog
            .lookup(req.service_id)
            .await
            .ok_or(EngineError::NotFound(req.service_id))?;

        let _gate = self.commit_gate.read().await;
        let slot_id = req.time_slot_id;
        let start = self
            .tables
            .slot_time(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;
        let now = now_local();
        if start <= now {
            return Err(EngineError::SlotUnavailable(slot_id));
        }

        let mut locks = self
            .lock_hours_for_write(&[hour_before(start), start, hour_after(start)])
            .await;
        let target = locks.get(start).ok_or(EngineError::NotFound(slot_id))?;
        if target.id != slot_id {
            return Err(EngineError::NotFound(slot_id));
        }
        if !target.is_available || self.claimant(start, None).is_some() {
            return Err(EngineError::SlotUnavailable(slot_id));
        }

        let appointment = Appointment {
            id: Ulid::new(),
            customer_id: req.customer_id,
            service_id: service.id,
            time_slot_id: slot_id,
            status: AppointmentStatus::Pending,
            car: req.car,
            client_comment: req.client_comment,
            quoted_price: service.default_price,
            final_price: None,
            created_at: now,
            confirmed_at: None,
            cancellation_reason: None,
            notified: false,
            rating: None,
        };
        let mut txn = vec![Event::SlotAvailabilityChanged {
            id: slot_id,
            is_available: false,
            at: now,
        }];
        txn.extend(self.block_buffers(&locks, start, now));
        txn.push(Event::AppointmentCreated(Box::new(appointment.clone())));

        self.commit(&txn).await?;
        for event in &txn {
            self.tables.apply_locked(event, &mut locks.guards, &mut []);
        }

        metrics::counter!(APPOINTMENTS_CREATED_TOTAL).increment(1);
        info!(
            appointment_id = %appointment.id,
            customer_id = %appointment.customer_id,
            service = %service.name,
            start = %start,
            "appointment created"
        );
        self.notify.send(BookingEvent::AppointmentCreated {
            appointment: appointment.clone(),
            start_time: start,
        });
        Ok(appointment)
    }

    /// Staff confirmation: sets the final price and re-applies the buffer.
    pub async fn confirm_appointment(
        &self,
        id: Ulid,
        final_price: u32,
    ) -> Result<Appointment, EngineError> {
        self.try_confirm(id, final_price)
            .await
            .inspect_err(|e| self.record_error("confirm", e))
    }

    async fn try_confirm(&self, id: Ulid, final_price: u32) -> Result<Appointment, EngineError> {
        if final_price > MAX_PRICE {
            return Err(EngineError::LimitExceeded("price too large"));
        }
        let _gate = self.commit_gate.read().await;
        let mut appointment = self.lock_appointment(id).await?;
        let from = appointment.status;
        if !from.can_transition_to(AppointmentStatus::Confirmed) {
            return Err(match from {
                AppointmentStatus::Confirmed => EngineError::AlreadyConfirmed(id),
                AppointmentStatus::Cancelled => EngineError::AlreadyCancelled(id),
                _ => EngineError::InvalidTransition {
                    id,
                    from,
                    to: AppointmentStatus::Confirmed,
                },
            });
        }
        let start = self.start_of(&appointment)?;
        let now = now_local();

        let mut locks = self
            .lock_hours_for_write(&[hour_before(start), hour_after(start)])
            .await;
        let mut txn = self.block_buffers(&locks, start, now);
        txn.push(Event::AppointmentConfirmed {
            id,
            final_price,
            at: now,
        });

        self.commit(&txn).await?;
        for event in &txn {
            self.tables.apply_locked(
                event,
                &mut locks.guards,
                std::slice::from_mut(&mut appointment),
            );
        }

        count_transition(AppointmentStatus::Confirmed);
        info!(appointment_id = %id, final_price, start = %start, "appointment confirmed");
        let confirmed = appointment.clone();
        self.notify.send(BookingEvent::AppointmentConfirmed {
            appointment: confirmed.clone(),
            start_time: start,
        });
        Ok(confirmed)
    }

    /// Cancel from PENDING or CONFIRMED. Cancelling twice returns the row
    /// unchanged. The target slot is freed unless a neighbour still needs it
    /// as a buffer; buffers are freed per the release policy.
    pub async fn cancel_appointment(
        &self,
        id: Ulid,
        reason: &str,
        notify_customer: bool,
    ) -> Result<Appointment, EngineError> {
        self.try_cancel(id, reason, notify_customer)
            .await
            .inspect_err(|e| self.record_error("cancel", e))
    }

    async fn try_cancel(
        &self,
        id: Ulid,
        reason: &str,
        notify_customer: bool,
    ) -> Result<Appointment, EngineError> {
        if reason.len() > MAX_REASON_LEN {
            return Err(EngineError::LimitExceeded("cancellation reason too long"));
        }
        let _gate = self.commit_gate.read().await;
        let mut appointment = self.lock_appointment(id).await?;
        match appointment.status {
            AppointmentStatus::Cancelled => {
                debug!(appointment_id = %id, "already cancelled");
                return Ok(appointment.clone());
            }
            from if !from.can_transition_to(AppointmentStatus::Cancelled) => {
                return Err(EngineError::InvalidTransition {
                    id,
                    from,
                    to: AppointmentStatus::Cancelled,
                });
            }
            _ => {}
        }
        let start = self.start_of(&appointment)?;
        let now = now_local();

        let release_buffers = appointment.confirmed_at.is_some()
            || self.buffer_policy == BufferReleasePolicy::Always;
        let hours = if release_buffers {
            vec![hour_before(start), start, hour_after(start)]
        } else {
            vec![start]
        };
        let (mut guards, _) = self.lock_existing(&hours).await;

        let mut txn = self.release_unclaimed(&guards, Some(id), now);
        txn.push(Event::AppointmentCancelled {
            id,
            reason: reason.to_owned(),
            at: now,
        });

        self.commit(&txn).await?;
        for event in &txn {
            self.tables
                .apply_locked(event, &mut guards, std::slice::from_mut(&mut appointment));
        }

        count_transition(AppointmentStatus::Cancelled);
        info!(
            appointment_id = %id,
            start = %start,
            released = txn.len() - 1,
            reason,
            "appointment cancelled"
        );
        let cancelled = appointment.clone();
        self.notify.send(BookingEvent::AppointmentCancelled {
            appointment: cancelled.clone(),
            start_time: start,
            notify_customer,
        });
        Ok(cancelled)
    }

    /// Customer feedback after the visit. Re-rating overwrites.
    pub async fn rate_appointment(&self, id: Ulid, rating: u8) -> Result<Appointment, EngineError> {
        if !(MIN_RATING..=MAX_RATING).contains(&rating) {
            return Err(EngineError::InvalidInput("rating must be between 1 and 5"));
        }
        let _gate = self.commit_gate.read().await;
        let mut appointment = self.lock_appointment(id).await?;
        if appointment.status != AppointmentStatus::Completed {
            return Err(EngineError::InvalidInput("only completed appointments can be rated"));
        }

        let txn = [Event::AppointmentRated { id, rating }];
        self.commit(&txn).await?;
        self.tables
            .apply_locked(&txn[0], &mut [], std::slice::from_mut(&mut appointment));

        info!(appointment_id = %id, rating, "appointment rated");
        self.notify.send(BookingEvent::AppointmentRated {
            appointment: appointment.clone(),
        });
        Ok(appointment.clone())
    }

    /// Lock a batch of appointment rows in id order. Unknown ids are skipped.
    async fn lock_appointments(&self, ids: &[Ulid]) -> Result<Vec<AppointmentGuard>, EngineError> {
        if ids.len() > MAX_BATCH_SIZE {
            return Err(EngineError::LimitExceeded("batch too large"));
        }
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.tables.appointment(&id) {
                guards.push(row.lock_owned().await);
            }
        }
        Ok(guards)
    }

    /// Set the reminder marker on one appointment. Returns whether it changed.
    pub async fn mark_notified(&self, id: Ulid) -> Result<bool, EngineError> {
        Ok(!self.mark_notified_all(&[id]).await?.is_empty())
    }

    /// Set the reminder marker on every CONFIRMED, not yet notified row among
    /// `ids`, in one transaction. Returns the ids that changed.
    pub async fn mark_notified_all(&self, ids: &[Ulid]) -> Result<Vec<Ulid>, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guards = self.lock_appointments(ids).await?;

        let txn: Vec<Event> = guards
            .iter()
            .filter(|a| a.status == AppointmentStatus::Confirmed && !a.notified)
            .map(|a| Event::AppointmentNotified { id: a.id })
            .collect();
        self.commit(&txn).await?;
        for event in &txn {
            self.tables.apply_locked(event, &mut [], &mut guards);
        }
        Ok(txn.iter().filter_map(Event::appointment_id).collect())
    }

    /// Promote one CONFIRMED appointment to COMPLETED once its service has
    /// finished. `None` when it is in another state or still running.
    pub async fn mark_completed(&self, id: Ulid, now: Stamp) -> Result<Option<Appointment>, EngineError> {
        Ok(self.mark_completed_all(&[id], now).await?.pop())
    }

    /// Promote every CONFIRMED row among `ids` whose service ended before
    /// `now` to COMPLETED, in one transaction. Everything else is skipped.
    pub async fn mark_completed_all(
        &self,
        ids: &[Ulid],
        now: Stamp,
    ) -> Result<Vec<Appointment>, EngineError> {
        let _gate = self.commit_gate.read().await;
        let mut guards = self.lock_appointments(ids).await?;
        let refs: Vec<&Appointment> = guards.iter().map(|g| &**g).collect();
        let durations = self.service_durations(refs).await;

        let txn: Vec<Event> = guards
            .iter()
            .filter(|a| a.status.can_transition_to(AppointmentStatus::Completed))
            .filter(|a| {
                let ends = self
                    .start_of(a)
                    .ok()
                    .zip(durations.get(&a.service_id))
                    .map(|(start, duration)| start + *duration);
                ends.is_some_and(|end| end < now)
            })
            .map(|a| Event::AppointmentCompleted { id: a.id, at: now })
            .collect();
        self.commit(&txn).await?;
        for event in &txn {
            self.tables.apply_locked(event, &mut [], &mut guards);
        }

        let completed_ids: Vec<Ulid> = txn.iter().filter_map(Event::appointment_id).collect();
        let mut completed = Vec::with_capacity(completed_ids.len());
        for guard in guards.iter().filter(|g| completed_ids.contains(&g.id)) {
            let appointment = (**guard).clone();
            let start_time = self.start_of(&appointment).unwrap_or(now);
            count_transition(AppointmentStatus::Completed);
            info!(appointment_id = %appointment.id, start = %start_time, "appointment completed");
            self.notify.send(BookingEvent::AppointmentCompleted {
                appointment: appointment.clone(),
                start_time,
            });
            completed.push(appointment);
        }
        Ok(completed)
    }
}
