use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::gateway::{NotificationGateway, Notice, Recipient};
use crate::notify::BookingEvent;
use crate::observability::{DISPATCH_LAGGED_TOTAL, NOTICES_TOTAL};

/// Who hears about a booking event, and what they are told.
pub fn notices_for(event: &BookingEvent, staff: &[String]) -> Vec<(Recipient, Notice)> {
    let to_staff = |notice: Notice| {
        staff
            .iter()
            .map(move |handle| (Recipient::Staff(handle.clone()), notice.clone()))
            .collect::<Vec<_>>()
    };
    match event {
        BookingEvent::AppointmentCreated {
            appointment,
            start_time,
        } => to_staff(Notice::NewBooking {
            appointment_id: appointment.id,
            customer_id: appointment.customer_id,
            service_id: appointment.service_id,
            start_time: *start_time,
            quoted_price: appointment.quoted_price,
        }),
        BookingEvent::AppointmentConfirmed {
            appointment,
            start_time,
        } => vec![(
            Recipient::Customer(appointment.customer_id),
            Notice::Confirmed {
                appointment_id: appointment.id,
                start_time: *start_time,
                final_price: appointment.final_price.unwrap_or(appointment.quoted_price),
            },
        )],
        BookingEvent::AppointmentCancelled {
            appointment,
            start_time,
            notify_customer,
        } => {
            let notice = Notice::Cancelled {
                appointment_id: appointment.id,
                start_time: *start_time,
                reason: appointment.cancellation_reason.clone().unwrap_or_default(),
            };
            let mut out = Vec::with_capacity(staff.len() + 1);
            if *notify_customer {
                out.push((Recipient::Customer(appointment.customer_id), notice.clone()));
            }
            out.extend(to_staff(notice));
            out
        }
        BookingEvent::AppointmentCompleted {
            appointment,
            start_time,
        } => vec![(
            Recipient::Customer(appointment.customer_id),
            Notice::Completed {
                appointment_id: appointment.id,
                start_time: *start_time,
                price: appointment.final_price.unwrap_or(appointment.quoted_price),
            },
        )],
        BookingEvent::AppointmentRated { .. } => Vec::new(),
    }
}

pub(crate) fn notice_kind(notice: &Notice) -> &'static str {
    match notice {
        Notice::NewBooking { .. } => "new_booking",
        Notice::Confirmed { .. } => "confirmed",
        Notice::Cancelled { .. } => "cancelled",
        Notice::Reminder { .. } => "reminder",
        Notice::Completed { .. } => "completed",
    }
}

/// Deliver every notice concurrently. Returns how many failed; failures are
/// logged and counted, never retried.
pub async fn deliver_all(
    gateway: &dyn NotificationGateway,
    deliveries: &[(Recipient, Notice)],
) -> usize {
    let results = join_all(
        deliveries
            .iter()
            .map(|(to, notice)| gateway.deliver(to, notice)),
    )
    .await;

    let mut failed = 0;
    for ((to, notice), result) in deliveries.iter().zip(results) {
        let kind = notice_kind(notice);
        match result {
            Ok(()) => {
                metrics::counter!(NOTICES_TOTAL, "kind" => kind, "status" => "ok").increment(1);
            }
            Err(e) => {
                failed += 1;
                metrics::counter!(NOTICES_TOTAL, "kind" => kind, "status" => "failed").increment(1);
                error!(recipient = %to, kind, "notice delivery failed: {e}");
            }
        }
    }
    failed
}

/// Turn booking events into notices until shutdown. Delivery failures are
/// logged; the transitions behind them are already committed.
pub async fn run_dispatcher(
    mut rx: broadcast::Receiver<BookingEvent>,
    gateway: Arc<dyn NotificationGateway>,
    staff: Vec<String>,
    shutdown: CancellationToken,
) {
    info!(staff = staff.len(), "notification dispatcher started");
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = rx.recv() => match received {
                Ok(event) => event,
                Err(RecvError::Lagged(skipped)) => {
                    metrics::counter!(DISPATCH_LAGGED_TOTAL).increment(skipped);
                    warn!(skipped, "dispatcher lagged; notices dropped");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };

        let deliveries = notices_for(&event, &staff);
        if deliveries.is_empty() {
            debug!(appointment_id = %event.appointment().id, "no notices for event");
            continue;
        }
        deliver_all(gateway.as_ref(), &deliveries).await;
    }
    info!("notification dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::MemoryGateway;
    use crate::model::{Appointment, AppointmentStatus, CarInfo, Stamp};
    use crate::notify::NotifyHub;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn two_pm() -> Stamp {
        NaiveDate::from_ymd_opt(2031, 6, 3)
            .unwrap()
            .and_hms_opt(14, 0, 0)
            .unwrap()
    }

    fn appointment(status: AppointmentStatus) -> Appointment {
        Appointment {
            id: Ulid::new(),
            customer_id: Ulid::new(),
            service_id: Ulid::new(),
            time_slot_id: Ulid::new(),
            status,
            car: CarInfo::default(),
            client_comment: None,
            quoted_price: 1500,
            final_price: None,
            created_at: two_pm(),
            confirmed_at: None,
            cancellation_reason: Some("rain".into()),
            notified: false,
            rating: None,
        }
    }

    fn staff() -> Vec<String> {
        vec!["front-desk".into(), "owner".into()]
    }

    #[test]
    fn new_booking_goes_to_every_staff_member() {
        let event = BookingEvent::AppointmentCreated {
            appointment: appointment(AppointmentStatus::Pending),
            start_time: two_pm(),
        };
        let out = notices_for(&event, &staff());
        assert_eq!(out.len(), 2);
        assert!(out.iter().all(|(to, n)| matches!(to, Recipient::Staff(_))
            && matches!(n, Notice::NewBooking { quoted_price: 1500, .. })));
    }

    #[test]
    fn silent_cancellation_skips_customer() {
        let a = appointment(AppointmentStatus::Cancelled);
        let loud = BookingEvent::AppointmentCancelled {
            appointment: a.clone(),
            start_time: two_pm(),
            notify_customer: true,
        };
        let silent = BookingEvent::AppointmentCancelled {
            appointment: a.clone(),
            start_time: two_pm(),
            notify_customer: false,
        };
        let loud = notices_for(&loud, &staff());
        assert_eq!(loud.len(), 3);
        assert_eq!(loud[0].0, Recipient::Customer(a.customer_id));
        assert!(notices_for(&silent, &staff())
            .iter()
            .all(|(to, _)| matches!(to, Recipient::Staff(_))));
    }

    #[test]
    fn rating_produces_no_notice() {
        let event = BookingEvent::AppointmentRated {
            appointment: appointment(AppointmentStatus::Completed),
        };
        assert!(notices_for(&event, &staff()).is_empty());
    }

    #[tokio::test]
    async fn dispatcher_delivers_and_survives_failures() {
        let hub = NotifyHub::new();
        let gateway = Arc::new(MemoryGateway::new());
        gateway.fail_for(Recipient::Staff("owner".into()));
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_dispatcher(
            hub.subscribe(),
            gateway.clone(),
            staff(),
            shutdown.clone(),
        ));

        let mut confirmed = appointment(AppointmentStatus::Confirmed);
        confirmed.final_price = Some(1900);
        hub.send(BookingEvent::AppointmentCreated {
            appointment: appointment(AppointmentStatus::Pending),
            start_time: two_pm(),
        });
        hub.send(BookingEvent::AppointmentConfirmed {
            appointment: confirmed.clone(),
            start_time: two_pm(),
        });

        let customer = Recipient::Customer(confirmed.customer_id);
        for _ in 0..100 {
            if !gateway.sent_to(&customer).await.is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(
            gateway.sent_to(&customer).await,
            vec![Notice::Confirmed {
                appointment_id: confirmed.id,
                start_time: two_pm(),
                final_price: 1900,
            }]
        );
        assert_eq!(
            gateway
                .sent_to(&Recipient::Staff("front-desk".into()))
                .await
                .len(),
            1
        );
        assert!(gateway
            .sent_to(&Recipient::Staff("owner".into()))
            .await
            .is_empty());

        shutdown.cancel();
        task.await.unwrap();
    }
}
