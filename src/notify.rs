use serde::Serialize;
use tokio::sync::broadcast;

use crate::model::{Appointment, Stamp};

const CHANNEL_CAPACITY: usize = 256;

/// Structured facts the engine publishes after a transition commits.
/// Rendering and delivery happen downstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum BookingEvent {
    AppointmentCreated {
        appointment: Appointment,
        start_time: Stamp,
    },
    AppointmentConfirmed {
        appointment: Appointment,
        start_time: Stamp,
    },
    AppointmentCancelled {
        appointment: Appointment,
        start_time: Stamp,
        notify_customer: bool,
    },
    AppointmentCompleted {
        appointment: Appointment,
        start_time: Stamp,
    },
    AppointmentRated {
        appointment: Appointment,
    },
}

impl BookingEvent {
    pub fn appointment(&self) -> &Appointment {
        match self {
            Self::AppointmentCreated { appointment, .. }
            | Self::AppointmentConfirmed { appointment, .. }
            | Self::AppointmentCancelled { appointment, .. }
            | Self::AppointmentCompleted { appointment, .. }
            | Self::AppointmentRated { appointment } => appointment,
        }
    }
}

/// Broadcast hub for booking events (dispatcher, admin views).
pub struct NotifyHub {
    sender: broadcast::Sender<BookingEvent>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BookingEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. No-op if nobody is listening.
    pub fn send(&self, event: BookingEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppointmentStatus, CarInfo};
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn rated() -> BookingEvent {
        let at = NaiveDate::from_ymd_opt(2031, 6, 3)
            .unwrap()
            .and_hms_opt(14, 0, 0)
            .unwrap();
        BookingEvent::AppointmentRated {
            appointment: Appointment {
                id: Ulid::new(),
                customer_id: Ulid::new(),
                service_id: Ulid::new(),
                time_slot_id: Ulid::new(),
                status: AppointmentStatus::Completed,
                car: CarInfo::default(),
                client_comment: None,
                quoted_price: 1000,
                final_price: Some(1200),
                created_at: at,
                confirmed_at: Some(at),
                cancellation_reason: None,
                notified: true,
                rating: Some(5),
            },
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let mut rx = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 1);

        let event = rated();
        hub.send(event.clone());

        let received = rx.recv().await.unwrap();
        assert_eq!(received, event);
        assert_eq!(received.appointment().rating, Some(5));
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        hub.send(rated());
        assert_eq!(hub.subscriber_count(), 0);
    }
}
