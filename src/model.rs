use chrono::{Duration, NaiveDateTime, Timelike, Weekday};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Shop-local wall-clock time. Slots start on whole hours.
pub type Stamp = NaiveDateTime;

/// The hour immediately before `t`.
pub fn hour_before(t: Stamp) -> Stamp {
    t - Duration::hours(1)
}

/// The hour immediately after `t`.
pub fn hour_after(t: Stamp) -> Stamp {
    t + Duration::hours(1)
}

pub fn is_whole_hour(t: &Stamp) -> bool {
    t.minute() == 0 && t.second() == 0 && t.nanosecond() == 0
}

/// One bookable hour. `is_available == false` means either reserved by an
/// appointment or blocked as a buffer next to one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub id: Ulid,
    pub start_time: Stamp,
    pub is_available: bool,
    pub created_at: Stamp,
    pub updated_at: Stamp,
}

impl TimeSlot {
    pub fn new(id: Ulid, start_time: Stamp, is_available: bool, at: Stamp) -> Self {
        Self {
            id,
            start_time,
            is_available,
            created_at: at,
            updated_at: at,
        }
    }

    /// Apply a slot-level event. Events for other rows are ignored.
    pub fn apply(&mut self, event: &Event) {
        if let Event::SlotAvailabilityChanged { id, is_available, at } = event
            && *id == self.id
        {
            self.is_available = *is_available;
            self.updated_at = *at;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    /// Active appointments hold their slot.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// Edges of the lifecycle graph.
    pub fn can_transition_to(self, next: AppointmentStatus) -> bool {
        use AppointmentStatus::*;
        matches!(
            (self, next),
            (Pending, Confirmed) | (Pending, Cancelled) | (Confirmed, Completed) | (Confirmed, Cancelled)
        )
    }
}

impl std::fmt::Display for AppointmentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Confirmed => "CONFIRMED",
            Self::Cancelled => "CANCELLED",
            Self::Completed => "COMPLETED",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for AppointmentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "CONFIRMED" => Ok(Self::Confirmed),
            "CANCELLED" => Ok(Self::Cancelled),
            "COMPLETED" => Ok(Self::Completed),
            other => Err(format!("unknown appointment status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarInfo {
    pub brand: String,
    pub model: String,
    pub year: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub customer_id: Ulid,
    pub service_id: Ulid,
    pub time_slot_id: Ulid,
    pub status: AppointmentStatus,
    pub car: CarInfo,
    pub client_comment: Option<String>,
    /// Catalog default price at booking time.
    pub quoted_price: u32,
    pub final_price: Option<u32>,
    pub created_at: Stamp,
    pub confirmed_at: Option<Stamp>,
    pub cancellation_reason: Option<String>,
    /// Reminder already delivered to every recipient.
    pub notified: bool,
    pub rating: Option<u8>,
}

impl Appointment {
    /// Apply an appointment-level event. Events for other rows are ignored.
    pub fn apply(&mut self, event: &Event) {
        match event {
            Event::AppointmentConfirmed { id, final_price, at } if *id == self.id => {
                self.status = AppointmentStatus::Confirmed;
                self.final_price = Some(*final_price);
                self.confirmed_at = Some(*at);
            }
            Event::AppointmentCancelled { id, reason, .. } if *id == self.id => {
                self.status = AppointmentStatus::Cancelled;
                self.cancellation_reason = Some(reason.clone());
            }
            Event::AppointmentNotified { id } if *id == self.id => {
                self.notified = true;
            }
            Event::AppointmentCompleted { id, .. } if *id == self.id => {
                self.status = AppointmentStatus::Completed;
            }
            Event::AppointmentRated { id, rating } if *id == self.id => {
                self.rating = Some(*rating);
            }
            _ => {}
        }
    }
}

/// Input for a booking request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAppointment {
    pub customer_id: Ulid,
    pub service_id: Ulid,
    pub time_slot_id: Ulid,
    pub car: CarInfo,
    pub client_comment: Option<String>,
}

/// WAL record payload. A committed transaction is a `Vec<Event>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SlotCreated(TimeSlot),
    SlotAvailabilityChanged {
        id: Ulid,
        is_available: bool,
        at: Stamp,
    },
    SlotDeleted {
        id: Ulid,
    },
    AppointmentCreated(Box<Appointment>),
    AppointmentConfirmed {
        id: Ulid,
        final_price: u32,
        at: Stamp,
    },
    AppointmentCancelled {
        id: Ulid,
        reason: String,
        at: Stamp,
    },
    AppointmentNotified {
        id: Ulid,
    },
    AppointmentCompleted {
        id: Ulid,
        at: Stamp,
    },
    AppointmentRated {
        id: Ulid,
        rating: u8,
    },
}

impl Event {
    /// Appointment row touched by this event, if any.
    pub fn appointment_id(&self) -> Option<Ulid> {
        match self {
            Self::AppointmentCreated(a) => Some(a.id),
            Self::AppointmentConfirmed { id, .. }
            | Self::AppointmentCancelled { id, .. }
            | Self::AppointmentNotified { id }
            | Self::AppointmentCompleted { id, .. }
            | Self::AppointmentRated { id, .. } => Some(*id),
            Self::SlotCreated(_) | Self::SlotAvailabilityChanged { .. } | Self::SlotDeleted { .. } => None,
        }
    }
}

/// Inclusive-exclusive range of opening hours, e.g. `9..17`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourRange {
    pub start: u32,
    pub end: u32,
}

impl HourRange {
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end && self.end <= 24
    }

    pub fn hours(&self) -> std::ops::Range<u32> {
        self.start..self.end
    }
}

/// Opening hours used when generating a month of slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub weekday: HourRange,
    pub saturday: HourRange,
    pub day_off: Weekday,
}

impl Default for WorkingHours {
    fn default() -> Self {
        Self {
            weekday: HourRange::new(9, 17),
            saturday: HourRange::new(10, 13),
            day_off: Weekday::Sun,
        }
    }
}

impl WorkingHours {
    /// Opening hours for `day`, or `None` on the day off.
    pub fn for_day(&self, day: Weekday) -> Option<HourRange> {
        if day == self.day_off {
            None
        } else if day == Weekday::Sat {
            Some(self.saturday)
        } else {
            Some(self.weekday)
        }
    }
}

/// How a slot is occupied, as seen by the schedule view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Occupancy {
    Free,
    /// Target slot of an active appointment.
    Booked {
        appointment_id: Ulid,
        status: AppointmentStatus,
    },
    /// Blocked as the buffer of an adjacent active appointment.
    Buffer { appointment_id: Ulid },
    /// Unavailable with no active appointment nearby (manual reservation or
    /// a buffer left behind by a cancelled booking).
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotView {
    pub slot: TimeSlot,
    pub occupancy: Occupancy,
}

/// A confirmed appointment inside the reminder window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueAppointment {
    pub appointment: Appointment,
    pub start_time: Stamp,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn at(h: u32, m: u32) -> Stamp {
        NaiveDate::from_ymd_opt(2031, 6, 3)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    fn appointment() -> Appointment {
        Appointment {
            id: Ulid::new(),
            customer_id: Ulid::new(),
            service_id: Ulid::new(),
            time_slot_id: Ulid::new(),
            status: AppointmentStatus::Pending,
            car: CarInfo::default(),
            client_comment: None,
            quoted_price: 1500,
            final_price: None,
            created_at: at(9, 0),
            confirmed_at: None,
            cancellation_reason: None,
            notified: false,
            rating: None,
        }
    }

    #[test]
    fn lifecycle_edges() {
        use AppointmentStatus::*;
        assert!(Pending.can_transition_to(Confirmed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Confirmed.can_transition_to(Completed));
        assert!(Confirmed.can_transition_to(Cancelled));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Cancelled.can_transition_to(Confirmed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Confirmed.can_transition_to(Confirmed));
    }

    #[test]
    fn status_text() {
        assert_eq!(AppointmentStatus::Confirmed.to_string(), "CONFIRMED");
        assert_eq!("pending".parse::<AppointmentStatus>(), Ok(AppointmentStatus::Pending));
        assert!("DONE".parse::<AppointmentStatus>().is_err());
        assert!(AppointmentStatus::Pending.is_active());
        assert!(AppointmentStatus::Completed.is_terminal());
    }

    #[test]
    fn whole_hours() {
        assert!(is_whole_hour(&at(14, 0)));
        assert!(!is_whole_hour(&at(14, 30)));
        assert_eq!(hour_before(at(14, 0)), at(13, 0));
        assert_eq!(hour_after(at(23, 0)), at(23, 0) + Duration::hours(1));
    }

    #[test]
    fn slot_apply_ignores_other_rows() {
        let mut slot = TimeSlot::new(Ulid::new(), at(14, 0), true, at(8, 0));
        slot.apply(&Event::SlotAvailabilityChanged {
            id: Ulid::new(),
            is_available: false,
            at: at(9, 0),
        });
        assert!(slot.is_available);

        slot.apply(&Event::SlotAvailabilityChanged {
            id: slot.id,
            is_available: false,
            at: at(9, 0),
        });
        assert!(!slot.is_available);
        assert_eq!(slot.updated_at, at(9, 0));
        assert_eq!(slot.created_at, at(8, 0));
    }

    #[test]
    fn appointment_apply_confirm_then_cancel() {
        let mut a = appointment();
        a.apply(&Event::AppointmentConfirmed {
            id: a.id,
            final_price: 2000,
            at: at(10, 0),
        });
        assert_eq!(a.status, AppointmentStatus::Confirmed);
        assert_eq!(a.final_price, Some(2000));
        assert_eq!(a.confirmed_at, Some(at(10, 0)));

        a.apply(&Event::AppointmentCancelled {
            id: a.id,
            reason: "customer request".into(),
            at: at(11, 0),
        });
        assert_eq!(a.status, AppointmentStatus::Cancelled);
        assert_eq!(a.cancellation_reason.as_deref(), Some("customer request"));
        // confirmed_at survives cancellation; buffer release keys off it
        assert!(a.confirmed_at.is_some());
    }
}
