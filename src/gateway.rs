use async_trait::async_trait;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;
use ulid::Ulid;

use crate::model::Stamp;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Recipient {
    Customer(Ulid),
    /// Staff handle as configured (chat id, address, ...).
    Staff(String),
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Customer(id) => write!(f, "customer:{id}"),
            Self::Staff(handle) => write!(f, "staff:{handle}"),
        }
    }
}

/// What to tell a recipient. Text rendering is the gateway's business.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    NewBooking {
        appointment_id: Ulid,
        customer_id: Ulid,
        service_id: Ulid,
        start_time: Stamp,
        quoted_price: u32,
    },
    Confirmed {
        appointment_id: Ulid,
        start_time: Stamp,
        final_price: u32,
    },
    Cancelled {
        appointment_id: Ulid,
        start_time: Stamp,
        reason: String,
    },
    Reminder {
        appointment_id: Ulid,
        start_time: Stamp,
        final_price: Option<u32>,
    },
    /// Thank-you and rating request after the visit.
    Completed {
        appointment_id: Ulid,
        start_time: Stamp,
        price: u32,
    },
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("recipient {0} unreachable")]
    Unreachable(Recipient),
    #[error("delivery failed: {0}")]
    Transport(String),
}

/// Outbound message channel. Implementations own retries, rendering and transport.
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn deliver(&self, to: &Recipient, notice: &Notice) -> Result<(), DeliveryError>;
}

/// Writes every notice to the log as JSON. Default for a bare deployment.
pub struct LogGateway;

#[async_trait]
impl NotificationGateway for LogGateway {
    async fn deliver(&self, to: &Recipient, notice: &Notice) -> Result<(), DeliveryError> {
        let body =
            serde_json::to_string(notice).map_err(|e| DeliveryError::Transport(e.to_string()))?;
        info!(recipient = %to, notice = %body, "notice delivered");
        Ok(())
    }
}

/// Records deliveries in memory; recipients can be switched to fail on demand.
#[derive(Default)]
pub struct MemoryGateway {
    sent: Mutex<Vec<(Recipient, Notice)>>,
    failing: DashSet<Recipient>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_for(&self, recipient: Recipient) {
        self.failing.insert(recipient);
    }

    pub fn recover(&self, recipient: &Recipient) {
        self.failing.remove(recipient);
    }

    pub async fn sent(&self) -> Vec<(Recipient, Notice)> {
        self.sent.lock().await.clone()
    }

    pub async fn sent_to(&self, recipient: &Recipient) -> Vec<Notice> {
        self.sent
            .lock()
            .await
            .iter()
            .filter(|(to, _)| to == recipient)
            .map(|(_, notice)| notice.clone())
            .collect()
    }
}

#[async_trait]
impl NotificationGateway for MemoryGateway {
    async fn deliver(&self, to: &Recipient, notice: &Notice) -> Result<(), DeliveryError> {
        if self.failing.contains(to) {
            return Err(DeliveryError::Unreachable(to.clone()));
        }
        self.sent.lock().await.push((to.clone(), notice.clone()));
        Ok(())
    }
}
