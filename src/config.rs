//! Layered configuration: built-in defaults, then `slotbook.toml` (or the file
//! named by `SLOTBOOK_CONFIG`), then `SLOTBOOK_*` environment variables.
//! Nested keys use a double underscore: `SLOTBOOK_REMINDER__LEAD_MINUTES=30`.

use std::path::{Path, PathBuf};

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

use crate::catalog::ServiceInfo;
use crate::engine::BufferReleasePolicy;
use crate::model::WorkingHours;
use crate::scheduler::Trigger;

pub const DEFAULT_CONFIG_FILE: &str = "slotbook.toml";
pub const CONFIG_PATH_ENV: &str = "SLOTBOOK_CONFIG";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderConfig {
    pub trigger: Trigger,
    /// How far ahead of the appointment the reminder goes out.
    pub lead_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionConfig {
    pub trigger: Trigger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompactionConfig {
    pub trigger: Trigger,
    /// Transactions appended since the last compaction before the next one runs.
    pub threshold: u64,
}

/// When next month's slots are generated from `working_hours`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanningConfig {
    pub trigger: Trigger,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Directory holding the WAL.
    pub data_dir: PathBuf,
    /// Prometheus listener port; no exporter when unset.
    pub metrics_port: Option<u16>,
    /// Staff handles that receive booking and reminder notices.
    pub staff: Vec<String>,
    pub reminder: ReminderConfig,
    pub completion: CompletionConfig,
    pub compaction: CompactionConfig,
    pub planning: PlanningConfig,
    pub buffer_release: BufferReleasePolicy,
    pub working_hours: WorkingHours,
    pub services: Vec<ServiceInfo>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            staff: Vec::new(),
            reminder: ReminderConfig {
                trigger: Trigger::every_secs(10),
                lead_minutes: 60,
            },
            completion: CompletionConfig {
                trigger: Trigger::every_secs(600),
            },
            compaction: CompactionConfig {
                trigger: Trigger::every_secs(60),
                threshold: 1000,
            },
            planning: PlanningConfig {
                trigger: Trigger::Daily { hour: 1, minute: 0 },
            },
            buffer_release: BufferReleasePolicy::default(),
            working_hours: WorkingHours::default(),
            services: Vec::new(),
        }
    }
}

impl Config {
    /// Load from the default locations, honouring `SLOTBOOK_CONFIG`.
    pub fn load() -> Result<Self, figment::Error> {
        let path = std::env::var_os(CONFIG_PATH_ENV).map(PathBuf::from);
        Self::load_from(path.as_deref())
    }

    /// Load with `config_path` in place of `slotbook.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let file = config_path.unwrap_or(Path::new(DEFAULT_CONFIG_FILE));
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed("SLOTBOOK_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), figment::Error> {
        let hours = &self.working_hours;
        if !hours.weekday.is_valid() || !hours.saturday.is_valid() {
            return Err(figment::Error::from(
                "working_hours: start must not exceed end, end at most 24".to_string(),
            ));
        }
        if self.reminder.lead_minutes == 0 {
            return Err(figment::Error::from(
                "reminder.lead_minutes must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }

    pub fn reminder_lead(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.reminder.lead_minutes))
    }
}
