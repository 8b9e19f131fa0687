//! Slotwise configuration system.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Result, SlotwiseError};

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotwiseConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduling: SchedulingConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub directory: DirectoryConfig,
}

impl SlotwiseConfig {
    /// Load config from the default path (~/.slotwise/config.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SlotwiseError::Config(format!("Failed to read config: {e}")))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| SlotwiseError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        tracing::debug!("⚙️ Config loaded from {}", path.display());
        Ok(config)
    }

    /// Save config to the default path.
    pub fn save(&self) -> Result<()> {
        let path = Self::default_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| SlotwiseError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(&path, content)?;
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("config.toml")
    }

    /// Get the Slotwise home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".slotwise")
    }

    /// Reject values the scheduler cannot work with.
    pub fn validate(&self) -> Result<()> {
        let s = &self.scheduling;
        if s.default_max_occurrences == 0 {
            return Err(SlotwiseError::Config(
                "scheduling.default_max_occurrences must be at least 1".into(),
            ));
        }
        if s.default_max_occurrences > s.max_series_occurrences {
            return Err(SlotwiseError::Config(format!(
                "scheduling.default_max_occurrences ({}) exceeds max_series_occurrences ({})",
                s.default_max_occurrences, s.max_series_occurrences
            )));
        }
        if s.suggestion_offsets_minutes.iter().any(|m| *m <= 0) {
            return Err(SlotwiseError::Config(
                "scheduling.suggestion_offsets_minutes must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// SQLite store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_db_path() -> String { "~/.slotwise/scheduling.db".into() }
fn default_busy_timeout_ms() -> u64 { 5000 }

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// How "monthly" recurrence advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MonthlyAdvance {
    /// Same day-of-month each month, clamped to the month's last day.
    #[default]
    Calendar,
    /// Legacy fixed 30-day step.
    #[serde(rename = "fixed_30_days")]
    Fixed30Days,
}

/// Scheduling rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingConfig {
    /// Occurrences generated when a rule has neither an end date nor a count.
    #[serde(default = "default_max_occurrences")]
    pub default_max_occurrences: u32,
    /// Hard ceiling on any single series expansion.
    #[serde(default = "default_series_ceiling")]
    pub max_series_occurrences: u32,
    #[serde(default)]
    pub monthly_advance: MonthlyAdvance,
    /// Offsets from the rejected start probed for alternatives, in minutes.
    #[serde(default = "default_suggestion_offsets")]
    pub suggestion_offsets_minutes: Vec<i64>,
    #[serde(default = "default_max_suggestions")]
    pub max_suggestions: usize,
    /// Page size when the caller does not ask for one.
    #[serde(default = "default_page_size")]
    pub default_page_size: u32,
}

fn default_max_occurrences() -> u32 { 52 }
fn default_series_ceiling() -> u32 { 366 }
fn default_suggestion_offsets() -> Vec<i64> { vec![60, 120, 180, 24 * 60, 48 * 60] }
fn default_max_suggestions() -> usize { 3 }
fn default_page_size() -> u32 { 50 }

impl Default for SchedulingConfig {
    fn default() -> Self {
        Self {
            default_max_occurrences: default_max_occurrences(),
            max_series_occurrences: default_series_ceiling(),
            monthly_advance: MonthlyAdvance::default(),
            suggestion_offsets_minutes: default_suggestion_offsets(),
            max_suggestions: default_max_suggestions(),
            default_page_size: default_page_size(),
        }
    }
}

/// Notification dispatch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Send reminders this many hours before a session starts.
    #[serde(default = "default_reminder_lead_hours")]
    pub reminder_lead_hours: u32,
    #[serde(default = "default_reminder_scan_secs")]
    pub reminder_scan_interval_secs: u64,
    /// Outbound webhook for deliveries (empty = log only).
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub webhook_headers: Vec<(String, String)>,
    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,
    /// In-memory delivery history kept for inspection.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn bool_true() -> bool { true }
fn default_reminder_lead_hours() -> u32 { 24 }
fn default_reminder_scan_secs() -> u64 { 300 }
fn default_webhook_timeout() -> u64 { 10 }
fn default_history_limit() -> usize { 100 }

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reminder_lead_hours: default_reminder_lead_hours(),
            reminder_scan_interval_secs: default_reminder_scan_secs(),
            webhook_url: String::new(),
            webhook_headers: Vec::new(),
            webhook_timeout_secs: default_webhook_timeout(),
            history_limit: default_history_limit(),
        }
    }
}

/// Where facility/people records come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryConfig {
    #[serde(default = "default_directory_path")]
    pub path: String,
}

fn default_directory_path() -> String { "~/.slotwise/directory.toml".into() }

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            path: default_directory_path(),
        }
    }
}
