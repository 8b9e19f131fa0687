//! Reminder sweep: notifies rosters of sessions starting soon.
//! Uses tokio::interval, so it sleeps between scans.

use std::sync::Arc;

use chrono::Duration;
use slotwise_core::config::NotificationConfig;
use slotwise_core::error::Result;
use slotwise_core::types::{NotificationCategory, Timestamp};

use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::persistence::SchedulingDb;

/// Actor recorded for automated reminders.
pub const REMINDER_ACTOR: &str = "system:reminders";

pub struct ReminderSweep {
    db: Arc<SchedulingDb>,
    dispatcher: Arc<Dispatcher>,
    lead: Duration,
}

impl ReminderSweep {
    pub fn new(config: &NotificationConfig, db: Arc<SchedulingDb>, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            db,
            dispatcher,
            lead: Duration::hours(i64::from(config.reminder_lead_hours)),
        }
    }

    /// One scan: remind every scheduled session starting in `(now, now + lead]`
    /// that has not been reminded yet. Returns the reminded session ids.
    pub async fn run_once(&self, now: Timestamp) -> Result<Vec<String>> {
        let due: Vec<String> = self
            .db
            .read(|repo| repo.due_for_reminder(now, now + self.lead))?
            .into_iter()
            .map(|s| s.id)
            .collect();
        if due.is_empty() {
            return Ok(due);
        }

        for id in &due {
            let report = self
                .dispatcher
                .dispatch(DispatchRequest::roster(vec![id.clone()], NotificationCategory::Reminder, REMINDER_ACTOR))
                .await;
            if !report.failed.is_empty() {
                tracing::warn!("⚠️ Reminder for {}: {} delivery failure(s)", id, report.failed.len());
            }
            // At most once per session, whatever the delivery outcome.
            self.db.write(|repo| repo.mark_reminder_sent(id, now))?;
        }

        tracing::info!("⏰ Reminders sent for {} session(s)", due.len());
        Ok(due)
    }
}

/// Run the sweep forever on a fixed interval.
pub async fn spawn_reminder_loop(sweep: Arc<ReminderSweep>, check_interval_secs: u64) {
    tracing::info!("⏰ Reminder sweep started (check every {}s)", check_interval_secs);

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(check_interval_secs.max(1)));
    loop {
        interval.tick().await;
        let now = chrono::Utc::now().fixed_offset();
        if let Err(e) = sweep.run_once(now).await {
            tracing::warn!("⚠️ Reminder sweep failed: {}", e);
        }
    }
}
