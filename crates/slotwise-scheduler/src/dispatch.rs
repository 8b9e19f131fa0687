//! Notification dispatch: resolves recipients, routes each to the preferred
//! sink that can reach them, and records every outcome in the delivery log.
//!
//! Three phases per call: read rosters under the DB lock, deliver with the
//! lock released, then write the log and notification flags. A failed
//! delivery is logged and reported, never raised.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slotwise_core::config::NotificationConfig;
use slotwise_core::error::{Result, SlotwiseError};
use slotwise_core::traits::{Directory, NotificationSink};
use slotwise_core::types::{NotificationCategory, NotificationRecord, Recipient, RecipientRole, Timestamp};

use crate::notify::{Audience, LogSink, ResolvedAudience, build_record, role_label};
use crate::persistence::{DeliveryLogEntry, SchedulingDb};

/// One dispatch call.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub session_ids: Vec<String>,
    pub category: NotificationCategory,
    pub actor_id: String,
    pub custom_message: Option<String>,
    pub audience: Audience,
}

impl DispatchRequest {
    pub fn roster(session_ids: Vec<String>, category: NotificationCategory, actor_id: &str) -> Self {
        Self {
            session_ids,
            category,
            actor_id: actor_id.to_string(),
            custom_message: None,
            audience: Audience::Roster,
        }
    }

    pub fn with_audience(mut self, audience: Audience) -> Self {
        self.audience = audience;
        self
    }

    pub fn with_message(mut self, message: Option<String>) -> Self {
        self.custom_message = message;
        self
    }
}

/// A recipient that could not be reached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryFailure {
    pub session_id: String,
    pub recipient_id: String,
    pub error: String,
}

/// Outcome of one dispatch call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: Vec<DeliveryFailure>,
    /// People with no directory entry or contact channel.
    pub unreachable: Vec<String>,
    /// Requested sessions that no longer exist.
    pub missing_sessions: Vec<String>,
}

impl DispatchReport {
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed.len()
    }
}

struct Planned {
    record: NotificationRecord,
    recipient: Recipient,
}

struct Outcome {
    planned: Planned,
    sink: Option<String>,
    error: Option<String>,
}

/// Priority-ordered sink router.
pub struct Dispatcher {
    db: Arc<SchedulingDb>,
    directory: Arc<dyn Directory>,
    /// (priority, sink), lowest number first.
    sinks: Vec<(u8, Arc<dyn NotificationSink>)>,
    enabled: bool,
}

impl Dispatcher {
    pub fn new(db: Arc<SchedulingDb>, directory: Arc<dyn Directory>) -> Self {
        Self {
            db,
            directory,
            sinks: Vec::new(),
            enabled: true,
        }
    }

    /// Register a sink. Lower priority numbers are tried first.
    pub fn register_sink(&mut self, sink: Arc<dyn NotificationSink>, priority: u8) {
        tracing::debug!("📮 Notification sink registered: {} (priority {})", sink.name(), priority);
        self.sinks.push((priority, sink));
        self.sinks.sort_by_key(|(p, _)| *p);
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|(_, s)| s.name().to_string()).collect()
    }

    fn route(&self, recipient: &Recipient) -> Option<&Arc<dyn NotificationSink>> {
        self.sinks
            .iter()
            .map(|(_, s)| s)
            .find(|s| s.accepts(recipient))
    }

    /// Deliver `request` to its audience. Never fails the caller for delivery problems.
    pub async fn dispatch(&self, request: DispatchRequest) -> DispatchReport {
        let mut report = DispatchReport::default();
        if !self.enabled || request.session_ids.is_empty() {
            return report;
        }

        let now = chrono::Utc::now().fixed_offset();
        let plan = match self.plan(&request, now, &mut report) {
            Ok(plan) => plan,
            Err(e) => {
                tracing::warn!("⚠️ Could not resolve recipients for {}: {}", request.category.as_str(), e);
                return report;
            }
        };

        let mut outcomes = Vec::with_capacity(plan.len());
        for planned in plan {
            let outcome = match self.route(&planned.recipient) {
                Some(sink) => match sink.deliver(&planned.recipient, &planned.record).await {
                    Ok(()) => Outcome {
                        sink: Some(sink.name().to_string()),
                        error: None,
                        planned,
                    },
                    Err(e) => {
                        tracing::warn!(
                            "⚠️ Delivery to {} via {} failed: {}",
                            planned.recipient.person_id,
                            sink.name(),
                            e
                        );
                        Outcome {
                            sink: Some(sink.name().to_string()),
                            error: Some(e.to_string()),
                            planned,
                        }
                    }
                },
                None => Outcome {
                    sink: None,
                    error: Some("no sink accepts this recipient".to_string()),
                    planned,
                },
            };
            match &outcome.error {
                None => report.delivered += 1,
                Some(error) => report.failed.push(DeliveryFailure {
                    session_id: outcome.planned.record.session_id.clone(),
                    recipient_id: outcome.planned.recipient.person_id.clone(),
                    error: error.clone(),
                }),
            }
            outcomes.push(outcome);
        }

        if let Err(e) = self.record(&request, &outcomes, now) {
            tracing::warn!("⚠️ Failed to record deliveries: {}", e);
        }

        tracing::info!(
            "📨 {} dispatched: {} delivered, {} failed, {} unreachable",
            request.category.as_str(),
            report.delivered,
            report.failed.len(),
            report.unreachable.len()
        );
        report
    }

    /// Resolve sessions and recipients under one read.
    fn plan(&self, request: &DispatchRequest, now: Timestamp, report: &mut DispatchReport) -> Result<Vec<Planned>> {
        let directory = self.directory.as_ref();
        self.db.read(|repo| {
            let mut plan = Vec::new();
            for session_id in &request.session_ids {
                let Some(session) = repo.get_session(session_id)? else {
                    report.missing_sessions.push(session_id.clone());
                    continue;
                };

                let mut audience = ResolvedAudience::default();
                match &request.audience {
                    Audience::Roster => {
                        for e in repo.enrollments(session_id)?.iter().filter(|e| e.status.is_active()) {
                            audience.add_student(directory, &e.student_id);
                        }
                        for a in repo.active_assignments(session_id)? {
                            audience.add_instructor(directory, &a.instructor_id);
                        }
                    }
                    Audience::Students(ids) => {
                        for id in ids {
                            audience.add_student(directory, id);
                        }
                    }
                    Audience::Instructors(ids) => {
                        for id in ids {
                            audience.add_instructor(directory, id);
                        }
                    }
                }

                for id in audience.unreachable {
                    if !report.unreachable.contains(&id) {
                        report.unreachable.push(id);
                    }
                }
                if audience.recipients.is_empty() {
                    continue;
                }

                let record = build_record(
                    directory,
                    &session,
                    request.category,
                    request.custom_message.as_deref(),
                    &request.actor_id,
                    now,
                );
                plan.extend(audience.recipients.into_iter().map(|recipient| Planned {
                    record: record.clone(),
                    recipient,
                }));
            }
            Ok(plan)
        })
    }

    /// Append to the delivery log and stamp notification flags.
    fn record(&self, request: &DispatchRequest, outcomes: &[Outcome], now: Timestamp) -> Result<()> {
        if outcomes.is_empty() {
            return Ok(());
        }
        self.db.write(|repo| {
            let mut stamped_sessions: Vec<&str> = Vec::new();
            for o in outcomes {
                let record = &o.planned.record;
                let recipient = &o.planned.recipient;
                repo.log_delivery(&DeliveryLogEntry {
                    notification_id: record.id.clone(),
                    session_id: record.session_id.clone(),
                    category: request.category.as_str().to_string(),
                    recipient_id: recipient.person_id.clone(),
                    recipient_role: role_label(&recipient.role).to_string(),
                    sink: o.sink.clone(),
                    sent: o.error.is_none(),
                    error: o.error.clone(),
                    actor_id: request.actor_id.clone(),
                    created_at: now,
                })?;
                if o.error.is_some() {
                    continue;
                }

                if !stamped_sessions.contains(&record.session_id.as_str()) {
                    repo.mark_session_notified(&record.session_id, now)?;
                    stamped_sessions.push(&record.session_id);
                }
                match &recipient.role {
                    RecipientRole::Student => {
                        repo.mark_enrollment_notified(&record.session_id, &recipient.person_id, now)?
                    }
                    RecipientRole::Guardian { student_id } => {
                        repo.mark_enrollment_notified(&record.session_id, student_id, now)?
                    }
                    RecipientRole::Instructor => {}
                }
            }
            Ok(())
        })
    }
}

/// HTTP webhook sink: POSTs the record and recipient as JSON.
pub struct WebhookSink {
    url: String,
    headers: Vec<(String, String)>,
    client: reqwest::Client,
}

impl WebhookSink {
    pub fn new(url: &str, headers: Vec<(String, String)>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| SlotwiseError::Config(format!("Webhook client: {e}")))?;
        Ok(Self {
            url: url.to_string(),
            headers,
            client,
        })
    }
}

#[async_trait]
impl NotificationSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, recipient: &Recipient, record: &NotificationRecord) -> Result<()> {
        let mut req = self.client.post(&self.url).json(&serde_json::json!({
            "recipient": recipient,
            "notification": record,
            "text": record.body(),
        }));
        for (key, value) in &self.headers {
            req = req.header(key.as_str(), value.as_str());
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SlotwiseError::Delivery(format!("Webhook send failed: {e}")))?;
        if resp.status().is_success() {
            tracing::debug!("✅ Webhook notification sent to {}: {}", self.url, record.subject);
            Ok(())
        } else {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            Err(SlotwiseError::Delivery(format!("Webhook error {status}: {body}")))
        }
    }
}

/// Build the dispatcher sinks from config: webhook (if set) ahead of the log.
pub fn sinks_from_config(config: &NotificationConfig) -> Result<Vec<(u8, Arc<dyn NotificationSink>)>> {
    let mut sinks: Vec<(u8, Arc<dyn NotificationSink>)> = Vec::new();
    if !config.webhook_url.is_empty() {
        let webhook: Arc<dyn NotificationSink> = Arc::new(WebhookSink::new(
            &config.webhook_url,
            config.webhook_headers.clone(),
            config.webhook_timeout_secs,
        )?);
        sinks.push((10, webhook));
    }
    let log: Arc<dyn NotificationSink> = Arc::new(LogSink);
    sinks.push((100, log));
    Ok(sinks)
}
