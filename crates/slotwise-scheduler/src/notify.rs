//! Notification building blocks: who gets told, what they are told, and the
//! two local sinks (tracing log, in-memory history).

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use slotwise_core::error::{Result, SlotwiseError};
use slotwise_core::traits::{Directory, NotificationSink};
use slotwise_core::types::{
    NotificationCategory, NotificationRecord, PersonContact, Recipient, RecipientRole, Session,
    Timestamp,
};

/// Which people of a session a dispatch reaches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "ids")]
pub enum Audience {
    /// Active participants (with guardians) and active instructors.
    Roster,
    /// Only these students (with guardians).
    Students(Vec<String>),
    /// Only these instructors.
    Instructors(Vec<String>),
}

/// Recipients resolved for one session.
#[derive(Debug, Default)]
pub struct ResolvedAudience {
    pub recipients: Vec<Recipient>,
    /// People with no directory entry or no contact channel.
    pub unreachable: Vec<String>,
}

impl ResolvedAudience {
    fn push_person(&mut self, person: &PersonContact, role: RecipientRole) {
        let Some(channel) = person.contact.clone() else {
            self.unreachable.push(person.id.clone());
            return;
        };
        if self.recipients.iter().any(|r| r.person_id == person.id) {
            return;
        }
        self.recipients.push(Recipient {
            person_id: person.id.clone(),
            name: person.name.clone(),
            role,
            channel,
        });
    }

    /// A student and every guardian on file.
    pub fn add_student(&mut self, directory: &dyn Directory, student_id: &str) {
        match directory.student(student_id) {
            Some(student) => {
                self.push_person(&student.person, RecipientRole::Student);
                for guardian in &student.guardians {
                    self.push_person(
                        guardian,
                        RecipientRole::Guardian {
                            student_id: student_id.to_string(),
                        },
                    );
                }
            }
            None => self.unreachable.push(student_id.to_string()),
        }
    }

    pub fn add_instructor(&mut self, directory: &dyn Directory, instructor_id: &str) {
        match directory.instructor(instructor_id) {
            Some(person) => self.push_person(&person, RecipientRole::Instructor),
            None => self.unreachable.push(instructor_id.to_string()),
        }
    }
}

/// Snapshot a session into the record handed to sinks.
pub fn build_record(
    directory: &dyn Directory,
    session: &Session,
    category: NotificationCategory,
    custom_message: Option<&str>,
    actor_id: &str,
    now: Timestamp,
) -> NotificationRecord {
    let facility_name = directory
        .facility(&session.facility_id)
        .map(|f| f.name)
        .unwrap_or_else(|| session.facility_id.clone());
    NotificationRecord {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: session.id.clone(),
        category,
        subject: format!("{}: {}", category.subject(), session.title),
        session_title: session.title.clone(),
        session_date: session.local_date(),
        time_window: format!(
            "{}–{}",
            session.start_time.format("%H:%M"),
            session.end_time.format("%H:%M")
        ),
        facility_name,
        session_type_label: session.session_type.label().to_string(),
        custom_message: custom_message.map(str::to_string),
        actor_id: actor_id.to_string(),
        created_at: now,
    }
}

/// Stable string for the delivery log.
pub fn role_label(role: &RecipientRole) -> &'static str {
    match role {
        RecipientRole::Student => "student",
        RecipientRole::Guardian { .. } => "guardian",
        RecipientRole::Instructor => "instructor",
    }
}

// ─── Local sinks ───────────────────────────────────────────

/// Writes every delivery to the tracing log. Always succeeds.
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, recipient: &Recipient, record: &NotificationRecord) -> Result<()> {
        tracing::info!(
            "📢 [{}] → {} ({}): {}",
            record.category.as_str(),
            recipient.name,
            role_label(&recipient.role),
            record.body()
        );
        Ok(())
    }
}

/// One delivery kept by [`MemorySink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivered {
    pub recipient: Recipient,
    pub record: NotificationRecord,
}

/// Keeps the last `limit` deliveries in memory (ring buffer).
pub struct MemorySink {
    history: Mutex<VecDeque<Delivered>>,
    limit: usize,
    /// Person ids whose deliveries are rejected.
    failing: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn new(limit: usize) -> Self {
        Self {
            history: Mutex::new(VecDeque::new()),
            limit: limit.max(1),
            failing: Mutex::new(Vec::new()),
        }
    }

    /// Reject deliveries to `person_id` from now on.
    pub fn fail_for(&self, person_id: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.push(person_id.to_string());
        }
    }

    /// Delivered notifications, oldest first.
    pub fn history(&self) -> Vec<Delivered> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn delivered_to(&self, person_id: &str) -> Vec<NotificationRecord> {
        self.history()
            .into_iter()
            .filter(|d| d.recipient.person_id == person_id)
            .map(|d| d.record)
            .collect()
    }

    pub fn clear(&self) {
        if let Ok(mut h) = self.history.lock() {
            h.clear();
        }
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new(100)
    }
}

#[async_trait]
impl NotificationSink for MemorySink {
    fn name(&self) -> &str {
        "memory"
    }

    async fn deliver(&self, recipient: &Recipient, record: &NotificationRecord) -> Result<()> {
        let rejected = self
            .failing
            .lock()
            .map(|f| f.contains(&recipient.person_id))
            .unwrap_or(false);
        if rejected {
            return Err(SlotwiseError::Delivery(format!(
                "recipient {} rejected",
                recipient.person_id
            )));
        }

        let mut history = self
            .history
            .lock()
            .map_err(|e| SlotwiseError::Delivery(format!("history lock: {e}")))?;
        history.push_back(Delivered {
            recipient: recipient.clone(),
            record: record.clone(),
        });
        while history.len() > self.limit {
            history.pop_front();
        }
        Ok(())
    }
}
