//! Shared domain types: sessions, enrollments, assignments, conflict reports,
//! notification records and the directory records the scheduler consumes.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

/// An instant with an explicit UTC offset.
pub type Timestamp = DateTime<FixedOffset>;

/// Who is calling and which program (tenant) the call is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestContext {
    pub actor_id: String,
    pub program_id: String,
}

impl RequestContext {
    pub fn new(actor_id: impl Into<String>, program_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            program_id: program_id.into(),
        }
    }
}

// ─── Session ──────────────────────────────────────────────

/// Kind of session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Private,
    Group,
    SchoolGroup,
    /// Pre-migration private lesson rows.
    LegacyPrivate,
    /// Pre-migration group class rows.
    LegacyGroup,
}

impl SessionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Private => "private",
            SessionType::Group => "group",
            SessionType::SchoolGroup => "school_group",
            SessionType::LegacyPrivate => "legacy_private",
            SessionType::LegacyGroup => "legacy_group",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "private" => Some(SessionType::Private),
            "group" => Some(SessionType::Group),
            "school_group" => Some(SessionType::SchoolGroup),
            "legacy_private" => Some(SessionType::LegacyPrivate),
            "legacy_group" => Some(SessionType::LegacyGroup),
            _ => None,
        }
    }

    /// Human-readable label used in notifications.
    pub fn label(&self) -> &'static str {
        match self {
            SessionType::Private | SessionType::LegacyPrivate => "Private Lesson",
            SessionType::Group | SessionType::LegacyGroup => "Group Lesson",
            SessionType::SchoolGroup => "School Group",
        }
    }
}

/// Session lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Scheduled,
    InProgress,
    Completed,
    Cancelled,
    Postponed,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Scheduled => "scheduled",
            SessionStatus::InProgress => "in_progress",
            SessionStatus::Completed => "completed",
            SessionStatus::Cancelled => "cancelled",
            SessionStatus::Postponed => "postponed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(SessionStatus::Scheduled),
            "in_progress" => Some(SessionStatus::InProgress),
            "completed" => Some(SessionStatus::Completed),
            "cancelled" => Some(SessionStatus::Cancelled),
            "postponed" => Some(SessionStatus::Postponed),
            _ => None,
        }
    }

    /// Active sessions occupy their facility and instructors.
    pub fn is_active(&self) -> bool {
        matches!(self, SessionStatus::Scheduled | SessionStatus::InProgress)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Cancelled)
    }

    /// Allowed edges of the session state machine.
    pub fn can_transition_to(&self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Scheduled, InProgress)
                | (Scheduled, Cancelled)
                | (Scheduled, Postponed)
                | (InProgress, Completed)
                | (InProgress, Cancelled)
                | (Postponed, Scheduled)
                | (Postponed, Cancelled)
                | (Postponed, Completed)
        )
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a session repeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecurrencePattern {
    #[default]
    None,
    Daily,
    Weekly,
    Biweekly,
    Monthly,
    Custom,
}

impl RecurrencePattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecurrencePattern::None => "none",
            RecurrencePattern::Daily => "daily",
            RecurrencePattern::Weekly => "weekly",
            RecurrencePattern::Biweekly => "biweekly",
            RecurrencePattern::Monthly => "monthly",
            RecurrencePattern::Custom => "custom",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(RecurrencePattern::None),
            "daily" => Some(RecurrencePattern::Daily),
            "weekly" => Some(RecurrencePattern::Weekly),
            "biweekly" => Some(RecurrencePattern::Biweekly),
            "monthly" => Some(RecurrencePattern::Monthly),
            "custom" => Some(RecurrencePattern::Custom),
            _ => None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, RecurrencePattern::None)
    }
}

/// Recurrence configuration stored on the root session of a series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecurrenceRule {
    /// Step between occurrences, in units of the pattern.
    #[serde(default = "default_interval")]
    pub interval: u32,
    /// Last calendar day (inclusive) an occurrence may start on.
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    /// Number of occurrences to generate after the root.
    #[serde(default)]
    pub max_occurrences: Option<u32>,
    /// Custom pattern: weekdays to repeat on.
    #[serde(default)]
    pub days_of_week: Vec<Weekday>,
    /// Custom pattern: days of the month to repeat on.
    #[serde(default)]
    pub days_of_month: Vec<u32>,
}

fn default_interval() -> u32 {
    1
}

impl Default for RecurrenceRule {
    fn default() -> Self {
        Self {
            interval: default_interval(),
            end_date: None,
            max_occurrences: None,
            days_of_week: Vec::new(),
            days_of_month: Vec::new(),
        }
    }
}

/// A scheduled occurrence at a facility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub program_id: String,
    pub facility_id: String,
    pub course_id: Option<String>,
    pub title: String,
    pub description: String,
    pub session_type: SessionType,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub status: SessionStatus,
    pub max_participants: u32,
    pub special_requirements: Option<String>,
    pub notes: Option<String>,
    pub recurrence_pattern: RecurrencePattern,
    pub recurrence_rule: Option<RecurrenceRule>,
    /// Root of the series this session was generated from (None on the root).
    pub recurring_parent_id: Option<String>,
    /// Shared by the root and every child of a series.
    pub series_id: Option<String>,
    pub is_recurring: bool,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub cancelled_at: Option<Timestamp>,
    pub notification_sent: bool,
    pub notification_sent_at: Option<Timestamp>,
    pub reminder_sent_at: Option<Timestamp>,
    pub created_by: String,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Session {
    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }

    /// Calendar day of the session start in its own offset.
    pub fn local_date(&self) -> NaiveDate {
        self.start_time.date_naive()
    }

    pub fn is_series_root(&self) -> bool {
        self.series_id.is_some() && self.recurring_parent_id.is_none()
    }
}

// ─── Enrollment ───────────────────────────────────────────

/// Participant enrollment status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrollmentStatus {
    Enrolled,
    Waitlisted,
    Confirmed,
    Cancelled,
    NoShow,
}

impl EnrollmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentStatus::Enrolled => "enrolled",
            EnrollmentStatus::Waitlisted => "waitlisted",
            EnrollmentStatus::Confirmed => "confirmed",
            EnrollmentStatus::Cancelled => "cancelled",
            EnrollmentStatus::NoShow => "no_show",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "enrolled" => Some(EnrollmentStatus::Enrolled),
            "waitlisted" => Some(EnrollmentStatus::Waitlisted),
            "confirmed" => Some(EnrollmentStatus::Confirmed),
            "cancelled" => Some(EnrollmentStatus::Cancelled),
            "no_show" => Some(EnrollmentStatus::NoShow),
            _ => None,
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, EnrollmentStatus::Cancelled)
    }

    /// Statuses that count against `max_participants`.
    pub fn occupies_seat(&self) -> bool {
        matches!(
            self,
            EnrollmentStatus::Enrolled | EnrollmentStatus::Confirmed | EnrollmentStatus::NoShow
        )
    }
}

/// A student's relationship to one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Enrollment {
    pub id: String,
    pub session_id: String,
    pub student_id: String,
    pub status: EnrollmentStatus,
    pub waitlist_position: Option<u32>,
    pub enrolled_by: String,
    pub enrolled_at: Timestamp,
    pub cancellation_reason: Option<String>,
    pub cancelled_by: Option<String>,
    pub cancelled_at: Option<Timestamp>,
    pub notification_sent: bool,
    pub notification_sent_at: Option<Timestamp>,
}

// ─── Instructor assignment ────────────────────────────────

/// An instructor's relationship to one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructorAssignment {
    pub id: String,
    pub session_id: String,
    pub instructor_id: String,
    pub is_primary: bool,
    pub assignment_notes: Option<String>,
    pub special_instructions: Option<String>,
    pub assigned_by: String,
    pub assigned_at: Timestamp,
    pub removed_at: Option<Timestamp>,
    pub removed_by: Option<String>,
    pub removal_reason: Option<String>,
}

impl InstructorAssignment {
    pub fn is_active(&self) -> bool {
        self.removed_at.is_none()
    }
}

// ─── Conflicts ────────────────────────────────────────────

/// An existing session that collides with a proposed time range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictingSession {
    pub session_id: String,
    pub title: String,
    pub facility_id: String,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

impl From<&Session> for ConflictingSession {
    fn from(s: &Session) -> Self {
        Self {
            session_id: s.id.clone(),
            title: s.title.clone(),
            facility_id: s.facility_id.clone(),
            start_time: s.start_time,
            end_time: s.end_time,
        }
    }
}

/// Sessions that double-book one instructor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructorConflict {
    pub instructor_id: String,
    pub sessions: Vec<ConflictingSession>,
}

/// A conflict-free alternative to a rejected time range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedSlot {
    pub start_time: Timestamp,
    pub end_time: Timestamp,
}

/// Result of a conflict check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub facility_conflicts: Vec<ConflictingSession>,
    pub instructor_conflicts: Vec<InstructorConflict>,
    pub suggestions: Vec<SuggestedSlot>,
}

impl ConflictReport {
    pub fn has_conflicts(&self) -> bool {
        !self.facility_conflicts.is_empty() || !self.instructor_conflicts.is_empty()
    }

    /// One-line description for logs and error messages.
    pub fn summary(&self) -> String {
        let instructor_sessions: usize = self
            .instructor_conflicts
            .iter()
            .map(|c| c.sessions.len())
            .sum();
        format!(
            "{} facility conflict(s), {} instructor conflict(s) across {} instructor(s), {} suggestion(s)",
            self.facility_conflicts.len(),
            instructor_sessions,
            self.instructor_conflicts.len(),
            self.suggestions.len()
        )
    }

    /// Fold another report's conflicts into this one (suggestions are kept).
    pub fn absorb(&mut self, other: ConflictReport) {
        for c in other.facility_conflicts {
            if !self
                .facility_conflicts
                .iter()
                .any(|f| f.session_id == c.session_id)
            {
                self.facility_conflicts.push(c);
            }
        }
        for ic in other.instructor_conflicts {
            match self
                .instructor_conflicts
                .iter_mut()
                .find(|x| x.instructor_id == ic.instructor_id)
            {
                Some(existing) => {
                    for s in ic.sessions {
                        if !existing.sessions.iter().any(|e| e.session_id == s.session_id) {
                            existing.sessions.push(s);
                        }
                    }
                }
                None => self.instructor_conflicts.push(ic),
            }
        }
    }
}

// ─── Batch results ────────────────────────────────────────

/// One id that failed inside a batch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub id: String,
    pub error: String,
}

/// Per-id results of a batch operation. Failures never roll back successes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchOutcome<T> {
    pub succeeded: Vec<T>,
    pub failed: Vec<BatchFailure>,
}

impl<T> BatchOutcome<T> {
    pub fn new() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
        }
    }

    pub fn fail(&mut self, id: impl Into<String>, error: impl std::fmt::Display) {
        self.failed.push(BatchFailure {
            id: id.into(),
            error: error.to_string(),
        });
    }

    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty() && !self.succeeded.is_empty()
    }

    pub fn all_failed(&self) -> bool {
        self.succeeded.is_empty() && !self.failed.is_empty()
    }
}

impl<T> Default for BatchOutcome<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Paged result set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub offset: u32,
    pub limit: u32,
}

// ─── Directory records ────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacilityInfo {
    pub id: String,
    pub program_id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CourseInfo {
    pub id: String,
    pub program_id: String,
    pub name: String,
}

/// How to reach a person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "address")]
pub enum ContactChannel {
    Email(String),
    Phone(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonContact {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub contact: Option<ContactChannel>,
}

/// A student plus the guardians who receive notifications on their behalf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudentContact {
    #[serde(flatten)]
    pub person: PersonContact,
    #[serde(default)]
    pub guardians: Vec<PersonContact>,
}

// ─── Notifications ────────────────────────────────────────

/// What happened to the session(s) being notified about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationCategory {
    SessionCreated,
    TimeChanged,
    SessionCancelled,
    BulkCancelled,
    ParticipantAdded,
    ParticipantRemoved,
    WaitlistPromoted,
    InstructorAssigned,
    InstructorRemoved,
    Reminder,
}

impl NotificationCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationCategory::SessionCreated => "session_created",
            NotificationCategory::TimeChanged => "time_changed",
            NotificationCategory::SessionCancelled => "session_cancelled",
            NotificationCategory::BulkCancelled => "bulk_cancelled",
            NotificationCategory::ParticipantAdded => "participant_added",
            NotificationCategory::ParticipantRemoved => "participant_removed",
            NotificationCategory::WaitlistPromoted => "waitlist_promoted",
            NotificationCategory::InstructorAssigned => "instructor_assigned",
            NotificationCategory::InstructorRemoved => "instructor_removed",
            NotificationCategory::Reminder => "reminder",
        }
    }

    /// Subject line prefix.
    pub fn subject(&self) -> &'static str {
        match self {
            NotificationCategory::SessionCreated => "New session scheduled",
            NotificationCategory::TimeChanged => "Session time changed",
            NotificationCategory::SessionCancelled => "Session cancelled",
            NotificationCategory::BulkCancelled => "Sessions cancelled",
            NotificationCategory::ParticipantAdded => "You have been added to a session",
            NotificationCategory::ParticipantRemoved => "You have been removed from a session",
            NotificationCategory::WaitlistPromoted => "A spot opened up for you",
            NotificationCategory::InstructorAssigned => "You have been assigned to a session",
            NotificationCategory::InstructorRemoved => "You have been unassigned from a session",
            NotificationCategory::Reminder => "Upcoming session reminder",
        }
    }
}

/// Why a recipient is being notified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "role")]
pub enum RecipientRole {
    Student,
    Guardian { student_id: String },
    Instructor,
}

/// One resolved notification target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub person_id: String,
    pub name: String,
    pub role: RecipientRole,
    pub channel: ContactChannel,
}

/// Snapshot of a session change, handed to a sink once per recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub id: String,
    pub session_id: String,
    pub category: NotificationCategory,
    pub subject: String,
    pub session_title: String,
    pub session_date: NaiveDate,
    /// "HH:MM–HH:MM" in the session's own offset.
    pub time_window: String,
    pub facility_name: String,
    pub session_type_label: String,
    pub custom_message: Option<String>,
    pub actor_id: String,
    pub created_at: Timestamp,
}

impl NotificationRecord {
    /// Plain-text rendering for transports without structured payloads.
    pub fn body(&self) -> String {
        let mut body = format!(
            "{}: {} ({}) on {} {} at {}",
            self.subject,
            self.session_title,
            self.session_type_label,
            self.session_date.format("%Y-%m-%d"),
            self.time_window,
            self.facility_name
        );
        if let Some(msg) = &self.custom_message {
            body.push_str("\n\n");
            body.push_str(msg);
        }
        body
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(SessionStatus::Scheduled.can_transition_to(SessionStatus::InProgress));
        assert!(SessionStatus::InProgress.can_transition_to(SessionStatus::Completed));
        assert!(SessionStatus::Postponed.can_transition_to(SessionStatus::Scheduled));
        assert!(!SessionStatus::Cancelled.can_transition_to(SessionStatus::Scheduled));
        assert!(!SessionStatus::Completed.can_transition_to(SessionStatus::Cancelled));
        assert!(!SessionStatus::Scheduled.can_transition_to(SessionStatus::Completed));
    }

    #[test]
    fn test_enum_strings_parse_back() {
        for s in [
            SessionStatus::Scheduled,
            SessionStatus::InProgress,
            SessionStatus::Completed,
            SessionStatus::Cancelled,
            SessionStatus::Postponed,
        ] {
            assert_eq!(SessionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(SessionType::parse("school_group"), Some(SessionType::SchoolGroup));
        assert_eq!(RecurrencePattern::parse("biweekly"), Some(RecurrencePattern::Biweekly));
        assert_eq!(EnrollmentStatus::parse("no_show"), Some(EnrollmentStatus::NoShow));
        assert_eq!(SessionStatus::parse("bogus"), None);
    }

    #[test]
    fn test_seat_accounting() {
        assert!(EnrollmentStatus::Enrolled.occupies_seat());
        assert!(EnrollmentStatus::NoShow.occupies_seat());
        assert!(!EnrollmentStatus::Waitlisted.occupies_seat());
        assert!(!EnrollmentStatus::Cancelled.is_active());
    }

    #[test]
    fn test_report_absorb_dedupes() {
        let t = DateTime::parse_from_rfc3339("2026-03-02T10:00:00+00:00").unwrap();
        let c = ConflictingSession {
            session_id: "s1".into(),
            title: "Swim".into(),
            facility_id: "f1".into(),
            start_time: t,
            end_time: t + Duration::hours(1),
        };
        let mut a = ConflictReport {
            facility_conflicts: vec![c.clone()],
            ..Default::default()
        };
        a.absorb(ConflictReport {
            facility_conflicts: vec![c.clone()],
            instructor_conflicts: vec![InstructorConflict {
                instructor_id: "i1".into(),
                sessions: vec![c],
            }],
            suggestions: vec![],
        });
        assert_eq!(a.facility_conflicts.len(), 1);
        assert_eq!(a.instructor_conflicts.len(), 1);
        assert!(a.has_conflicts());
        assert!(a.summary().starts_with("1 facility conflict(s)"));
    }
}
