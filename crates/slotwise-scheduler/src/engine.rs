//! Session lifecycle manager: the entry point for every scheduling change.
//!
//! Each mutation validates, checks conflicts and writes inside one
//! `IMMEDIATE` transaction, then dispatches notifications after commit.
//! Batch operations commit each id on its own, so one bad id never undoes
//! the others.

use std::sync::Arc;

use chrono::{Duration, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use slotwise_core::config::SlotwiseConfig;
use slotwise_core::error::{Result, SlotwiseError};
use slotwise_core::traits::Directory;
use slotwise_core::types::{
    BatchOutcome, ConflictReport, ConflictingSession, Enrollment, EnrollmentStatus, FacilityInfo,
    InstructorAssignment, InstructorConflict, NotificationCategory, Page, RecurrencePattern,
    RecurrenceRule, RequestContext, Session, SessionStatus, SessionType, SuggestedSlot, Timestamp,
};

use crate::capacity::{self, AddOutcome, RemoveOutcome};
use crate::conflict::ConflictDetector;
use crate::dispatch::{DispatchRequest, Dispatcher};
use crate::interval::TimeRange;
use crate::notify::Audience;
use crate::persistence::{PageRequest, SchedulingDb, SessionFilter, SessionRepo};
use crate::recurrence::RecurrenceExpander;

/// Input for `create_session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewSession {
    pub facility_id: String,
    #[serde(default)]
    pub course_id: Option<String>,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub session_type: SessionType,
    pub start_time: Timestamp,
    pub end_time: Timestamp,
    pub max_participants: u32,
    #[serde(default)]
    pub special_requirements: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub recurrence_pattern: RecurrencePattern,
    #[serde(default)]
    pub recurrence_rule: Option<RecurrenceRule>,
    /// First id becomes the primary instructor.
    #[serde(default)]
    pub instructor_ids: Vec<String>,
    #[serde(default)]
    pub student_ids: Vec<String>,
}

impl NewSession {
    pub fn new(
        facility_id: &str,
        title: &str,
        session_type: SessionType,
        start_time: Timestamp,
        end_time: Timestamp,
        max_participants: u32,
    ) -> Self {
        Self {
            facility_id: facility_id.to_string(),
            course_id: None,
            title: title.to_string(),
            description: String::new(),
            session_type,
            start_time,
            end_time,
            max_participants,
            special_requirements: None,
            notes: None,
            recurrence_pattern: RecurrencePattern::None,
            recurrence_rule: None,
            instructor_ids: Vec::new(),
            student_ids: Vec::new(),
        }
    }

    pub fn recurring(mut self, pattern: RecurrencePattern, rule: RecurrenceRule) -> Self {
        self.recurrence_pattern = pattern;
        self.recurrence_rule = Some(rule);
        self
    }

    pub fn with_instructors(mut self, ids: &[&str]) -> Self {
        self.instructor_ids = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_students(mut self, ids: &[&str]) -> Self {
        self.student_ids = ids.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// What `create_session` wrote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreatedSessions {
    /// Root first, then occurrences in start order.
    pub sessions: Vec<Session>,
    pub assignments: Vec<InstructorAssignment>,
    pub enrollments: Vec<Enrollment>,
}

impl CreatedSessions {
    pub fn root(&self) -> Option<&Session> {
        self.sessions.first()
    }
}

/// Scheduling facade. `Send + Sync`; share it behind an `Arc`.
pub struct SessionManager {
    db: Arc<SchedulingDb>,
    directory: Arc<dyn Directory>,
    dispatcher: Arc<Dispatcher>,
    detector: ConflictDetector,
    expander: RecurrenceExpander,
    default_page_size: u32,
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(id) {
            out.push(id.clone());
        }
    }
    out
}

/// Attach suggestions to a failed check and wrap it as an error.
fn conflict(
    mut report: ConflictReport,
    suggestions_for: impl FnOnce() -> Result<Vec<SuggestedSlot>>,
) -> Result<SlotwiseError> {
    report.suggestions = suggestions_for()?;
    Ok(SlotwiseError::Conflict(Box::new(report)))
}

impl SessionManager {
    pub fn new(
        config: &SlotwiseConfig,
        db: Arc<SchedulingDb>,
        directory: Arc<dyn Directory>,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            db,
            directory,
            dispatcher,
            detector: ConflictDetector::new(&config.scheduling),
            expander: RecurrenceExpander::new(&config.scheduling),
            default_page_size: config.scheduling.default_page_size.max(1),
        }
    }

    pub fn db(&self) -> &Arc<SchedulingDb> {
        &self.db
    }

    fn now(&self) -> Timestamp {
        Utc::now().fixed_offset()
    }

    // ─── Scope checks ──────────────────────────────────────

    fn scoped_facility(&self, ctx: &RequestContext, facility_id: &str) -> Result<FacilityInfo> {
        let facility = self
            .directory
            .facility(facility_id)
            .ok_or_else(|| SlotwiseError::not_found("facility", facility_id))?;
        if facility.program_id != ctx.program_id {
            return Err(SlotwiseError::AccessDenied(format!(
                "facility {} is not in program {}",
                facility_id, ctx.program_id
            )));
        }
        Ok(facility)
    }

    fn scoped_session(repo: &SessionRepo<'_>, ctx: &RequestContext, session_id: &str) -> Result<Session> {
        let session = repo
            .get_session(session_id)?
            .ok_or_else(|| SlotwiseError::not_found("session", session_id))?;
        if session.program_id != ctx.program_id {
            return Err(SlotwiseError::AccessDenied(format!(
                "session {} is not in program {}",
                session_id, ctx.program_id
            )));
        }
        Ok(session)
    }

    fn ensure_open(session: &Session) -> Result<()> {
        if session.status.is_terminal() {
            return Err(SlotwiseError::StateConflict(format!(
                "session {} is {}",
                session.id, session.status
            )));
        }
        Ok(())
    }

    fn validate_new(&self, ctx: &RequestContext, new: &NewSession) -> Result<TimeRange> {
        if new.title.trim().is_empty() {
            return Err(SlotwiseError::validation("title must not be empty"));
        }
        if new.facility_id.trim().is_empty() {
            return Err(SlotwiseError::validation("facility_id must not be empty"));
        }
        if new.max_participants == 0 {
            return Err(SlotwiseError::validation("max_participants must be at least 1"));
        }
        let range = TimeRange::new(new.start_time, new.end_time)?;
        self.scoped_facility(ctx, &new.facility_id)?;

        if let Some(course_id) = &new.course_id {
            let course = self
                .directory
                .course(course_id)
                .ok_or_else(|| SlotwiseError::not_found("course", course_id.as_str()))?;
            if course.program_id != ctx.program_id {
                return Err(SlotwiseError::AccessDenied(format!(
                    "course {} is not in program {}",
                    course_id, ctx.program_id
                )));
            }
        }
        for id in &new.instructor_ids {
            if self.directory.instructor(id).is_none() {
                return Err(SlotwiseError::validation(format!("unknown instructor {id}")));
            }
        }
        for id in &new.student_ids {
            if self.directory.student(id).is_none() {
                return Err(SlotwiseError::validation(format!("unknown student {id}")));
            }
        }
        Ok(range)
    }

    async fn notify(&self, request: DispatchRequest) {
        let category = request.category;
        let report = self.dispatcher.dispatch(request).await;
        tracing::debug!(
            "📨 {} notifications: {} delivered, {} failed, {} unreachable",
            category.as_str(),
            report.delivered,
            report.failed.len(),
            report.unreachable.len()
        );
    }

    // ─── Create ────────────────────────────────────────────

    /// Create a session, and its occurrences when it recurs.
    pub async fn create_session(&self, ctx: &RequestContext, new: NewSession) -> Result<CreatedSessions> {
        let root_range = self.validate_new(ctx, &new)?;
        let rule = new
            .recurrence_pattern
            .is_recurring()
            .then(|| new.recurrence_rule.clone().unwrap_or_default());
        let occurrences = match &rule {
            Some(rule) => self.expander.expand(&root_range, new.recurrence_pattern, rule)?,
            None => Vec::new(),
        };
        let instructors = dedup(&new.instructor_ids);
        let students = dedup(&new.student_ids);
        let now = self.now();

        let created = self.db.write(|repo| {
            let mut report = ConflictReport::default();
            for range in std::iter::once(&root_range).chain(occurrences.iter()) {
                report.absorb(self.detector.collisions(
                    repo,
                    &ctx.program_id,
                    &new.facility_id,
                    range,
                    &instructors,
                    &[],
                )?);
            }
            if report.has_conflicts() {
                return Err(conflict(report, || {
                    self.detector
                        .suggest(repo, &ctx.program_id, &new.facility_id, &root_range, &instructors, &[])
                })?);
            }

            let root_id = uuid::Uuid::new_v4().to_string();
            let series_id = rule.as_ref().map(|_| uuid::Uuid::new_v4().to_string());
            let mut created = CreatedSessions {
                sessions: Vec::with_capacity(occurrences.len() + 1),
                assignments: Vec::new(),
                enrollments: Vec::new(),
            };

            let ranges = std::iter::once(&root_range).chain(occurrences.iter());
            for (i, range) in ranges.enumerate() {
                let is_root = i == 0;
                let session = Session {
                    id: if is_root { root_id.clone() } else { uuid::Uuid::new_v4().to_string() },
                    program_id: ctx.program_id.clone(),
                    facility_id: new.facility_id.clone(),
                    course_id: new.course_id.clone(),
                    title: new.title.trim().to_string(),
                    description: new.description.clone(),
                    session_type: new.session_type,
                    start_time: range.start(),
                    end_time: range.end(),
                    status: SessionStatus::Scheduled,
                    max_participants: new.max_participants,
                    special_requirements: new.special_requirements.clone(),
                    notes: new.notes.clone(),
                    recurrence_pattern: new.recurrence_pattern,
                    recurrence_rule: if is_root { rule.clone() } else { None },
                    recurring_parent_id: (!is_root).then(|| root_id.clone()),
                    series_id: series_id.clone(),
                    is_recurring: series_id.is_some(),
                    cancellation_reason: None,
                    cancelled_by: None,
                    cancelled_at: None,
                    notification_sent: false,
                    notification_sent_at: None,
                    reminder_sent_at: None,
                    created_by: ctx.actor_id.clone(),
                    created_at: now,
                    updated_at: now,
                };
                repo.insert_session(&session)?;

                for (n, instructor_id) in instructors.iter().enumerate() {
                    let assignment = InstructorAssignment {
                        id: uuid::Uuid::new_v4().to_string(),
                        session_id: session.id.clone(),
                        instructor_id: instructor_id.clone(),
                        is_primary: n == 0,
                        assignment_notes: None,
                        special_instructions: None,
                        assigned_by: ctx.actor_id.clone(),
                        assigned_at: now,
                        removed_at: None,
                        removed_by: None,
                        removal_reason: None,
                    };
                    repo.insert_assignment(&assignment)?;
                    created.assignments.push(assignment);
                }
                for student_id in &students {
                    let outcome = capacity::add_participant(repo, &session, student_id, &ctx.actor_id, now)?;
                    created.enrollments.push(outcome.enrollment().clone());
                }
                created.sessions.push(session);
            }
            Ok(created)
        })?;

        tracing::info!(
            "📅 Session '{}' created at {} ({} occurrence(s))",
            new.title,
            new.facility_id,
            created.sessions.len()
        );
        let ids = created.sessions.iter().map(|s| s.id.clone()).collect();
        self.notify(DispatchRequest::roster(ids, NotificationCategory::SessionCreated, &ctx.actor_id))
            .await;
        Ok(created)
    }

    // ─── Reschedule ────────────────────────────────────────

    /// Move a session, or its whole series by the same delta.
    pub async fn change_time(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        new_start: Timestamp,
        new_end: Timestamp,
        apply_to_series: bool,
    ) -> Result<Vec<Session>> {
        let target_range = TimeRange::new(new_start, new_end)?;
        let now = self.now();

        let moved = self.db.write(|repo| {
            let target = Self::scoped_session(repo, ctx, session_id)?;
            Self::ensure_open(&target)?;
            let delta = new_start - target.start_time;

            let members: Vec<Session> = match (&target.series_id, apply_to_series) {
                (Some(series_id), true) => repo
                    .series_members(series_id)?
                    .into_iter()
                    .filter(|s| !s.status.is_terminal())
                    .collect(),
                _ => vec![target.clone()],
            };
            let exclude: Vec<String> = members.iter().map(|s| s.id.clone()).collect();

            let mut plan: Vec<(Session, TimeRange)> = Vec::with_capacity(members.len());
            for member in members {
                let range = if member.id == target.id {
                    target_range
                } else {
                    TimeRange::new(member.start_time, member.end_time)?.shifted(delta)?
                };
                plan.push((member, range));
            }

            let mut report = ConflictReport::default();
            for (member, range) in &plan {
                let instructors: Vec<String> = repo
                    .active_assignments(&member.id)?
                    .into_iter()
                    .map(|a| a.instructor_id)
                    .collect();
                // Postponed members do not hold their slot until rescheduled.
                if member.status.is_active() {
                    report.absorb(self.detector.collisions(
                        repo,
                        &ctx.program_id,
                        &member.facility_id,
                        range,
                        &instructors,
                        &exclude,
                    )?);
                }
            }
            // A stretched target may run into the next member of its own series.
            for (member, range) in &plan {
                if member.id != target.id && member.status.is_active() && range.overlaps(&target_range) {
                    let mut clash = ConflictingSession::from(member);
                    clash.start_time = range.start();
                    clash.end_time = range.end();
                    report.facility_conflicts.push(clash);
                }
            }
            if report.has_conflicts() {
                let instructors: Vec<String> = repo
                    .active_assignments(&target.id)?
                    .into_iter()
                    .map(|a| a.instructor_id)
                    .collect();
                return Err(conflict(report, || {
                    self.detector.suggest(
                        repo,
                        &ctx.program_id,
                        &target.facility_id,
                        &target_range,
                        &instructors,
                        &exclude,
                    )
                })?);
            }

            let mut moved = Vec::with_capacity(plan.len());
            for (mut member, range) in plan {
                repo.update_session_times(&member.id, range.start(), range.end(), now)?;
                member.start_time = range.start();
                member.end_time = range.end();
                member.reminder_sent_at = None;
                member.updated_at = now;
                moved.push(member);
            }
            Ok(moved)
        })?;

        tracing::info!("🕑 Session {} rescheduled ({} session(s) moved)", session_id, moved.len());
        let ids = moved.iter().map(|s| s.id.clone()).collect();
        self.notify(DispatchRequest::roster(ids, NotificationCategory::TimeChanged, &ctx.actor_id))
            .await;
        Ok(moved)
    }

    // ─── Cancel ────────────────────────────────────────────

    /// Cancel a session, or every open session of its series.
    pub async fn cancel_session(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        reason: &str,
        cancel_all_in_series: bool,
    ) -> Result<Vec<Session>> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(SlotwiseError::validation("cancellation reason must not be empty"));
        }
        let now = self.now();

        let cancelled = self.db.write(|repo| {
            let target = Self::scoped_session(repo, ctx, session_id)?;
            Self::ensure_open(&target)?;

            let members: Vec<Session> = match (&target.series_id, cancel_all_in_series) {
                (Some(series_id), true) => repo
                    .series_members(series_id)?
                    .into_iter()
                    .filter(|s| !s.status.is_terminal())
                    .collect(),
                _ => vec![target],
            };
            let mut cancelled = Vec::with_capacity(members.len());
            for mut s in members {
                repo.cancel_session(&s.id, reason, &ctx.actor_id, now)?;
                s.status = SessionStatus::Cancelled;
                s.cancellation_reason = Some(reason.to_string());
                s.cancelled_by = Some(ctx.actor_id.clone());
                s.cancelled_at = Some(now);
                s.updated_at = now;
                cancelled.push(s);
            }
            Ok(cancelled)
        })?;

        tracing::info!("🚫 Session {} cancelled ({} session(s))", session_id, cancelled.len());
        let ids = cancelled.iter().map(|s| s.id.clone()).collect();
        self.notify(
            DispatchRequest::roster(ids, NotificationCategory::SessionCancelled, &ctx.actor_id)
                .with_message(Some(reason.to_string())),
        )
        .await;
        Ok(cancelled)
    }

    /// Cancel every active session at a facility on one local calendar day.
    pub async fn cancel_facility_day(
        &self,
        ctx: &RequestContext,
        facility_id: &str,
        date: NaiveDate,
        reason: &str,
    ) -> Result<BatchOutcome<String>> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(SlotwiseError::validation("cancellation reason must not be empty"));
        }
        self.scoped_facility(ctx, facility_id)?;

        // Offsets span UTC-12..UTC+14, so widen the UTC window by a day each way.
        let midnight = date.and_time(NaiveTime::MIN).and_utc().fixed_offset();
        let (Some(from), Some(until)) = (
            midnight.checked_sub_signed(Duration::days(1)),
            midnight.checked_add_signed(Duration::days(2)),
        ) else {
            return Err(SlotwiseError::validation(format!("date {date} is outside the supported range")));
        };
        let candidates: Vec<String> = self.db.read(|repo| {
            Ok(repo
                .facility_sessions_starting_between(facility_id, from, until)?
                .into_iter()
                .filter(|s| s.program_id == ctx.program_id && s.local_date() == date && s.status.is_active())
                .map(|s| s.id)
                .collect())
        })?;

        let mut outcome = BatchOutcome::new();
        for id in candidates {
            let now = self.now();
            let result = self.db.write(|repo| {
                let s = Self::scoped_session(repo, ctx, &id)?;
                if !s.status.is_active() {
                    return Err(SlotwiseError::StateConflict(format!("session {} is {}", s.id, s.status)));
                }
                repo.cancel_session(&s.id, reason, &ctx.actor_id, now)
            });
            match result {
                Ok(()) => outcome.succeeded.push(id),
                Err(e) => {
                    tracing::warn!("⚠️ Could not cancel {}: {}", id, e);
                    outcome.fail(id, e);
                }
            }
        }

        tracing::info!(
            "🚫 Facility {} closed on {}: {} cancelled, {} failed",
            facility_id,
            date,
            outcome.succeeded.len(),
            outcome.failed.len()
        );
        if !outcome.succeeded.is_empty() {
            self.notify(
                DispatchRequest::roster(outcome.succeeded.clone(), NotificationCategory::BulkCancelled, &ctx.actor_id)
                    .with_message(Some(reason.to_string())),
            )
            .await;
        }
        Ok(outcome)
    }

    /// Move a session along its state machine.
    pub async fn update_status(&self, ctx: &RequestContext, session_id: &str, status: SessionStatus) -> Result<Session> {
        if status == SessionStatus::Cancelled {
            return Err(SlotwiseError::validation("use cancel_session to cancel a session"));
        }
        let now = self.now();
        let updated = self.db.write(|repo| {
            let mut session = Self::scoped_session(repo, ctx, session_id)?;
            if !session.status.can_transition_to(status) {
                return Err(SlotwiseError::StateConflict(format!(
                    "session {} cannot go from {} to {}",
                    session.id, session.status, status
                )));
            }
            // Back from postponed: the slot must still be free.
            if status.is_active() && !session.status.is_active() {
                let range = TimeRange::new(session.start_time, session.end_time)?;
                let instructors: Vec<String> = repo
                    .active_assignments(&session.id)?
                    .into_iter()
                    .map(|a| a.instructor_id)
                    .collect();
                let exclude = vec![session.id.clone()];
                let report = self.detector.check(
                    repo,
                    &ctx.program_id,
                    &session.facility_id,
                    &range,
                    &instructors,
                    &exclude,
                )?;
                if report.has_conflicts() {
                    return Err(SlotwiseError::Conflict(Box::new(report)));
                }
            }
            repo.update_session_status(&session.id, status, now)?;
            session.status = status;
            session.updated_at = now;
            Ok(session)
        })?;
        tracing::info!("🔄 Session {} is now {}", updated.id, updated.status);
        Ok(updated)
    }

    /// Change capacity; growth promotes from the waitlist.
    pub async fn set_capacity(&self, ctx: &RequestContext, session_id: &str, max_participants: u32) -> Result<Vec<String>> {
        if max_participants == 0 {
            return Err(SlotwiseError::validation("max_participants must be at least 1"));
        }
        let now = self.now();
        let promoted = self.db.write(|repo| {
            let mut session = Self::scoped_session(repo, ctx, session_id)?;
            Self::ensure_open(&session)?;
            let occupied = repo.count_occupied(&session.id)?;
            if max_participants < occupied {
                return Err(SlotwiseError::validation(format!(
                    "capacity {max_participants} is below the {occupied} seated participant(s)"
                )));
            }
            repo.set_max_participants(&session.id, max_participants, now)?;
            session.max_participants = max_participants;
            capacity::promote_waitlisted(repo, &session)
        })?;

        if !promoted.is_empty() {
            self.notify(
                DispatchRequest::roster(vec![session_id.to_string()], NotificationCategory::WaitlistPromoted, &ctx.actor_id)
                    .with_audience(Audience::Students(promoted.clone())),
            )
            .await;
        }
        Ok(promoted)
    }

    // ─── Participants ──────────────────────────────────────

    pub async fn add_participants(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        student_ids: &[String],
    ) -> Result<BatchOutcome<AddOutcome>> {
        let session = self.db.read(|repo| Self::scoped_session(repo, ctx, session_id))?;
        Self::ensure_open(&session)?;

        let mut outcome = BatchOutcome::new();
        let mut added = Vec::new();
        for student_id in dedup(student_ids) {
            if self.directory.student(&student_id).is_none() {
                outcome.fail(&student_id, SlotwiseError::not_found("student", student_id.as_str()));
                continue;
            }
            let now = self.now();
            let result = self.db.write(|repo| {
                let session = Self::scoped_session(repo, ctx, session_id)?;
                Self::ensure_open(&session)?;
                capacity::add_participant(repo, &session, &student_id, &ctx.actor_id, now)
            });
            match result {
                Ok(add) => {
                    if add.is_new() {
                        added.push(student_id);
                    }
                    outcome.succeeded.push(add);
                }
                Err(e) => {
                    tracing::warn!("⚠️ Could not add {} to {}: {}", student_id, session_id, e);
                    outcome.fail(student_id, e);
                }
            }
        }

        if !added.is_empty() {
            tracing::info!("👥 {} participant(s) added to {}", added.len(), session_id);
            self.notify(
                DispatchRequest::roster(vec![session_id.to_string()], NotificationCategory::ParticipantAdded, &ctx.actor_id)
                    .with_audience(Audience::Students(added)),
            )
            .await;
        }
        Ok(outcome)
    }

    pub async fn remove_participants(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        student_ids: &[String],
        reason: Option<&str>,
    ) -> Result<BatchOutcome<RemoveOutcome>> {
        self.db.read(|repo| Self::scoped_session(repo, ctx, session_id))?;

        let mut outcome = BatchOutcome::new();
        let mut removed = Vec::new();
        let mut promoted = Vec::new();
        for student_id in dedup(student_ids) {
            let now = self.now();
            let result = self.db.write(|repo| {
                let session = Self::scoped_session(repo, ctx, session_id)?;
                capacity::remove_participant(repo, &session, &student_id, reason, &ctx.actor_id, now)
            });
            match result {
                Ok(out) => {
                    removed.push(student_id);
                    promoted.extend(out.promoted.iter().cloned());
                    outcome.succeeded.push(out);
                }
                Err(e) => {
                    tracing::warn!("⚠️ Could not remove {} from {}: {}", student_id, session_id, e);
                    outcome.fail(student_id, e);
                }
            }
        }

        if !removed.is_empty() {
            tracing::info!("👋 {} participant(s) removed from {}", removed.len(), session_id);
            self.notify(
                DispatchRequest::roster(vec![session_id.to_string()], NotificationCategory::ParticipantRemoved, &ctx.actor_id)
                    .with_audience(Audience::Students(removed))
                    .with_message(reason.map(str::to_string)),
            )
            .await;
        }
        if !promoted.is_empty() {
            self.notify(
                DispatchRequest::roster(vec![session_id.to_string()], NotificationCategory::WaitlistPromoted, &ctx.actor_id)
                    .with_audience(Audience::Students(promoted)),
            )
            .await;
        }
        Ok(outcome)
    }

    /// Attendance: mark a seated participant confirmed or no-show.
    pub fn set_participant_status(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        student_id: &str,
        status: EnrollmentStatus,
    ) -> Result<Enrollment> {
        self.db.write(|repo| {
            let session = Self::scoped_session(repo, ctx, session_id)?;
            capacity::set_participant_status(repo, &session, student_id, status)
        })
    }

    // ─── Instructors ───────────────────────────────────────

    pub async fn add_instructors(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        instructor_ids: &[String],
        notes: Option<&str>,
    ) -> Result<BatchOutcome<InstructorAssignment>> {
        let session = self.db.read(|repo| Self::scoped_session(repo, ctx, session_id))?;
        Self::ensure_open(&session)?;

        let mut outcome = BatchOutcome::new();
        let mut assigned = Vec::new();
        for instructor_id in dedup(instructor_ids) {
            if self.directory.instructor(&instructor_id).is_none() {
                outcome.fail(&instructor_id, SlotwiseError::not_found("instructor", instructor_id.as_str()));
                continue;
            }
            let now = self.now();
            let result = self.db.write(|repo| {
                let session = Self::scoped_session(repo, ctx, session_id)?;
                Self::ensure_open(&session)?;
                if repo.active_assignment(&session.id, &instructor_id)?.is_some() {
                    return Err(SlotwiseError::StateConflict(format!(
                        "{instructor_id} is already assigned"
                    )));
                }
                let range = TimeRange::new(session.start_time, session.end_time)?;
                let clashes = self.detector.instructor_collisions(
                    repo,
                    &ctx.program_id,
                    &instructor_id,
                    &range,
                    std::slice::from_ref(&session.id),
                )?;
                if !clashes.is_empty() {
                    return Err(SlotwiseError::Conflict(Box::new(ConflictReport {
                        instructor_conflicts: vec![InstructorConflict {
                            instructor_id: instructor_id.clone(),
                            sessions: clashes,
                        }],
                        ..Default::default()
                    })));
                }
                let has_primary = repo.active_assignments(&session.id)?.iter().any(|a| a.is_primary);
                let assignment = InstructorAssignment {
                    id: uuid::Uuid::new_v4().to_string(),
                    session_id: session.id.clone(),
                    instructor_id: instructor_id.clone(),
                    is_primary: !has_primary,
                    assignment_notes: notes.map(str::to_string),
                    special_instructions: None,
                    assigned_by: ctx.actor_id.clone(),
                    assigned_at: now,
                    removed_at: None,
                    removed_by: None,
                    removal_reason: None,
                };
                repo.insert_assignment(&assignment)?;
                Ok(assignment)
            });
            match result {
                Ok(a) => {
                    assigned.push(instructor_id);
                    outcome.succeeded.push(a);
                }
                Err(e) => {
                    tracing::warn!("⚠️ Skipped instructor {} on {}: {}", instructor_id, session_id, e);
                    outcome.fail(instructor_id, e);
                }
            }
        }

        if !assigned.is_empty() {
            tracing::info!("🧑‍🏫 {} instructor(s) assigned to {}", assigned.len(), session_id);
            self.notify(
                DispatchRequest::roster(vec![session_id.to_string()], NotificationCategory::InstructorAssigned, &ctx.actor_id)
                    .with_audience(Audience::Instructors(assigned)),
            )
            .await;
        }
        Ok(outcome)
    }

    pub async fn remove_instructors(
        &self,
        ctx: &RequestContext,
        session_id: &str,
        instructor_ids: &[String],
        reason: Option<&str>,
    ) -> Result<BatchOutcome<String>> {
        self.db.read(|repo| Self::scoped_session(repo, ctx, session_id))?;

        let mut outcome = BatchOutcome::new();
        for instructor_id in dedup(instructor_ids) {
            let now = self.now();
            let result = self.db.write(|repo| {
                let session = Self::scoped_session(repo, ctx, session_id)?;
                let assignment = repo
                    .active_assignment(&session.id, &instructor_id)?
                    .ok_or_else(|| {
                        SlotwiseError::not_found("assignment", format!("{}/{}", session.id, instructor_id))
                    })?;
                repo.remove_assignment(&assignment.id, reason, &ctx.actor_id, now)?;
                if assignment.is_primary {
                    // Earliest remaining assignment takes over.
                    if let Some(next) = repo.active_assignments(&session.id)?.first() {
                        repo.set_primary(&next.id)?;
                        tracing::debug!("⭐ {} is now primary on {}", next.instructor_id, session.id);
                    }
                }
                Ok(())
            });
            match result {
                Ok(()) => outcome.succeeded.push(instructor_id),
                Err(e) => {
                    tracing::warn!("⚠️ Could not remove instructor {} from {}: {}", instructor_id, session_id, e);
                    outcome.fail(instructor_id, e);
                }
            }
        }

        if !outcome.succeeded.is_empty() {
            self.notify(
                DispatchRequest::roster(vec![session_id.to_string()], NotificationCategory::InstructorRemoved, &ctx.actor_id)
                    .with_audience(Audience::Instructors(outcome.succeeded.clone()))
                    .with_message(reason.map(str::to_string)),
            )
            .await;
        }
        Ok(outcome)
    }

    // ─── Queries ───────────────────────────────────────────

    /// Read-only conflict check for a proposed slot.
    pub fn check_conflicts(
        &self,
        ctx: &RequestContext,
        facility_id: &str,
        start: Timestamp,
        end: Timestamp,
        instructor_ids: &[String],
        exclude_ids: &[String],
    ) -> Result<ConflictReport> {
        let range = TimeRange::new(start, end)?;
        self.scoped_facility(ctx, facility_id)?;
        self.db.read(|repo| {
            self.detector
                .check(repo, &ctx.program_id, facility_id, &range, instructor_ids, exclude_ids)
        })
    }

    pub fn get_session(&self, ctx: &RequestContext, session_id: &str) -> Result<Session> {
        self.db.read(|repo| Self::scoped_session(repo, ctx, session_id))
    }

    pub fn get_facility_sessions(
        &self,
        ctx: &RequestContext,
        facility_id: &str,
        filter: &SessionFilter,
        page: PageRequest,
    ) -> Result<Page<Session>> {
        self.scoped_facility(ctx, facility_id)?;
        if let (Some(from), Some(until)) = (filter.from, filter.until)
            && until <= from
        {
            return Err(SlotwiseError::InvalidRange { start: from, end: until });
        }
        let limit = if page.limit == 0 { self.default_page_size } else { page.limit };
        let (items, total) = self
            .db
            .read(|repo| repo.facility_sessions(&ctx.program_id, facility_id, filter, page.offset, limit))?;
        Ok(Page {
            items,
            total,
            offset: page.offset,
            limit,
        })
    }

    /// Seated first, then the waitlist in order, then cancelled rows.
    pub fn get_session_participants(&self, ctx: &RequestContext, session_id: &str) -> Result<Vec<Enrollment>> {
        self.db.read(|repo| {
            Self::scoped_session(repo, ctx, session_id)?;
            repo.enrollments(session_id)
        })
    }

    /// Active assignments, earliest first.
    pub fn get_session_instructors(
        &self,
        ctx: &RequestContext,
        session_id: &str,
    ) -> Result<Vec<InstructorAssignment>> {
        self.db.read(|repo| {
            Self::scoped_session(repo, ctx, session_id)?;
            repo.active_assignments(session_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::InMemoryDirectory;
    use crate::notify::MemorySink;
    use chrono::DateTime;
    use slotwise_core::types::{ContactChannel, CourseInfo, PersonContact, StudentContact};

    fn at(s: &str) -> Timestamp {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn person(id: &str) -> PersonContact {
        PersonContact {
            id: id.into(),
            name: id.into(),
            contact: Some(ContactChannel::Email(format!("{id}@example.com"))),
        }
    }

    struct Harness {
        manager: SessionManager,
        sink: Arc<MemorySink>,
        ctx: RequestContext,
    }

    fn harness() -> Harness {
        let mut dir = InMemoryDirectory::default();
        for (id, program) in [("pool", "p1"), ("gym", "p1"), ("rink", "p2")] {
            dir.add_facility(FacilityInfo {
                id: id.into(),
                program_id: program.into(),
                name: id.to_uppercase(),
            });
        }
        dir.add_course(CourseInfo {
            id: "c1".into(),
            program_id: "p1".into(),
            name: "Basics".into(),
        });
        for s in ["S1", "S2", "S3", "S4"] {
            dir.add_student(StudentContact {
                person: person(s),
                guardians: vec![],
            });
        }
        for i in ["coach", "aide", "sub"] {
            dir.add_instructor(person(i));
        }

        let config = SlotwiseConfig::default();
        let db = Arc::new(SchedulingDb::open_in_memory().unwrap());
        let directory: Arc<dyn Directory> = Arc::new(dir);
        let sink = Arc::new(MemorySink::new(500));
        let mut dispatcher = Dispatcher::new(db.clone(), directory.clone());
        dispatcher.register_sink(sink.clone(), 1);
        let manager = SessionManager::new(&config, db, directory, Arc::new(dispatcher));
        Harness {
            manager,
            sink,
            ctx: RequestContext::new("admin", "p1"),
        }
    }

    fn lesson(start: &str, end: &str) -> NewSession {
        NewSession::new("pool", "Lesson", SessionType::Group, at(start), at(end), 2)
    }

    #[tokio::test]
    async fn test_facility_overlap_scenario() {
        let h = harness();
        let first = h
            .manager
            .create_session(&h.ctx, lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z"))
            .await
            .unwrap();
        assert_eq!(first.sessions.len(), 1);

        let err = h
            .manager
            .create_session(&h.ctx, lesson("2026-03-02T10:30:00Z", "2026-03-02T11:30:00Z"))
            .await
            .unwrap_err();
        let report = err.conflict_report().unwrap();
        assert_eq!(report.facility_conflicts[0].session_id, first.sessions[0].id);
        assert!(!report.suggestions.is_empty());

        h.manager
            .create_session(&h.ctx, lesson("2026-03-02T11:00:00Z", "2026-03-02T12:00:00Z"))
            .await
            .unwrap();

        let page = h
            .manager
            .get_facility_sessions(&h.ctx, "pool", &SessionFilter::default(), PageRequest::default())
            .unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.limit, 50);
    }

    #[tokio::test]
    async fn test_validation_and_scope() {
        let h = harness();
        let backwards = h
            .manager
            .create_session(&h.ctx, lesson("2026-03-02T11:00:00Z", "2026-03-02T10:00:00Z"))
            .await;
        assert!(matches!(backwards, Err(SlotwiseError::InvalidRange { .. })));

        let mut empty = lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z");
        empty.title = "  ".into();
        assert!(matches!(
            h.manager.create_session(&h.ctx, empty).await,
            Err(SlotwiseError::Validation(_))
        ));

        let mut elsewhere = lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z");
        elsewhere.facility_id = "rink".into();
        assert!(matches!(
            h.manager.create_session(&h.ctx, elsewhere).await,
            Err(SlotwiseError::AccessDenied(_))
        ));

        let created = h
            .manager
            .create_session(&h.ctx, lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z"))
            .await
            .unwrap();
        let id = &created.sessions[0].id;
        let other = RequestContext::new("admin", "p2");
        assert!(matches!(h.manager.get_session(&other, id), Err(SlotwiseError::AccessDenied(_))));
        assert!(matches!(
            h.manager.get_session(&h.ctx, "missing"),
            Err(SlotwiseError::NotFound { entity: "session", .. })
        ));
    }

    #[tokio::test]
    async fn test_conflict_rejects_without_mutation() {
        let h = harness();
        h.manager
            .create_session(
                &h.ctx,
                NewSession::new("gym", "Busy coach", SessionType::Private, at("2026-03-09T10:00:00Z"), at("2026-03-09T11:00:00Z"), 1)
                    .with_instructors(&["coach"]),
            )
            .await
            .unwrap();
        h.sink.clear();

        // Root is free, but the second weekly occurrence double-books the coach.
        let new = lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z")
            .with_instructors(&["coach"])
            .with_students(&["S1"])
            .recurring(
                RecurrencePattern::Weekly,
                RecurrenceRule {
                    max_occurrences: Some(3),
                    ..Default::default()
                },
            );
        let err = h.manager.create_session(&h.ctx, new).await.unwrap_err();
        let report = err.conflict_report().unwrap();
        assert_eq!(report.instructor_conflicts[0].instructor_id, "coach");

        let pool = h
            .manager
            .get_facility_sessions(&h.ctx, "pool", &SessionFilter::default(), PageRequest::default())
            .unwrap();
        assert_eq!(pool.total, 0);
        assert!(h.sink.history().is_empty());
    }

    #[tokio::test]
    async fn test_weekly_series_and_shift() {
        let h = harness();
        let new = lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z")
            .with_instructors(&["coach"])
            .with_students(&["S1"])
            .recurring(
                RecurrencePattern::Weekly,
                RecurrenceRule {
                    max_occurrences: Some(4),
                    ..Default::default()
                },
            );
        let created = h.manager.create_session(&h.ctx, new).await.unwrap();
        assert_eq!(created.sessions.len(), 5);
        let root = created.root().unwrap().clone();
        let series_id = root.series_id.clone().unwrap();
        for (i, s) in created.sessions.iter().enumerate() {
            assert_eq!(s.start_time, root.start_time + Duration::weeks(i as i64));
            assert_eq!(s.series_id.as_deref(), Some(series_id.as_str()));
            if i > 0 {
                assert_eq!(s.recurring_parent_id.as_deref(), Some(root.id.as_str()));
                assert!(s.recurrence_rule.is_none());
            }
        }
        assert_eq!(created.assignments.len(), 5);
        assert_eq!(created.enrollments.len(), 5);

        // Cancel one occurrence; it stays put when the series moves.
        let third = created.sessions[2].id.clone();
        h.manager.cancel_session(&h.ctx, &third, "pool maintenance", false).await.unwrap();

        let second = &created.sessions[1];
        let moved = h
            .manager
            .change_time(
                &h.ctx,
                &second.id,
                second.start_time + Duration::hours(2),
                second.end_time + Duration::hours(2),
                true,
            )
            .await
            .unwrap();
        assert_eq!(moved.len(), 4);
        for s in &moved {
            assert_eq!(s.duration(), Duration::hours(1));
            assert_eq!(s.start_time.format("%H:%M").to_string(), "12:00");
        }
        let untouched = h.manager.get_session(&h.ctx, &third).unwrap();
        assert_eq!(untouched.start_time, at("2026-03-16T10:00:00Z"));
        assert_eq!(untouched.status, SessionStatus::Cancelled);

        let changed: Vec<_> = h
            .sink
            .delivered_to("S1")
            .into_iter()
            .filter(|r| r.category == NotificationCategory::TimeChanged)
            .collect();
        assert_eq!(changed.len(), 4);
    }

    #[tokio::test]
    async fn test_change_time_conflict_and_terminal() {
        let h = harness();
        let a = h
            .manager
            .create_session(&h.ctx, lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z"))
            .await
            .unwrap();
        let b = h
            .manager
            .create_session(&h.ctx, lesson("2026-03-02T12:00:00Z", "2026-03-02T13:00:00Z"))
            .await
            .unwrap();
        let b_id = b.sessions[0].id.clone();

        let err = h
            .manager
            .change_time(&h.ctx, &b_id, at("2026-03-02T10:30:00Z"), at("2026-03-02T11:30:00Z"), false)
            .await
            .unwrap_err();
        assert!(err.conflict_report().is_some());
        assert_eq!(h.manager.get_session(&h.ctx, &b_id).unwrap().start_time, at("2026-03-02T12:00:00Z"));

        // Moving onto its own slot is fine: the session excludes itself.
        h.manager
            .change_time(&h.ctx, &b_id, at("2026-03-02T12:30:00Z"), at("2026-03-02T13:30:00Z"), false)
            .await
            .unwrap();

        h.manager.cancel_session(&h.ctx, &a.sessions[0].id, "rain", false).await.unwrap();
        let err = h
            .manager
            .change_time(&h.ctx, &a.sessions[0].id, at("2026-03-03T10:00:00Z"), at("2026-03-03T11:00:00Z"), false)
            .await
            .unwrap_err();
        assert!(matches!(err, SlotwiseError::StateConflict(_)));
        let again = h.manager.cancel_session(&h.ctx, &a.sessions[0].id, "rain", false).await;
        assert!(matches!(again, Err(SlotwiseError::StateConflict(_))));
    }

    #[tokio::test]
    async fn test_cancel_facility_day_scoping() {
        let h = harness();
        let mut made = Vec::new();
        for (facility, start, end) in [
            ("pool", "2026-03-02T08:00:00+02:00", "2026-03-02T09:00:00+02:00"),
            ("pool", "2026-03-02T23:00:00-05:00", "2026-03-02T23:45:00-05:00"),
            ("pool", "2026-03-03T09:00:00+02:00", "2026-03-03T10:00:00+02:00"),
            ("gym", "2026-03-02T09:00:00+02:00", "2026-03-02T10:00:00+02:00"),
            ("pool", "2026-03-02T12:00:00Z", "2026-03-02T13:00:00Z"),
            ("pool", "2026-03-02T14:00:00Z", "2026-03-02T15:00:00Z"),
        ] {
            let mut new = lesson(start, end).with_students(&["S1"]);
            new.facility_id = facility.into();
            made.push(h.manager.create_session(&h.ctx, new).await.unwrap().sessions[0].id.clone());
        }
        // Already closed before the facility day is cancelled.
        h.manager.cancel_session(&h.ctx, &made[4], "rain", false).await.unwrap();
        h.manager.update_status(&h.ctx, &made[5], SessionStatus::InProgress).await.unwrap();
        h.manager.update_status(&h.ctx, &made[5], SessionStatus::Completed).await.unwrap();
        h.sink.clear();

        // 23:00-05:00 on the 2nd is the 3rd in UTC; it still belongs to the 2nd.
        let outcome = h
            .manager
            .cancel_facility_day(&h.ctx, "pool", NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(), "pool closed")
            .await
            .unwrap();
        let mut cancelled = outcome.succeeded.clone();
        cancelled.sort();
        let mut expected = vec![made[0].clone(), made[1].clone()];
        expected.sort();
        assert_eq!(cancelled, expected);
        assert!(outcome.failed.is_empty());

        assert_eq!(h.manager.get_session(&h.ctx, &made[2]).unwrap().status, SessionStatus::Scheduled);
        assert_eq!(h.manager.get_session(&h.ctx, &made[3]).unwrap().status, SessionStatus::Scheduled);
        let s = h.manager.get_session(&h.ctx, &made[0]).unwrap();
        assert_eq!(s.cancellation_reason.as_deref(), Some("pool closed"));
        assert_eq!(s.cancelled_by.as_deref(), Some("admin"));

        let earlier = h.manager.get_session(&h.ctx, &made[4]).unwrap();
        assert_eq!(earlier.cancellation_reason.as_deref(), Some("rain"));
        let done = h.manager.get_session(&h.ctx, &made[5]).unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(done.cancellation_reason.is_none());

        let sent = h.sink.history();
        assert_eq!(sent.len(), 2);
        for d in &sent {
            assert_eq!(d.record.category, NotificationCategory::BulkCancelled);
            assert!(expected.contains(&d.record.session_id));
        }
    }

    #[tokio::test]
    async fn test_cancel_whole_series_skips_completed() {
        let h = harness();
        let new = lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z")
            .with_students(&["S1"])
            .recurring(
                RecurrencePattern::Weekly,
                RecurrenceRule {
                    max_occurrences: Some(2),
                    ..Default::default()
                },
            );
        let created = h.manager.create_session(&h.ctx, new).await.unwrap();
        assert_eq!(created.sessions.len(), 3);
        let series: Vec<String> = created.sessions.iter().map(|s| s.id.clone()).collect();

        h.manager.update_status(&h.ctx, &series[0], SessionStatus::InProgress).await.unwrap();
        h.manager.update_status(&h.ctx, &series[0], SessionStatus::Completed).await.unwrap();
        h.sink.clear();

        let cancelled = h
            .manager
            .cancel_session(&h.ctx, &series[1], "season over", true)
            .await
            .unwrap();
        let mut got: Vec<String> = cancelled.iter().map(|s| s.id.clone()).collect();
        got.sort();
        let mut expected = vec![series[1].clone(), series[2].clone()];
        expected.sort();
        assert_eq!(got, expected);

        assert_eq!(h.manager.get_session(&h.ctx, &series[0]).unwrap().status, SessionStatus::Completed);
        for id in &expected {
            let s = h.manager.get_session(&h.ctx, id).unwrap();
            assert_eq!(s.status, SessionStatus::Cancelled);
            assert_eq!(s.cancellation_reason.as_deref(), Some("season over"));
        }

        let mut notified: Vec<String> = h
            .sink
            .delivered_to("S1")
            .into_iter()
            .filter(|r| r.category == NotificationCategory::SessionCancelled)
            .map(|r| r.session_id)
            .collect();
        notified.sort();
        assert_eq!(notified, expected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_book_the_slot_once() {
        let Harness { manager, ctx, .. } = harness();
        let manager = Arc::new(manager);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            let ctx = ctx.clone();
            handles.push(tokio::spawn(async move {
                manager
                    .create_session(&ctx, lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z"))
                    .await
            }));
        }

        let mut booked = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => booked += 1,
                Err(e) => assert!(matches!(e, SlotwiseError::Conflict(_)), "unexpected error: {e}"),
            }
        }
        assert_eq!(booked, 1);

        let page = manager
            .get_facility_sessions(&ctx, "pool", &SessionFilter::default(), PageRequest::default())
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_removal_from_closed_session_sends_no_promotion() {
        let h = harness();
        let created = h
            .manager
            .create_session(&h.ctx, lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z"))
            .await
            .unwrap();
        let id = created.sessions[0].id.clone();
        h.manager.add_participants(&h.ctx, &id, &ids(&["S1", "S2", "S3"])).await.unwrap();
        h.manager.cancel_session(&h.ctx, &id, "storm", false).await.unwrap();
        h.sink.clear();

        let removed = h
            .manager
            .remove_participants(&h.ctx, &id, &ids(&["S1"]), None)
            .await
            .unwrap();
        assert!(removed.succeeded[0].promoted.is_empty());
        assert!(
            !h.sink
                .history()
                .iter()
                .any(|d| d.record.category == NotificationCategory::WaitlistPromoted)
        );
    }

    #[tokio::test]
    async fn test_change_time_past_max_date_is_rejected() {
        let h = harness();
        let new = lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z").recurring(
            RecurrencePattern::Weekly,
            RecurrenceRule {
                max_occurrences: Some(1),
                ..Default::default()
            },
        );
        let created = h.manager.create_session(&h.ctx, new).await.unwrap();
        let root = &created.sessions[0];

        // The target itself fits; the next week's member would not.
        let last = NaiveDate::MAX.and_hms_opt(10, 0, 0).unwrap().and_utc().fixed_offset();
        let err = h
            .manager
            .change_time(&h.ctx, &root.id, last, last + Duration::hours(1), true)
            .await
            .unwrap_err();
        assert!(matches!(err, SlotwiseError::Validation(_)));
        assert_eq!(h.manager.get_session(&h.ctx, &root.id).unwrap().start_time, root.start_time);

        let err = h
            .manager
            .cancel_facility_day(&h.ctx, "pool", NaiveDate::MAX, "closed")
            .await
            .unwrap_err();
        assert!(matches!(err, SlotwiseError::Validation(_)));
    }

    #[tokio::test]
    async fn test_participants_waitlist_flow() {
        let h = harness();
        let created = h
            .manager
            .create_session(&h.ctx, lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z"))
            .await
            .unwrap();
        let id = created.sessions[0].id.clone();

        let added = h
            .manager
            .add_participants(&h.ctx, &id, &ids(&["S1", "S2", "S3", "S4", "ghost"]))
            .await
            .unwrap();
        assert_eq!(added.succeeded.len(), 4);
        assert_eq!(added.failed.len(), 1);
        assert_eq!(added.failed[0].id, "ghost");
        assert!(added.is_partial());
        assert!(matches!(added.succeeded[2], AddOutcome::Waitlisted(_)));

        let removed = h
            .manager
            .remove_participants(&h.ctx, &id, &ids(&["S1"]), Some("moved away"))
            .await
            .unwrap();
        assert_eq!(removed.succeeded[0].promoted, vec!["S3".to_string()]);

        let roster = h.manager.get_session_participants(&h.ctx, &id).unwrap();
        let summary: Vec<(&str, EnrollmentStatus, Option<u32>)> = roster
            .iter()
            .map(|e| (e.student_id.as_str(), e.status, e.waitlist_position))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("S2", EnrollmentStatus::Enrolled, None),
                ("S3", EnrollmentStatus::Enrolled, None),
                ("S4", EnrollmentStatus::Waitlisted, Some(1)),
                ("S1", EnrollmentStatus::Cancelled, None),
            ]
        );
        assert!(
            h.sink
                .delivered_to("S3")
                .iter()
                .any(|r| r.category == NotificationCategory::WaitlistPromoted)
        );
        // Only the affected student hears about the removal.
        assert!(
            !h.sink
                .delivered_to("S2")
                .iter()
                .any(|r| r.category == NotificationCategory::ParticipantRemoved)
        );

        let promoted = h.manager.set_capacity(&h.ctx, &id, 3).await.unwrap();
        assert_eq!(promoted, vec!["S4".to_string()]);
        assert!(matches!(
            h.manager.set_capacity(&h.ctx, &id, 1).await,
            Err(SlotwiseError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_instructor_assignment_rules() {
        let h = harness();
        let busy = h
            .manager
            .create_session(
                &h.ctx,
                NewSession::new("gym", "Gym", SessionType::Group, at("2026-03-02T10:30:00Z"), at("2026-03-02T11:30:00Z"), 5)
                    .with_instructors(&["sub"]),
            )
            .await
            .unwrap();
        assert!(busy.assignments[0].is_primary);

        let created = h
            .manager
            .create_session(&h.ctx, lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z"))
            .await
            .unwrap();
        let id = created.sessions[0].id.clone();

        let out = h
            .manager
            .add_instructors(&h.ctx, &id, &ids(&["coach", "aide", "sub", "coach"]), None)
            .await
            .unwrap();
        assert_eq!(out.succeeded.len(), 2);
        assert_eq!(out.failed.len(), 1);
        assert_eq!(out.failed[0].id, "sub");
        assert!(out.succeeded[0].is_primary);
        assert!(!out.succeeded[1].is_primary);

        let again = h.manager.add_instructors(&h.ctx, &id, &ids(&["aide"]), None).await.unwrap();
        assert!(again.all_failed());

        let removed = h
            .manager
            .remove_instructors(&h.ctx, &id, &ids(&["coach", "nobody"]), Some("injury"))
            .await
            .unwrap();
        assert_eq!(removed.succeeded, vec!["coach".to_string()]);
        assert_eq!(removed.failed[0].id, "nobody");

        let active = h.manager.get_session_instructors(&h.ctx, &id).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].instructor_id, "aide");
        assert!(active[0].is_primary);
        assert_eq!(h.sink.delivered_to("coach").last().unwrap().category, NotificationCategory::InstructorRemoved);
    }

    #[tokio::test]
    async fn test_status_machine() {
        let h = harness();
        let created = h
            .manager
            .create_session(&h.ctx, lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z"))
            .await
            .unwrap();
        let id = created.sessions[0].id.clone();

        h.manager.update_status(&h.ctx, &id, SessionStatus::Postponed).await.unwrap();
        // The freed slot can be taken while postponed...
        h.manager
            .create_session(&h.ctx, lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z"))
            .await
            .unwrap();
        // ...so returning to scheduled now conflicts.
        let err = h.manager.update_status(&h.ctx, &id, SessionStatus::Scheduled).await.unwrap_err();
        assert!(err.conflict_report().is_some());

        let done = h.manager.update_status(&h.ctx, &id, SessionStatus::Completed).await.unwrap();
        assert_eq!(done.status, SessionStatus::Completed);
        assert!(matches!(
            h.manager.update_status(&h.ctx, &id, SessionStatus::InProgress).await,
            Err(SlotwiseError::StateConflict(_))
        ));
        assert!(matches!(
            h.manager.update_status(&h.ctx, &id, SessionStatus::Cancelled).await,
            Err(SlotwiseError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_check_conflicts_read_only() {
        let h = harness();
        h.manager
            .create_session(&h.ctx, lesson("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z").with_instructors(&["coach"]))
            .await
            .unwrap();
        let report = h
            .manager
            .check_conflicts(&h.ctx, "gym", at("2026-03-02T10:15:00Z"), at("2026-03-02T10:45:00Z"), &ids(&["coach"]), &[])
            .unwrap();
        assert!(report.facility_conflicts.is_empty());
        assert_eq!(report.instructor_conflicts.len(), 1);
        assert_eq!(report.suggestions.len(), 3);
    }
}
