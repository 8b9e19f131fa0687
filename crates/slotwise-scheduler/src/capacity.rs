//! Capacity & waitlist management.
//!
//! Seats are counted from `enrolled`, `confirmed` and `no_show` rows. The
//! waitlist is FIFO with dense positions `1..n`; every removal or promotion
//! renumbers what is left.

use serde::{Deserialize, Serialize};
use slotwise_core::error::{Result, SlotwiseError};
use slotwise_core::types::{Enrollment, EnrollmentStatus, Session, Timestamp};

use crate::persistence::SessionRepo;

/// What `add_participant` did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "enrollment")]
pub enum AddOutcome {
    Enrolled(Enrollment),
    Waitlisted(Enrollment),
    /// An active enrollment already existed; nothing changed.
    AlreadyEnrolled(Enrollment),
}

impl AddOutcome {
    pub fn enrollment(&self) -> &Enrollment {
        match self {
            AddOutcome::Enrolled(e) | AddOutcome::Waitlisted(e) | AddOutcome::AlreadyEnrolled(e) => e,
        }
    }

    /// True when a row was written.
    pub fn is_new(&self) -> bool {
        !matches!(self, AddOutcome::AlreadyEnrolled(_))
    }
}

/// What `remove_participant` did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoveOutcome {
    pub removed: Enrollment,
    /// Students moved off the waitlist as a result.
    pub promoted: Vec<String>,
}

/// Seat a student, or queue them when the session is full.
pub fn add_participant(
    repo: &SessionRepo<'_>,
    session: &Session,
    student_id: &str,
    actor_id: &str,
    now: Timestamp,
) -> Result<AddOutcome> {
    if let Some(existing) = repo.active_enrollment(&session.id, student_id)? {
        return Ok(AddOutcome::AlreadyEnrolled(existing));
    }

    let occupied = repo.count_occupied(&session.id)?;
    let (status, waitlist_position) = if occupied < session.max_participants {
        (EnrollmentStatus::Enrolled, None)
    } else {
        (
            EnrollmentStatus::Waitlisted,
            Some(repo.max_waitlist_position(&session.id)? + 1),
        )
    };

    let enrollment = Enrollment {
        id: uuid::Uuid::new_v4().to_string(),
        session_id: session.id.clone(),
        student_id: student_id.to_string(),
        status,
        waitlist_position,
        enrolled_by: actor_id.to_string(),
        enrolled_at: now,
        cancellation_reason: None,
        cancelled_by: None,
        cancelled_at: None,
        notification_sent: false,
        notification_sent_at: None,
    };
    repo.insert_enrollment(&enrollment)?;

    Ok(match status {
        EnrollmentStatus::Waitlisted => {
            tracing::debug!(
                "⏳ {} waitlisted on {} at position {}",
                student_id,
                session.id,
                waitlist_position.unwrap_or_default()
            );
            AddOutcome::Waitlisted(enrollment)
        }
        _ => AddOutcome::Enrolled(enrollment),
    })
}

/// Soft-cancel a student's enrollment, then fill any freed seat from the waitlist.
pub fn remove_participant(
    repo: &SessionRepo<'_>,
    session: &Session,
    student_id: &str,
    reason: Option<&str>,
    actor_id: &str,
    now: Timestamp,
) -> Result<RemoveOutcome> {
    let mut removed = repo
        .active_enrollment(&session.id, student_id)?
        .ok_or_else(|| SlotwiseError::not_found("enrollment", format!("{}/{}", session.id, student_id)))?;

    repo.cancel_enrollment(&removed.id, reason, actor_id, now)?;
    let was_waitlisted = removed.status == EnrollmentStatus::Waitlisted;
    removed.status = EnrollmentStatus::Cancelled;
    removed.waitlist_position = None;
    removed.cancellation_reason = reason.map(str::to_string);
    removed.cancelled_by = Some(actor_id.to_string());
    removed.cancelled_at = Some(now);

    if was_waitlisted {
        renumber_waitlist(repo, &session.id)?;
    }
    let promoted = promote_waitlisted(repo, session)?;
    Ok(RemoveOutcome { removed, promoted })
}

/// Promote waitlisted students into free seats, first in line first.
/// Returns the promoted student ids. Closed sessions never promote.
pub fn promote_waitlisted(repo: &SessionRepo<'_>, session: &Session) -> Result<Vec<String>> {
    if session.status.is_terminal() {
        return Ok(Vec::new());
    }
    let occupied = repo.count_occupied(&session.id)?;
    let available = session.max_participants.saturating_sub(occupied) as usize;
    if available == 0 {
        return Ok(Vec::new());
    }

    let waitlist = repo.waitlisted(&session.id)?;
    if waitlist.is_empty() {
        return Ok(Vec::new());
    }

    let mut promoted = Vec::new();
    for entry in waitlist.iter().take(available) {
        repo.set_enrollment_status(&entry.id, EnrollmentStatus::Enrolled, None)?;
        promoted.push(entry.student_id.clone());
    }
    renumber_waitlist(repo, &session.id)?;

    tracing::info!("⬆️ Promoted {} from waitlist on {}", promoted.len(), session.id);
    Ok(promoted)
}

/// Attendance marking. Only seated rows can move between `confirmed` and `no_show`.
pub fn set_participant_status(
    repo: &SessionRepo<'_>,
    session: &Session,
    student_id: &str,
    status: EnrollmentStatus,
) -> Result<Enrollment> {
    if !matches!(status, EnrollmentStatus::Confirmed | EnrollmentStatus::NoShow) {
        return Err(SlotwiseError::validation(format!(
            "attendance status must be confirmed or no_show, got {}",
            status.as_str()
        )));
    }
    let mut enrollment = repo
        .active_enrollment(&session.id, student_id)?
        .ok_or_else(|| SlotwiseError::not_found("enrollment", format!("{}/{}", session.id, student_id)))?;
    if !matches!(
        enrollment.status,
        EnrollmentStatus::Enrolled | EnrollmentStatus::Confirmed | EnrollmentStatus::NoShow
    ) {
        return Err(SlotwiseError::StateConflict(format!(
            "enrollment of {} is {}",
            student_id,
            enrollment.status.as_str()
        )));
    }
    repo.set_enrollment_status(&enrollment.id, status, None)?;
    enrollment.status = status;
    Ok(enrollment)
}

fn renumber_waitlist(repo: &SessionRepo<'_>, session_id: &str) -> Result<()> {
    for (i, entry) in repo.waitlisted(session_id)?.iter().enumerate() {
        let position = i as u32 + 1;
        if entry.waitlist_position != Some(position) {
            repo.set_waitlist_position(&entry.id, position)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SchedulingDb;
    use chrono::{DateTime, Duration};
    use slotwise_core::types::{RecurrencePattern, SessionStatus, SessionType};

    fn now() -> Timestamp {
        DateTime::parse_from_rfc3339("2026-03-01T09:00:00Z").unwrap()
    }

    fn session(max: u32) -> Session {
        let start = DateTime::parse_from_rfc3339("2026-03-02T10:00:00Z").unwrap();
        Session {
            id: "s1".into(),
            program_id: "p1".into(),
            facility_id: "f1".into(),
            course_id: None,
            title: "Group".into(),
            description: String::new(),
            session_type: SessionType::Group,
            start_time: start,
            end_time: start + Duration::hours(1),
            status: SessionStatus::Scheduled,
            max_participants: max,
            special_requirements: None,
            notes: None,
            recurrence_pattern: RecurrencePattern::None,
            recurrence_rule: None,
            recurring_parent_id: None,
            series_id: None,
            is_recurring: false,
            cancellation_reason: None,
            cancelled_by: None,
            cancelled_at: None,
            notification_sent: false,
            notification_sent_at: None,
            reminder_sent_at: None,
            created_by: "admin".into(),
            created_at: start,
            updated_at: start,
        }
    }

    fn setup(max: u32) -> (SchedulingDb, Session) {
        let db = SchedulingDb::open_in_memory().unwrap();
        let s = session(max);
        db.write(|repo| repo.insert_session(&s)).unwrap();
        (db, s)
    }

    fn statuses(db: &SchedulingDb) -> Vec<(String, EnrollmentStatus, Option<u32>)> {
        db.read(|repo| repo.enrollments("s1"))
            .unwrap()
            .into_iter()
            .filter(|e| e.status.is_active())
            .map(|e| (e.student_id, e.status, e.waitlist_position))
            .collect()
    }

    #[test]
    fn test_waitlist_scenario() {
        let (db, s) = setup(2);
        let t = now();
        db.write(|repo| {
            for (i, student) in ["S1", "S2", "S3", "S4"].iter().enumerate() {
                add_participant(repo, &s, student, "admin", t + Duration::minutes(i as i64))?;
            }
            Ok(())
        })
        .unwrap();
        assert_eq!(
            statuses(&db),
            vec![
                ("S1".into(), EnrollmentStatus::Enrolled, None),
                ("S2".into(), EnrollmentStatus::Enrolled, None),
                ("S3".into(), EnrollmentStatus::Waitlisted, Some(1)),
                ("S4".into(), EnrollmentStatus::Waitlisted, Some(2)),
            ]
        );

        let out = db
            .write(|repo| remove_participant(repo, &s, "S1", Some("sick"), "admin", t + Duration::hours(1)))
            .unwrap();
        assert_eq!(out.promoted, vec!["S3".to_string()]);
        assert_eq!(out.removed.status, EnrollmentStatus::Cancelled);

        let after = statuses(&db);
        assert!(after.contains(&("S3".into(), EnrollmentStatus::Enrolled, None)));
        assert!(after.contains(&("S4".into(), EnrollmentStatus::Waitlisted, Some(1))));
        assert_eq!(db.read(|repo| repo.count_occupied("s1")).unwrap(), 2);
    }

    #[test]
    fn test_duplicate_add_is_noop() {
        let (db, s) = setup(2);
        let first = db.write(|repo| add_participant(repo, &s, "S1", "admin", now())).unwrap();
        assert!(first.is_new());
        let again = db.write(|repo| add_participant(repo, &s, "S1", "admin", now())).unwrap();
        assert!(matches!(again, AddOutcome::AlreadyEnrolled(_)));
        assert_eq!(again.enrollment().id, first.enrollment().id);
        assert_eq!(statuses(&db).len(), 1);
    }

    #[test]
    fn test_removing_waitlisted_redensifies() {
        let (db, s) = setup(1);
        db.write(|repo| {
            for student in ["A", "B", "C", "D"] {
                add_participant(repo, &s, student, "admin", now())?;
            }
            Ok(())
        })
        .unwrap();

        let out = db
            .write(|repo| remove_participant(repo, &s, "C", None, "admin", now()))
            .unwrap();
        assert!(out.promoted.is_empty());
        let waitlist: Vec<(String, Option<u32>)> = db
            .read(|repo| repo.waitlisted("s1"))
            .unwrap()
            .into_iter()
            .map(|e| (e.student_id, e.waitlist_position))
            .collect();
        assert_eq!(waitlist, vec![("B".into(), Some(1)), ("D".into(), Some(2))]);
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let (db, s) = setup(1);
        let err = db
            .write(|repo| remove_participant(repo, &s, "ghost", None, "admin", now()))
            .unwrap_err();
        assert!(matches!(err, SlotwiseError::NotFound { entity: "enrollment", .. }));
    }

    #[test]
    fn test_capacity_growth_promotes_in_order() {
        let (db, mut s) = setup(1);
        db.write(|repo| {
            for student in ["A", "B", "C", "D"] {
                add_participant(repo, &s, student, "admin", now())?;
            }
            Ok(())
        })
        .unwrap();

        s.max_participants = 3;
        let promoted = db
            .write(|repo| {
                repo.set_max_participants("s1", 3, now())?;
                promote_waitlisted(repo, &s)
            })
            .unwrap();
        assert_eq!(promoted, vec!["B".to_string(), "C".to_string()]);
        let waitlist = db.read(|repo| repo.waitlisted("s1")).unwrap();
        assert_eq!(waitlist.len(), 1);
        assert_eq!(waitlist[0].student_id, "D");
        assert_eq!(waitlist[0].waitlist_position, Some(1));
    }

    #[test]
    fn test_no_show_keeps_seat() {
        let (db, s) = setup(1);
        db.write(|repo| {
            add_participant(repo, &s, "A", "admin", now())?;
            add_participant(repo, &s, "B", "admin", now())
        })
        .unwrap();
        let e = db
            .write(|repo| set_participant_status(repo, &s, "A", EnrollmentStatus::NoShow))
            .unwrap();
        assert_eq!(e.status, EnrollmentStatus::NoShow);
        assert!(db.write(|repo| promote_waitlisted(repo, &s)).unwrap().is_empty());

        let err = db
            .write(|repo| set_participant_status(repo, &s, "B", EnrollmentStatus::Confirmed))
            .unwrap_err();
        assert!(matches!(err, SlotwiseError::StateConflict(_)));
    }

    #[test]
    fn test_closed_session_removal_does_not_promote() {
        let (db, mut s) = setup(1);
        db.write(|repo| {
            add_participant(repo, &s, "A", "admin", now())?;
            add_participant(repo, &s, "B", "admin", now())
        })
        .unwrap();

        s.status = SessionStatus::Cancelled;
        db.write(|repo| repo.update_session_status("s1", SessionStatus::Cancelled, now()))
            .unwrap();
        let out = db
            .write(|repo| remove_participant(repo, &s, "A", None, "admin", now()))
            .unwrap();
        assert!(out.promoted.is_empty());
        assert_eq!(out.removed.status, EnrollmentStatus::Cancelled);
        assert_eq!(
            statuses(&db),
            vec![("B".into(), EnrollmentStatus::Waitlisted, Some(1))]
        );
    }
}
