//! Conflict detection: facility and instructor double-booking.
//!
//! Read-only: runs against whatever view the caller hands it, which inside a
//! mutation is the open write transaction.

use chrono::Duration;
use slotwise_core::config::SchedulingConfig;
use slotwise_core::error::Result;
use slotwise_core::types::{ConflictReport, ConflictingSession, InstructorConflict, SuggestedSlot};

use crate::interval::TimeRange;
use crate::persistence::SessionRepo;

/// Finds overlapping active sessions and proposes nearby free slots.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    offsets: Vec<Duration>,
    max_suggestions: usize,
}

impl ConflictDetector {
    pub fn new(config: &SchedulingConfig) -> Self {
        Self {
            offsets: config
                .suggestion_offsets_minutes
                .iter()
                .map(|m| Duration::minutes(*m))
                .collect(),
            max_suggestions: config.max_suggestions,
        }
    }

    /// Full check with suggestions when anything collides.
    pub fn check(
        &self,
        repo: &SessionRepo<'_>,
        program_id: &str,
        facility_id: &str,
        range: &TimeRange,
        instructor_ids: &[String],
        exclude_ids: &[String],
    ) -> Result<ConflictReport> {
        let mut report = self.collisions(repo, program_id, facility_id, range, instructor_ids, exclude_ids)?;
        if report.has_conflicts() {
            report.suggestions =
                self.suggest(repo, program_id, facility_id, range, instructor_ids, exclude_ids)?;
            tracing::debug!(
                "🚧 Conflict at facility {} for {}..{}: {}",
                facility_id,
                range.start(),
                range.end(),
                report.summary()
            );
        }
        Ok(report)
    }

    /// Colliding sessions only, no suggestions.
    pub fn collisions(
        &self,
        repo: &SessionRepo<'_>,
        program_id: &str,
        facility_id: &str,
        range: &TimeRange,
        instructor_ids: &[String],
        exclude_ids: &[String],
    ) -> Result<ConflictReport> {
        let excluded = |id: &str| exclude_ids.iter().any(|x| x == id);

        let facility_conflicts: Vec<ConflictingSession> = repo
            .facility_overlaps(program_id, facility_id, range.start(), range.end())?
            .iter()
            .filter(|s| !excluded(&s.id))
            .map(ConflictingSession::from)
            .collect();

        let mut instructor_conflicts: Vec<InstructorConflict> = Vec::new();
        for instructor_id in instructor_ids {
            if instructor_conflicts.iter().any(|c| &c.instructor_id == instructor_id) {
                continue;
            }
            let sessions = self.instructor_collisions(repo, program_id, instructor_id, range, exclude_ids)?;
            if !sessions.is_empty() {
                instructor_conflicts.push(InstructorConflict {
                    instructor_id: instructor_id.clone(),
                    sessions,
                });
            }
        }

        Ok(ConflictReport {
            facility_conflicts,
            instructor_conflicts,
            suggestions: Vec::new(),
        })
    }

    /// Active sessions already holding `instructor_id` during `range`.
    pub fn instructor_collisions(
        &self,
        repo: &SessionRepo<'_>,
        program_id: &str,
        instructor_id: &str,
        range: &TimeRange,
        exclude_ids: &[String],
    ) -> Result<Vec<ConflictingSession>> {
        Ok(repo
            .instructor_overlaps(program_id, instructor_id, range.start(), range.end())?
            .iter()
            .filter(|s| !exclude_ids.contains(&s.id))
            .map(ConflictingSession::from)
            .collect())
    }

    /// Probe the configured offsets once each; no recursion.
    pub fn suggest(
        &self,
        repo: &SessionRepo<'_>,
        program_id: &str,
        facility_id: &str,
        range: &TimeRange,
        instructor_ids: &[String],
        exclude_ids: &[String],
    ) -> Result<Vec<SuggestedSlot>> {
        let mut out = Vec::new();
        for offset in &self.offsets {
            if out.len() >= self.max_suggestions {
                break;
            }
            let Ok(candidate) = range.shifted(*offset) else {
                continue;
            };
            let probe = self.collisions(repo, program_id, facility_id, &candidate, instructor_ids, exclude_ids)?;
            if !probe.has_conflicts() {
                out.push(SuggestedSlot {
                    start_time: candidate.start(),
                    end_time: candidate.end(),
                });
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SchedulingDb;
    use chrono::DateTime;
    use slotwise_core::types::{
        InstructorAssignment, RecurrencePattern, Session, SessionStatus, SessionType, Timestamp,
    };

    fn at(s: &str) -> Timestamp {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    fn session(id: &str, facility: &str, start: &str, minutes: i64) -> Session {
        let start = at(start);
        Session {
            id: id.into(),
            program_id: "p1".into(),
            facility_id: facility.into(),
            course_id: None,
            title: id.to_uppercase(),
            description: String::new(),
            session_type: SessionType::Private,
            start_time: start,
            end_time: start + Duration::minutes(minutes),
            status: SessionStatus::Scheduled,
            max_participants: 1,
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

    fn assign(session_id: &str, instructor: &str) -> InstructorAssignment {
        InstructorAssignment {
            id: format!("{session_id}-{instructor}"),
            session_id: session_id.into(),
            instructor_id: instructor.into(),
            is_primary: true,
            assignment_notes: None,
            special_instructions: None,
            assigned_by: "admin".into(),
            assigned_at: at("2026-03-01T00:00:00Z"),
            removed_at: None,
            removed_by: None,
            removal_reason: None,
        }
    }

    fn range(start: &str, end: &str) -> TimeRange {
        TimeRange::new(at(start), at(end)).unwrap()
    }

    fn detector() -> ConflictDetector {
        ConflictDetector::new(&SchedulingConfig::default())
    }

    #[test]
    fn test_facility_scenario() {
        let db = SchedulingDb::open_in_memory().unwrap();
        db.write(|repo| repo.insert_session(&session("a", "f1", "2026-03-02T10:00:00Z", 60)))
            .unwrap();

        db.read(|repo| {
            let d = detector();
            let half_past = d.check(repo, "p1", "f1", &range("2026-03-02T10:30:00Z", "2026-03-02T11:30:00Z"), &[], &[])?;
            assert!(half_past.has_conflicts());
            assert_eq!(half_past.facility_conflicts[0].session_id, "a");

            let eleven = d.check(repo, "p1", "f1", &range("2026-03-02T11:00:00Z", "2026-03-02T12:00:00Z"), &[], &[])?;
            assert!(!eleven.has_conflicts());
            assert!(eleven.suggestions.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_exclude_and_inactive_ignored() {
        let db = SchedulingDb::open_in_memory().unwrap();
        db.write(|repo| {
            repo.insert_session(&session("a", "f1", "2026-03-02T10:00:00Z", 60))?;
            let mut done = session("b", "f1", "2026-03-02T10:00:00Z", 60);
            done.status = SessionStatus::Completed;
            repo.insert_session(&done)
        })
        .unwrap();

        let report = db
            .read(|repo| {
                detector().check(
                    repo,
                    "p1",
                    "f1",
                    &range("2026-03-02T10:15:00Z", "2026-03-02T10:45:00Z"),
                    &[],
                    &["a".to_string()],
                )
            })
            .unwrap();
        assert!(!report.has_conflicts());
    }

    #[test]
    fn test_instructor_double_booking() {
        let db = SchedulingDb::open_in_memory().unwrap();
        db.write(|repo| {
            repo.insert_session(&session("a", "pool", "2026-03-02T10:00:00Z", 60))?;
            repo.insert_assignment(&assign("a", "coach"))
        })
        .unwrap();

        let report = db
            .read(|repo| {
                detector().check(
                    repo,
                    "p1",
                    "gym",
                    &range("2026-03-02T10:30:00Z", "2026-03-02T11:00:00Z"),
                    &["coach".to_string(), "other".to_string()],
                    &[],
                )
            })
            .unwrap();
        assert!(report.facility_conflicts.is_empty());
        assert_eq!(report.instructor_conflicts.len(), 1);
        assert_eq!(report.instructor_conflicts[0].instructor_id, "coach");
        assert_eq!(report.instructor_conflicts[0].sessions[0].session_id, "a");
    }

    #[test]
    fn test_suggestions_skip_busy_offsets() {
        let db = SchedulingDb::open_in_memory().unwrap();
        db.write(|repo| {
            repo.insert_session(&session("a", "f1", "2026-03-02T10:00:00Z", 60))?;
            // Blocks the +1h probe.
            repo.insert_session(&session("b", "f1", "2026-03-02T11:00:00Z", 60))
        })
        .unwrap();

        let report = db
            .read(|repo| {
                detector().check(repo, "p1", "f1", &range("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z"), &[], &[])
            })
            .unwrap();
        let starts: Vec<Timestamp> = report.suggestions.iter().map(|s| s.start_time).collect();
        assert_eq!(
            starts,
            vec![at("2026-03-02T12:00:00Z"), at("2026-03-02T13:00:00Z"), at("2026-03-03T10:00:00Z")]
        );
        for s in &report.suggestions {
            assert_eq!(s.end_time - s.start_time, Duration::hours(1));
        }
    }

    #[test]
    fn test_suggestions_skip_offsets_past_max_date() {
        let last = chrono::NaiveDate::MAX.and_hms_opt(20, 0, 0).unwrap().and_utc().fixed_offset();
        let db = SchedulingDb::open_in_memory().unwrap();
        let slots = db
            .read(|repo| {
                let slot = TimeRange::new(last, last + Duration::hours(1))?;
                detector().suggest(repo, "p1", "f1", &slot, &[], &[])
            })
            .unwrap();
        // Only +1h and +2h end on the last representable day.
        let starts: Vec<Timestamp> = slots.iter().map(|s| s.start_time).collect();
        assert_eq!(starts, vec![last + Duration::hours(1), last + Duration::hours(2)]);
    }

    #[test]
    fn test_other_program_not_visible() {
        let db = SchedulingDb::open_in_memory().unwrap();
        db.write(|repo| repo.insert_session(&session("a", "f1", "2026-03-02T10:00:00Z", 60)))
            .unwrap();
        let report = db
            .read(|repo| {
                detector().check(repo, "p2", "f1", &range("2026-03-02T10:00:00Z", "2026-03-02T11:00:00Z"), &[], &[])
            })
            .unwrap();
        assert!(!report.has_conflicts());
    }
}
