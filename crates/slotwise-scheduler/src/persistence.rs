//! SQLite-backed persistence for sessions, enrollments, instructor
//! assignments and the notification delivery log.
//!
//! Every write goes through [`SchedulingDb::write`], which holds the
//! connection lock and an `IMMEDIATE` transaction for the whole closure, so a
//! conflict check and the rows it guards commit together.

use chrono::DateTime;
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};
use serde::{Deserialize, Serialize};
use slotwise_core::error::{Result, SlotwiseError};
use slotwise_core::types::{
    Enrollment, EnrollmentStatus, InstructorAssignment, RecurrencePattern, RecurrenceRule,
    Session, SessionStatus, SessionType, Timestamp,
};
use std::path::Path;
use std::sync::Mutex;

/// Scheduling database: one connection, serialized writers.
pub struct SchedulingDb {
    conn: Mutex<Connection>,
}

fn db_err(context: &'static str) -> impl Fn(rusqlite::Error) -> SlotwiseError {
    move |e| SlotwiseError::Database(format!("{context}: {e}"))
}

impl SchedulingDb {
    /// Open or create the scheduling database.
    pub fn open(path: &Path, busy_timeout_ms: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err("DB open"))?;

        // WAL lets readers proceed while a writer holds the transaction.
        conn.execute_batch(&format!(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = {busy_timeout_ms};"
        ))
        .map_err(db_err("DB pragma"))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        tracing::debug!("💾 Scheduling DB ready at {}", path.display());
        Ok(db)
    }

    /// Private in-memory database (tests, dry runs).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err("DB open"))?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .map_err(db_err("DB pragma"))?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run migrations to create tables.
    fn migrate(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SlotwiseError::Database(format!("Lock: {e}")))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                program_id TEXT NOT NULL,
                facility_id TEXT NOT NULL,
                course_id TEXT,
                title TEXT NOT NULL,
                description TEXT NOT NULL DEFAULT '',
                session_type TEXT NOT NULL,
                start_at TEXT NOT NULL,          -- RFC 3339 with the caller's offset
                start_ms INTEGER NOT NULL,       -- epoch millis, for range queries
                end_at TEXT NOT NULL,
                end_ms INTEGER NOT NULL,
                status TEXT NOT NULL DEFAULT 'scheduled',
                max_participants INTEGER NOT NULL,
                special_requirements TEXT,
                notes TEXT,
                recurrence_pattern TEXT NOT NULL DEFAULT 'none',
                recurrence_rule TEXT,            -- JSON, root sessions only
                recurring_parent_id TEXT REFERENCES sessions(id),
                series_id TEXT,
                is_recurring INTEGER NOT NULL DEFAULT 0,
                cancellation_reason TEXT,
                cancelled_by TEXT,
                cancelled_at TEXT,
                notification_sent INTEGER NOT NULL DEFAULT 0,
                notification_sent_at TEXT,
                reminder_sent_at TEXT,
                created_by TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                CHECK (end_ms > start_ms)
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_facility_time ON sessions(facility_id, start_ms);
            CREATE INDEX IF NOT EXISTS idx_sessions_series ON sessions(series_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_program ON sessions(program_id);

            CREATE TABLE IF NOT EXISTS session_participants (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                student_id TEXT NOT NULL,
                status TEXT NOT NULL,
                waitlist_position INTEGER,
                enrolled_by TEXT NOT NULL,
                enrolled_at TEXT NOT NULL,
                cancellation_reason TEXT,
                cancelled_by TEXT,
                cancelled_at TEXT,
                notification_sent INTEGER NOT NULL DEFAULT 0,
                notification_sent_at TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS uq_participants_active
                ON session_participants(session_id, student_id) WHERE status != 'cancelled';

            CREATE TABLE IF NOT EXISTS session_instructors (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                instructor_id TEXT NOT NULL,
                is_primary INTEGER NOT NULL DEFAULT 0,
                assignment_notes TEXT,
                special_instructions TEXT,
                assigned_by TEXT NOT NULL,
                assigned_at TEXT NOT NULL,
                removed_at TEXT,
                removed_by TEXT,
                removal_reason TEXT
            );
            CREATE UNIQUE INDEX IF NOT EXISTS uq_instructors_active
                ON session_instructors(session_id, instructor_id) WHERE removed_at IS NULL;
            CREATE INDEX IF NOT EXISTS idx_instructors_by_person
                ON session_instructors(instructor_id) WHERE removed_at IS NULL;

            -- Per-recipient delivery outcomes
            CREATE TABLE IF NOT EXISTS notification_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                notification_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                category TEXT NOT NULL,
                recipient_id TEXT NOT NULL,
                recipient_role TEXT NOT NULL,
                sink TEXT,
                status TEXT NOT NULL,            -- sent, failed
                error TEXT,
                actor_id TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            ",
        )
        .map_err(db_err("Migration"))?;
        Ok(())
    }

    /// Run `f` inside one `IMMEDIATE` transaction. Commits on `Ok`, rolls back on `Err`.
    pub fn write<T>(&self, f: impl FnOnce(&SessionRepo<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| SlotwiseError::Database(format!("Lock: {e}")))?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err("Begin"))?;
        let out = {
            let repo = SessionRepo { conn: &tx };
            f(&repo)?
        };
        tx.commit().map_err(db_err("Commit"))?;
        Ok(out)
    }

    /// Run `f` against a consistent read view.
    pub fn read<T>(&self, f: impl FnOnce(&SessionRepo<'_>) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| SlotwiseError::Database(format!("Lock: {e}")))?;
        let repo = SessionRepo { conn: &conn };
        f(&repo)
    }
}

/// Filters for facility session listings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilter {
    /// Only these statuses (empty = all non-cancelled, unless `include_cancelled`).
    #[serde(default)]
    pub statuses: Vec<SessionStatus>,
    #[serde(default)]
    pub from: Option<Timestamp>,
    #[serde(default)]
    pub until: Option<Timestamp>,
    #[serde(default)]
    pub series_id: Option<String>,
    #[serde(default)]
    pub include_cancelled: bool,
}

/// Offset/limit paging.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PageRequest {
    pub offset: u32,
    /// 0 = the configured default page size.
    pub limit: u32,
}

/// One row of the delivery log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryLogEntry {
    pub notification_id: String,
    pub session_id: String,
    pub category: String,
    pub recipient_id: String,
    pub recipient_role: String,
    pub sink: Option<String>,
    pub sent: bool,
    pub error: Option<String>,
    pub actor_id: String,
    pub created_at: Timestamp,
}

/// Query/mutation surface over one connection or open transaction.
pub struct SessionRepo<'c> {
    conn: &'c Connection,
}

/// Shared SELECT column list for session queries.
const SESSION_COLUMNS: &str = "s.id, s.program_id, s.facility_id, s.course_id, s.title, s.description, \
     s.session_type, s.start_at, s.end_at, s.status, s.max_participants, s.special_requirements, \
     s.notes, s.recurrence_pattern, s.recurrence_rule, s.recurring_parent_id, s.series_id, \
     s.is_recurring, s.cancellation_reason, s.cancelled_by, s.cancelled_at, s.notification_sent, \
     s.notification_sent_at, s.reminder_sent_at, s.created_by, s.created_at, s.updated_at";

const ENROLLMENT_COLUMNS: &str = "id, session_id, student_id, status, waitlist_position, enrolled_by, \
     enrolled_at, cancellation_reason, cancelled_by, cancelled_at, notification_sent, notification_sent_at";

const ASSIGNMENT_COLUMNS: &str = "id, session_id, instructor_id, is_primary, assignment_notes, \
     special_instructions, assigned_by, assigned_at, removed_at, removed_by, removal_reason";

const ACTIVE_STATUSES: &str = "('scheduled', 'in_progress')";

fn conversion_error(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(SlotwiseError::Database(msg)))
}

fn ts_col(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Timestamp> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw).map_err(|e| conversion_error(idx, format!("bad timestamp '{raw}': {e}")))
}

fn opt_ts_col(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<Option<Timestamp>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        DateTime::parse_from_rfc3339(&r).map_err(|e| conversion_error(idx, format!("bad timestamp '{r}': {e}")))
    })
    .transpose()
}

fn enum_col<T>(row: &rusqlite::Row, idx: usize, parse: fn(&str) -> Option<T>) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    parse(&raw).ok_or_else(|| conversion_error(idx, format!("unknown value '{raw}'")))
}

fn row_to_session(row: &rusqlite::Row) -> rusqlite::Result<Session> {
    let rule_json: Option<String> = row.get(14)?;
    let recurrence_rule = rule_json
        .map(|j| {
            serde_json::from_str::<RecurrenceRule>(&j)
                .map_err(|e| conversion_error(14, format!("bad recurrence rule: {e}")))
        })
        .transpose()?;
    Ok(Session {
        id: row.get(0)?,
        program_id: row.get(1)?,
        facility_id: row.get(2)?,
        course_id: row.get(3)?,
        title: row.get(4)?,
        description: row.get(5)?,
        session_type: enum_col(row, 6, SessionType::parse)?,
        start_time: ts_col(row, 7)?,
        end_time: ts_col(row, 8)?,
        status: enum_col(row, 9, SessionStatus::parse)?,
        max_participants: row.get(10)?,
        special_requirements: row.get(11)?,
        notes: row.get(12)?,
        recurrence_pattern: enum_col(row, 13, RecurrencePattern::parse)?,
        recurrence_rule,
        recurring_parent_id: row.get(15)?,
        series_id: row.get(16)?,
        is_recurring: row.get::<_, i32>(17)? != 0,
        cancellation_reason: row.get(18)?,
        cancelled_by: row.get(19)?,
        cancelled_at: opt_ts_col(row, 20)?,
        notification_sent: row.get::<_, i32>(21)? != 0,
        notification_sent_at: opt_ts_col(row, 22)?,
        reminder_sent_at: opt_ts_col(row, 23)?,
        created_by: row.get(24)?,
        created_at: ts_col(row, 25)?,
        updated_at: ts_col(row, 26)?,
    })
}

fn row_to_enrollment(row: &rusqlite::Row) -> rusqlite::Result<Enrollment> {
    Ok(Enrollment {
        id: row.get(0)?,
        session_id: row.get(1)?,
        student_id: row.get(2)?,
        status: enum_col(row, 3, EnrollmentStatus::parse)?,
        waitlist_position: row.get(4)?,
        enrolled_by: row.get(5)?,
        enrolled_at: ts_col(row, 6)?,
        cancellation_reason: row.get(7)?,
        cancelled_by: row.get(8)?,
        cancelled_at: opt_ts_col(row, 9)?,
        notification_sent: row.get::<_, i32>(10)? != 0,
        notification_sent_at: opt_ts_col(row, 11)?,
    })
}

fn row_to_assignment(row: &rusqlite::Row) -> rusqlite::Result<InstructorAssignment> {
    Ok(InstructorAssignment {
        id: row.get(0)?,
        session_id: row.get(1)?,
        instructor_id: row.get(2)?,
        is_primary: row.get::<_, i32>(3)? != 0,
        assignment_notes: row.get(4)?,
        special_instructions: row.get(5)?,
        assigned_by: row.get(6)?,
        assigned_at: ts_col(row, 7)?,
        removed_at: opt_ts_col(row, 8)?,
        removed_by: row.get(9)?,
        removal_reason: row.get(10)?,
    })
}

impl<'c> SessionRepo<'c> {
    fn query_sessions(&self, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(sql).map_err(db_err("Prepare sessions"))?;
        let rows = stmt
            .query_map(params, row_to_session)
            .map_err(db_err("Query sessions"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read session row"))
    }

    // ─── Sessions ──────────────────────────────────────────

    pub fn insert_session(&self, s: &Session) -> Result<()> {
        let rule_json = s
            .recurrence_rule
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| SlotwiseError::Database(format!("Serialize recurrence rule: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO sessions
                 (id, program_id, facility_id, course_id, title, description, session_type,
                  start_at, start_ms, end_at, end_ms, status, max_participants, special_requirements,
                  notes, recurrence_pattern, recurrence_rule, recurring_parent_id, series_id,
                  is_recurring, cancellation_reason, cancelled_by, cancelled_at, notification_sent,
                  notification_sent_at, reminder_sent_at, created_by, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                         ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29)",
                params![
                    s.id,
                    s.program_id,
                    s.facility_id,
                    s.course_id,
                    s.title,
                    s.description,
                    s.session_type.as_str(),
                    s.start_time.to_rfc3339(),
                    s.start_time.timestamp_millis(),
                    s.end_time.to_rfc3339(),
                    s.end_time.timestamp_millis(),
                    s.status.as_str(),
                    s.max_participants,
                    s.special_requirements,
                    s.notes,
                    s.recurrence_pattern.as_str(),
                    rule_json,
                    s.recurring_parent_id,
                    s.series_id,
                    s.is_recurring as i32,
                    s.cancellation_reason,
                    s.cancelled_by,
                    s.cancelled_at.map(|t| t.to_rfc3339()),
                    s.notification_sent as i32,
                    s.notification_sent_at.map(|t| t.to_rfc3339()),
                    s.reminder_sent_at.map(|t| t.to_rfc3339()),
                    s.created_by,
                    s.created_at.to_rfc3339(),
                    s.updated_at.to_rfc3339(),
                ],
            )
            .map_err(db_err("Insert session"))?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        self.conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions s WHERE s.id = ?1"),
                [id],
                row_to_session,
            )
            .optional()
            .map_err(db_err("Get session"))
    }

    pub fn update_session_times(
        &self,
        id: &str,
        start: Timestamp,
        end: Timestamp,
        now: Timestamp,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET start_at = ?1, start_ms = ?2, end_at = ?3, end_ms = ?4,
                 reminder_sent_at = NULL, updated_at = ?5 WHERE id = ?6",
                params![
                    start.to_rfc3339(),
                    start.timestamp_millis(),
                    end.to_rfc3339(),
                    end.timestamp_millis(),
                    now.to_rfc3339(),
                    id
                ],
            )
            .map_err(db_err("Update session times"))?;
        Ok(())
    }

    pub fn update_session_status(&self, id: &str, status: SessionStatus, now: Timestamp) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), now.to_rfc3339(), id],
            )
            .map_err(db_err("Update session status"))?;
        Ok(())
    }

    pub fn cancel_session(&self, id: &str, reason: &str, actor: &str, at: Timestamp) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET status = 'cancelled', cancellation_reason = ?1, cancelled_by = ?2,
                 cancelled_at = ?3, updated_at = ?3 WHERE id = ?4",
                params![reason, actor, at.to_rfc3339(), id],
            )
            .map_err(db_err("Cancel session"))?;
        Ok(())
    }

    pub fn set_max_participants(&self, id: &str, max: u32, now: Timestamp) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET max_participants = ?1, updated_at = ?2 WHERE id = ?3",
                params![max, now.to_rfc3339(), id],
            )
            .map_err(db_err("Update capacity"))?;
        Ok(())
    }

    /// Root and children of a series, earliest first.
    pub fn series_members(&self, series_id: &str) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!("SELECT {SESSION_COLUMNS} FROM sessions s WHERE s.series_id = ?1 ORDER BY s.start_ms"),
            [series_id],
        )
    }

    /// Active sessions of a program at a facility overlapping `[start, end)`.
    pub fn facility_overlaps(
        &self,
        program_id: &str,
        facility_id: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions s
                 WHERE s.program_id = ?1 AND s.facility_id = ?2 AND s.status IN {ACTIVE_STATUSES}
                   AND s.start_ms < ?4 AND ?3 < s.end_ms
                 ORDER BY s.start_ms"
            ),
            params![program_id, facility_id, start.timestamp_millis(), end.timestamp_millis()],
        )
    }

    /// Active sessions with an active assignment for `instructor_id` overlapping `[start, end)`.
    pub fn instructor_overlaps(
        &self,
        program_id: &str,
        instructor_id: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions s
                 JOIN session_instructors i ON i.session_id = s.id
                 WHERE s.program_id = ?1 AND i.instructor_id = ?2 AND i.removed_at IS NULL
                   AND s.status IN {ACTIVE_STATUSES}
                   AND s.start_ms < ?4 AND ?3 < s.end_ms
                 ORDER BY s.start_ms"
            ),
            params![program_id, instructor_id, start.timestamp_millis(), end.timestamp_millis()],
        )
    }

    /// Facility sessions whose start falls in `[from, until)`, any status.
    pub fn facility_sessions_starting_between(
        &self,
        facility_id: &str,
        from: Timestamp,
        until: Timestamp,
    ) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions s
                 WHERE s.facility_id = ?1 AND s.start_ms >= ?2 AND s.start_ms < ?3
                 ORDER BY s.start_ms"
            ),
            params![facility_id, from.timestamp_millis(), until.timestamp_millis()],
        )
    }

    /// Filtered, paged listing scoped to one program and facility.
    pub fn facility_sessions(
        &self,
        program_id: &str,
        facility_id: &str,
        filter: &SessionFilter,
        offset: u32,
        limit: u32,
    ) -> Result<(Vec<Session>, u64)> {
        let mut clauses = vec!["s.program_id = ?".to_string(), "s.facility_id = ?".to_string()];
        let mut args: Vec<Value> = vec![program_id.to_string().into(), facility_id.to_string().into()];

        if !filter.statuses.is_empty() {
            let marks = vec!["?"; filter.statuses.len()].join(", ");
            clauses.push(format!("s.status IN ({marks})"));
            args.extend(filter.statuses.iter().map(|st| Value::from(st.as_str().to_string())));
        } else if !filter.include_cancelled {
            clauses.push("s.status != 'cancelled'".to_string());
        }
        if let Some(from) = filter.from {
            clauses.push("s.end_ms > ?".to_string());
            args.push(from.timestamp_millis().into());
        }
        if let Some(until) = filter.until {
            clauses.push("s.start_ms < ?".to_string());
            args.push(until.timestamp_millis().into());
        }
        if let Some(series) = &filter.series_id {
            clauses.push("s.series_id = ?".to_string());
            args.push(series.clone().into());
        }
        let where_sql = clauses.join(" AND ");

        let total: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM sessions s WHERE {where_sql}"),
                params_from_iter(args.iter()),
                |r| r.get(0),
            )
            .map_err(db_err("Count sessions"))?;

        let mut page_args = args;
        page_args.push(i64::from(limit).into());
        page_args.push(i64::from(offset).into());
        let items = self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions s WHERE {where_sql}
                 ORDER BY s.start_ms, s.id LIMIT ? OFFSET ?"
            ),
            params_from_iter(page_args.iter()),
        )?;
        Ok((items, total.max(0) as u64))
    }

    /// Scheduled sessions starting in `(after, until]` that have not been reminded.
    pub fn due_for_reminder(&self, after: Timestamp, until: Timestamp) -> Result<Vec<Session>> {
        self.query_sessions(
            &format!(
                "SELECT {SESSION_COLUMNS} FROM sessions s
                 WHERE s.status = 'scheduled' AND s.reminder_sent_at IS NULL
                   AND s.start_ms > ?1 AND s.start_ms <= ?2
                 ORDER BY s.start_ms"
            ),
            params![after.timestamp_millis(), until.timestamp_millis()],
        )
    }

    pub fn mark_session_notified(&self, id: &str, at: Timestamp) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET notification_sent = 1, notification_sent_at = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), id],
            )
            .map_err(db_err("Mark session notified"))?;
        Ok(())
    }

    pub fn mark_reminder_sent(&self, id: &str, at: Timestamp) -> Result<()> {
        self.conn
            .execute(
                "UPDATE sessions SET reminder_sent_at = ?1 WHERE id = ?2",
                params![at.to_rfc3339(), id],
            )
            .map_err(db_err("Mark reminder sent"))?;
        Ok(())
    }

    // ─── Enrollments ───────────────────────────────────────

    pub fn insert_enrollment(&self, e: &Enrollment) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO session_participants ({ENROLLMENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    e.id,
                    e.session_id,
                    e.student_id,
                    e.status.as_str(),
                    e.waitlist_position,
                    e.enrolled_by,
                    e.enrolled_at.to_rfc3339(),
                    e.cancellation_reason,
                    e.cancelled_by,
                    e.cancelled_at.map(|t| t.to_rfc3339()),
                    e.notification_sent as i32,
                    e.notification_sent_at.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(db_err("Insert enrollment"))?;
        Ok(())
    }

    pub fn active_enrollment(&self, session_id: &str, student_id: &str) -> Result<Option<Enrollment>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {ENROLLMENT_COLUMNS} FROM session_participants
                     WHERE session_id = ?1 AND student_id = ?2 AND status != 'cancelled'"
                ),
                [session_id, student_id],
                row_to_enrollment,
            )
            .optional()
            .map_err(db_err("Get enrollment"))
    }

    /// Every enrollment row of a session: seated first, then waitlist by position, then cancelled.
    pub fn enrollments(&self, session_id: &str) -> Result<Vec<Enrollment>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ENROLLMENT_COLUMNS} FROM session_participants WHERE session_id = ?1
                 ORDER BY CASE status WHEN 'cancelled' THEN 2 WHEN 'waitlisted' THEN 1 ELSE 0 END,
                          waitlist_position, enrolled_at, rowid"
            ))
            .map_err(db_err("Prepare enrollments"))?;
        let rows = stmt
            .query_map([session_id], row_to_enrollment)
            .map_err(db_err("Query enrollments"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read enrollment row"))
    }

    /// Seats taken (enrolled, confirmed, no-show).
    pub fn count_occupied(&self, session_id: &str) -> Result<u32> {
        self.conn
            .query_row(
                "SELECT COUNT(*) FROM session_participants
                 WHERE session_id = ?1 AND status IN ('enrolled', 'confirmed', 'no_show')",
                [session_id],
                |r| r.get(0),
            )
            .map_err(db_err("Count enrolled"))
    }

    pub fn max_waitlist_position(&self, session_id: &str) -> Result<u32> {
        self.conn
            .query_row(
                "SELECT COALESCE(MAX(waitlist_position), 0) FROM session_participants
                 WHERE session_id = ?1 AND status = 'waitlisted'",
                [session_id],
                |r| r.get(0),
            )
            .map_err(db_err("Max waitlist position"))
    }

    /// Waitlisted rows, first in line first.
    pub fn waitlisted(&self, session_id: &str) -> Result<Vec<Enrollment>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ENROLLMENT_COLUMNS} FROM session_participants
                 WHERE session_id = ?1 AND status = 'waitlisted'
                 ORDER BY waitlist_position ASC, enrolled_at ASC, rowid ASC"
            ))
            .map_err(db_err("Prepare waitlist"))?;
        let rows = stmt
            .query_map([session_id], row_to_enrollment)
            .map_err(db_err("Query waitlist"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read waitlist row"))
    }

    pub fn set_enrollment_status(
        &self,
        enrollment_id: &str,
        status: EnrollmentStatus,
        waitlist_position: Option<u32>,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE session_participants SET status = ?1, waitlist_position = ?2 WHERE id = ?3",
                params![status.as_str(), waitlist_position, enrollment_id],
            )
            .map_err(db_err("Update enrollment"))?;
        Ok(())
    }

    pub fn set_waitlist_position(&self, enrollment_id: &str, position: u32) -> Result<()> {
        self.conn
            .execute(
                "UPDATE session_participants SET waitlist_position = ?1 WHERE id = ?2",
                params![position, enrollment_id],
            )
            .map_err(db_err("Update waitlist position"))?;
        Ok(())
    }

    pub fn cancel_enrollment(
        &self,
        enrollment_id: &str,
        reason: Option<&str>,
        actor: &str,
        at: Timestamp,
    ) -> Result<()> {
        self.conn
            .execute(
                "UPDATE session_participants SET status = 'cancelled', waitlist_position = NULL,
                 cancellation_reason = ?1, cancelled_by = ?2, cancelled_at = ?3 WHERE id = ?4",
                params![reason, actor, at.to_rfc3339(), enrollment_id],
            )
            .map_err(db_err("Cancel enrollment"))?;
        Ok(())
    }

    /// Stamp the most recent enrollment row of a student in a session.
    pub fn mark_enrollment_notified(&self, session_id: &str, student_id: &str, at: Timestamp) -> Result<()> {
        self.conn
            .execute(
                "UPDATE session_participants SET notification_sent = 1, notification_sent_at = ?1
                 WHERE rowid = (SELECT rowid FROM session_participants
                                WHERE session_id = ?2 AND student_id = ?3
                                ORDER BY rowid DESC LIMIT 1)",
                params![at.to_rfc3339(), session_id, student_id],
            )
            .map_err(db_err("Mark enrollment notified"))?;
        Ok(())
    }

    // ─── Instructor assignments ────────────────────────────

    pub fn insert_assignment(&self, a: &InstructorAssignment) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO session_instructors ({ASSIGNMENT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
                ),
                params![
                    a.id,
                    a.session_id,
                    a.instructor_id,
                    a.is_primary as i32,
                    a.assignment_notes,
                    a.special_instructions,
                    a.assigned_by,
                    a.assigned_at.to_rfc3339(),
                    a.removed_at.map(|t| t.to_rfc3339()),
                    a.removed_by,
                    a.removal_reason,
                ],
            )
            .map_err(db_err("Insert assignment"))?;
        Ok(())
    }

    pub fn active_assignment(&self, session_id: &str, instructor_id: &str) -> Result<Option<InstructorAssignment>> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {ASSIGNMENT_COLUMNS} FROM session_instructors
                     WHERE session_id = ?1 AND instructor_id = ?2 AND removed_at IS NULL"
                ),
                [session_id, instructor_id],
                row_to_assignment,
            )
            .optional()
            .map_err(db_err("Get assignment"))
    }

    /// Active assignments, earliest assigned first.
    pub fn active_assignments(&self, session_id: &str) -> Result<Vec<InstructorAssignment>> {
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT {ASSIGNMENT_COLUMNS} FROM session_instructors
                 WHERE session_id = ?1 AND removed_at IS NULL ORDER BY assigned_at, rowid"
            ))
            .map_err(db_err("Prepare assignments"))?;
        let rows = stmt
            .query_map([session_id], row_to_assignment)
            .map_err(db_err("Query assignments"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read assignment row"))
    }

    pub fn remove_assignment(&self, assignment_id: &str, reason: Option<&str>, actor: &str, at: Timestamp) -> Result<()> {
        self.conn
            .execute(
                "UPDATE session_instructors SET removed_at = ?1, removed_by = ?2, removal_reason = ?3,
                 is_primary = 0 WHERE id = ?4",
                params![at.to_rfc3339(), actor, reason, assignment_id],
            )
            .map_err(db_err("Remove assignment"))?;
        Ok(())
    }

    pub fn set_primary(&self, assignment_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE session_instructors SET is_primary = 1 WHERE id = ?1",
                [assignment_id],
            )
            .map_err(db_err("Set primary"))?;
        Ok(())
    }

    // ─── Delivery log ──────────────────────────────────────

    pub fn log_delivery(&self, entry: &DeliveryLogEntry) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO notification_log
                 (notification_id, session_id, category, recipient_id, recipient_role, sink, status,
                  error, actor_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    entry.notification_id,
                    entry.session_id,
                    entry.category,
                    entry.recipient_id,
                    entry.recipient_role,
                    entry.sink,
                    if entry.sent { "sent" } else { "failed" },
                    entry.error,
                    entry.actor_id,
                    entry.created_at.to_rfc3339(),
                ],
            )
            .map_err(db_err("Log delivery"))?;
        Ok(())
    }

    /// Most recent deliveries first.
    pub fn recent_deliveries(&self, limit: usize) -> Result<Vec<DeliveryLogEntry>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT notification_id, session_id, category, recipient_id, recipient_role, sink,
                        status, error, actor_id, created_at
                 FROM notification_log ORDER BY id DESC LIMIT ?1",
            )
            .map_err(db_err("Prepare deliveries"))?;
        let rows = stmt
            .query_map([limit as i64], |row| {
                Ok(DeliveryLogEntry {
                    notification_id: row.get(0)?,
                    session_id: row.get(1)?,
                    category: row.get(2)?,
                    recipient_id: row.get(3)?,
                    recipient_role: row.get(4)?,
                    sink: row.get(5)?,
                    sent: row.get::<_, String>(6)? == "sent",
                    error: row.get(7)?,
                    actor_id: row.get(8)?,
                    created_at: ts_col(row, 9)?,
                })
            })
            .map_err(db_err("Query deliveries"))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(db_err("Read delivery row"))
    }
}
