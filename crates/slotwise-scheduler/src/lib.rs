//! # Slotwise Scheduler
//!
//! Facility/session scheduling core: single and recurring sessions,
//! facility and instructor conflict detection, capacity with FIFO waitlists,
//! and change notifications.
//!
//! ## Design Principles
//! - One SQLite file, WAL mode, serialized writers
//! - Conflict check and write share one transaction
//! - Notifications go out after commit and never fail a mutation
//! - Tokio timers only for the reminder sweep
//!
//! ## Architecture
//! ```text
//! SessionManager (engine)
//!   ├── interval      half-open [start, end) arithmetic
//!   ├── recurrence    root → bounded occurrence list
//!   ├── conflict      facility / instructor overlap + suggestions
//!   ├── capacity      seats, waitlist, promotion
//!   └── after commit → Dispatcher
//!                        ├── WebhookSink (HTTP POST)
//!                        ├── LogSink (tracing)
//!                        └── MemorySink (history ring)
//!
//! ReminderSweep (tokio interval) → Dispatcher
//! ```

pub mod capacity;
pub mod conflict;
pub mod directory;
pub mod dispatch;
pub mod engine;
pub mod interval;
pub mod notify;
pub mod persistence;
pub mod recurrence;
pub mod reminders;

pub use capacity::{AddOutcome, RemoveOutcome};
pub use conflict::ConflictDetector;
pub use directory::InMemoryDirectory;
pub use dispatch::{DispatchReport, DispatchRequest, Dispatcher, WebhookSink, sinks_from_config};
pub use engine::{CreatedSessions, NewSession, SessionManager};
pub use interval::TimeRange;
pub use notify::{Audience, LogSink, MemorySink};
pub use persistence::{DeliveryLogEntry, PageRequest, SchedulingDb, SessionFilter};
pub use recurrence::RecurrenceExpander;
pub use reminders::{ReminderSweep, spawn_reminder_loop};
