//! Boundary contracts the scheduling core consumes.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    CourseInfo, FacilityInfo, NotificationRecord, PersonContact, Recipient, StudentContact,
};

/// Read-only lookups into the facility/program/people data owned elsewhere.
pub trait Directory: Send + Sync {
    fn facility(&self, facility_id: &str) -> Option<FacilityInfo>;
    fn course(&self, course_id: &str) -> Option<CourseInfo>;
    fn student(&self, student_id: &str) -> Option<StudentContact>;
    fn instructor(&self, instructor_id: &str) -> Option<PersonContact>;
}

/// A delivery transport. Receives one record per recipient.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Name recorded in the delivery log.
    fn name(&self) -> &str;

    /// Whether this sink can reach the recipient (e.g. email-only sinks).
    fn accepts(&self, _recipient: &Recipient) -> bool {
        true
    }

    async fn deliver(&self, recipient: &Recipient, record: &NotificationRecord) -> Result<()>;
}
