//! In-memory `Directory`, optionally loaded from a TOML file.
//!
//! ```toml
//! [[facilities]]
//! id = "pool-north"
//! program_id = "swim-club"
//! name = "North Pool"
//!
//! [[students]]
//! id = "st-1"
//! name = "Ada"
//! [[students.guardians]]
//! id = "g-1"
//! name = "Grace"
//! contact = { kind = "email", address = "grace@example.com" }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use slotwise_core::error::{Result, SlotwiseError};
use slotwise_core::traits::Directory;
use slotwise_core::types::{CourseInfo, FacilityInfo, PersonContact, StudentContact};

/// On-disk shape of the directory file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    facilities: Vec<FacilityInfo>,
    #[serde(default)]
    courses: Vec<CourseInfo>,
    #[serde(default)]
    students: Vec<StudentContact>,
    #[serde(default)]
    instructors: Vec<PersonContact>,
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryDirectory {
    facilities: HashMap<String, FacilityInfo>,
    courses: HashMap<String, CourseInfo>,
    students: HashMap<String, StudentContact>,
    instructors: HashMap<String, PersonContact>,
}

impl InMemoryDirectory {
    /// Load from a TOML file. A missing file yields an empty directory.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::warn!("⚠️ Directory file {} not found, starting empty", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let dir = Self::from_toml(&content)?;
        tracing::debug!(
            "📇 Directory loaded: {} facilities, {} students, {} instructors",
            dir.facilities.len(),
            dir.students.len(),
            dir.instructors.len()
        );
        Ok(dir)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let file: DirectoryFile = toml::from_str(content)
            .map_err(|e| SlotwiseError::Config(format!("Failed to parse directory: {e}")))?;
        let mut dir = Self::default();
        file.facilities.into_iter().for_each(|f| dir.add_facility(f));
        file.courses.into_iter().for_each(|c| dir.add_course(c));
        file.students.into_iter().for_each(|s| dir.add_student(s));
        file.instructors.into_iter().for_each(|i| dir.add_instructor(i));
        Ok(dir)
    }

    pub fn add_facility(&mut self, facility: FacilityInfo) {
        self.facilities.insert(facility.id.clone(), facility);
    }

    pub fn add_course(&mut self, course: CourseInfo) {
        self.courses.insert(course.id.clone(), course);
    }

    pub fn add_student(&mut self, student: StudentContact) {
        self.students.insert(student.person.id.clone(), student);
    }

    pub fn add_instructor(&mut self, instructor: PersonContact) {
        self.instructors.insert(instructor.id.clone(), instructor);
    }
}

impl Directory for InMemoryDirectory {
    fn facility(&self, facility_id: &str) -> Option<FacilityInfo> {
        self.facilities.get(facility_id).cloned()
    }

    fn course(&self, course_id: &str) -> Option<CourseInfo> {
        self.courses.get(course_id).cloned()
    }

    fn student(&self, student_id: &str) -> Option<StudentContact> {
        self.students.get(student_id).cloned()
    }

    fn instructor(&self, instructor_id: &str) -> Option<PersonContact> {
        self.instructors.get(instructor_id).cloned()
    }
}
